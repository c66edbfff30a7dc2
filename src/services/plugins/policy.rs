//! Policy task plugin: defers the decision to the external policy service.
//!
//! Evaluation semantics live entirely in that service; this plugin carries
//! the caching and rate-limiting shell around it. Decisions are cached by
//! (policy, input) content hash with LRU eviction, and outbound evaluation
//! calls pass through a token-bucket limiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::Task;
use crate::services::rate_limiter::{RateLimiter, RateLimiterConfig};

use super::{PluginContext, TaskPlugin};

struct CachedDecision {
    output: HashMap<String, Value>,
    last_used: Instant,
}

/// Executes `policy` tasks by POSTing `{policy, input}` to the policy
/// service, where `input` is the execution's shared context.
pub struct PolicyPlugin {
    client: reqwest::Client,
    base_url: String,
    cache_size: usize,
    cache: Mutex<HashMap<String, CachedDecision>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl PolicyPlugin {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url,
            cache_size: 1024,
            cache: Mutex::new(HashMap::new()),
            limiter: None,
        }
    }

    /// Configure the decision cache size and the outbound rate limit.
    pub fn with_shell(mut self, cache_size: usize, limiter_config: RateLimiterConfig) -> Self {
        self.cache_size = cache_size.max(1);
        self.limiter = Some(Arc::new(RateLimiter::new(limiter_config)));
        self
    }

    fn decision_key(policy: &str, input: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(policy.as_bytes());
        hasher.update([0u8]);
        hasher.update(input.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl TaskPlugin for PolicyPlugin {
    async fn execute(
        &self,
        task: &Task,
        ctx: &PluginContext,
    ) -> SwarmResult<HashMap<String, Value>> {
        let policy = task
            .policy
            .as_deref()
            .ok_or_else(|| SwarmError::validation("policy", "policy task requires a policy name"))?;

        let input = serde_json::to_value(&ctx.context)?;
        let key = Self::decision_key(policy, &input);

        {
            let mut cache = self.cache.lock().await;
            if let Some(decision) = cache.get_mut(&key) {
                decision.last_used = Instant::now();
                return Ok(decision.output.clone());
            }
        }

        if let Some(limiter) = &self.limiter {
            limiter.try_acquire(1).map_err(|_| SwarmError::RateLimited {
                key: "policy".to_string(),
            })?;
        }

        let response = self
            .client
            .post(format!("{}/v1/evaluate", self.base_url.trim_end_matches('/')))
            .header("X-Workflow-ID", &ctx.workflow_id)
            .json(&json!({
                "policy": policy,
                "input": input,
            }))
            .send()
            .await
            .map_err(|e| SwarmError::TaskFailed(format!("policy request failed: {e}")))?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(SwarmError::Downstream {
                service: "policy".to_string(),
                status,
            });
        }

        let output: HashMap<String, Value> = match response
            .json::<Value>()
            .await
            .map_err(|e| SwarmError::TaskFailed(format!("policy response unreadable: {e}")))?
        {
            Value::Object(map) => map.into_iter().collect(),
            other => HashMap::from([("decision".to_string(), other)]),
        };

        let mut cache = self.cache.lock().await;
        if cache.len() >= self.cache_size && !cache.contains_key(&key) {
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, d)| d.last_used)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            key,
            CachedDecision {
                output: output.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TaskKind;

    fn policy_task(name: &str) -> Task {
        let mut task = Task::new("p", TaskKind::Policy);
        task.policy = Some(name.to_string());
        task
    }

    #[tokio::test]
    async fn test_posts_policy_and_context() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/evaluate")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"policy": "block-critical"}"#.to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"allow": false, "reason": "critical severity"}"#)
            .create_async()
            .await;

        let plugin = PolicyPlugin::new(reqwest::Client::new(), server.url());
        let out = plugin
            .execute(&policy_task("block-critical"), &PluginContext::default())
            .await
            .unwrap();

        assert_eq!(out.get("allow"), Some(&json!(false)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_identical_input_served_from_cache() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/evaluate")
            .with_status(200)
            .with_body(r#"{"allow": true}"#)
            .expect(1)
            .create_async()
            .await;

        let plugin = PolicyPlugin::new(reqwest::Client::new(), server.url());
        let ctx = PluginContext::default();

        let first = plugin.execute(&policy_task("p"), &ctx).await.unwrap();
        let second = plugin.execute(&policy_task("p"), &ctx).await.unwrap();
        assert_eq!(first, second);
        // Only one call reached the service.
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_limiter_denial_is_rate_limited() {
        let plugin = PolicyPlugin::new(reqwest::Client::new(), "http://unused".into()).with_shell(
            16,
            RateLimiterConfig {
                capacity: 0.5,
                fill_rate: 0.0001,
                window: std::time::Duration::from_secs(60),
                max_per_window: 100,
            },
        );

        let err = plugin
            .execute(&policy_task("p"), &PluginContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
    }

    #[tokio::test]
    async fn test_non_200_is_downstream_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/evaluate")
            .with_status(500)
            .create_async()
            .await;

        let plugin = PolicyPlugin::new(reqwest::Client::new(), server.url());
        let err = plugin
            .execute(&policy_task("x"), &PluginContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::Downstream { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_missing_policy_name_rejected() {
        let plugin = PolicyPlugin::new(reqwest::Client::new(), "http://unused".into());
        let err = plugin
            .execute(&Task::new("p", TaskKind::Policy), &PluginContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
