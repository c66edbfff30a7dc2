//! HTTP task plugin.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::Task;

use super::{PluginContext, TaskPlugin};

/// Maximum bytes read from a downstream response body.
const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Executes `http` tasks: resolves templates in URL, body, and headers, then
/// issues the request on a shared keep-alive pool.
pub struct HttpPlugin {
    client: reqwest::Client,
}

impl HttpPlugin {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TaskPlugin for HttpPlugin {
    async fn execute(
        &self,
        task: &Task,
        ctx: &PluginContext,
    ) -> SwarmResult<HashMap<String, Value>> {
        let url = task
            .url
            .as_deref()
            .ok_or_else(|| SwarmError::validation("url", "http task requires a url"))?;
        let url = ctx.resolve(url);

        let method: reqwest::Method = task
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_uppercase()
            .parse()
            .map_err(|_| SwarmError::validation("method", "invalid http method"))?;

        let mut request = self
            .client
            .request(method, &url)
            .header("X-Workflow-ID", &ctx.workflow_id)
            .header("X-Forwarded-By", "swarmguard-orchestrator");

        for (name, value) in &task.headers {
            request = request.header(name, ctx.resolve(value));
        }
        if let Some(body) = &task.body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(ctx.resolve(body));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SwarmError::TaskFailed(format!("http request to {url} failed: {e}")))?;
        let status = response.status();

        let mut body = Vec::new();
        let mut stream = response;
        while let Some(chunk) = stream
            .chunk()
            .await
            .map_err(|e| SwarmError::TaskFailed(format!("http body read failed: {e}")))?
        {
            if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(SwarmError::TaskFailed(format!(
                    "http response from {url} exceeded {MAX_RESPONSE_BYTES} bytes"
                )));
            }
            body.extend_from_slice(&chunk);
        }

        if status.as_u16() >= 400 {
            return Err(SwarmError::Downstream {
                service: url,
                status: status.as_u16(),
            });
        }

        // JSON objects become the output map directly; anything else is
        // wrapped alongside the status code.
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
            _ => {
                let mut out = HashMap::new();
                out.insert(
                    "body".to_string(),
                    Value::String(String::from_utf8_lossy(&body).into_owned()),
                );
                out.insert("status_code".to_string(), json!(status.as_u16()));
                Ok(out)
            }
        }
    }
}
