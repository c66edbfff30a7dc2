//! Contract plugins for kinds whose backends live outside this core.
//!
//! These validate their task inputs and enforce the declared security
//! contracts (read-only SQL in particular) before failing with a typed
//! error naming the unconfigured backend. Wiring a real backend replaces
//! the final step only; the contracts stay.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::{Task, TaskKind};

use super::{PluginContext, TaskPlugin};

pub struct ContractPlugin {
    kind: TaskKind,
    backend: &'static str,
}

impl ContractPlugin {
    pub fn model() -> Self {
        Self {
            kind: TaskKind::Model,
            backend: "model registry",
        }
    }

    pub fn grpc() -> Self {
        Self {
            kind: TaskKind::Grpc,
            backend: "grpc endpoint",
        }
    }

    pub fn sql() -> Self {
        Self {
            kind: TaskKind::Sql,
            backend: "sql warehouse",
        }
    }

    pub fn kafka() -> Self {
        Self {
            kind: TaskKind::Kafka,
            backend: "kafka brokers",
        }
    }

    fn validate(&self, task: &Task) -> SwarmResult<()> {
        match self.kind {
            TaskKind::Model => {
                task.model
                    .as_deref()
                    .filter(|m| !m.is_empty())
                    .ok_or_else(|| SwarmError::validation("model", "model task requires a model"))?;
            }
            TaskKind::Grpc => {
                task.url
                    .as_deref()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| SwarmError::validation("url", "grpc task requires a target url"))?;
            }
            TaskKind::Sql => {
                let query = task
                    .query
                    .as_deref()
                    .filter(|q| !q.trim().is_empty())
                    .ok_or_else(|| SwarmError::validation("query", "sql task requires a query"))?;
                enforce_read_only(query)?;
            }
            TaskKind::Kafka => {
                task.topic
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| SwarmError::validation("topic", "kafka task requires a topic"))?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// SQL tasks are read-only by contract: after stripping comments, the
/// statement must start with SELECT and contain no statement separator.
fn enforce_read_only(query: &str) -> SwarmResult<()> {
    let mut cleaned = String::with_capacity(query.len());
    for line in query.lines() {
        let line = match line.find("--") {
            Some(at) => &line[..at],
            None => line,
        };
        cleaned.push_str(line);
        cleaned.push(' ');
    }
    let cleaned = cleaned.trim();

    if !cleaned.to_ascii_uppercase().starts_with("SELECT") {
        return Err(SwarmError::validation(
            "query",
            "sql tasks are read-only; only SELECT statements are accepted",
        ));
    }
    if cleaned.contains(';') {
        return Err(SwarmError::validation(
            "query",
            "sql tasks must be a single statement",
        ));
    }
    Ok(())
}

#[async_trait]
impl TaskPlugin for ContractPlugin {
    async fn execute(
        &self,
        task: &Task,
        _ctx: &PluginContext,
    ) -> SwarmResult<HashMap<String, Value>> {
        self.validate(task)?;
        Err(SwarmError::Internal(format!(
            "{} backend is not configured for '{}' tasks",
            self.backend,
            self.kind.as_str()
        )))
    }
}
