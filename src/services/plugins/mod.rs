//! Task plugins: one executor per `TaskKind`.
//!
//! Dispatch is a sealed map from kind to plugin; workflows referencing an
//! unknown kind never get this far because `TaskKind` is a closed enum.

mod http;
mod policy;
mod script;
mod shell;
mod stub;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::{Task, TaskKind};
use crate::services::condition::{substitute, SharedContext};

pub use http::HttpPlugin;
pub use policy::PolicyPlugin;
pub use script::ScriptPlugin;
pub use shell::ShellPlugin;
pub use stub::ContractPlugin;

/// Immutable view of the execution a task runs inside: identity plus a
/// snapshot of the shared context taken when the task became ready.
#[derive(Debug, Clone, Default)]
pub struct PluginContext {
    pub workflow_id: String,
    pub workflow_name: String,
    pub context: SharedContext,
}

impl PluginContext {
    /// Resolve `{{task.field}}` / `{{workflow.*}}` placeholders in a string
    /// field.
    pub fn resolve(&self, template: &str) -> String {
        substitute(template, &self.context, &self.workflow_id, &self.workflow_name)
    }
}

/// A task executor. Implementations must be cancel-safe: the engine races
/// `execute` against the task timeout and the workflow cancel signal.
#[async_trait]
pub trait TaskPlugin: Send + Sync {
    async fn execute(
        &self,
        task: &Task,
        ctx: &PluginContext,
    ) -> SwarmResult<HashMap<String, Value>>;
}

/// Registry of plugins keyed by task kind.
pub struct PluginRegistry {
    plugins: HashMap<TaskKind, Arc<dyn TaskPlugin>>,
}

impl PluginRegistry {
    /// Registry with every kind wired to its default plugin.
    pub fn with_defaults(
        http_client: reqwest::Client,
        policy_url: String,
        python_path: String,
        shell_allow_list: Vec<String>,
    ) -> Self {
        let mut plugins: HashMap<TaskKind, Arc<dyn TaskPlugin>> = HashMap::new();
        plugins.insert(
            TaskKind::Http,
            Arc::new(HttpPlugin::new(http_client.clone())),
        );
        plugins.insert(
            TaskKind::Script,
            Arc::new(ScriptPlugin::new(python_path)),
        );
        plugins.insert(
            TaskKind::Shell,
            Arc::new(ShellPlugin::new(shell_allow_list)),
        );
        plugins.insert(
            TaskKind::Policy,
            Arc::new(PolicyPlugin::new(http_client, policy_url)),
        );
        plugins.insert(TaskKind::Model, Arc::new(ContractPlugin::model()));
        plugins.insert(TaskKind::Grpc, Arc::new(ContractPlugin::grpc()));
        plugins.insert(TaskKind::Sql, Arc::new(ContractPlugin::sql()));
        plugins.insert(TaskKind::Kafka, Arc::new(ContractPlugin::kafka()));
        Self { plugins }
    }

    /// Empty registry for tests; populate with `register`.
    pub fn empty() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: TaskKind, plugin: Arc<dyn TaskPlugin>) {
        self.plugins.insert(kind, plugin);
    }

    pub fn get(&self, kind: TaskKind) -> SwarmResult<Arc<dyn TaskPlugin>> {
        self.plugins.get(&kind).cloned().ok_or_else(|| {
            SwarmError::Internal(format!("no plugin registered for kind '{}'", kind.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_kind() {
        let registry = PluginRegistry::with_defaults(
            reqwest::Client::new(),
            "http://policy".into(),
            "python3".into(),
            vec!["echo".into()],
        );
        for kind in [
            TaskKind::Http,
            TaskKind::Script,
            TaskKind::Grpc,
            TaskKind::Model,
            TaskKind::Sql,
            TaskKind::Kafka,
            TaskKind::Shell,
            TaskKind::Policy,
        ] {
            assert!(registry.get(kind).is_ok(), "missing plugin for {kind:?}");
        }
    }

    #[test]
    fn test_empty_registry_reports_missing() {
        let registry = PluginRegistry::empty();
        assert!(registry.get(TaskKind::Http).is_err());
    }
}
