//! Workflow and task domain models.
//!
//! A `Workflow` is an immutable definition: a named, ordered list of tasks
//! whose `depends_on` edges form a DAG, plus an optional trigger. Runtime
//! state lives in `WorkflowExecution` (see `execution.rs`), never here.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::errors::{SwarmError, SwarmResult};

/// Kind of work a task performs. Unknown kinds fail workflow validation;
/// there is no string-typed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Http,
    Script,
    Grpc,
    Model,
    Sql,
    Kafka,
    Shell,
    Policy,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Script => "script",
            Self::Grpc => "grpc",
            Self::Model => "model",
            Self::Sql => "sql",
            Self::Kafka => "kafka",
            Self::Shell => "shell",
            Self::Policy => "policy",
        }
    }
}

/// Per-task retry policy. Tasks without one inherit the engine default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRetry {
    pub max_attempts: u32,
    pub initial_wait_ms: u64,
    pub multiplier: f64,
    pub max_wait_ms: u64,
}

impl Default for TaskRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_wait_ms: 1_000,
            multiplier: 2.0,
            max_wait_ms: 30_000,
        }
    }
}

fn default_timeout_secs() -> u64 {
    60
}

/// A single unit of work within a workflow.
///
/// Kind-specific fields are optional and only consulted by the plugin for
/// the task's kind; serialization skips absent fields so the canonical JSON
/// form round-trips byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique within the owning workflow.
    pub id: String,
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// When true, a terminal failure of this task does not abort the
    /// workflow; downstream conditions see its output as missing.
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub cacheable: bool,
    /// Condition expression; empty means unconditional.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<TaskRetry>,

    // Kind-specific fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            kind,
            depends_on: Vec::new(),
            timeout_secs: default_timeout_secs(),
            allow_failure: false,
            cacheable: false,
            condition: String::new(),
            retry: None,
            url: None,
            method: None,
            headers: HashMap::new(),
            body: None,
            script: None,
            command: None,
            policy: None,
            query: None,
            topic: None,
            model: None,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| (*d).to_string()).collect();
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Trigger attached to a workflow definition, advisory for operators; the
/// authoritative trigger state lives in the schedules bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Trigger {
    Cron { expression: String },
    Event { event_type: String },
}

/// A named workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Registry key. Executions get their own `workflow_id`; the two are
    /// never conflated.
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            tasks: Vec::new(),
            trigger: None,
        }
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Structural validation: non-empty name, at least one task, unique task
    /// ids, and every dependency referencing an existing task. Cycle
    /// detection happens at execution start when the graph is built.
    pub fn validate(&self) -> SwarmResult<()> {
        if self.name.is_empty() {
            return Err(SwarmError::validation("name", "workflow name is required"));
        }
        if self.tasks.is_empty() {
            return Err(SwarmError::validation("tasks", "workflow has no tasks"));
        }

        let mut seen: HashSet<&str> = HashSet::with_capacity(self.tasks.len());
        for task in &self.tasks {
            if task.id.is_empty() {
                return Err(SwarmError::validation("tasks.id", "task id is required"));
            }
            if !seen.insert(task.id.as_str()) {
                return Err(SwarmError::validation(
                    "tasks.id",
                    format!("duplicate task id '{}'", task.id),
                ));
            }
        }

        for task in &self.tasks {
            for dep in &task.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(SwarmError::MissingDependency {
                        task: task.id.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Canonical JSON bytes, used for storage and versioning.
    pub fn canonical_bytes(&self) -> SwarmResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
