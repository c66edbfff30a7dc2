//! Workflow execution runtime state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a single task within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Terminal states allow dependents to be scheduled (or skipped).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Aggregate state of a whole execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one task within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub output: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of execution attempts, at least 1 for any task that ran.
    #[serde(default)]
    pub attempts: u32,
}

impl TaskResult {
    pub fn pending(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            started_at: None,
            ended_at: None,
            duration_ms: 0,
            output: HashMap::new(),
            error: None,
            attempts: 0,
        }
    }

    pub fn skipped(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Skipped,
            started_at: None,
            ended_at: None,
            duration_ms: 0,
            output: HashMap::new(),
            error: None,
            attempts: 0,
        }
    }
}

/// One run of a workflow.
///
/// `workflow_id` is `<name>-<unix_nanos>` and keys the executions bucket and
/// the cancellation registry; `workflow_name` keys the workflow registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub workflow_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub task_results: HashMap<String, TaskResult>,
    /// Outputs published by completed tasks, visible to their descendants.
    #[serde(default)]
    pub context: HashMap<String, HashMap<String, Value>>,
}

impl WorkflowExecution {
    /// Start a new execution for the named workflow.
    pub fn begin(workflow_name: &str) -> Self {
        let started_at = Utc::now();
        let nanos = started_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| started_at.timestamp_millis() * 1_000_000);
        Self {
            workflow_id: format!("{workflow_name}-{nanos}"),
            workflow_name: workflow_name.to_string(),
            started_at,
            ended_at: None,
            status: ExecutionStatus::Running,
            task_results: HashMap::new(),
            context: HashMap::new(),
        }
    }

    /// Nanosecond start timestamp used in index keys.
    pub fn start_nanos(&self) -> i64 {
        self.started_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.started_at.timestamp_millis() * 1_000_000)
    }

    pub fn duration_ms(&self) -> u64 {
        match self.ended_at {
            Some(end) => (end - self.started_at).num_milliseconds().max(0) as u64,
            None => (Utc::now() - self.started_at).num_milliseconds().max(0) as u64,
        }
    }

    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_id_embeds_name() {
        let exec = WorkflowExecution::begin("nightly-scan");
        assert!(exec.workflow_id.starts_with("nightly-scan-"));
        assert_eq!(exec.workflow_name, "nightly-scan");
        assert_eq!(exec.status, ExecutionStatus::Running);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn test_execution_round_trip() {
        let mut exec = WorkflowExecution::begin("wf");
        exec.task_results
            .insert("a".into(), TaskResult::pending("a"));
        exec.finish(ExecutionStatus::Completed);

        let bytes = serde_json::to_vec(&exec).unwrap();
        let back: WorkflowExecution = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(exec, back);
    }
}
