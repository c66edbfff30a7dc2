//! Cancellation registry for in-flight workflow executions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use serde::Serialize;
use tokio::sync::{watch, RwLock};

/// Registry status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
struct Registration {
    workflow_name: String,
    status: RunStatus,
    cancel_tx: watch::Sender<bool>,
    cancel_reason: Option<String>,
    registered_at: Instant,
}

/// Snapshot row for the active-executions surface.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveExecution {
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub cancel_reason: Option<String>,
}

/// How long finished registrations are retained for status queries.
const RETENTION: Duration = Duration::from_secs(3600);

/// Maps workflow_id to its execution's cancel handle and status.
#[derive(Default)]
pub struct CancellationRegistry {
    entries: RwLock<HashMap<String, Registration>>,
}

impl CancellationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a starting execution and get its cancellation watch. Tasks
    /// select on the watch and unwind when it flips true.
    pub async fn register(&self, workflow_id: &str, workflow_name: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        let mut entries = self.entries.write().await;
        entries.insert(
            workflow_id.to_string(),
            Registration {
                workflow_name: workflow_name.to_string(),
                status: RunStatus::Running,
                cancel_tx: tx,
                cancel_reason: None,
                registered_at: Instant::now(),
            },
        );
        rx
    }

    /// Mark an execution finished (kept for status queries until retention
    /// expires).
    pub async fn finish(&self, workflow_id: &str, status: RunStatus) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(workflow_id) {
            // A cancel that already landed wins over a late completion.
            if entry.status != RunStatus::Cancelled {
                entry.status = status;
            }
        }
    }

    /// Cancel a running execution. Idempotent: cancelling an already
    /// cancelled or finished execution returns its current status.
    pub async fn cancel(&self, workflow_id: &str, reason: &str) -> Option<RunStatus> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(workflow_id)?;

        if entry.status == RunStatus::Running {
            entry.status = RunStatus::Cancelled;
            entry.cancel_reason = Some(reason.to_string());
            let _ = entry.cancel_tx.send(true);
            counter!("swarm_workflow_cancellations_total").increment(1);
            tracing::info!(workflow_id, reason, "workflow execution cancelled");
        }
        Some(entry.status)
    }

    /// Cancel every running execution; used during shutdown.
    pub async fn cancel_all(&self, reason: &str) -> usize {
        let mut entries = self.entries.write().await;
        let mut cancelled = 0;
        for (workflow_id, entry) in entries.iter_mut() {
            if entry.status == RunStatus::Running {
                entry.status = RunStatus::Cancelled;
                entry.cancel_reason = Some(reason.to_string());
                let _ = entry.cancel_tx.send(true);
                cancelled += 1;
                tracing::info!(workflow_id, reason, "workflow execution cancelled");
            }
        }
        if cancelled > 0 {
            counter!("swarm_workflow_cancellations_total").increment(cancelled as u64);
        }
        cancelled
    }

    pub async fn status(&self, workflow_id: &str) -> Option<RunStatus> {
        self.entries
            .read()
            .await
            .get(workflow_id)
            .map(|e| e.status)
    }

    /// Currently running executions.
    pub async fn active(&self) -> Vec<ActiveExecution> {
        let entries = self.entries.read().await;
        let mut active: Vec<ActiveExecution> = entries
            .iter()
            .filter(|(_, e)| e.status == RunStatus::Running)
            .map(|(id, e)| ActiveExecution {
                workflow_id: id.clone(),
                workflow_name: e.workflow_name.clone(),
                status: e.status,
                cancel_reason: e.cancel_reason.clone(),
            })
            .collect();
        active.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        active
    }

    /// Drop non-running registrations older than the retention window.
    pub async fn cleanup(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| {
            e.status == RunStatus::Running || e.registered_at.elapsed() < RETENTION
        });
        before - entries.len()
    }

    /// Spawn the periodic retention sweep.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                registry.cleanup().await;
            }
        })
    }
}
