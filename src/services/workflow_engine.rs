//! DAG workflow execution engine.
//!
//! Kahn-style scheduling over a bounded worker pool: a ready queue is seeded
//! with all zero-in-degree tasks, workers execute ready tasks through the
//! plugin registry, and a single coordinator drains completions, decrements
//! child in-degrees, evaluates conditions, and enqueues newly ready work.
//! A task starts only after every dependency has reached a terminal state;
//! siblings run concurrently up to the worker count.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::timeout;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::{
    ExecutionStatus, Task, TaskResult, TaskRetry, TaskStatus, Workflow, WorkflowExecution,
};
use crate::services::cancellation::{CancellationRegistry, RunStatus};
use crate::services::condition::{evaluate, SharedContext};
use crate::services::plugins::{PluginContext, PluginRegistry};
use crate::services::result_cache::{cache_key, ResultCache};

/// Configuration for the workflow engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded worker pool size.
    pub max_workers: usize,
    /// Retry policy for tasks that do not carry their own.
    pub default_retry: TaskRetry,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            default_retry: TaskRetry::default(),
        }
    }
}

/// One node of the built graph.
struct DagNode {
    task: Task,
    in_degree: usize,
    children: Vec<String>,
    cache_key: Option<String>,
}

/// Build and validate the dependency graph. Duplicate ids and missing deps
/// were already rejected by `Workflow::validate`; this detects cycles (a
/// graph where Kahn's algorithm cannot consume every node).
fn build_graph(workflow: &Workflow) -> SwarmResult<HashMap<String, DagNode>> {
    workflow.validate()?;

    let mut nodes: HashMap<String, DagNode> = workflow
        .tasks
        .iter()
        .map(|task| {
            (
                task.id.clone(),
                DagNode {
                    task: task.clone(),
                    in_degree: task.depends_on.len(),
                    children: Vec::new(),
                    cache_key: task.cacheable.then(|| cache_key(task)),
                },
            )
        })
        .collect();

    let edges: Vec<(String, String)> = workflow
        .tasks
        .iter()
        .flat_map(|task| {
            task.depends_on
                .iter()
                .map(|dep| (dep.clone(), task.id.clone()))
        })
        .collect();
    for (parent, child) in edges {
        nodes
            .get_mut(&parent)
            .expect("validated dependency")
            .children
            .push(child);
    }

    // Kahn feasibility check. No roots or unconsumed remainder means a cycle.
    let mut in_degree: HashMap<&str, usize> = nodes
        .iter()
        .map(|(id, node)| (id.as_str(), node.in_degree))
        .collect();
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut consumed = 0usize;
    while let Some(id) = queue.pop_front() {
        consumed += 1;
        for child in &nodes[id].children {
            let d = in_degree.get_mut(child.as_str()).expect("known child");
            *d -= 1;
            if *d == 0 {
                queue.push_back(child.as_str());
            }
        }
    }
    if consumed != nodes.len() {
        return Err(SwarmError::Cycle(workflow.name.clone()));
    }

    Ok(nodes)
}

/// Message from a worker back to the coordinator.
struct Outcome {
    task_id: String,
    result: TaskResult,
}

/// The workflow execution engine.
pub struct WorkflowEngine {
    config: EngineConfig,
    plugins: Arc<PluginRegistry>,
    cache: Arc<ResultCache>,
    registry: Arc<CancellationRegistry>,
}

impl WorkflowEngine {
    pub fn new(
        config: EngineConfig,
        plugins: Arc<PluginRegistry>,
        cache: Arc<ResultCache>,
        registry: Arc<CancellationRegistry>,
    ) -> Self {
        Self {
            config,
            plugins,
            cache,
            registry,
        }
    }

    pub fn registry(&self) -> Arc<CancellationRegistry> {
        self.registry.clone()
    }

    /// Execute a workflow to completion. Validation problems (cycles,
    /// missing deps) are errors; task failures are reported in the returned
    /// execution, not as an `Err`.
    pub async fn execute(&self, workflow: &Workflow) -> SwarmResult<WorkflowExecution> {
        self.execute_with_parameters(workflow, HashMap::new()).await
    }

    /// Execute with caller-supplied parameters, visible to conditions and
    /// templates as `parameters.<field>`.
    pub async fn execute_with_parameters(
        &self,
        workflow: &Workflow,
        parameters: HashMap<String, Value>,
    ) -> SwarmResult<WorkflowExecution> {
        let mut nodes = build_graph(workflow)?;

        let mut execution = WorkflowExecution::begin(&workflow.name);
        let cancel_rx = self
            .registry
            .register(&execution.workflow_id, &workflow.name)
            .await;

        let shared: Arc<RwLock<SharedContext>> = Arc::new(RwLock::new(SharedContext::new()));
        if !parameters.is_empty() {
            shared
                .write()
                .await
                .insert("parameters".to_string(), parameters.clone());
            execution
                .context
                .insert("parameters".to_string(), parameters);
        }

        for task in &workflow.tasks {
            execution
                .task_results
                .insert(task.id.clone(), TaskResult::pending(&task.id));
        }

        let (ready_tx, ready_rx) = mpsc::unbounded_channel::<Task>();
        let (outcome_tx, mut outcome_rx) = mpsc::channel::<Outcome>(self.config.max_workers * 2);
        let ready_rx = Arc::new(Mutex::new(ready_rx));

        let mut worker_handles = Vec::with_capacity(self.config.max_workers);
        for _ in 0..self.config.max_workers {
            worker_handles.push(self.spawn_worker(
                ready_rx.clone(),
                outcome_tx.clone(),
                shared.clone(),
                cancel_rx.clone(),
                execution.workflow_id.clone(),
                workflow.name.clone(),
            ));
        }
        drop(outcome_tx);

        // Seed all roots.
        let mut terminal: HashSet<String> = HashSet::new();
        let mut in_flight = 0usize;
        let mut ready_sender = Some(ready_tx);
        for node in nodes.values() {
            if node.in_degree == 0 {
                if let Some(tx) = &ready_sender {
                    let _ = tx.send(node.task.clone());
                    in_flight += 1;
                }
            }
        }

        let mut aborted: Option<ExecutionStatus> = None;
        let mut cancel_watch = cancel_rx.clone();

        while terminal.len() < nodes.len() {
            if in_flight == 0 {
                // Nothing running and nothing terminal-izable: only possible
                // after an abort stopped scheduling.
                break;
            }

            let outcome = tokio::select! {
                outcome = outcome_rx.recv() => match outcome {
                    Some(o) => o,
                    None => break,
                },
                _ = cancel_watch.changed() => {
                    if *cancel_watch.borrow() && aborted.is_none() {
                        aborted = Some(ExecutionStatus::Cancelled);
                        ready_sender = None;
                    }
                    continue;
                }
            };
            in_flight -= 1;

            let task_id = outcome.task_id.clone();
            terminal.insert(task_id.clone());

            if outcome.result.status == TaskStatus::Completed {
                let output = outcome.result.output.clone();
                shared.write().await.insert(task_id.clone(), output.clone());
                execution.context.insert(task_id.clone(), output);
            }

            let failed = outcome.result.status == TaskStatus::Failed;
            let allow_failure = nodes
                .get(&task_id)
                .map(|n| n.task.allow_failure)
                .unwrap_or(false);
            execution
                .task_results
                .insert(task_id.clone(), outcome.result);

            if failed && !allow_failure {
                if aborted.is_none() {
                    aborted = Some(ExecutionStatus::Failed);
                    // Stop scheduling and let in-flight tasks observe cancel.
                    ready_sender = None;
                    self.registry
                        .cancel(&execution.workflow_id, "task failure aborted workflow")
                        .await;
                }
                continue;
            }

            if aborted.is_some() {
                continue;
            }

            // Decrement children; enqueue, or skip subtrees on false
            // conditions.
            let children = nodes
                .get(&task_id)
                .map(|n| n.children.clone())
                .unwrap_or_default();
            for child_id in children {
                let ready = {
                    let child = nodes.get_mut(&child_id).expect("known child");
                    child.in_degree -= 1;
                    child.in_degree == 0
                };
                if !ready || terminal.contains(&child_id) {
                    continue;
                }

                let condition = nodes[&child_id].task.condition.clone();
                let passes = {
                    let ctx = shared.read().await;
                    evaluate(&condition, &ctx)
                };
                if passes {
                    if let Some(tx) = &ready_sender {
                        let _ = tx.send(nodes[&child_id].task.clone());
                        in_flight += 1;
                    }
                } else {
                    self.skip_subtree(&child_id, &mut nodes, &mut terminal, &mut execution);
                }
            }
        }

        // Shut the pool down and wait for workers to drain.
        drop(ready_sender);
        while let Some(outcome) = outcome_rx.recv().await {
            execution
                .task_results
                .insert(outcome.task_id.clone(), outcome.result);
            terminal.insert(outcome.task_id);
        }
        for handle in worker_handles {
            let _ = handle.await;
        }

        let final_status = aborted.unwrap_or_else(|| {
            let any_failed = execution
                .task_results
                .values()
                .any(|r| r.status == TaskStatus::Failed);
            if any_failed {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            }
        });
        execution.finish(final_status);

        let registry_status = match final_status {
            ExecutionStatus::Completed => RunStatus::Completed,
            ExecutionStatus::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        };
        self.registry
            .finish(&execution.workflow_id, registry_status)
            .await;

        counter!("swarm_workflow_runs_total", "status" => final_status.as_str()).increment(1);
        tracing::info!(
            workflow = workflow.name,
            workflow_id = execution.workflow_id,
            status = final_status.as_str(),
            duration_ms = execution.duration_ms(),
            "workflow execution finished"
        );

        Ok(execution)
    }

    /// Mark a false-conditioned task and its whole subtree skipped.
    fn skip_subtree(
        &self,
        root: &str,
        nodes: &mut HashMap<String, DagNode>,
        terminal: &mut HashSet<String>,
        execution: &mut WorkflowExecution,
    ) {
        let mut queue = VecDeque::from([root.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !terminal.insert(id.clone()) {
                continue;
            }
            execution
                .task_results
                .insert(id.clone(), TaskResult::skipped(&id));
            if let Some(node) = nodes.get(&id) {
                for child in node.children.clone() {
                    if let Some(c) = nodes.get_mut(&child) {
                        c.in_degree = c.in_degree.saturating_sub(1);
                    }
                    queue.push_back(child);
                }
            }
        }
    }

    fn spawn_worker(
        &self,
        ready_rx: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
        outcome_tx: mpsc::Sender<Outcome>,
        shared: Arc<RwLock<SharedContext>>,
        cancel_rx: watch::Receiver<bool>,
        workflow_id: String,
        workflow_name: String,
    ) -> tokio::task::JoinHandle<()> {
        let plugins = self.plugins.clone();
        let cache = self.cache.clone();
        let default_retry = self.config.default_retry.clone();

        tokio::spawn(async move {
            loop {
                let task = {
                    let mut rx = ready_rx.lock().await;
                    rx.recv().await
                };
                let task = match task {
                    Some(t) => t,
                    None => break,
                };

                gauge!("swarm_workflow_parallelism").increment(1.0);
                let result = run_task(
                    &task,
                    &plugins,
                    &cache,
                    &shared,
                    cancel_rx.clone(),
                    &workflow_id,
                    &workflow_name,
                    &default_retry,
                )
                .await;
                gauge!("swarm_workflow_parallelism").decrement(1.0);

                if outcome_tx
                    .send(Outcome {
                        task_id: task.id.clone(),
                        result,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    }
}

/// Execute one task: cache probe, then a bounded retry loop where each
/// attempt runs the plugin inside its own spawn (panic isolation) under the
/// task timeout, racing the workflow cancel signal.
#[allow(clippy::too_many_arguments)]
async fn run_task(
    task: &Task,
    plugins: &Arc<PluginRegistry>,
    cache: &Arc<ResultCache>,
    shared: &Arc<RwLock<SharedContext>>,
    mut cancel_rx: watch::Receiver<bool>,
    workflow_id: &str,
    workflow_name: &str,
    default_retry: &TaskRetry,
) -> TaskResult {
    let key = task.cacheable.then(|| cache_key(task));
    if let Some(key) = &key {
        if let Some(cached) = cache.get(key).await {
            tracing::debug!(task = task.id, "task served from result cache");
            return cached;
        }
    }

    let mut result = TaskResult::pending(&task.id);
    result.status = TaskStatus::Running;
    result.started_at = Some(Utc::now());
    let started = std::time::Instant::now();

    let plugin = match plugins.get(task.kind) {
        Ok(p) => p,
        Err(e) => {
            result.status = TaskStatus::Failed;
            result.error = Some(e.to_string());
            result.ended_at = Some(Utc::now());
            counter!("swarm_workflow_task_failures_total").increment(1);
            return result;
        }
    };

    let retry = task.retry.clone().unwrap_or_else(|| default_retry.clone());
    let max_attempts = retry.max_attempts.max(1);
    let mut wait = Duration::from_millis(retry.initial_wait_ms);
    let task_timeout = Duration::from_secs(task.timeout_secs.max(1));

    let mut last_error = String::new();
    for attempt in 1..=max_attempts {
        result.attempts = attempt;

        if *cancel_rx.borrow() {
            last_error = "execution cancelled".to_string();
            break;
        }

        let ctx = PluginContext {
            workflow_id: workflow_id.to_string(),
            workflow_name: workflow_name.to_string(),
            context: shared.read().await.clone(),
        };
        let plugin = plugin.clone();
        let task_clone = task.clone();
        let mut attempt_handle =
            tokio::spawn(async move { plugin.execute(&task_clone, &ctx).await });

        let attempt_result = tokio::select! {
            joined = timeout(task_timeout, &mut attempt_handle) => match joined {
                Ok(Ok(inner)) => inner,
                Ok(Err(join_err)) => {
                    // A panicking plugin must not take down the engine.
                    let message = if join_err.is_panic() {
                        match join_err.into_panic().downcast::<String>() {
                            Ok(msg) => *msg,
                            Err(payload) => match payload.downcast::<&'static str>() {
                                Ok(msg) => (*msg).to_string(),
                                Err(_) => "plugin panicked".to_string(),
                            },
                        }
                    } else {
                        "plugin task aborted".to_string()
                    };
                    Err(SwarmError::TaskFailed(format!("plugin panic: {message}")))
                }
                Err(_) => {
                    attempt_handle.abort();
                    Err(SwarmError::Timeout(task_timeout))
                }
            },
            _ = cancel_rx.changed() => {
                attempt_handle.abort();
                last_error = "execution cancelled".to_string();
                break;
            }
        };

        match attempt_result {
            Ok(output) => {
                result.status = TaskStatus::Completed;
                result.output = output;
                result.ended_at = Some(Utc::now());
                result.duration_ms = started.elapsed().as_millis() as u64;
                histogram!("swarm_workflow_task_duration_ms")
                    .record(result.duration_ms as f64);

                if let Some(key) = key {
                    cache.put(key, result.clone()).await;
                }
                return result;
            }
            Err(e) => {
                last_error = e.to_string();
                tracing::warn!(
                    task = task.id,
                    attempt,
                    max_attempts,
                    error = %e,
                    "task attempt failed"
                );
            }
        }

        if attempt < max_attempts {
            counter!("swarm_workflow_task_retries_total").increment(1);
            let sleep_for = jittered(wait);
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel_rx.changed() => {
                    last_error = "execution cancelled".to_string();
                    break;
                }
            }
            wait = Duration::from_millis(
                ((wait.as_millis() as f64 * retry.multiplier) as u64).min(retry.max_wait_ms),
            );
        }
    }

    result.status = TaskStatus::Failed;
    result.error = Some(last_error);
    result.ended_at = Some(Utc::now());
    result.duration_ms = started.elapsed().as_millis() as u64;
    counter!("swarm_workflow_task_failures_total").increment(1);
    result
}

/// Apply +/-10% jitter to a retry wait.
fn jittered(wait: Duration) -> Duration {
    let millis = wait.as_millis() as f64;
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_millis((millis * factor) as u64)
}
