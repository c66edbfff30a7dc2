//! Workflow triggers: cron schedules and event-driven launches.
//!
//! A ticker loop fires due cron schedules; `trigger_event` fans an event out
//! to every enabled schedule whose filters match, gated per schedule by
//! `max_concurrent`. Schedule configs persist in the store's schedules
//! bucket and are restored on startup.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::ScheduleConfig;
use crate::infrastructure::database::WorkflowStore;
use crate::services::workflow_engine::WorkflowEngine;

/// Configuration for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
        }
    }
}

struct Registration {
    config: ScheduleConfig,
    cron: Option<cron::Schedule>,
    registered_at: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
    /// Executions currently in flight for this schedule.
    running: Arc<AtomicU32>,
}

impl Registration {
    fn new(config: ScheduleConfig) -> SwarmResult<Self> {
        config.validate()?;
        let cron = match &config.cron_expr {
            Some(expr) => Some(cron::Schedule::from_str(expr).map_err(|e| {
                SwarmError::validation("cron_expr", format!("invalid cron expression: {e}"))
            })?),
            None => None,
        };
        Ok(Self {
            config,
            cron,
            registered_at: Utc::now(),
            last_fired: None,
            running: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Try to claim a concurrency slot; `max_concurrent = 0` is unbounded.
    fn try_claim(&self) -> bool {
        let max = self.config.max_concurrent;
        if max == 0 {
            self.running.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        self.running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < max).then_some(current + 1)
            })
            .is_ok()
    }
}

/// Cron + event trigger scheduler.
pub struct Scheduler {
    engine: Arc<WorkflowEngine>,
    store: Arc<WorkflowStore>,
    config: SchedulerConfig,
    /// All registrations keyed by workflow name.
    registrations: RwLock<HashMap<String, Arc<RwLock<Registration>>>>,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        store: Arc<WorkflowStore>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            store,
            config,
            registrations: RwLock::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Register a schedule and persist it. Replaces any prior schedule for
    /// the same workflow.
    pub async fn register(&self, config: ScheduleConfig) -> SwarmResult<()> {
        let registration = Registration::new(config.clone())?;
        self.store.put_schedule(&config).await?;
        self.registrations
            .write()
            .await
            .insert(config.workflow_name.clone(), Arc::new(RwLock::new(registration)));
        tracing::info!(workflow = config.workflow_name, "schedule registered");
        Ok(())
    }

    /// Remove a schedule from memory and the store.
    pub async fn unregister(&self, workflow_name: &str) -> SwarmResult<()> {
        self.registrations.write().await.remove(workflow_name);
        self.store.delete_schedule(workflow_name).await
    }

    /// Restore enabled schedules from the store. Called at startup.
    pub async fn restore(&self) -> SwarmResult<usize> {
        let stored = self.store.list_schedules().await?;
        let mut registrations = self.registrations.write().await;
        let mut restored = 0;
        for config in stored {
            if !config.enabled {
                continue;
            }
            match Registration::new(config.clone()) {
                Ok(reg) => {
                    registrations.insert(config.workflow_name.clone(), Arc::new(RwLock::new(reg)));
                    restored += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        workflow = config.workflow_name,
                        error = %e,
                        "skipping unrestorable schedule"
                    );
                }
            }
        }
        tracing::info!(restored, "schedules restored from store");
        Ok(restored)
    }

    pub async fn list(&self) -> Vec<ScheduleConfig> {
        let registrations = self.registrations.read().await;
        let mut configs = Vec::with_capacity(registrations.len());
        for reg in registrations.values() {
            configs.push(reg.read().await.config.clone());
        }
        configs.sort_by(|a, b| a.workflow_name.cmp(&b.workflow_name));
        configs
    }

    /// Fire an event. Every enabled schedule for `event_type` whose filters
    /// match `data` launches an async execution, bounded by its
    /// `max_concurrent`. Returns the number of launches.
    pub async fn trigger_event(
        &self,
        event_type: &str,
        data: HashMap<String, Value>,
    ) -> SwarmResult<usize> {
        counter!("swarm_event_triggers_total", "event_type" => event_type.to_string())
            .increment(1);

        let candidates: Vec<Arc<RwLock<Registration>>> = {
            let registrations = self.registrations.read().await;
            registrations.values().cloned().collect()
        };

        let mut launched = 0;
        for reg_lock in candidates {
            let (config, running) = {
                let reg = reg_lock.read().await;
                if reg.config.event_type.as_deref() != Some(event_type)
                    || !reg.config.enabled
                    || !reg.config.matches_event(&data)
                {
                    continue;
                }
                if !reg.try_claim() {
                    tracing::warn!(
                        workflow = reg.config.workflow_name,
                        "event trigger dropped: max_concurrent reached"
                    );
                    continue;
                }
                (reg.config.clone(), reg.running.clone())
            };

            launched += 1;
            let engine = self.engine.clone();
            let store = self.store.clone();
            tokio::spawn(async move {
                let result = tokio::time::timeout(
                    Duration::from_secs(config.timeout_secs.max(1)),
                    execute_scheduled(&engine, &store, &config),
                )
                .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!(workflow = config.workflow_name, error = %e, "event-triggered run failed");
                    }
                    Err(_) => {
                        tracing::error!(workflow = config.workflow_name, "event-triggered run timed out");
                        counter!("swarm_schedule_failures_total").increment(1);
                    }
                }
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        Ok(launched)
    }

    /// Start the cron ticker.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let scheduler = self.clone();

        tokio::spawn(async move {
            while scheduler.running.load(Ordering::SeqCst) {
                tokio::time::sleep(scheduler.config.tick_interval).await;
                scheduler.tick().await;
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One pass over all cron registrations, firing everything due.
    async fn tick(&self) {
        let now = Utc::now();
        let candidates: Vec<Arc<RwLock<Registration>>> = {
            let registrations = self.registrations.read().await;
            registrations.values().cloned().collect()
        };

        for reg_lock in candidates {
            let due = {
                let reg = reg_lock.read().await;
                match (&reg.cron, reg.config.enabled) {
                    (Some(schedule), true) => {
                        let reference = reg.last_fired.unwrap_or(reg.registered_at);
                        schedule
                            .after(&reference)
                            .next()
                            .is_some_and(|next| now >= next)
                    }
                    _ => false,
                }
            };
            if !due {
                continue;
            }

            let (config, running) = {
                let mut reg = reg_lock.write().await;
                reg.last_fired = Some(now);
                if !reg.try_claim() {
                    tracing::warn!(
                        workflow = reg.config.workflow_name,
                        "cron fire dropped: max_concurrent reached"
                    );
                    continue;
                }
                (reg.config.clone(), reg.running.clone())
            };

            let engine = self.engine.clone();
            let store = self.store.clone();
            tokio::spawn(async move {
                let result = tokio::time::timeout(
                    Duration::from_secs(config.timeout_secs.max(1)),
                    execute_scheduled(&engine, &store, &config),
                )
                .await;
                if !matches!(result, Ok(Ok(()))) {
                    tracing::error!(workflow = config.workflow_name, "scheduled run failed");
                }
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}

/// Load the workflow, execute it, persist the execution.
async fn execute_scheduled(
    engine: &WorkflowEngine,
    store: &WorkflowStore,
    config: &ScheduleConfig,
) -> SwarmResult<()> {
    let outcome: SwarmResult<()> = async {
        let workflow = store.get_workflow(&config.workflow_name).await?;
        let execution = engine.execute(&workflow).await?;
        store.put_execution(&execution).await?;
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => {
            counter!("swarm_schedule_runs_total").increment(1);
            Ok(())
        }
        Err(e) => {
            counter!("swarm_schedule_failures_total").increment(1);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Task, TaskKind, TaskRetry, Workflow};
    use crate::infrastructure::database::connection::migrated_test_pool;
    use crate::services::cancellation::CancellationRegistry;
    use crate::services::plugins::{PluginContext, PluginRegistry, TaskPlugin};
    use crate::services::result_cache::{ResultCache, ResultCacheConfig};
    use crate::services::workflow_engine::EngineConfig;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;

    struct CountingPlugin {
        calls: StdAtomicU32,
    }

    #[async_trait]
    impl TaskPlugin for CountingPlugin {
        async fn execute(
            &self,
            _task: &Task,
            _ctx: &PluginContext,
        ) -> SwarmResult<HashMap<String, Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HashMap::from([("done".to_string(), json!(true))]))
        }
    }

    async fn setup() -> (Arc<Scheduler>, Arc<WorkflowStore>, Arc<CountingPlugin>) {
        let pool = migrated_test_pool().await.unwrap();
        let store = Arc::new(WorkflowStore::new(pool));

        let plugin = Arc::new(CountingPlugin {
            calls: StdAtomicU32::new(0),
        });
        let mut plugins = PluginRegistry::empty();
        plugins.register(TaskKind::Http, plugin.clone());

        let engine = Arc::new(WorkflowEngine::new(
            EngineConfig {
                max_workers: 2,
                default_retry: TaskRetry {
                    max_attempts: 1,
                    initial_wait_ms: 1,
                    multiplier: 2.0,
                    max_wait_ms: 10,
                },
            },
            Arc::new(plugins),
            ResultCache::new(ResultCacheConfig::default()),
            CancellationRegistry::new(),
        ));

        let scheduler = Scheduler::new(engine, store.clone(), SchedulerConfig::default());
        (scheduler, store, plugin)
    }

    fn one_task_workflow(name: &str) -> Workflow {
        Workflow::new(name).with_task(Task::new("t", TaskKind::Http))
    }

    #[tokio::test]
    async fn test_register_persists_schedule() {
        let (scheduler, store, _) = setup().await;
        scheduler
            .register(ScheduleConfig::cron("wf", "0 0 4 * * *"))
            .await
            .unwrap();

        assert_eq!(store.list_schedules().await.unwrap().len(), 1);
        assert_eq!(scheduler.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_schedule_rejected() {
        let (scheduler, _, _) = setup().await;
        assert!(scheduler
            .register(ScheduleConfig::cron("wf", "bogus"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_restore_loads_enabled_schedules() {
        let (scheduler, store, _) = setup().await;
        store
            .put_schedule(&ScheduleConfig::cron("enabled-wf", "0 0 4 * * *"))
            .await
            .unwrap();
        let mut disabled = ScheduleConfig::cron("disabled-wf", "0 0 4 * * *");
        disabled.enabled = false;
        store.put_schedule(&disabled).await.unwrap();

        assert_eq!(scheduler.restore().await.unwrap(), 1);
        assert_eq!(scheduler.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_event_trigger_runs_matching_workflow() {
        let (scheduler, store, plugin) = setup().await;
        store.put_workflow(&one_task_workflow("on-threat")).await.unwrap();

        let mut config = ScheduleConfig::event("on-threat", "threat.detected");
        config.event_filter.insert("severity".into(), "high".into());
        scheduler.register(config).await.unwrap();

        let launched = scheduler
            .trigger_event(
                "threat.detected",
                HashMap::from([("severity".to_string(), json!("high"))]),
            )
            .await
            .unwrap();
        assert_eq!(launched, 1);

        // Wait for the async execution to land in the store.
        for _ in 0..50 {
            if !store
                .list_executions("on-threat", None, None, 10)
                .await
                .unwrap()
                .is_empty()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_event_filter_mismatch_no_launch() {
        let (scheduler, store, plugin) = setup().await;
        store.put_workflow(&one_task_workflow("on-threat")).await.unwrap();

        let mut config = ScheduleConfig::event("on-threat", "threat.detected");
        config.event_filter.insert("severity".into(), "high".into());
        scheduler.register(config).await.unwrap();

        let launched = scheduler
            .trigger_event(
                "threat.detected",
                HashMap::from([("severity".to_string(), json!("low"))]),
            )
            .await
            .unwrap();
        assert_eq!(launched, 0);
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_event_type_no_launch() {
        let (scheduler, _, _) = setup().await;
        let launched = scheduler
            .trigger_event("never.registered", HashMap::new())
            .await
            .unwrap();
        assert_eq!(launched, 0);
    }

    #[tokio::test]
    async fn test_max_concurrent_gate() {
        let (scheduler, store, _) = setup().await;
        store.put_workflow(&one_task_workflow("gated")).await.unwrap();

        let mut config = ScheduleConfig::event("gated", "burst");
        config.max_concurrent = 1;
        scheduler.register(config).await.unwrap();

        // Claim the only slot by hand, then fire.
        {
            let registrations = scheduler.registrations.read().await;
            let reg = registrations.get("gated").unwrap().read().await;
            assert!(reg.try_claim());
        }
        let launched = scheduler.trigger_event("burst", HashMap::new()).await.unwrap();
        assert_eq!(launched, 0);
    }

    #[tokio::test]
    async fn test_cron_ticker_fires_due_schedule() {
        let (scheduler, store, plugin) = setup().await;
        store.put_workflow(&one_task_workflow("every-second")).await.unwrap();

        let mut scheduler_cfg = SchedulerConfig::default();
        scheduler_cfg.tick_interval = Duration::from_millis(100);
        // Rebuild the scheduler with the fast tick.
        let fast = Scheduler::new(
            scheduler.engine.clone(),
            store.clone(),
            scheduler_cfg,
        );
        fast.register(ScheduleConfig::cron("every-second", "* * * * * *"))
            .await
            .unwrap();

        let handle = fast.start();
        for _ in 0..60 {
            if plugin.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        fast.stop();
        handle.abort();

        assert!(plugin.calls.load(Ordering::SeqCst) >= 1, "cron never fired");
    }

    #[tokio::test]
    async fn test_unregister_removes_from_store() {
        let (scheduler, store, _) = setup().await;
        scheduler
            .register(ScheduleConfig::cron("wf", "0 0 4 * * *"))
            .await
            .unwrap();
        scheduler.unregister("wf").await.unwrap();

        assert!(scheduler.list().await.is_empty());
        assert!(store.list_schedules().await.unwrap().is_empty());
    }
}
