//! Durable workflow store over five logical buckets.
//!
//! Buckets: `workflows` (name -> canonical JSON), `executions`
//! (workflow_id -> canonical JSON), `versions` (archived prior bytes),
//! `schedules` (workflow_name -> ScheduleConfig JSON), and `exec_index`
//! (`"<workflow>:<start_ns>:<workflow_id>"` -> workflow_id) supporting
//! time-range listing by key prefix.
//!
//! Reads are served from in-memory caches where possible and fall back to
//! the database; one writer mutex serializes mutations.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, RwLock};

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::{ScheduleConfig, Workflow, WorkflowExecution};

/// Maximum executions held in the in-memory cache.
const EXECUTION_CACHE_CAP: usize = 256;

/// Store statistics for the `/v1/stats/db` surface.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub workflows: u64,
    pub executions: u64,
    pub versions: u64,
    pub schedules: u64,
    pub index_entries: u64,
    pub cached_workflows: usize,
    pub cached_executions: usize,
}

pub struct WorkflowStore {
    pool: SqlitePool,
    /// Serializes bucket mutations; reads bypass it.
    write_lock: Mutex<()>,
    workflow_cache: RwLock<HashMap<String, Workflow>>,
    execution_cache: RwLock<HashMap<String, WorkflowExecution>>,
}

fn now_nanos() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_millis() * 1_000_000)
}

fn record_read(start: Instant) {
    histogram!("swarm_workflow_db_read_ms").record(start.elapsed().as_secs_f64() * 1_000.0);
}

fn record_write(start: Instant) {
    histogram!("swarm_workflow_db_write_ms").record(start.elapsed().as_secs_f64() * 1_000.0);
}

impl WorkflowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
            workflow_cache: RwLock::new(HashMap::new()),
            execution_cache: RwLock::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    /// Store a workflow under its name. An existing entry with different
    /// bytes is archived to `versions["<name>:<now_ns>"]` first; identical
    /// bytes are a no-op (no new version).
    pub async fn put_workflow(&self, workflow: &Workflow) -> SwarmResult<()> {
        let bytes = workflow.canonical_bytes()?;
        let _guard = self.write_lock.lock().await;
        let start = Instant::now();

        let existing: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM workflows WHERE key = ?1")
                .bind(&workflow.name)
                .fetch_optional(&self.pool)
                .await?;

        if let Some((old_bytes,)) = existing {
            if old_bytes == bytes {
                record_write(start);
                return Ok(());
            }
            let version_key = format!("{}:{}", workflow.name, now_nanos());
            sqlx::query("INSERT OR REPLACE INTO versions (key, value) VALUES (?1, ?2)")
                .bind(&version_key)
                .bind(&old_bytes)
                .execute(&self.pool)
                .await?;
        }

        sqlx::query("INSERT OR REPLACE INTO workflows (key, value) VALUES (?1, ?2)")
            .bind(&workflow.name)
            .bind(&bytes)
            .execute(&self.pool)
            .await?;
        record_write(start);

        self.workflow_cache
            .write()
            .await
            .insert(workflow.name.clone(), workflow.clone());
        Ok(())
    }

    pub async fn get_workflow(&self, name: &str) -> SwarmResult<Workflow> {
        {
            let cache = self.workflow_cache.read().await;
            if let Some(workflow) = cache.get(name) {
                counter!("swarm_workflow_db_cache_hits_total").increment(1);
                return Ok(workflow.clone());
            }
        }

        let start = Instant::now();
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM workflows WHERE key = ?1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        record_read(start);

        let (bytes,) = row.ok_or_else(|| SwarmError::not_found("workflow", name))?;
        let workflow: Workflow = serde_json::from_slice(&bytes)?;
        self.workflow_cache
            .write()
            .await
            .insert(name.to_string(), workflow.clone());
        Ok(workflow)
    }

    pub async fn list_workflows(&self) -> SwarmResult<Vec<Workflow>> {
        let start = Instant::now();
        let rows: Vec<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM workflows ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        record_read(start);

        rows.into_iter()
            .map(|(bytes,)| serde_json::from_slice(&bytes).map_err(SwarmError::from))
            .collect()
    }

    /// Archive the current bytes under `versions["archive:<name>:<now_ns>"]`
    /// and delete the workflow.
    pub async fn delete_workflow(&self, name: &str) -> SwarmResult<()> {
        let _guard = self.write_lock.lock().await;
        let start = Instant::now();

        let existing: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM workflows WHERE key = ?1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        let (bytes,) = existing.ok_or_else(|| SwarmError::not_found("workflow", name))?;

        let archive_key = format!("archive:{}:{}", name, now_nanos());
        sqlx::query("INSERT OR REPLACE INTO versions (key, value) VALUES (?1, ?2)")
            .bind(&archive_key)
            .bind(&bytes)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM workflows WHERE key = ?1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        record_write(start);

        self.workflow_cache.write().await.remove(name);
        Ok(())
    }

    /// Archived versions of a workflow, oldest first. Excludes
    /// delete-archives (`archive:` prefix).
    pub async fn get_workflow_versions(&self, name: &str) -> SwarmResult<Vec<Workflow>> {
        let prefix = format!("{name}:");
        let upper = format!("{name};");
        let start = Instant::now();
        let rows: Vec<(Vec<u8>,)> = sqlx::query_as(
            "SELECT value FROM versions WHERE key >= ?1 AND key < ?2 ORDER BY key",
        )
        .bind(&prefix)
        .bind(&upper)
        .fetch_all(&self.pool)
        .await?;
        record_read(start);

        rows.into_iter()
            .map(|(bytes,)| serde_json::from_slice(&bytes).map_err(SwarmError::from))
            .collect()
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    /// Persist an execution and its range-scan index entry.
    pub async fn put_execution(&self, execution: &WorkflowExecution) -> SwarmResult<()> {
        let bytes = serde_json::to_vec(execution)?;
        let index_key = format!(
            "{}:{}:{}",
            execution.workflow_name,
            execution.start_nanos(),
            execution.workflow_id
        );

        let _guard = self.write_lock.lock().await;
        let start = Instant::now();
        sqlx::query("INSERT OR REPLACE INTO executions (key, value) VALUES (?1, ?2)")
            .bind(&execution.workflow_id)
            .bind(&bytes)
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT OR REPLACE INTO exec_index (key, workflow_id) VALUES (?1, ?2)")
            .bind(&index_key)
            .bind(&execution.workflow_id)
            .execute(&self.pool)
            .await?;
        record_write(start);

        let mut cache = self.execution_cache.write().await;
        if cache.len() >= EXECUTION_CACHE_CAP && !cache.contains_key(&execution.workflow_id) {
            // Evict the oldest execution by start time.
            if let Some(oldest) = cache
                .values()
                .min_by_key(|e| e.started_at)
                .map(|e| e.workflow_id.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(execution.workflow_id.clone(), execution.clone());
        Ok(())
    }

    pub async fn get_execution(&self, workflow_id: &str) -> SwarmResult<WorkflowExecution> {
        {
            let cache = self.execution_cache.read().await;
            if let Some(execution) = cache.get(workflow_id) {
                counter!("swarm_workflow_db_cache_hits_total").increment(1);
                return Ok(execution.clone());
            }
        }

        let start = Instant::now();
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM executions WHERE key = ?1")
                .bind(workflow_id)
                .fetch_optional(&self.pool)
                .await?;
        record_read(start);

        let (bytes,) = row.ok_or_else(|| SwarmError::not_found("execution", workflow_id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Executions of a workflow within `[from, to]`, oldest first, capped at
    /// `limit`. Uses a prefix range over the index bucket.
    pub async fn list_executions(
        &self,
        workflow_name: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: usize,
    ) -> SwarmResult<Vec<WorkflowExecution>> {
        let prefix = format!("{workflow_name}:");
        let upper = format!("{workflow_name};");
        let start = Instant::now();
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT key, workflow_id FROM exec_index WHERE key >= ?1 AND key < ?2 ORDER BY key",
        )
        .bind(&prefix)
        .bind(&upper)
        .fetch_all(&self.pool)
        .await?;
        record_read(start);

        let mut executions = Vec::new();
        for (key, workflow_id) in rows {
            if executions.len() >= limit {
                break;
            }
            // key = "<workflow>:<start_ns>:<workflow_id>"
            let start_ns: i64 = key
                .strip_prefix(&prefix)
                .and_then(|rest| rest.split(':').next())
                .and_then(|ns| ns.parse().ok())
                .unwrap_or(0);
            if let Some(from) = from {
                if start_ns < from.timestamp_nanos_opt().unwrap_or(i64::MIN) {
                    continue;
                }
            }
            if let Some(to) = to {
                if start_ns > to.timestamp_nanos_opt().unwrap_or(i64::MAX) {
                    continue;
                }
            }
            executions.push(self.get_execution(&workflow_id).await?);
        }
        Ok(executions)
    }

    // ------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------

    pub async fn put_schedule(&self, schedule: &ScheduleConfig) -> SwarmResult<()> {
        schedule.validate()?;
        let bytes = serde_json::to_vec(schedule)?;

        let _guard = self.write_lock.lock().await;
        let start = Instant::now();
        sqlx::query("INSERT OR REPLACE INTO schedules (key, value) VALUES (?1, ?2)")
            .bind(&schedule.workflow_name)
            .bind(&bytes)
            .execute(&self.pool)
            .await?;
        record_write(start);
        Ok(())
    }

    pub async fn get_schedule(&self, workflow_name: &str) -> SwarmResult<ScheduleConfig> {
        let start = Instant::now();
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM schedules WHERE key = ?1")
                .bind(workflow_name)
                .fetch_optional(&self.pool)
                .await?;
        record_read(start);

        let (bytes,) = row.ok_or_else(|| SwarmError::not_found("schedule", workflow_name))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn list_schedules(&self) -> SwarmResult<Vec<ScheduleConfig>> {
        let start = Instant::now();
        let rows: Vec<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM schedules ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        record_read(start);

        rows.into_iter()
            .map(|(bytes,)| serde_json::from_slice(&bytes).map_err(SwarmError::from))
            .collect()
    }

    pub async fn delete_schedule(&self, workflow_name: &str) -> SwarmResult<()> {
        let _guard = self.write_lock.lock().await;
        let start = Instant::now();
        let result = sqlx::query("DELETE FROM schedules WHERE key = ?1")
            .bind(workflow_name)
            .execute(&self.pool)
            .await?;
        record_write(start);

        if result.rows_affected() == 0 {
            return Err(SwarmError::not_found("schedule", workflow_name));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub async fn stats(&self) -> SwarmResult<StoreStats> {
        let start = Instant::now();
        let mut counts = [0u64; 5];
        for (i, table) in ["workflows", "executions", "versions", "schedules", "exec_index"]
            .iter()
            .enumerate()
        {
            let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await?;
            counts[i] = count as u64;
        }
        record_read(start);

        Ok(StoreStats {
            workflows: counts[0],
            executions: counts[1],
            versions: counts[2],
            schedules: counts[3],
            index_entries: counts[4],
            cached_workflows: self.workflow_cache.read().await.len(),
            cached_executions: self.execution_cache.read().await.len(),
        })
    }
}
