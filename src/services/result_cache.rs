//! LRU + TTL cache for cacheable task results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::domain::models::{Task, TaskResult};

/// Stable cache key: SHA-256 over the task's canonical JSON.
pub fn cache_key(task: &Task) -> String {
    let bytes = serde_json::to_vec(task).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: TaskResult,
    expires_at: Instant,
    last_used: Instant,
}

/// Configuration for the result cache.
#[derive(Debug, Clone)]
pub struct ResultCacheConfig {
    pub max_size: usize,
    pub ttl: Duration,
    /// Interval of the background sweep that purges expired entries.
    pub sweep_interval: Duration,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 512,
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Task-result cache with LRU eviction and TTL expiry.
pub struct ResultCache {
    config: ResultCacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResultCache {
    pub fn new(config: ResultCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch an unexpired entry, refreshing its LRU position.
    pub async fn get(&self, key: &str) -> Option<TaskResult> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        let expired = matches!(entries.get(key), Some(e) if e.expires_at <= now);
        if expired {
            entries.remove(key);
        }

        match entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = now;
                counter!("swarm_workflow_cache_hits_total").increment(1);
                Some(entry.result.clone())
            }
            None => {
                counter!("swarm_workflow_cache_misses_total").increment(1);
                None
            }
        }
    }

    /// Insert a result, evicting the least-recently-used entry at capacity.
    pub async fn put(&self, key: String, result: TaskResult) {
        let mut entries = self.entries.lock().await;

        if entries.len() >= self.config.max_size && !entries.contains_key(&key) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }

        let now = Instant::now();
        entries.insert(
            key,
            CacheEntry {
                result,
                expires_at: now + self.config.ttl,
                last_used: now,
            },
        );
    }

    /// Remove expired entries. Also run periodically by `start_sweeper`.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Spawn the periodic expiry sweep.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        let interval = cache.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let purged = cache.purge_expired().await;
                if purged > 0 {
                    tracing::debug!(purged, "result cache sweep");
                }
            }
        })
    }
}
