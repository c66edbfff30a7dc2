//! Rate limiting disciplines.
//!
//! The primary limiter is a token bucket with a secondary sliding-window cap:
//! the bucket shapes burst rate, the window bounds absolute volume per
//! interval. A hybrid variant adds a bounded leaky-bucket queue so callers
//! can wait for admission instead of being rejected outright. Per-client
//! isolation comes from a keyed pool with stale-entry cleanup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::counter;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::domain::errors::SwarmError;

/// Why an admission request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitRejection {
    /// The sliding-window volume cap was reached.
    WindowExceeded,
    /// The token bucket had too few tokens.
    TokensExhausted,
}

impl std::fmt::Display for RateLimitRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WindowExceeded => write!(f, "sliding window exceeded"),
            Self::TokensExhausted => write!(f, "token bucket exhausted"),
        }
    }
}

/// Configuration shared by the limiter variants.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum token count (burst capacity).
    pub capacity: f64,
    /// Tokens added per second.
    pub fill_rate: f64,
    /// Sliding-window duration.
    pub window: Duration,
    /// Maximum admissions per window.
    pub max_per_window: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 200.0,
            fill_rate: 200.0 / 60.0,
            window: Duration::from_secs(60),
            max_per_window: 400,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    available: f64,
    last_refill: Instant,
    window_start: Instant,
    window_count: u64,
}

/// Token bucket with a secondary sliding-window counter.
///
/// Admission is linearizable per instance: all checks and updates happen
/// under one mutex with no suspension points.
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
}

/// Point-in-time view of a limiter, served on the introspection surface.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub available: f64,
    pub capacity: f64,
    pub window_count: u64,
    pub max_per_window: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(BucketState {
                available: config.capacity,
                last_refill: now,
                window_start: now,
                window_count: 0,
            }),
            config,
        }
    }

    /// Lazy refill and window rotation. Called with the lock held.
    fn advance(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.available =
            (state.available + elapsed * self.config.fill_rate).min(self.config.capacity);
        state.last_refill = now;

        if now.duration_since(state.window_start) >= self.config.window {
            state.window_start = now;
            state.window_count = 0;
        }
    }

    /// Try to admit `n` units.
    pub fn try_acquire(&self, n: u64) -> Result<(), RateLimitRejection> {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        self.advance(&mut state, now);

        if state.window_count + n > self.config.max_per_window {
            counter!("swarm_ratelimiter_window_drops_total").increment(1);
            return Err(RateLimitRejection::WindowExceeded);
        }
        if state.available < n as f64 {
            counter!("swarm_ratelimiter_token_drops_total").increment(1);
            return Err(RateLimitRejection::TokensExhausted);
        }

        state.available -= n as f64;
        state.window_count += n;
        Ok(())
    }

    /// How long until `n` tokens could be available. Zero when they already
    /// are. Ignores the window cap, which cannot be waited out incrementally.
    pub fn reserve_after(&self, n: u64) -> Duration {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        self.advance(&mut state, now);

        let deficit = n as f64 - state.available;
        if deficit <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / self.config.fill_rate)
        }
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        self.advance(&mut state, now);
        RateLimiterSnapshot {
            available: state.available,
            capacity: self.config.capacity,
            window_count: state.window_count,
            max_per_window: self.config.max_per_window,
        }
    }
}

/// Token bucket backed by a bounded leaky-bucket waiter queue.
///
/// Bursts up to `capacity` pass immediately; once the bucket drains, callers
/// queue and are released one per `leak_rate` by a background worker, so the
/// steady-state output rate never exceeds `1 / leak_rate`.
pub struct HybridLimiter {
    limiter: Arc<RateLimiter>,
    waiters: mpsc::Sender<oneshot::Sender<()>>,
}

impl HybridLimiter {
    pub fn new(config: RateLimiterConfig, leak_rate: Duration, queue_size: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<oneshot::Sender<()>>(queue_size.max(1));

        tokio::spawn(async move {
            while let Some(waiter) = rx.recv().await {
                // A dropped receiver just means the caller gave up waiting.
                let _ = waiter.send(());
                tokio::time::sleep(leak_rate).await;
            }
        });

        Self {
            limiter: Arc::new(RateLimiter::new(config)),
            waiters: tx,
        }
    }

    /// Fast-path admission; never waits.
    pub fn allow(&self) -> bool {
        self.limiter.try_acquire(1).is_ok()
    }

    /// Admission that queues when the bucket is empty. Fails fast with
    /// `rate_limited` when the waiter queue is full.
    pub async fn wait(&self) -> Result<(), SwarmError> {
        if self.allow() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.try_send(tx).map_err(|_| SwarmError::RateLimited {
            key: "queue".to_string(),
        })?;
        rx.await.map_err(|_| SwarmError::Internal("rate limiter worker stopped".into()))
    }
}

/// How long an untouched per-key limiter survives before cleanup.
const STALE_CUTOFF: Duration = Duration::from_secs(30 * 60);
/// Minimum interval between cleanup sweeps.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

struct PoolEntry {
    limiter: Arc<RateLimiter>,
    last_seen: Instant,
}

/// One limiter per client key, with opportunistic stale-entry cleanup.
pub struct KeyedLimiterPool {
    config: RateLimiterConfig,
    entries: RwLock<HashMap<String, PoolEntry>>,
    last_cleanup: Mutex<Instant>,
}

impl KeyedLimiterPool {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Admit one unit for `key`, creating the key's limiter on first use.
    pub async fn try_acquire(&self, key: &str) -> Result<(), RateLimitRejection> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                return entry.limiter.try_acquire(1);
            }
        }

        let mut entries = self.entries.write().await;
        self.cleanup_locked(&mut entries);
        let entry = entries.entry(key.to_string()).or_insert_with(|| PoolEntry {
            limiter: Arc::new(RateLimiter::new(self.config.clone())),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        entry.limiter.try_acquire(1)
    }

    /// Drop limiters idle past the stale cutoff. Called under the write lock,
    /// at most once per `CLEANUP_INTERVAL`.
    fn cleanup_locked(&self, entries: &mut HashMap<String, PoolEntry>) {
        let mut last = self.last_cleanup.lock().expect("cleanup lock poisoned");
        if last.elapsed() < CLEANUP_INTERVAL {
            return;
        }
        *last = Instant::now();
        entries.retain(|_, entry| entry.last_seen.elapsed() < STALE_CUTOFF);
    }

    pub async fn snapshot(&self) -> HashMap<String, RateLimiterSnapshot> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.limiter.snapshot()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
