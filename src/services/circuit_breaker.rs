//! Adaptive circuit breaker for failure detection and fast failure.
//!
//! Tracks outcomes in a rolling window of fixed-time buckets and trips open
//! when the windowed failure rate crosses a threshold. The threshold is
//! either static or adaptive: under sustained pressure it shrinks so the
//! breaker trips faster, and it relaxes slowly once traffic is healthy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::counter;
use serde::Serialize;
use tokio::sync::RwLock;

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Total rolling-window duration.
    pub window: Duration,
    /// Number of fixed-time buckets the window is partitioned into.
    pub buckets: usize,
    /// Minimum observations in the window before the failure rate is evaluated.
    pub min_samples: u64,
    /// Static failure-rate threshold for tripping open.
    pub failure_rate_open: f64,
    /// How long the breaker stays open before probing.
    pub half_open_after: Duration,
    /// Maximum concurrently admitted probe calls while half-open.
    pub max_half_open_probes: u32,
    /// Whether the trip threshold adapts to observed pressure.
    pub adaptive: bool,
    /// Lower clamp for the adaptive threshold.
    pub min_adaptive: f64,
    /// Upper clamp for the adaptive threshold.
    pub max_adaptive: f64,
    /// Minimum interval between adaptive re-evaluations.
    pub eval_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            buckets: 10,
            min_samples: 10,
            failure_rate_open: 0.5,
            half_open_after: Duration::from_secs(30),
            max_half_open_probes: 2,
            adaptive: false,
            min_adaptive: 0.1,
            max_adaptive: 0.9,
            eval_interval: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    /// Breaker that adapts its threshold under sustained failure pressure.
    pub fn adaptive() -> Self {
        Self {
            adaptive: true,
            ..Default::default()
        }
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// One fixed-time bucket of the rolling window.
#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    interval: u64,
    success: u64,
    failure: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    buckets: Vec<Bucket>,
    opened_at: Option<Instant>,
    half_open_admitted: u32,
    half_open_successes: u32,
    dynamic_threshold: f64,
    last_eval: Option<Instant>,
    open_count: u64,
    closed_count: u64,
}

/// Thread-safe adaptive circuit breaker. All operations hold the internal
/// mutex for O(1) work only.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    epoch: Instant,
    inner: Mutex<Inner>,
}

/// Point-in-time view of a breaker, served on the introspection surface.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub total: u64,
    pub failures: u64,
    pub failure_rate: f64,
    pub threshold: f64,
    pub open_count: u64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let dynamic_threshold = config.failure_rate_open;
        Self {
            name: name.into(),
            config,
            epoch: Instant::now(),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                buckets: vec![Bucket::default(); 0],
                opened_at: None,
                half_open_admitted: 0,
                half_open_successes: 0,
                dynamic_threshold,
                last_eval: None,
                open_count: 0,
                closed_count: 0,
            }),
        }
    }

    fn bucket_width(&self) -> Duration {
        self.config.window / self.config.buckets as u32
    }

    /// Current interval number since the breaker was created.
    fn current_interval(&self) -> u64 {
        let width = self.bucket_width().as_nanos().max(1);
        (self.epoch.elapsed().as_nanos() / width) as u64
    }

    /// Bucket for the current interval, reset lazily when the interval has
    /// rolled past the bucket's previous occupant.
    fn rotate<'a>(&self, inner: &'a mut Inner) -> &'a mut Bucket {
        if inner.buckets.len() != self.config.buckets {
            inner.buckets = vec![Bucket::default(); self.config.buckets.max(1)];
        }
        let interval = self.current_interval();
        let idx = (interval % inner.buckets.len() as u64) as usize;
        let bucket = &mut inner.buckets[idx];
        if bucket.interval != interval {
            *bucket = Bucket {
                interval,
                success: 0,
                failure: 0,
            };
        }
        bucket
    }

    /// Sum live buckets. Buckets whose interval fell out of the window are
    /// ignored; they will be reset on their next write.
    fn window_stats(&self, inner: &Inner) -> (u64, u64) {
        let interval = self.current_interval();
        let live = inner.buckets.len() as u64;
        let mut total = 0;
        let mut failures = 0;
        for bucket in &inner.buckets {
            if interval.saturating_sub(bucket.interval) < live {
                total += bucket.success + bucket.failure;
                failures += bucket.failure;
            }
        }
        (total, failures)
    }

    fn effective_threshold(&self, inner: &Inner) -> f64 {
        if self.config.adaptive {
            inner.dynamic_threshold
        } else {
            self.config.failure_rate_open
        }
    }

    /// Re-evaluate the adaptive threshold, at most once per `eval_interval`.
    /// Shrinks fast (x0.7) under pressure, grows slowly (x1.05) when calm.
    fn adapt(&self, inner: &mut Inner, failure_rate: f64) {
        if !self.config.adaptive {
            return;
        }
        let due = match inner.last_eval {
            None => true,
            Some(at) => at.elapsed() >= self.config.eval_interval,
        };
        if !due {
            return;
        }
        inner.last_eval = Some(Instant::now());
        if failure_rate > self.config.failure_rate_open {
            inner.dynamic_threshold =
                (inner.dynamic_threshold * 0.7).max(self.config.min_adaptive);
        } else {
            inner.dynamic_threshold =
                (inner.dynamic_threshold * 1.05).min(self.config.max_adaptive);
        }
    }

    fn trip_open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_admitted = 0;
        inner.half_open_successes = 0;
        inner.open_count += 1;
        counter!("swarm_resilience_circuit_open_total", "name" => self.name.clone())
            .increment(1);
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.half_open_admitted = 0;
        inner.half_open_successes = 0;
        inner.buckets.clear();
        inner.closed_count += 1;
        counter!("swarm_resilience_circuit_closed_total", "name" => self.name.clone())
            .increment(1);
    }

    /// Whether a call may proceed. An open breaker lazily transitions to
    /// half-open once `half_open_after` has elapsed; half-open admits at most
    /// `max_half_open_probes` outstanding probes.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.half_open_after {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_admitted = 1;
                    inner.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_admitted < self.config.max_half_open_probes {
                    inner.half_open_admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a call outcome.
    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                let bucket = self.rotate(&mut inner);
                if success {
                    bucket.success += 1;
                } else {
                    bucket.failure += 1;
                }

                let (total, failures) = self.window_stats(&inner);
                if total < self.config.min_samples {
                    return;
                }
                let failure_rate = failures as f64 / total as f64;
                self.adapt(&mut inner, failure_rate);
                if failure_rate >= self.effective_threshold(&inner) {
                    self.trip_open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.max_half_open_probes {
                        self.close(&mut inner);
                    }
                } else {
                    // Any probe failure sends the breaker back to open.
                    self.trip_open(&mut inner);
                }
            }
            // Records that race past an allow() refusal are dropped.
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .expect("circuit breaker lock poisoned")
            .state
    }

    /// (total, failures) across the live window.
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock().expect("circuit breaker lock poisoned");
        self.window_stats(&inner)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().expect("circuit breaker lock poisoned");
        let (total, failures) = self.window_stats(&inner);
        let failure_rate = if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        };
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            total,
            failures,
            failure_rate,
            threshold: self.effective_threshold(&inner),
            open_count: inner.open_count,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One circuit breaker per named downstream service.
pub struct CircuitBreakerPool {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerPool {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the breaker for a downstream, creating it on first use.
    pub async fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(service) {
                return breaker.clone();
            }
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, self.config.clone())))
            .clone()
    }

    pub async fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let breakers = self.breakers.read().await;
        let mut out: Vec<CircuitSnapshot> = breakers.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            window: Duration::from_secs(2),
            buckets: 4,
            min_samples: 4,
            failure_rate_open: 0.5,
            half_open_after: Duration::from_millis(500),
            max_half_open_probes: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_closed_allows() {
        let breaker = CircuitBreaker::new("t", fast_config());
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trips_at_threshold() {
        let breaker = CircuitBreaker::new("t", fast_config());
        for _ in 0..4 {
            breaker.record(false);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_below_min_samples_never_trips() {
        let breaker = CircuitBreaker::new("t", fast_config());
        breaker.record(false);
        breaker.record(false);
        breaker.record(false);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn test_mixed_traffic_below_rate_stays_closed() {
        let breaker = CircuitBreaker::new("t", fast_config());
        for _ in 0..6 {
            breaker.record(true);
        }
        breaker.record(false);
        breaker.record(false);
        // 2 failures / 8 total = 0.25 < 0.5
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_recovery_closes() {
        let breaker = CircuitBreaker::new("t", fast_config());
        for _ in 0..4 {
            breaker.record(false);
        }
        assert!(!breaker.allow());

        tokio::time::sleep(Duration::from_millis(600)).await;

        // First allow transitions to half-open and admits probe 1.
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record(true);

        assert!(breaker.allow());
        breaker.record(true);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow());
        // Window was cleared on close.
        assert_eq!(breaker.stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("t", fast_config());
        for _ in 0..4 {
            breaker.record(false);
        }
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(breaker.allow());
        breaker.record(false);

        assert_eq!(breaker.state(), CircuitState::Open);
        // opened_at was reset; still blocked.
        assert!(!breaker.allow());
    }

    #[tokio::test]
    async fn test_half_open_probe_budget() {
        let breaker = CircuitBreaker::new("t", fast_config());
        for _ in 0..4 {
            breaker.record(false);
        }
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(breaker.allow());
        assert!(breaker.allow());
        // Probe budget of 2 exhausted with no outcomes yet.
        assert!(!breaker.allow());
    }

    #[tokio::test]
    async fn test_window_rotation_forgets_old_failures() {
        let config = CircuitBreakerConfig {
            window: Duration::from_millis(200),
            buckets: 4,
            min_samples: 4,
            failure_rate_open: 0.5,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new("t", config);
        breaker.record(false);
        breaker.record(false);
        breaker.record(false);

        // Let the whole window expire; the old failures no longer count.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let (total, _) = breaker.stats();
        assert_eq!(total, 0);

        breaker.record(false);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_adaptive_threshold_shrinks_under_pressure() {
        let config = CircuitBreakerConfig {
            min_samples: 2,
            failure_rate_open: 0.9,
            adaptive: true,
            eval_interval: Duration::ZERO,
            ..fast_config()
        };
        let breaker = CircuitBreaker::new("t", config);

        breaker.record(false);
        breaker.record(false);
        // rate 1.0 > 0.9, so the dynamic threshold shrank below the static one.
        let snap = breaker.snapshot();
        assert!(snap.threshold < 0.9, "threshold {} not shrunk", snap.threshold);
    }

    #[test]
    fn test_adaptive_threshold_relaxes_when_calm() {
        let config = CircuitBreakerConfig {
            min_samples: 2,
            failure_rate_open: 0.5,
            adaptive: true,
            max_adaptive: 0.9,
            eval_interval: Duration::ZERO,
            ..fast_config()
        };
        let breaker = CircuitBreaker::new("t", config);
        let before = breaker.snapshot().threshold;

        for _ in 0..4 {
            breaker.record(true);
        }
        let after = breaker.snapshot().threshold;
        assert!(after > before, "threshold {after} did not grow from {before}");
        assert!(after <= 0.9);
    }

    #[tokio::test]
    async fn test_pool_is_per_service() {
        let pool = CircuitBreakerPool::new(fast_config());
        let detection = pool.get("detection").await;
        for _ in 0..4 {
            detection.record(false);
        }
        assert!(!pool.get("detection").await.allow());
        assert!(pool.get("threat-intel").await.allow());

        let snaps = pool.snapshot().await;
        assert_eq!(snaps.len(), 2);
    }
}
