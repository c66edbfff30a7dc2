//! Scan instrumentation.
//!
//! Tracks lifetime totals, a fixed latency histogram, per-rule hit counts,
//! and a rolling 60-second ring used for recent throughput. Everything is
//! also mirrored into the process-wide metrics facade under the stable
//! `swarm_` names.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::Serialize;

use crate::domain::models::MatchResult;

/// Upper bounds of the latency buckets, in milliseconds. The last bucket is
/// unbounded.
const LATENCY_BOUNDS_MS: [u64; 4] = [1, 10, 100, 1_000];
const RING_SECONDS: usize = 60;

#[derive(Debug, Default, Clone, Copy)]
struct RingSlot {
    second: u64,
    scans: u64,
    bytes: u64,
}

/// Collector shared by the scan surface and the streaming scanner.
pub struct ScanMetricsCollector {
    started: Instant,
    scans: AtomicU64,
    matches: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    latency_buckets: [AtomicU64; 5],
    rule_hits: Mutex<HashMap<String, u64>>,
    ring: Mutex<[RingSlot; RING_SECONDS]>,
}

/// Snapshot served on the scanner's `/stats` surface.
#[derive(Debug, Clone, Serialize)]
pub struct ScanStats {
    pub scans_total: u64,
    pub matches_total: u64,
    pub bytes_total: u64,
    pub errors_total: u64,
    /// Counts for buckets <1ms, <10ms, <100ms, <1s, >=1s.
    pub latency_buckets: Vec<u64>,
    pub top_rules: Vec<RuleHits>,
    pub recent_scans_per_sec: f64,
    pub recent_bytes_per_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleHits {
    pub rule_id: String,
    pub hits: u64,
}

impl Default for ScanMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanMetricsCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            scans: AtomicU64::new(0),
            matches: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latency_buckets: Default::default(),
            rule_hits: Mutex::new(HashMap::new()),
            ring: Mutex::new([RingSlot::default(); RING_SECONDS]),
        }
    }

    /// Record one completed scan.
    pub fn record_scan(&self, duration: Duration, bytes: usize, matches: &[MatchResult]) {
        self.scans.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.matches
            .fetch_add(matches.len() as u64, Ordering::Relaxed);

        let ms = duration.as_millis() as u64;
        let bucket = LATENCY_BOUNDS_MS
            .iter()
            .position(|&bound| ms < bound)
            .unwrap_or(LATENCY_BOUNDS_MS.len());
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        {
            let mut hits = self.rule_hits.lock().expect("rule hits lock poisoned");
            for m in matches {
                *hits.entry(m.rule_id.clone()).or_insert(0) += 1;
            }
        }

        self.tick_ring(1, bytes as u64);

        counter!("swarm_signature_match_total").increment(matches.len() as u64);
        histogram!("swarm_scan_duration_seconds").record(duration.as_secs_f64());
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn current_second(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    fn tick_ring(&self, scans: u64, bytes: u64) {
        let second = self.current_second();
        let mut ring = self.ring.lock().expect("ring lock poisoned");
        let slot = &mut ring[(second % RING_SECONDS as u64) as usize];
        if slot.second != second {
            *slot = RingSlot {
                second,
                scans: 0,
                bytes: 0,
            };
        }
        slot.scans += scans;
        slot.bytes += bytes;
    }

    /// Top `n` rules by lifetime hit count.
    pub fn top_rules(&self, n: usize) -> Vec<RuleHits> {
        let hits = self.rule_hits.lock().expect("rule hits lock poisoned");
        let mut all: Vec<RuleHits> = hits
            .iter()
            .map(|(rule_id, &hits)| RuleHits {
                rule_id: rule_id.clone(),
                hits,
            })
            .collect();
        all.sort_by(|a, b| b.hits.cmp(&a.hits).then(a.rule_id.cmp(&b.rule_id)));
        all.truncate(n);
        all
    }

    pub fn snapshot(&self) -> ScanStats {
        let now = self.current_second();
        let (recent_scans, recent_bytes) = {
            let ring = self.ring.lock().expect("ring lock poisoned");
            let mut scans = 0;
            let mut bytes = 0;
            for slot in ring.iter() {
                if now.saturating_sub(slot.second) < RING_SECONDS as u64 {
                    scans += slot.scans;
                    bytes += slot.bytes;
                }
            }
            (scans, bytes)
        };
        let span = (now.min(RING_SECONDS as u64).max(1)) as f64;

        ScanStats {
            scans_total: self.scans.load(Ordering::Relaxed),
            matches_total: self.matches.load(Ordering::Relaxed),
            bytes_total: self.bytes.load(Ordering::Relaxed),
            errors_total: self.errors.load(Ordering::Relaxed),
            latency_buckets: self
                .latency_buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            top_rules: self.top_rules(10),
            recent_scans_per_sec: recent_scans as f64 / span,
            recent_bytes_per_sec: recent_bytes as f64 / span,
        }
    }
}
