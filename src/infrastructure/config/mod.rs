//! Configuration model and loader.

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};

/// Top-level configuration shared by all three surfaces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    #[serde(default)]
    pub downstreams: DownstreamConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub port: u16,
    /// Per-call timeout for downstream forwards, seconds.
    pub downstream_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            downstream_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub port: u16,
    pub db_path: String,
    pub max_workers: usize,
    pub python_path: String,
    pub shell_allow_list: Vec<String>,
    /// Max idle keep-alive connections per downstream host.
    pub http_pool_max_idle_per_host: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            db_path: "swarmguard.db".to_string(),
            max_workers: 8,
            python_path: "python3".to_string(),
            shell_allow_list: crate::services::plugins::ShellPlugin::default_allow_list(),
            http_pool_max_idle_per_host: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub port: u16,
    pub rule_dir: String,
    pub reload_interval_secs: u64,
    pub chunk_size: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            port: 8082,
            rule_dir: "rules".to_string(),
            reload_interval_secs: 3,
            chunk_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: f64,
    /// Tokens restored per interval.
    pub refill: f64,
    pub interval_secs: u64,
    pub max_per_window: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 200.0,
            refill: 200.0,
            interval_secs: 60,
            max_per_window: 400,
        }
    }
}

impl RateLimitConfig {
    pub fn to_limiter_config(&self) -> crate::services::RateLimiterConfig {
        crate::services::RateLimiterConfig {
            capacity: self.capacity,
            fill_rate: self.refill / self.interval_secs.max(1) as f64,
            window: std::time::Duration::from_secs(self.interval_secs.max(1)),
            max_per_window: self.max_per_window,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub window_secs: u64,
    pub buckets: usize,
    pub min_samples: u64,
    pub failure_rate_open: f64,
    pub half_open_after_secs: u64,
    pub max_half_open_probes: u32,
    pub adaptive: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_secs: 10,
            buckets: 10,
            min_samples: 10,
            failure_rate_open: 0.5,
            half_open_after_secs: 30,
            max_half_open_probes: 2,
            adaptive: true,
        }
    }
}

impl BreakerConfig {
    pub fn to_breaker_config(&self) -> crate::services::CircuitBreakerConfig {
        crate::services::CircuitBreakerConfig {
            window: std::time::Duration::from_secs(self.window_secs.max(1)),
            buckets: self.buckets.max(1),
            min_samples: self.min_samples,
            failure_rate_open: self.failure_rate_open,
            half_open_after: std::time::Duration::from_secs(self.half_open_after_secs.max(1)),
            max_half_open_probes: self.max_half_open_probes.max(1),
            adaptive: self.adaptive,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamConfig {
    pub detection_url: String,
    pub threat_intel_url: String,
    pub policy_url: String,
    pub orchestrator_url: String,
    pub model_registry_url: String,
    pub kafka_brokers: String,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            detection_url: "http://detection:8080".to_string(),
            threat_intel_url: "http://threat-intel:8080".to_string(),
            policy_url: "http://policy:8080".to_string(),
            orchestrator_url: "http://orchestrator:8081".to_string(),
            model_registry_url: "http://model-registry:8080".to_string(),
            kafka_brokers: "kafka:9092".to_string(),
        }
    }
}

impl DownstreamConfig {
    /// Base URL for a named downstream, if known.
    pub fn url_for(&self, service: &str) -> Option<&str> {
        match service {
            "detection" => Some(&self.detection_url),
            "threat-intel" => Some(&self.threat_intel_url),
            "policy" => Some(&self.policy_url),
            "orchestrator" => Some(&self.orchestrator_url),
            _ => None,
        }
    }
}

/// The caching/rate-limiting shell around policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub decision_cache_size: usize,
    pub rate_limit_capacity: f64,
    pub rate_limit_refill_per_sec: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            decision_cache_size: 1024,
            rate_limit_capacity: 50.0,
            rate_limit_refill_per_sec: 25.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
