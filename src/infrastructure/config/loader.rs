//! Configuration loading with hierarchical merging.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use super::Config;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid rate limit capacity: {0}. Must be positive")]
    InvalidCapacity(f64),

    #[error("Invalid rate limit refill: {0}. Must be positive")]
    InvalidRefill(f64),

    #[error("Invalid worker count: {0}. Must be between 1 and 256")]
    InvalidWorkers(usize),

    #[error("Invalid failure rate threshold: {0}. Must be in (0, 1]")]
    InvalidFailureRate(f64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,
}

/// Configuration loader.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `swarmguard.yaml` in the working directory (optional)
    /// 3. `SWARMGUARD_*` environment variables (`__` as section separator)
    /// 4. The flat operational env names (`RATE_LIMIT_CAPACITY`,
    ///    `DETECTION_URL`, ...) recognized across the deployment
    pub fn load() -> Result<Config> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file("swarmguard.yaml"))
            .merge(Env::prefixed("SWARMGUARD_").split("__"))
            .extract()
            .context("Failed to extract configuration")?;

        Self::apply_flat_env(&mut config);
        Self::validate(&config)?;
        Ok(config)
    }

    /// Load from a specific file, then flat env overrides.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::apply_flat_env(&mut config);
        Self::validate(&config)?;
        Ok(config)
    }

    /// Apply the flat, unprefixed environment names recognized by the wider
    /// deployment.
    fn apply_flat_env(config: &mut Config) {
        fn set_f64(name: &str, target: &mut f64) {
            if let Some(v) = std::env::var(name).ok().and_then(|v| v.parse().ok()) {
                *target = v;
            }
        }
        fn set_u64(name: &str, target: &mut u64) {
            if let Some(v) = std::env::var(name).ok().and_then(|v| v.parse().ok()) {
                *target = v;
            }
        }
        fn set_usize(name: &str, target: &mut usize) {
            if let Some(v) = std::env::var(name).ok().and_then(|v| v.parse().ok()) {
                *target = v;
            }
        }
        fn set_string(name: &str, target: &mut String) {
            if let Ok(v) = std::env::var(name) {
                if !v.is_empty() {
                    *target = v;
                }
            }
        }

        set_f64("RATE_LIMIT_CAPACITY", &mut config.rate_limit.capacity);
        set_f64("RATE_LIMIT_REFILL", &mut config.rate_limit.refill);
        set_u64("RATE_LIMIT_INTERVAL_SEC", &mut config.rate_limit.interval_secs);

        set_usize(
            "POLICY_DECISION_CACHE_SIZE",
            &mut config.policy.decision_cache_size,
        );
        set_f64(
            "POLICY_RATE_LIMIT_CAPACITY",
            &mut config.policy.rate_limit_capacity,
        );
        set_f64(
            "POLICY_RATE_LIMIT_REFILL",
            &mut config.policy.rate_limit_refill_per_sec,
        );

        set_string("SIGNATURE_RULE_DIR", &mut config.scanner.rule_dir);
        set_u64(
            "SIGNATURE_RELOAD_INTERVAL_SEC",
            &mut config.scanner.reload_interval_secs,
        );

        set_string("DETECTION_URL", &mut config.downstreams.detection_url);
        set_string("THREAT_INTEL_URL", &mut config.downstreams.threat_intel_url);
        set_string("POLICY_URL", &mut config.downstreams.policy_url);
        set_string("ORCHESTRATOR_URL", &mut config.downstreams.orchestrator_url);
        set_string(
            "MODEL_REGISTRY_URL",
            &mut config.downstreams.model_registry_url,
        );
        set_string("KAFKA_BROKERS", &mut config.downstreams.kafka_brokers);

        set_string("ORCHESTRATOR_DB_PATH", &mut config.orchestrator.db_path);
        set_string("PYTHON_PATH", &mut config.orchestrator.python_path);
    }

    /// Validate configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.rate_limit.capacity <= 0.0 {
            return Err(ConfigError::InvalidCapacity(config.rate_limit.capacity));
        }
        if config.rate_limit.refill <= 0.0 {
            return Err(ConfigError::InvalidRefill(config.rate_limit.refill));
        }

        if config.orchestrator.max_workers == 0 || config.orchestrator.max_workers > 256 {
            return Err(ConfigError::InvalidWorkers(config.orchestrator.max_workers));
        }
        if config.orchestrator.db_path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }

        let rate = config.circuit_breaker.failure_rate_open;
        if rate <= 0.0 || rate > 1.0 {
            return Err(ConfigError::InvalidFailureRate(rate));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(ConfigLoader::validate(&config).is_ok());
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.rate_limit.capacity, 200.0);
        assert_eq!(config.scanner.reload_interval_secs, 3);
    }

    #[test]
    fn test_invalid_capacity_rejected() {
        let mut config = Config::default();
        config.rate_limit.capacity = 0.0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidCapacity(_))
        ));
    }

    #[test]
    fn test_invalid_failure_rate_rejected() {
        let mut config = Config::default();
        config.circuit_breaker.failure_rate_open = 1.5;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidFailureRate(_))
        ));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn test_flat_env_overrides() {
        temp_env::with_vars(
            [
                ("RATE_LIMIT_CAPACITY", Some("50")),
                ("DETECTION_URL", Some("http://detector.test:9000")),
                ("PYTHON_PATH", Some("/usr/bin/python3.12")),
            ],
            || {
                let mut config = Config::default();
                ConfigLoader::apply_flat_env(&mut config);
                assert_eq!(config.rate_limit.capacity, 50.0);
                assert_eq!(config.downstreams.detection_url, "http://detector.test:9000");
                assert_eq!(config.orchestrator.python_path, "/usr/bin/python3.12");
            },
        );
    }

    #[test]
    fn test_limiter_config_conversion() {
        let config = Config::default();
        let limiter = config.rate_limit.to_limiter_config();
        assert_eq!(limiter.capacity, 200.0);
        // 200 tokens per 60 s window.
        assert!((limiter.fill_rate - 200.0 / 60.0).abs() < 1e-9);
    }
}
