//! SwarmGuard request-processing and orchestration core:
//! - Resilience primitives: adaptive circuit breaker, hybrid rate limiter,
//!   retry with full jitter
//! - API gateway with per-key limiter pools, per-downstream breakers, and
//!   schema validation
//! - DAG workflow orchestrator with cron and event triggers and a durable
//!   workflow store
//! - Aho-Corasick signature scanner with sampling, streaming, and hot reload

pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::{SwarmError, SwarmResult};
pub use infrastructure::database::DatabaseConnection;
