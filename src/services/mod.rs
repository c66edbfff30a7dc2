//! Service layer: resilience primitives, validation, the workflow engine,
//! triggers, and the signature-scanning engine.

pub mod cancellation;
pub mod circuit_breaker;
pub mod condition;
pub mod plugins;
pub mod rate_limiter;
pub mod result_cache;
pub mod retry;
pub mod scheduler;
pub mod signature;
pub mod validator;
pub mod workflow_engine;

pub use cancellation::CancellationRegistry;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerPool, CircuitState};
pub use rate_limiter::{HybridLimiter, KeyedLimiterPool, RateLimiter, RateLimiterConfig};
pub use result_cache::{ResultCache, ResultCacheConfig};
pub use retry::RetryRunner;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use validator::RequestValidator;
pub use workflow_engine::{EngineConfig, WorkflowEngine};
