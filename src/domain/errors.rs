//! Domain errors for the SwarmGuard core.

use thiserror::Error;

/// Errors raised across the gateway, orchestrator, and scanner.
///
/// Every variant maps to a stable `kind()` tag and an HTTP status so the
/// surfaces can answer clients without string matching.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("validation failed on field '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limit exceeded for key '{key}'")]
    RateLimited { key: String },

    #[error("circuit '{service}' is open")]
    CircuitOpen { service: String },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("downstream '{service}' returned status {status}")]
    Downstream { service: String, status: u16 },

    #[error("dependency cycle or unreachable tasks in workflow '{0}'")]
    Cycle(String),

    #[error("task '{task}' depends on unknown task '{missing}'")]
    MissingDependency { task: String, missing: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("workflow execution cancelled: {0}")]
    Cancelled(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type SwarmResult<T> = Result<T, SwarmError>;

impl SwarmError {
    /// Create a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Stable kind tag used in error bodies and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Auth(_) => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout(_) => "timeout",
            Self::Downstream { .. } => "downstream",
            Self::Cycle(_) | Self::MissingDependency { .. } => "invalid_workflow",
            Self::NotFound { .. } => "not_found",
            Self::TaskFailed(_) => "task_failed",
            Self::Cancelled(_) => "cancelled",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status code for surfacing this error to a client.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Auth(_) => 401,
            Self::RateLimited { .. } => 429,
            Self::CircuitOpen { .. } => 503,
            Self::Timeout(_) => 504,
            Self::Downstream { .. } => 502,
            Self::Cycle(_) | Self::MissingDependency { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::TaskFailed(_) => 500,
            Self::Cancelled(_) => 409,
            Self::Storage(_) | Self::Serialization(_) | Self::Internal(_) => 500,
        }
    }

    /// Whether the retry runner may re-attempt an operation that failed with
    /// this error. Client-side errors and downstream 4xx are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Internal(_) | Self::Storage(_) => true,
            Self::Downstream { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for SwarmError {
    fn from(err: sqlx::Error) -> Self {
        SwarmError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SwarmError {
    fn from(err: serde_json::Error) -> Self {
        SwarmError::Serialization(err.to_string())
    }
}
