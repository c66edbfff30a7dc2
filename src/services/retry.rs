//! Retry with exponential backoff and full jitter.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use tokio::sync::watch;

use crate::domain::errors::SwarmError;

/// Hard ceiling on a single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Retry runner: up to `attempts` tries with a doubling delay, clamped at
/// 60 s, where each sleep is drawn uniformly from `[0, current_delay]`
/// (full jitter). Sleeps are interruptible through a cancellation watch.
#[derive(Debug, Clone)]
pub struct RetryRunner {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryRunner {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryRunner {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Backoff ceiling for a 0-indexed attempt: `base * 2^attempt`, clamped.
    fn delay_for(&self, attempt: u32) -> Duration {
        let millis = self
            .base_delay
            .as_millis()
            .saturating_mul(1u128 << attempt.min(32)) as u64;
        Duration::from_millis(millis).min(MAX_DELAY)
    }

    /// Run `op` without external cancellation.
    pub async fn run<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let (_tx, rx) = watch::channel(false);
        match self.run_with_cancel(rx, op).await {
            Ok(value) => Ok(value),
            Err(RetryError::Exhausted(e)) => Err(e),
            // Unreachable: the sender above is never used to cancel.
            Err(RetryError::Cancelled) => unreachable!("retry cancelled without a canceller"),
        }
    }

    /// Run `op`, giving up immediately when `cancel` flips to true, including
    /// mid-sleep.
    pub async fn run_with_cancel<F, Fut, T, E>(
        &self,
        mut cancel: watch::Receiver<bool>,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut last_err = None;

        for attempt in 0..self.attempts {
            if *cancel.borrow() {
                return Err(RetryError::Cancelled);
            }

            counter!("swarm_resilience_retry_attempts_total").increment(1);
            match op().await {
                Ok(value) => {
                    counter!("swarm_resilience_retry_success_total").increment(1);
                    return Ok(value);
                }
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "retryable operation failed");
                    last_err = Some(err);
                }
            }

            // No sleep after the final attempt.
            if attempt + 1 < self.attempts {
                let ceiling = self.delay_for(attempt);
                let sleep_for = full_jitter(ceiling);
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            return Err(RetryError::Cancelled);
                        }
                    }
                }
            }
        }

        counter!("swarm_resilience_retry_fail_total").increment(1);
        Err(RetryError::Exhausted(
            last_err.expect("at least one attempt ran"),
        ))
    }
}

/// Uniform draw from `[0, ceiling]`.
fn full_jitter(ceiling: Duration) -> Duration {
    if ceiling.is_zero() {
        return Duration::ZERO;
    }
    let nanos = ceiling.as_nanos() as u64;
    Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
}

/// Outcome of a cancelled or exhausted retry loop.
#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted(E),
    Cancelled,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted(e) => write!(f, "retries exhausted: {e}"),
            Self::Cancelled => write!(f, "retry cancelled"),
        }
    }
}

impl<E: std::fmt::Display + std::fmt::Debug> std::error::Error for RetryError<E> {}

impl From<RetryError<SwarmError>> for SwarmError {
    fn from(err: RetryError<SwarmError>) -> Self {
        match err {
            RetryError::Exhausted(e) => e,
            RetryError::Cancelled => SwarmError::Cancelled("retry interrupted".into()),
        }
    }
}
