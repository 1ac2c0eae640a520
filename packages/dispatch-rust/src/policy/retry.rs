//! Retry with exponential backoff.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`, with
//! jitter applied to the clamped value. Jitter never feeds back into the next
//! attempt's base delay.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::DispatchError;

/// Randomization applied to a computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterPolicy {
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`.
    Equal,
}

impl JitterPolicy {
    fn apply(self, delay: Duration) -> Duration {
        match self {
            Self::None => delay,
            Self::Full => delay.mul_f64(rand::rng().random_range(0.0..=1.0)),
            Self::Equal => {
                let half = delay / 2;
                half + half.mul_f64(rand::rng().random_range(0.0..=1.0))
            }
        }
    }
}

/// How retry delays grow.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Cap on any single delay.
    pub max: Duration,
    /// Multiplicative growth per attempt.
    pub factor: f64,
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(50),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the zero-based `attempt` failed.
    #[must_use]
    pub fn next(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.first.as_secs_f64() * self.factor.powi(exponent);
        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        self.jitter.apply(base)
    }
}

/// Re-runs a failed operation up to `max_retries` more times.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Whether `error` is worth another attempt. Wiring errors, duplicates,
    /// deferrals (which belong to the pump), and open circuits are not.
    #[must_use]
    pub fn is_retryable(error: &DispatchError) -> bool {
        !matches!(
            error,
            DispatchError::Configuration(_)
                | DispatchError::DuplicateProcessing { .. }
                | DispatchError::Defer { .. }
                | DispatchError::BrokenCircuit { .. }
                | DispatchError::Mapping { .. }
                | DispatchError::OutboxLimitReached { .. }
                | DispatchError::OutboxEntryNotFound(_)
        )
    }

    /// Runs `operation`, passing the zero-based attempt number, until it
    /// succeeds, fails with a non-retryable error, or retries run out.
    ///
    /// # Errors
    ///
    /// Returns the last error from `operation`.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, DispatchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_retries && Self::is_retryable(&error) => {
                    let delay = self.backoff.next(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
