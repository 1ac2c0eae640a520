//! Circuit breaker shared by every pipeline that names the same policy.
//!
//! State machine: Closed -> Open (after `failure_threshold` consecutive
//! failures) -> `HalfOpen` (once `break_duration` has passed, one trial call is
//! let through) -> Closed on success, Open again on failure.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerPolicy {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call.
    pub break_duration: Duration,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    policy: CircuitBreakerPolicy,
    state: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, policy: CircuitBreakerPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            state: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        Self::refresh(&mut state);
        match *state {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Runs `operation` if the circuit admits a call.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::BrokenCircuit`] without running `operation`
    /// while the circuit is open, otherwise whatever `operation` returns.
    pub async fn execute<T, Fut>(&self, operation: Fut) -> Result<T, DispatchError>
    where
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        self.acquire()?;
        let result = operation.await;
        match &result {
            Ok(_) => self.record_success(),
            Err(error) if Self::counts_as_failure(error) => self.record_failure(),
            // Not the dependency's fault; release a half-open trial without judging it.
            Err(_) => self.release_trial(),
        }
        result
    }

    fn counts_as_failure(error: &DispatchError) -> bool {
        !matches!(
            error,
            DispatchError::Configuration(_)
                | DispatchError::DuplicateProcessing { .. }
                | DispatchError::Defer { .. }
                | DispatchError::BrokenCircuit { .. }
        )
    }

    fn refresh(state: &mut Inner) {
        if let Inner::Open { until } = *state {
            if Instant::now() >= until {
                *state = Inner::HalfOpen {
                    trial_in_flight: false,
                };
            }
        }
    }

    fn acquire(&self) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        Self::refresh(&mut state);
        match &mut *state {
            Inner::Closed { .. } => Ok(()),
            Inner::HalfOpen { trial_in_flight } if !*trial_in_flight => {
                *trial_in_flight = true;
                Ok(())
            }
            Inner::Open { .. } | Inner::HalfOpen { .. } => Err(DispatchError::BrokenCircuit {
                policy: self.name.clone(),
            }),
        }
    }

    fn record_success(&self) {
        *self.state.lock() = Inner::Closed { failures: 0 };
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        let open = match &mut *state {
            Inner::Closed { failures } => {
                *failures += 1;
                *failures >= self.policy.failure_threshold
            }
            Inner::HalfOpen { .. } | Inner::Open { .. } => true,
        };
        if open {
            tracing::warn!(circuit = %self.name, "circuit opened");
            *state = Inner::Open {
                until: Instant::now() + self.policy.break_duration,
            };
        }
    }

    fn release_trial(&self) {
        if let Inner::HalfOpen { trial_in_flight } = &mut *self.state.lock() {
            *trial_in_flight = false;
        }
    }
}
