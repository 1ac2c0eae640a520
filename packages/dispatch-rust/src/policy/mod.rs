//! Named resilience policies.

pub mod circuit;
pub mod retry;

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::DispatchError;

pub use circuit::{CircuitBreaker, CircuitBreakerPolicy, CircuitState};
pub use retry::{BackoffPolicy, JitterPolicy, RetryPolicy};

/// Key of the retry policy the outbox mediator sends under.
pub const RETRY_POLICY: &str = "courier.retry";

/// Key of the default circuit breaker.
pub const CIRCUIT_BREAKER: &str = "courier.circuit_breaker";

/// A policy stored in a [`PolicyRegistry`].
#[derive(Debug, Clone)]
pub enum Policy {
    Retry(Arc<RetryPolicy>),
    CircuitBreaker(Arc<CircuitBreaker>),
}

/// Policies by string key.
///
/// Circuit breakers are stored as shared instances, so every pipeline naming
/// the same key trips and recovers together.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: DashMap<String, Policy>,
}

impl PolicyRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding [`RETRY_POLICY`] and [`CIRCUIT_BREAKER`]
    /// with default settings.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.add_retry(RETRY_POLICY, RetryPolicy::default());
        registry.add_circuit_breaker(CIRCUIT_BREAKER, CircuitBreakerPolicy::default());
        registry
    }

    pub fn add_retry(&self, key: impl Into<String>, policy: RetryPolicy) {
        self.policies
            .insert(key.into(), Policy::Retry(Arc::new(policy)));
    }

    pub fn add_circuit_breaker(&self, key: impl Into<String>, policy: CircuitBreakerPolicy) {
        let key = key.into();
        let breaker = CircuitBreaker::new(key.clone(), policy);
        self.policies
            .insert(key, Policy::CircuitBreaker(Arc::new(breaker)));
    }

    /// Returns the policy under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] if no policy is registered under `key`.
    pub fn lookup(&self, key: &str) -> Result<Policy, DispatchError> {
        self.policies
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                DispatchError::configuration(format!("no policy is registered under `{key}`"))
            })
    }

    /// Returns the retry policy under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] if `key` is missing or names a circuit breaker.
    pub fn retry(&self, key: &str) -> Result<Arc<RetryPolicy>, DispatchError> {
        match self.lookup(key)? {
            Policy::Retry(policy) => Ok(policy),
            Policy::CircuitBreaker(_) => Err(DispatchError::configuration(format!(
                "policy `{key}` is a circuit breaker, a retry policy was expected"
            ))),
        }
    }

    /// Returns the circuit breaker under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] if `key` is missing or names a retry policy.
    pub fn circuit_breaker(&self, key: &str) -> Result<Arc<CircuitBreaker>, DispatchError> {
        match self.lookup(key)? {
            Policy::CircuitBreaker(breaker) => Ok(breaker),
            Policy::Retry(_) => Err(DispatchError::configuration(format!(
                "policy `{key}` is a retry policy, a circuit breaker was expected"
            ))),
        }
    }
}
