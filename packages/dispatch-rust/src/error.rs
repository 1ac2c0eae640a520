//! Error taxonomy shared by the processor, the pipeline, the outbox mediator, the
//! pump, and the scheduler.

use std::time::Duration;

use courier_core::Id;

/// Errors raised while dispatching, staging, or consuming requests.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Registration or wiring is wrong. Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The inbox already holds this request for this handler.
    #[error("request {request_id} has already been processed by {context_key}")]
    DuplicateProcessing { request_id: Id, context_key: String },

    /// A handler asked for the message to be redelivered later.
    #[error("handler deferred processing")]
    Defer { delay: Option<Duration> },

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("circuit `{policy}` is open")]
    BrokenCircuit { policy: String },

    /// Broker connectivity or transport fault.
    #[error("channel failure: {0}")]
    ChannelFailure(#[source] anyhow::Error),

    /// A message could not be turned into a request, or a request into a message.
    #[error("failed to map message {message_id}: {source}")]
    Mapping {
        message_id: Id,
        #[source]
        source: anyhow::Error,
    },

    /// More handlers failed during a publish; every failure is kept.
    #[error("{} of the published handlers failed", .0.len())]
    Aggregate(Vec<DispatchError>),

    #[error("outbox holds {outstanding} undispatched messages, limit is {limit}")]
    OutboxLimitReached { outstanding: usize, limit: usize },

    #[error("no outbox entry with id {0}")]
    OutboxEntryNotFound(Id),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("a fire with id {0} is already scheduled")]
    SchedulerConflict(String),

    /// The caller passed an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A handler or collaborator failed.
    #[error("{0}")]
    Handler(#[from] anyhow::Error),
}

impl DispatchError {
    /// Shorthand for a [`DispatchError::Configuration`].
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether redelivering the message could succeed.
    ///
    /// The pump requeues transient failures and acknowledges the rest.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Defer { .. }
            | Self::Timeout(_)
            | Self::BrokenCircuit { .. }
            | Self::ChannelFailure(_) => true,
            Self::Aggregate(errors) => errors.iter().any(Self::is_transient),
            _ => false,
        }
    }

    /// Whether this error, or any error aggregated in it, is a configuration error.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::Configuration(_) => true,
            Self::Aggregate(errors) => errors.iter().any(Self::is_configuration),
            _ => false,
        }
    }

    /// Redelivery delay requested by a deferring handler.
    #[must_use]
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            Self::Defer { delay } => *delay,
            Self::Aggregate(errors) => errors.iter().find_map(Self::requeue_delay),
            _ => None,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::DuplicateProcessing { .. } => "duplicate",
            Self::Defer { .. } => "defer",
            Self::Timeout(_) => "timeout",
            Self::BrokenCircuit { .. } => "broken_circuit",
            Self::ChannelFailure(_) => "channel_failure",
            Self::Mapping { .. } => "mapping",
            Self::Aggregate(_) => "aggregate",
            Self::OutboxLimitReached { .. } => "outbox_limit",
            Self::OutboxEntryNotFound(_) => "outbox_not_found",
            Self::InvalidSchedule(_) => "invalid_schedule",
            Self::SchedulerConflict(_) => "scheduler_conflict",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Handler(_) => "handler",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(DispatchError::Defer { delay: None }.is_transient());
        assert!(DispatchError::Timeout(Duration::from_millis(5)).is_transient());
        assert!(DispatchError::ChannelFailure(anyhow::anyhow!("down")).is_transient());
        assert!(!DispatchError::configuration("x").is_transient());
        assert!(!DispatchError::Handler(anyhow::anyhow!("boom")).is_transient());
    }

    #[test]
    fn aggregate_inherits_classification() {
        let aggregate = DispatchError::Aggregate(vec![
            DispatchError::Handler(anyhow::anyhow!("boom")),
            DispatchError::Defer {
                delay: Some(Duration::from_millis(20)),
            },
        ]);
        assert!(aggregate.is_transient());
        assert!(!aggregate.is_configuration());
        assert_eq!(aggregate.requeue_delay(), Some(Duration::from_millis(20)));
        assert_eq!(aggregate.to_string(), "2 of the published handlers failed");
    }

    #[test]
    fn configuration_message_is_kept() {
        let error = DispatchError::configuration("No handler found for demo::Ping");
        assert!(error.to_string().contains("demo::Ping"));
        assert_eq!(error.kind(), "configuration");
    }
}
