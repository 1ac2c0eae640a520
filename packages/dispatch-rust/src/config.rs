use std::time::Duration;

use crate::pipeline::decorators::OnceOnlyAction;

/// Inbox guard applied to every handler without one of its own.
#[derive(Debug, Clone, Default)]
pub struct InboxConfiguration {
    pub action: OnceOnlyAction,
    /// When `false`, only handlers that declare an inbox guard are guarded.
    pub auto_apply: bool,
    /// Context key for auto-applied guards. `None` uses the handler type name.
    pub context_key: Option<String>,
}

/// Command processor settings.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Timeout used by `call` when the caller passes none.
    pub default_call_timeout: Duration,
    /// Global inbox guard. `None` leaves inbox use to individual registrations.
    pub inbox: Option<InboxConfiguration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            default_call_timeout: Duration::from_millis(500),
            inbox: None,
        }
    }
}

/// Outbox mediator and sweeper settings.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Interval between background sweeps.
    pub sweep_interval: Duration,
    /// Entries younger than this are left to the clear that follows their deposit.
    pub min_age: Duration,
    /// Most entries dispatched per sweep.
    pub batch_size: usize,
    /// Deposits fail once this many entries are outstanding. `None` disables the limit.
    pub max_outstanding: Option<usize>,
    /// Minimum interval between refreshes of the outstanding count.
    pub outstanding_check_interval: Duration,
    /// Sweeps a topic is skipped for after a failed send.
    pub topic_cooldown_sweeps: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            min_age: Duration::from_secs(5),
            batch_size: 100,
            max_outstanding: None,
            outstanding_check_interval: Duration::from_secs(1),
            topic_cooldown_sweeps: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processor_defaults() {
        let config = ProcessorConfig::default();
        assert_eq!(config.default_call_timeout, Duration::from_millis(500));
        assert!(config.inbox.is_none());
    }

    #[test]
    fn outbox_defaults() {
        let config = OutboxConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert_eq!(config.min_age, Duration::from_secs(5));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_outstanding, None);
        assert_eq!(config.outstanding_check_interval, Duration::from_secs(1));
        assert_eq!(config.topic_cooldown_sweeps, 3);
    }

    #[test]
    fn inbox_configuration_defaults_to_throw_without_auto_apply() {
        let config = InboxConfiguration::default();
        assert_eq!(config.action, OnceOnlyAction::Throw);
        assert!(!config.auto_apply);
    }
}
