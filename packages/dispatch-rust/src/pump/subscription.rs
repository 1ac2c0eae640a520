use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use courier_core::{Channel, Message, Request};

/// Threading model of a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessagePumpType {
    /// One blocking loop per channel on a dedicated OS thread.
    #[default]
    Reactor,
    /// Channels pumped as tasks on the shared async runtime.
    Proactor,
}

/// Where rejected messages go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    /// Topic rejected messages are forwarded to.
    pub routing_key: String,
    /// Deliveries before a transiently failing message is rejected. Overrides
    /// the subscription's requeue count when set.
    pub max_delivery_attempts: Option<u32>,
}

impl DeadLetterPolicy {
    #[must_use]
    pub fn new(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            max_delivery_attempts: None,
        }
    }
}

/// Picks the request type of an inbound message by name.
pub type RequestTypeMap = Arc<dyn Fn(&Message) -> Option<&'static str> + Send + Sync>;

/// A channel bound to pump behavior.
#[derive(Clone)]
pub struct Subscription {
    /// Name the dispatcher knows the subscription by.
    pub name: String,
    pub channel_name: String,
    pub routing_key: String,
    /// Request type messages are decoded as, unless the type map says otherwise.
    pub request_type: &'static str,
    pub request_type_map: Option<RequestTypeMap>,
    /// Messages a Proactor pump takes per receive. They are handled in receive order.
    pub buffer_size: usize,
    /// How long one receive waits for a message.
    pub timeout: Duration,
    /// Deliveries before a transiently failing message is rejected. `None` requeues forever.
    pub requeue_count: Option<u32>,
    pub requeue_delay: Duration,
    pub dead_letter: Option<DeadLetterPolicy>,
    pub pump_type: MessagePumpType,
    /// Unacceptable messages tolerated before the pump stops. Zero means no limit.
    pub unacceptable_message_limit: u32,
    pub empty_channel_delay: Duration,
    pub channel_failure_delay: Duration,
    /// Pumps the dispatcher runs for this subscription.
    pub number_of_performers: usize,
    /// Upper bound on one delivery's dispatch.
    pub handler_timeout: Option<Duration>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("channel_name", &self.channel_name)
            .field("routing_key", &self.routing_key)
            .field("request_type", &self.request_type)
            .field("pump_type", &self.pump_type)
            .field("number_of_performers", &self.number_of_performers)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Subscription decoding messages on `routing_key` as `R`. The channel is
    /// named after the subscription.
    #[must_use]
    pub fn new<R: Request>(name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            channel_name: name.clone(),
            name,
            routing_key: routing_key.into(),
            request_type: type_name::<R>(),
            request_type_map: None,
            buffer_size: 1,
            timeout: Duration::from_millis(300),
            requeue_count: Some(3),
            requeue_delay: Duration::ZERO,
            dead_letter: None,
            pump_type: MessagePumpType::Reactor,
            unacceptable_message_limit: 0,
            empty_channel_delay: Duration::from_millis(500),
            channel_failure_delay: Duration::from_millis(1000),
            number_of_performers: 1,
            handler_timeout: None,
        }
    }

    #[must_use]
    pub fn with_channel_name(mut self, channel_name: impl Into<String>) -> Self {
        self.channel_name = channel_name.into();
        self
    }

    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    #[must_use]
    pub fn with_request_type_map(
        mut self,
        map: impl Fn(&Message) -> Option<&'static str> + Send + Sync + 'static,
    ) -> Self {
        self.request_type_map = Some(Arc::new(map));
        self
    }

    #[must_use]
    pub fn with_pump_type(mut self, pump_type: MessagePumpType) -> Self {
        self.pump_type = pump_type;
        self
    }

    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_requeue(mut self, count: Option<u32>, delay: Duration) -> Self {
        self.requeue_count = count;
        self.requeue_delay = delay;
        self
    }

    #[must_use]
    pub fn with_dead_letter(mut self, policy: DeadLetterPolicy) -> Self {
        self.dead_letter = Some(policy);
        self
    }

    #[must_use]
    pub fn with_unacceptable_message_limit(mut self, limit: u32) -> Self {
        self.unacceptable_message_limit = limit;
        self
    }

    #[must_use]
    pub fn with_delays(mut self, empty_channel: Duration, channel_failure: Duration) -> Self {
        self.empty_channel_delay = empty_channel;
        self.channel_failure_delay = channel_failure;
        self
    }

    #[must_use]
    pub fn with_performers(mut self, performers: usize) -> Self {
        self.number_of_performers = performers.max(1);
        self
    }

    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Deliveries allowed before a transiently failing message is rejected.
    #[must_use]
    pub fn max_attempts(&self) -> Option<u32> {
        self.dead_letter
            .as_ref()
            .and_then(|policy| policy.max_delivery_attempts)
            .or(self.requeue_count)
    }

    /// Name of the request type `message` decodes as.
    #[must_use]
    pub fn request_type_for(&self, message: &Message) -> Option<&'static str> {
        match &self.request_type_map {
            Some(map) => map(message),
            None => Some(self.request_type),
        }
    }
}

/// Opens the channel a subscription reads from.
pub trait ChannelFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the broker refuses the channel.
    fn create_channel(&self, subscription: &Subscription) -> anyhow::Result<Arc<dyn Channel>>;
}
