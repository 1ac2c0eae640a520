use std::sync::Arc;

use courier_core::{ClockSource, Inbox, SystemClock};

use super::{CommandProcessor, ExternalBus};
use crate::config::ProcessorConfig;
use crate::handler::{HandlerFactory, SubscriberRegistry};
use crate::mapper::MessageMapperRegistry;
use crate::pipeline::{PipelineBuilder, PipelineServices};
use crate::policy::PolicyRegistry;
use crate::pump::{ChannelFactory, Subscription};
use crate::scheduler::RequestScheduler;

/// Assembles a [`CommandProcessor`] from its collaborators.
///
/// Only the subscriber registry and the handler factory are required. The
/// outbox, scheduler, and reply channels are needed only by the operations
/// that use them; calling such an operation without them is a configuration
/// error. Give the processor the same [`MessageMapperRegistry`] as the outbox
/// mediator so pumped messages decode with the mappers that encoded them.
pub struct CommandProcessorBuilder {
    registry: Arc<SubscriberRegistry>,
    factory: Arc<dyn HandlerFactory>,
    policies: Option<Arc<PolicyRegistry>>,
    inbox: Option<Arc<dyn Inbox>>,
    mappers: Option<Arc<MessageMapperRegistry>>,
    bus: Option<Arc<ExternalBus>>,
    scheduler: Option<Arc<dyn RequestScheduler>>,
    channel_factory: Option<Arc<dyn ChannelFactory>>,
    reply_subscriptions: Vec<Subscription>,
    clock: Option<Arc<dyn ClockSource>>,
    config: ProcessorConfig,
}

impl CommandProcessorBuilder {
    #[must_use]
    pub fn new(registry: Arc<SubscriberRegistry>, factory: Arc<dyn HandlerFactory>) -> Self {
        Self {
            registry,
            factory,
            policies: None,
            inbox: None,
            mappers: None,
            bus: None,
            scheduler: None,
            channel_factory: None,
            reply_subscriptions: Vec::new(),
            clock: None,
            config: ProcessorConfig::default(),
        }
    }

    /// Defaults to [`PolicyRegistry::with_defaults`].
    #[must_use]
    pub fn with_policies(mut self, policies: Arc<PolicyRegistry>) -> Self {
        self.policies = Some(policies);
        self
    }

    #[must_use]
    pub fn with_inbox(mut self, inbox: Arc<dyn Inbox>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    #[must_use]
    pub fn with_mappers(mut self, mappers: Arc<MessageMapperRegistry>) -> Self {
        self.mappers = Some(mappers);
        self
    }

    #[must_use]
    pub fn with_external_bus(mut self, bus: Arc<ExternalBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn RequestScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Enables `call`: replies of each subscription's request type are read
    /// from channels `factory` opens.
    #[must_use]
    pub fn with_reply_channels(
        mut self,
        subscriptions: Vec<Subscription>,
        factory: Arc<dyn ChannelFactory>,
    ) -> Self {
        self.reply_subscriptions = subscriptions;
        self.channel_factory = Some(factory);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<CommandProcessor> {
        let services = PipelineServices {
            inbox: self.inbox,
            policies: self
                .policies
                .unwrap_or_else(|| Arc::new(PolicyRegistry::with_defaults())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };
        let pipelines = PipelineBuilder::new(
            self.registry,
            self.factory,
            services,
            self.config.inbox.clone(),
        );
        Arc::new_cyclic(|me| CommandProcessor {
            pipelines,
            mappers: self.mappers.unwrap_or_default(),
            bus: self.bus.unwrap_or_default(),
            scheduler: self.scheduler,
            channel_factory: self.channel_factory,
            reply_subscriptions: self.reply_subscriptions,
            config: self.config,
            me: me.clone(),
        })
    }
}
