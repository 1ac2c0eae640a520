//! Courier dispatch: command processor, handler pipelines, outbox mediator,
//! message pumps, and scheduler.

pub mod config;
pub mod error;
pub mod handler;
pub mod mapper;
pub mod memory;
pub mod outbox;
pub mod pipeline;
pub mod policy;
pub mod processor;
pub mod pump;
pub mod scheduler;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use config::{InboxConfiguration, OutboxConfig, ProcessorConfig};
pub use error::DispatchError;
pub use handler::{Handler, HandlerFactory, HandlerRegistration, SimpleHandlerFactory, SubscriberRegistry};
pub use mapper::MessageMapperRegistry;
pub use outbox::{OutboxProducerMediator, OutboxSweeper, ProducerRegistry};
pub use pipeline::{Decorator, Next, Timing};
pub use policy::PolicyRegistry;
pub use processor::{CommandProcessor, CommandProcessorBuilder, ExternalBus};
pub use pump::{Dispatcher, DispatcherBuilder, MessagePumpType, Subscription};
pub use scheduler::{InMemoryScheduler, RequestScheduler, ScheduleTime, SchedulerKind};
