//! Transactional outbox: deposit, clear, and background sweep.

pub mod circuit;
pub mod mediator;
pub mod producers;
pub mod sweeper;

pub use circuit::TopicCircuitBreaker;
pub use mediator::{ClearReport, OutboxProducerMediator, SweepReport};
pub use producers::ProducerRegistry;
pub use sweeper::{OutboxSweeper, SweepTask};
