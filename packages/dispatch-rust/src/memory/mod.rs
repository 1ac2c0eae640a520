//! In-memory collaborators for tests and single-process deployments.

pub mod bus;
pub mod inbox;
pub mod outbox;
pub mod transaction;

pub use bus::{InMemoryChannel, InMemoryChannelFactory, InMemoryProducer, InternalBus};
pub use inbox::InMemoryInbox;
pub use outbox::InMemoryOutbox;
pub use transaction::{InMemoryTransaction, InMemoryTransactionProvider, TransactionState};
