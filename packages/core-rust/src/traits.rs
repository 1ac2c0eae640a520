//! Contracts for the collaborators the engine talks to: brokers, outbox and inbox
//! stores, and the ambient business transaction.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::mapper::Publication;
use crate::message::Message;
use crate::request::{Id, Request};
use crate::types::{InboxRecord, OutboxEntry, OutstandingQuery};

/// Consumer side of a broker queue or subscription.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Name of the channel (queue) being read.
    fn name(&self) -> &str;

    /// Routing key the channel is bound to.
    fn routing_key(&self) -> &str;

    /// Waits up to `timeout` for the next message.
    ///
    /// Returns a message of kind [`MessageKind::None`](crate::MessageKind::None)
    /// when nothing arrived. An `Err` is a transport failure.
    async fn receive(&self, timeout: Duration) -> anyhow::Result<Message>;

    /// Confirms the message was handled; it will not be delivered again.
    async fn acknowledge(&self, message: &Message) -> anyhow::Result<()>;

    /// Refuses the message without requeue. Channels with a dead-letter target
    /// move it there.
    async fn reject(&self, message: &Message) -> anyhow::Result<()>;

    /// Returns the message to the channel, visible again after `delay`.
    ///
    /// Returns `false` if the channel could not requeue it.
    async fn requeue(&self, message: &Message, delay: Option<Duration>) -> anyhow::Result<bool>;

    /// Drops everything currently queued.
    async fn purge(&self) -> anyhow::Result<()>;
}

/// Sending side of a broker, bound to one publication.
#[async_trait]
pub trait Producer: Send + Sync {
    fn publication(&self) -> &Publication;

    async fn send(&self, message: &Message) -> anyhow::Result<()>;

    async fn send_with_delay(&self, message: &Message, delay: Duration) -> anyhow::Result<()>;
}

/// A business transaction an outbox write can enlist in.
///
/// Stores downcast through [`as_any`](Self::as_any) to their own transaction type.
pub trait BoxTransaction: fmt::Debug + Send + Sync {
    fn id(&self) -> &Id;

    fn as_any(&self) -> &dyn Any;
}

/// Reports the ambient transaction of the calling code, if one is open.
pub trait TransactionProvider: Send + Sync {
    fn current(&self) -> Option<Arc<dyn BoxTransaction>>;
}

/// Durable staging store for outgoing messages.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Writes `entry`, inside `transaction` when one is given.
    async fn add(
        &self,
        entry: OutboxEntry,
        transaction: Option<Arc<dyn BoxTransaction>>,
    ) -> anyhow::Result<()>;

    async fn get(&self, id: &Id) -> anyhow::Result<Option<OutboxEntry>>;

    /// Undispatched entries matching `query`, oldest first. Age is measured against `now`.
    async fn outstanding_messages(
        &self,
        query: &OutstandingQuery,
        now: u64,
    ) -> anyhow::Result<Vec<OutboxEntry>>;

    /// Number of undispatched entries.
    async fn outstanding_count(&self) -> anyhow::Result<usize>;

    /// Stamps the entry dispatched at `when`.
    ///
    /// Returns `false` if the entry was already dispatched, in which case the
    /// original stamp is kept.
    async fn mark_dispatched(&self, id: &Id, when: u64) -> anyhow::Result<bool>;
}

/// Durable record of which handlers have processed which request ids.
#[async_trait]
pub trait Inbox: Send + Sync {
    /// Records the pair. Adding an existing pair is a no-op.
    async fn add(&self, record: InboxRecord) -> anyhow::Result<()>;

    async fn exists(&self, request_id: &Id, context_key: &str) -> anyhow::Result<bool>;

    async fn get(&self, request_id: &Id, context_key: &str) -> anyhow::Result<Option<InboxRecord>>;
}

/// Typed reads over any [`Inbox`].
#[async_trait]
pub trait InboxExt: Inbox {
    /// Returns the recorded request, decoded as `R`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the record does not decode as `R`.
    async fn get_request<R: Request>(
        &self,
        request_id: &Id,
        context_key: &str,
    ) -> anyhow::Result<Option<R>> {
        match self.get(request_id, context_key).await? {
            Some(record) => Ok(Some(serde_json::from_value(record.request)?)),
            None => Ok(None),
        }
    }
}

impl<T: Inbox + ?Sized> InboxExt for T {}
