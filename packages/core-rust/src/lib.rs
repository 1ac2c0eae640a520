//! Courier core: the message envelope, the request model, and the contracts for
//! the brokers and stores the dispatch engine talks to.

pub mod clock;
pub mod context;
pub mod mapper;
pub mod message;
pub mod request;
pub mod traits;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use context::RequestContext;
pub use mapper::{JsonMessageMapper, MessageMapper, Publication};
pub use message::{Message, MessageBody, MessageHeader, MessageKind};
pub use request::{CallRequest, Id, ReplyAddress, Request};
pub use traits::{
    BoxTransaction, Channel, Inbox, InboxExt, Outbox, Producer, TransactionProvider,
};
pub use types::{InboxRecord, OutboxEntry, OutstandingQuery};
