//! In-process request model: identifiers, requests, and reply addressing.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier shared by a request, the message produced from it, and the
/// outbox/inbox records that track it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// Generates a fresh random (v4 UUID) identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::random()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Uuid> for Id {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

/// An identified unit of work.
///
/// Whether a request behaves as a command (exactly one handler) or an event
/// (zero or more handlers) is decided by how it is dispatched: `send` versus
/// `publish`. Requests are serializable so they can be staged in an outbox,
/// recorded in an inbox, or held by a scheduler.
pub trait Request: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// The request's unique identifier.
    fn id(&self) -> &Id;
}

/// Where a reply to a request/reply call should be sent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplyAddress {
    /// Routing key of the ephemeral reply channel.
    pub topic: String,
    /// Correlates the reply with the originating call.
    pub correlation_id: Option<Id>,
}

impl ReplyAddress {
    /// Creates a reply address for `topic` correlated by `correlation_id`.
    #[must_use]
    pub fn new(topic: impl Into<String>, correlation_id: Id) -> Self {
        Self {
            topic: topic.into(),
            correlation_id: Some(correlation_id),
        }
    }
}

/// A request that expects a reply.
///
/// The processor stamps the reply address before the request is mapped, so the
/// receiving handler knows where to answer.
pub trait CallRequest: Request {
    /// The address replies should be sent to.
    fn reply_address(&self) -> &ReplyAddress;

    /// Replaces the reply address.
    fn set_reply_address(&mut self, address: ReplyAddress);
}
