//! Wire envelope exchanged with brokers: [`Message`], [`MessageHeader`], [`MessageBody`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::request::Id;

/// Content type written by the JSON mapper.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Bag key holding the id of the message a dead-lettered copy was made from.
pub const ORIGINAL_MESSAGE_ID: &str = "x-original-message-id";

/// Bag key recording the channel a message was received on.
pub const RECEIVED_ON_CHANNEL: &str = "x-received-on-channel";

/// Bag key recording why a message was rejected.
pub const REJECTION_REASON: &str = "x-rejection-reason";

/// What a message carries, which decides how the pump dispatches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// No message: an empty receive.
    #[default]
    None,
    /// Dispatched to exactly one handler via `send`.
    Command,
    /// Dispatched to every subscribed handler via `publish`.
    Event,
    /// A state-transfer document; dispatched like an event.
    Document,
    /// Control message asking the pump to stop.
    Quit,
    /// A message the channel could not decode; acknowledged and counted.
    Unacceptable,
}

impl MessageKind {
    /// `true` for kinds that carry a request to dispatch.
    #[must_use]
    pub fn is_serviceable(self) -> bool {
        matches!(self, Self::Command | Self::Event | Self::Document)
    }
}

/// Envelope metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Stable across requeue and redrive.
    pub id: Id,
    /// Routing key the message was published to.
    pub topic: String,
    pub kind: MessageKind,
    pub correlation_id: Option<Id>,
    /// Routing key replies should be published to.
    pub reply_to: Option<String>,
    pub content_type: String,
    /// Creation time, millis since Unix epoch.
    pub timestamp: u64,
    /// Requested delivery delay in millis.
    pub delay_ms: u64,
    /// Number of times this message has been requeued.
    pub handled_count: u32,
    pub partition_key: Option<String>,
    /// Free-form metadata. `BTreeMap` keeps serialization order deterministic.
    pub bag: BTreeMap<String, serde_json::Value>,
}

impl MessageHeader {
    /// Creates a header for a message of `kind` on `topic`.
    #[must_use]
    pub fn new(id: Id, topic: impl Into<String>, kind: MessageKind, timestamp: u64) -> Self {
        Self {
            id,
            topic: topic.into(),
            kind,
            correlation_id: None,
            reply_to: None,
            content_type: JSON_CONTENT_TYPE.to_string(),
            timestamp,
            delay_ms: 0,
            handled_count: 0,
            partition_key: None,
            bag: BTreeMap::new(),
        }
    }
}

/// Opaque payload bytes plus their declared content type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl MessageBody {
    #[must_use]
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }

    /// Serializes `value` as a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn json<T: Serialize>(value: &T) -> anyhow::Result<Self> {
        Ok(Self::new(serde_json::to_vec(value)?, JSON_CONTENT_TYPE))
    }

    /// Deserializes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not valid JSON for `T`.
    pub fn to_json<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_slice(&self.bytes)?)
    }

    /// Body as UTF-8 text, lossy.
    #[must_use]
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// A header and a body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    #[must_use]
    pub fn new(header: MessageHeader, body: MessageBody) -> Self {
        Self { header, body }
    }

    /// The result of a receive that found nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(
            MessageHeader::new(Id::random(), "", MessageKind::None, 0),
            MessageBody::default(),
        )
    }

    /// A control message that stops the pump reading it.
    #[must_use]
    pub fn quit() -> Self {
        Self::new(
            MessageHeader::new(Id::random(), "", MessageKind::Quit, 0),
            MessageBody::default(),
        )
    }

    #[must_use]
    pub fn id(&self) -> &Id {
        &self.header.id
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    /// `true` when this is an empty receive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.header.kind == MessageKind::None
    }

    /// `true` once the message has been requeued `limit` times or more.
    #[must_use]
    pub fn handled_count_reached(&self, limit: u32) -> bool {
        self.header.handled_count >= limit
    }

    /// Records one more requeue.
    pub fn increment_handled_count(&mut self) {
        self.header.handled_count = self.header.handled_count.saturating_add(1);
    }
}
