//! Conversion between requests and wire messages.

use std::any::type_name;
use std::marker::PhantomData;

use crate::clock::{ClockSource, SystemClock};
use crate::message::{Message, MessageBody, MessageHeader, MessageKind};
use crate::request::Request;

/// Where a request type is published: its topic and declared content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// Routing key messages are sent to.
    pub topic: String,
    /// Fully qualified name of the request type this publication carries, if bound to one.
    pub request_type: Option<&'static str>,
    pub content_type: String,
}

impl Publication {
    /// Creates a publication on `topic` not bound to a request type.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            request_type: None,
            content_type: crate::message::JSON_CONTENT_TYPE.to_string(),
        }
    }

    /// Creates a publication on `topic` carrying requests of type `R`.
    #[must_use]
    pub fn for_request<R: Request>(topic: impl Into<String>) -> Self {
        Self {
            request_type: Some(type_name::<R>()),
            ..Self::new(topic)
        }
    }
}

/// Maps requests of type `R` to and from messages.
pub trait MessageMapper<R: Request>: Send + Sync + 'static {
    /// Builds the outgoing message for `request` on `publication`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be encoded.
    fn to_message(&self, request: &R, publication: &Publication) -> anyhow::Result<Message>;

    /// Rebuilds the request carried by `message`.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not decode as `R`.
    fn to_request(&self, message: &Message) -> anyhow::Result<R>;
}

/// Mapper that encodes the request as a JSON body.
///
/// The message id is the request id, so the outbox, the broker, and the
/// receiving inbox all agree on identity.
pub struct JsonMessageMapper<R> {
    kind: MessageKind,
    clock: Box<dyn ClockSource>,
    _request: PhantomData<fn() -> R>,
}

impl<R: Request> JsonMessageMapper<R> {
    /// Mapper producing command messages.
    #[must_use]
    pub fn command() -> Self {
        Self::with_kind(MessageKind::Command)
    }

    /// Mapper producing event messages.
    #[must_use]
    pub fn event() -> Self {
        Self::with_kind(MessageKind::Event)
    }

    #[must_use]
    pub fn with_kind(kind: MessageKind) -> Self {
        Self {
            kind,
            clock: Box::new(SystemClock),
            _request: PhantomData,
        }
    }

    /// Replaces the clock used for message timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Box<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }
}

impl<R: Request> MessageMapper<R> for JsonMessageMapper<R> {
    fn to_message(&self, request: &R, publication: &Publication) -> anyhow::Result<Message> {
        let mut header = MessageHeader::new(
            request.id().clone(),
            publication.topic.clone(),
            self.kind,
            self.clock.now(),
        );
        header.content_type.clone_from(&publication.content_type);
        Ok(Message::new(header, MessageBody::json(request)?))
    }

    fn to_request(&self, message: &Message) -> anyhow::Result<R> {
        message.body.to_json()
    }
}
