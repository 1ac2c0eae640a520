use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::message::Message;

/// Bag key holding the channel a pumped request arrived on.
pub const CHANNEL_NAME: &str = "courier.channel_name";

/// Bag key holding the millis-since-epoch time a pumped request was received.
pub const REQUEST_START: &str = "courier.request_start";

/// Per-dispatch scratch space carrying the tracing span and a bag of values
/// that decorators and handlers share during one dispatch. Never persisted.
///
/// Cloning is cheap and clones share the same bag, so a retry or a fan-out to
/// several handlers sees what earlier steps wrote.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Span the dispatch runs in.
    pub span: tracing::Span,
    /// Message the request was translated from, when it came off a channel.
    pub originating_message: Option<Arc<Message>>,
    bag: Arc<RwLock<HashMap<String, serde_json::Value>>>,
}

impl RequestContext {
    /// Creates a context bound to the current span.
    #[must_use]
    pub fn new() -> Self {
        Self::with_span(tracing::Span::current())
    }

    /// Creates a context bound to `span`.
    #[must_use]
    pub fn with_span(span: tracing::Span) -> Self {
        Self {
            span,
            originating_message: None,
            bag: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Attaches the message this dispatch was translated from.
    #[must_use]
    pub fn from_message(mut self, message: Message) -> Self {
        self.originating_message = Some(Arc::new(message));
        self
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.bag.write().insert(key.into(), value.into());
    }

    /// Returns a copy of the value under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.bag.read().get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.bag.read().contains_key(key)
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
