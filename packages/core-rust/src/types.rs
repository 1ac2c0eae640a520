use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::request::Id;

/// A staged outgoing message plus its dispatch bookkeeping.
///
/// Written in the same unit of work as the business change that produced it and
/// mutated only when the mediator marks it dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub message: Message,
    /// Millis since epoch when the entry was written.
    pub written_at: u64,
    /// Millis since epoch of the successful send, `None` while outstanding.
    pub dispatched_at: Option<u64>,
}

impl OutboxEntry {
    #[must_use]
    pub fn new(message: Message, written_at: u64) -> Self {
        Self {
            message,
            written_at,
            dispatched_at: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &Id {
        self.message.id()
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.message.header.topic
    }

    #[must_use]
    pub fn is_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }
}

/// Marks that the handler identified by `context_key` has processed `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub request_id: Id,
    pub context_key: String,
    /// The handled request, serialized.
    pub request: serde_json::Value,
    /// Millis since epoch when the record was written.
    pub recorded_at: u64,
}

/// Query for outstanding outbox entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutstandingQuery {
    /// Only entries at least this old (millis) are returned.
    pub min_age_ms: u64,
    /// Upper bound on the number of entries returned.
    pub max_count: usize,
    /// Entries on these topics are skipped.
    pub excluded_topics: Vec<String>,
}
