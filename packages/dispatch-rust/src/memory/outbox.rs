//! In-memory [`Outbox`] backed by [`DashMap`].

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{BoxTransaction, Id, Outbox, OutboxEntry, OutstandingQuery};
use dashmap::DashMap;

use super::transaction::InMemoryTransaction;

/// Outbox entries keyed by message id.
///
/// Cloning shares the same store. `mark_dispatched` updates an entry under its
/// shard lock, so concurrent sweeps can both send an entry but only one of
/// them stamps it.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    entries: Arc<DashMap<Id, OutboxEntry>>,
}

impl InMemoryOutbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the entry under `id`.
    #[must_use]
    pub fn entry(&self, id: &Id) -> Option<OutboxEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    fn insert(&self, entry: OutboxEntry) {
        self.entries.insert(entry.id().clone(), entry);
    }
}

#[async_trait]
impl Outbox for InMemoryOutbox {
    async fn add(
        &self,
        entry: OutboxEntry,
        transaction: Option<Arc<dyn BoxTransaction>>,
    ) -> anyhow::Result<()> {
        match transaction {
            None => self.insert(entry),
            Some(transaction) => {
                let transaction = transaction
                    .as_any()
                    .downcast_ref::<InMemoryTransaction>()
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "transaction {} is not an in-memory transaction",
                            transaction.id()
                        )
                    })?;
                let store = self.clone();
                transaction.enlist(move || store.insert(entry))?;
            }
        }
        Ok(())
    }

    async fn get(&self, id: &Id) -> anyhow::Result<Option<OutboxEntry>> {
        Ok(self.entry(id))
    }

    async fn outstanding_messages(
        &self,
        query: &OutstandingQuery,
        now: u64,
    ) -> anyhow::Result<Vec<OutboxEntry>> {
        let mut outstanding: Vec<OutboxEntry> = self
            .entries
            .iter()
            .filter(|e| !e.is_dispatched())
            .filter(|e| now.saturating_sub(e.written_at) >= query.min_age_ms)
            .filter(|e| !query.excluded_topics.iter().any(|t| t == e.topic()))
            .map(|e| e.value().clone())
            .collect();
        outstanding.sort_by_key(|e| e.written_at);
        outstanding.truncate(query.max_count);
        Ok(outstanding)
    }

    async fn outstanding_count(&self) -> anyhow::Result<usize> {
        Ok(self.entries.iter().filter(|e| !e.is_dispatched()).count())
    }

    async fn mark_dispatched(&self, id: &Id, when: u64) -> anyhow::Result<bool> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("no outbox entry with id {id}"))?;
        if entry.dispatched_at.is_some() {
            return Ok(false);
        }
        entry.dispatched_at = Some(when);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{Message, MessageBody, MessageHeader, MessageKind};

    use super::*;

    fn entry(id: &str, topic: &str, written_at: u64) -> OutboxEntry {
        OutboxEntry::new(
            Message::new(
                MessageHeader::new(Id::from(id), topic, MessageKind::Command, written_at),
                MessageBody::default(),
            ),
            written_at,
        )
    }

    fn query(min_age_ms: u64) -> OutstandingQuery {
        OutstandingQuery {
            min_age_ms,
            max_count: 10,
            excluded_topics: Vec::new(),
        }
    }

    #[tokio::test]
    async fn outstanding_respects_age_topic_and_limit() {
        let outbox = InMemoryOutbox::new();
        outbox.add(entry("old", "a", 1_000), None).await.unwrap();
        outbox.add(entry("older", "b", 500), None).await.unwrap();
        outbox.add(entry("young", "a", 9_500), None).await.unwrap();

        let found = outbox.outstanding_messages(&query(1_000), 10_000).await.unwrap();
        let ids: Vec<_> = found.iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids, vec!["older", "old"]);

        let mut excluding = query(1_000);
        excluding.excluded_topics.push("b".to_string());
        excluding.max_count = 1;
        let found = outbox.outstanding_messages(&excluding, 10_000).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), &Id::from("old"));
    }

    #[tokio::test]
    async fn mark_dispatched_only_once() {
        let outbox = InMemoryOutbox::new();
        outbox.add(entry("m", "a", 1), None).await.unwrap();

        assert!(outbox.mark_dispatched(&Id::from("m"), 10).await.unwrap());
        assert!(!outbox.mark_dispatched(&Id::from("m"), 20).await.unwrap());
        assert_eq!(outbox.entry(&Id::from("m")).unwrap().dispatched_at, Some(10));
        assert_eq!(outbox.outstanding_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_dispatched_unknown_id_fails() {
        let outbox = InMemoryOutbox::new();
        assert!(outbox.mark_dispatched(&Id::from("missing"), 1).await.is_err());
    }
}
