//! In-memory [`Inbox`] backed by [`DashMap`].

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{Id, Inbox, InboxRecord};
use dashmap::DashMap;

#[derive(Clone, Default)]
pub struct InMemoryInbox {
    records: Arc<DashMap<(Id, String), InboxRecord>>,
}

impl InMemoryInbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl Inbox for InMemoryInbox {
    async fn add(&self, record: InboxRecord) -> anyhow::Result<()> {
        // First write wins; records are immutable once written.
        self.records
            .entry((record.request_id.clone(), record.context_key.clone()))
            .or_insert(record);
        Ok(())
    }

    async fn exists(&self, request_id: &Id, context_key: &str) -> anyhow::Result<bool> {
        Ok(self
            .records
            .contains_key(&(request_id.clone(), context_key.to_string())))
    }

    async fn get(&self, request_id: &Id, context_key: &str) -> anyhow::Result<Option<InboxRecord>> {
        Ok(self
            .records
            .get(&(request_id.clone(), context_key.to_string()))
            .map(|r| r.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn record(id: &str, key: &str, recorded_at: u64) -> InboxRecord {
        InboxRecord {
            request_id: Id::from(id),
            context_key: key.to_string(),
            request: serde_json::json!({ "id": id }),
            recorded_at,
        }
    }

    #[tokio::test]
    async fn context_keys_are_independent() {
        let inbox = InMemoryInbox::new();
        inbox.add(record("r", "a", 1)).await.unwrap();
        assert!(inbox.exists(&Id::from("r"), "a").await.unwrap());
        assert!(!inbox.exists(&Id::from("r"), "b").await.unwrap());
        assert!(inbox.get(&Id::from("r"), "b").await.unwrap().is_none());
    }

    proptest! {
        #[test]
        fn add_is_idempotent(id in "[a-z0-9]{1,12}", key in "[a-z]{1,8}", repeats in 2usize..6) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let inbox = InMemoryInbox::new();
                for i in 0..repeats {
                    inbox.add(record(&id, &key, i as u64)).await.unwrap();
                }
                assert_eq!(inbox.len(), 1);
                let stored = inbox.get(&Id::from(id.as_str()), &key).await.unwrap().unwrap();
                assert_eq!(stored.recorded_at, 0);
            });
        }
    }
}
