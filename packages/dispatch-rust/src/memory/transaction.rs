//! In-memory business transaction that outbox writes can enlist in.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use courier_core::{BoxTransaction, Id, TransactionProvider};
use parking_lot::Mutex;

type PendingWrite = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

/// Buffers enlisted writes until commit; rollback discards them.
pub struct InMemoryTransaction {
    id: Id,
    pending: Mutex<Vec<PendingWrite>>,
    state: Mutex<TransactionState>,
}

impl fmt::Debug for InMemoryTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTransaction")
            .field("id", &self.id)
            .field("pending", &self.pending.lock().len())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl InMemoryTransaction {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Id::random(),
            pending: Mutex::new(Vec::new()),
            state: Mutex::new(TransactionState::Open),
        }
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Defers `write` until commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction has already finished.
    pub fn enlist(&self, write: impl FnOnce() + Send + 'static) -> anyhow::Result<()> {
        let state = self.state.lock();
        if *state != TransactionState::Open {
            anyhow::bail!("transaction {} is {:?}", self.id, *state);
        }
        self.pending.lock().push(Box::new(write));
        Ok(())
    }

    /// Applies every enlisted write.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction has already finished.
    pub fn commit(&self) -> anyhow::Result<()> {
        let writes = {
            let mut state = self.state.lock();
            if *state != TransactionState::Open {
                anyhow::bail!("transaction {} is {:?}", self.id, *state);
            }
            *state = TransactionState::Committed;
            std::mem::take(&mut *self.pending.lock())
        };
        for write in writes {
            write();
        }
        Ok(())
    }

    /// Discards every enlisted write.
    pub fn rollback(&self) {
        let mut state = self.state.lock();
        if *state == TransactionState::Open {
            *state = TransactionState::RolledBack;
            self.pending.lock().clear();
        }
    }
}

impl Default for InMemoryTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl BoxTransaction for InMemoryTransaction {
    fn id(&self) -> &Id {
        &self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Tracks the caller's current [`InMemoryTransaction`].
#[derive(Default)]
pub struct InMemoryTransactionProvider {
    current: ArcSwapOption<InMemoryTransaction>,
}

impl InMemoryTransactionProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transaction and makes it current.
    pub fn begin(&self) -> Arc<InMemoryTransaction> {
        let transaction = Arc::new(InMemoryTransaction::new());
        self.current.store(Some(Arc::clone(&transaction)));
        transaction
    }

    /// Commits the current transaction and clears it.
    ///
    /// # Errors
    ///
    /// Returns an error if no transaction is open.
    pub fn commit(&self) -> anyhow::Result<()> {
        match self.current.swap(None) {
            Some(transaction) => transaction.commit(),
            None => anyhow::bail!("no open transaction"),
        }
    }

    /// Rolls the current transaction back and clears it.
    pub fn rollback(&self) {
        if let Some(transaction) = self.current.swap(None) {
            transaction.rollback();
        }
    }
}

impl TransactionProvider for InMemoryTransactionProvider {
    fn current(&self) -> Option<Arc<dyn BoxTransaction>> {
        self.current
            .load_full()
            .map(|transaction| transaction as Arc<dyn BoxTransaction>)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn commit_applies_and_rollback_discards() {
        let applied = Arc::new(AtomicU32::new(0));

        let committed = InMemoryTransaction::new();
        let counter = Arc::clone(&applied);
        committed.enlist(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 0);
        committed.commit().unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 1);

        let rolled_back = InMemoryTransaction::new();
        let counter = Arc::clone(&applied);
        rolled_back
            .enlist(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        rolled_back.rollback();
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert_eq!(rolled_back.state(), TransactionState::RolledBack);
    }

    #[test]
    fn finished_transaction_refuses_writes() {
        let transaction = InMemoryTransaction::new();
        transaction.commit().unwrap();
        assert!(transaction.enlist(|| {}).is_err());
        assert!(transaction.commit().is_err());
    }

    #[test]
    fn provider_reports_current_transaction() {
        let provider = InMemoryTransactionProvider::new();
        assert!(provider.current().is_none());
        let transaction = provider.begin();
        assert_eq!(provider.current().unwrap().id(), transaction.id());
        provider.rollback();
        assert!(provider.current().is_none());
        assert!(provider.commit().is_err());
    }
}
