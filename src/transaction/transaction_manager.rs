use dashmap::DashMap;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::transaction::lock_manager::LockManager;
use crate::transaction::{IsolationLevel, Transaction, TransactionId, TransactionState};

/// Hands out transaction ids, keeps the registry the deadlock detector
/// resolves victims through, and drives commit/abort.
#[derive(Debug)]
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    active_txns: DashMap<TransactionId, Arc<Transaction>>,
    lock_manager: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            // id 0 is reserved as the invalid sentinel
            next_txn_id: AtomicU64::new(1),
            active_txns: DashMap::new(),
            lock_manager,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_txns.insert(txn_id, txn.clone());
        debug!("txn {} began ({:?})", txn_id, isolation_level);
        txn
    }

    pub fn get_transaction(&self, txn_id: TransactionId) -> Option<Arc<Transaction>> {
        self.active_txns.get(&txn_id).map(|entry| entry.value().clone())
    }

    /// Release everything and mark committed.
    pub fn commit(&self, txn: &Arc<Transaction>) {
        self.lock_manager.release_all_locks(txn);
        txn.set_state(TransactionState::Committed);
        self.active_txns.remove(&txn.id());
        debug!("txn {} committed", txn.id());
    }

    /// Mark aborted first so any thread blocked on a lock call observes the
    /// state when the sweep wakes it, then release everything.
    pub fn abort(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all_locks(txn);
        self.active_txns.remove(&txn.id());
        debug!("txn {} aborted", txn.id());
    }
}
