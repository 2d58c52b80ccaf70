use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::storage::page::RecordId;
use crate::transaction::lock_manager::LockMode;

pub type TransactionId = u64;
pub type TableOid = u32;

pub const INVALID_TRANSACTION_ID: TransactionId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why a transaction was aborted by the lock manager.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("lock requested while shrinking")]
    LockOnShrinking,

    #[error("shared lock requested under read-uncommitted")]
    LockSharedOnReadUncommitted,

    #[error("another upgrade is already in progress on the resource")]
    UpgradeConflict,

    #[error("requested mode is not a legal upgrade of the held lock")]
    IncompatibleUpgrade,

    #[error("no lock held on the resource being unlocked")]
    AttemptedUnlockButNoLockHeld,

    #[error("intention lock requested on a row")]
    AttemptedIntentionLockOnRow,

    #[error("row lock requested without a covering table lock")]
    TableLockNotPresent,

    #[error("table unlocked while row locks are still held")]
    TableUnlockedBeforeUnlockingRows,

    #[error("chosen as deadlock victim")]
    Deadlock,
}

/// Per-mode table lock sets plus the S/X row lock sets, keyed by table.
#[derive(Debug, Default)]
pub struct LockSets {
    pub shared_tables: HashSet<TableOid>,
    pub exclusive_tables: HashSet<TableOid>,
    pub intention_shared_tables: HashSet<TableOid>,
    pub intention_exclusive_tables: HashSet<TableOid>,
    pub shared_intention_exclusive_tables: HashSet<TableOid>,
    pub shared_rows: HashMap<TableOid, HashSet<RecordId>>,
    pub exclusive_rows: HashMap<TableOid, HashSet<RecordId>>,
}

impl LockSets {
    fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }

    fn table_set(&self, mode: LockMode) -> &HashSet<TableOid> {
        match mode {
            LockMode::Shared => &self.shared_tables,
            LockMode::Exclusive => &self.exclusive_tables,
            LockMode::IntentionShared => &self.intention_shared_tables,
            LockMode::IntentionExclusive => &self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &self.shared_intention_exclusive_tables,
        }
    }
}

/// State carrier for one transaction. The deadlock detector flips victims
/// to `Aborted` from its own thread, so state and lock sets sit behind
/// their own latches.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    state: RwLock<TransactionState>,
    lock_sets: Mutex<LockSets>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: RwLock::new(TransactionState::Growing),
            lock_sets: Mutex::new(LockSets::default()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.write() = state;
    }

    pub(crate) fn record_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set_mut(mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set_mut(mode).remove(&oid);
    }

    pub(crate) fn record_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        match mode {
            LockMode::Shared => sets.shared_rows.entry(oid).or_default().insert(rid),
            LockMode::Exclusive => sets.exclusive_rows.entry(oid).or_default().insert(rid),
            _ => unreachable!("intention locks are never recorded on rows"),
        };
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        match mode {
            LockMode::Shared => {
                if let Some(rows) = sets.shared_rows.get_mut(&oid) {
                    rows.remove(&rid);
                }
            }
            LockMode::Exclusive => {
                if let Some(rows) = sets.exclusive_rows.get_mut(&oid) {
                    rows.remove(&rid);
                }
            }
            _ => {}
        }
    }

    /// Does this transaction hold a table lock on `oid` in any of `modes`?
    pub fn holds_table_lock_in(&self, oid: TableOid, modes: &[LockMode]) -> bool {
        let sets = self.lock_sets.lock();
        modes.iter().any(|mode| sets.table_set(*mode).contains(&oid))
    }

    pub fn is_row_shared_locked(&self, oid: TableOid, rid: RecordId) -> bool {
        self.lock_sets
            .lock()
            .shared_rows
            .get(&oid)
            .is_some_and(|rows| rows.contains(&rid))
    }

    pub fn is_row_exclusive_locked(&self, oid: TableOid, rid: RecordId) -> bool {
        self.lock_sets
            .lock()
            .exclusive_rows
            .get(&oid)
            .is_some_and(|rows| rows.contains(&rid))
    }

    /// Any row lock still held under `oid`?
    pub fn has_row_locks_on(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_rows.get(&oid).is_some_and(|rows| !rows.is_empty())
            || sets
                .exclusive_rows
                .get(&oid)
                .is_some_and(|rows| !rows.is_empty())
    }

    pub(crate) fn clear_lock_sets(&self) {
        *self.lock_sets.lock() = LockSets::default();
    }
}
