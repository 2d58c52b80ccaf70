use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::background::{spawn_periodic_worker, WorkerHandle, WorkerKind};
use crate::error::{VellumError, VellumResult};
use crate::storage::page::RecordId;
use crate::transaction::transaction_manager::TransactionManager;
use crate::transaction::{
    AbortReason, IsolationLevel, TableOid, Transaction, TransactionId, TransactionState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short = match self {
            LockMode::IntentionShared => "IS",
            LockMode::IntentionExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::SharedIntentionExclusive => "SIX",
            LockMode::Exclusive => "X",
        };
        write!(f, "{}", short)
    }
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TransactionId,
    mode: LockMode,
    granted: bool,
}

impl LockRequest {
    fn new(txn_id: TransactionId, mode: LockMode) -> Self {
        Self {
            txn_id,
            mode,
            granted: false,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    requests: VecDeque<LockRequest>,
    // the single transaction currently upgrading its lock, if any
    upgrading: Option<TransactionId>,
}

#[derive(Debug, Default)]
struct LockRequestQueue {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

/// Multi-granularity two-phase lock manager: per-resource FIFO wait queues
/// with upgrade priority, isolation-level rule checks, and a background
/// wait-for cycle breaker.
#[derive(Debug, Default)]
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<RecordId, Arc<LockRequestQueue>>>,
    // rebuilt from the queues before each detection sweep
    wait_for: Mutex<BTreeMap<TransactionId, BTreeSet<TransactionId>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a table lock, waiting until the grant rule admits it.
    /// Rule violations abort the transaction and surface as errors; a
    /// transaction already aborted (e.g. a deadlock victim) gets `false`.
    pub fn lock_table(
        &self,
        txn: &Transaction,
        mode: LockMode,
        oid: TableOid,
    ) -> VellumResult<bool> {
        match txn.state() {
            TransactionState::Aborted | TransactionState::Committed => return Ok(false),
            _ => {}
        }
        self.check_table_lock_rules(txn, mode)?;

        let queue = self.table_queue(oid);
        let mut state = queue.state.lock();

        let mut upgrading = false;
        if let Some(pos) = state
            .requests
            .iter()
            .position(|request| request.txn_id == txn.id())
        {
            let held = state.requests[pos].mode;
            if held == mode {
                return Ok(true);
            }
            if state.upgrading.is_some() && state.upgrading != Some(txn.id()) {
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            if !can_upgrade(held, mode) {
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }
            // release the held lock; the new request goes ahead of every
            // waiter and the queue is reserved for this upgrade
            txn.remove_table_lock(held, oid);
            state.requests.remove(pos);
            state.upgrading = Some(txn.id());
            upgrading = true;
            let insert_at = state
                .requests
                .iter()
                .position(|request| !request.granted)
                .unwrap_or(state.requests.len());
            state
                .requests
                .insert(insert_at, LockRequest::new(txn.id(), mode));
        } else {
            state.requests.push_back(LockRequest::new(txn.id(), mode));
        }

        loop {
            if txn.state() == TransactionState::Aborted {
                state.requests.retain(|request| request.txn_id != txn.id());
                if state.upgrading == Some(txn.id()) {
                    state.upgrading = None;
                }
                queue.condvar.notify_all();
                return Ok(false);
            }
            if can_grant(&state, txn.id()) {
                break;
            }
            queue.condvar.wait(&mut state);
        }

        if let Some(request) = state
            .requests
            .iter_mut()
            .find(|request| request.txn_id == txn.id())
        {
            request.granted = true;
        }
        if upgrading {
            // waiters held back by the in-flight upgrade re-evaluate now
            state.upgrading = None;
            queue.condvar.notify_all();
        }
        txn.record_table_lock(mode, oid);
        trace!("txn {} locked table {} in {}", txn.id(), oid, mode);
        Ok(true)
    }

    /// Release a granted table lock, applying the 2PL state transition.
    pub fn unlock_table(&self, txn: &Transaction, oid: TableOid) -> VellumResult<bool> {
        let already_done = matches!(
            txn.state(),
            TransactionState::Aborted | TransactionState::Committed
        );
        let Some(queue) = self.existing_table_queue(oid) else {
            if already_done {
                return Ok(false);
            }
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let mut state = queue.state.lock();

        if txn.has_row_locks_on(oid) {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let Some(pos) = state
            .requests
            .iter()
            .position(|request| request.granted && request.txn_id == txn.id())
        else {
            // a victim's requests were already swept; nothing to release
            if already_done {
                return Ok(false);
            }
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mode = state.requests[pos].mode;
        self.transition_on_unlock(txn, mode);
        if state.upgrading == Some(txn.id()) {
            state.upgrading = None;
        }
        state.requests.remove(pos);
        txn.remove_table_lock(mode, oid);
        queue.condvar.notify_all();
        trace!("txn {} unlocked table {} ({})", txn.id(), oid, mode);
        Ok(true)
    }

    /// Acquire a row lock. Rows only take S or X, and require a covering
    /// table lock.
    pub fn lock_row(
        &self,
        txn: &Transaction,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> VellumResult<bool> {
        match txn.state() {
            TransactionState::Aborted | TransactionState::Committed => return Ok(false),
            _ => {}
        }
        self.check_row_lock_rules(txn, mode, oid)?;

        let queue = self.row_queue(rid);
        let mut state = queue.state.lock();

        let mut upgrading = false;
        if let Some(pos) = state
            .requests
            .iter()
            .position(|request| request.txn_id == txn.id())
        {
            let held = state.requests[pos].mode;
            if held == mode {
                return Ok(true);
            }
            if state.upgrading.is_some() && state.upgrading != Some(txn.id()) {
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            // the only legal row upgrade is S -> X
            if !(held == LockMode::Shared && mode == LockMode::Exclusive) {
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }
            txn.remove_row_lock(held, oid, rid);
            state.requests.remove(pos);
            state.upgrading = Some(txn.id());
            upgrading = true;
            let insert_at = state
                .requests
                .iter()
                .position(|request| !request.granted)
                .unwrap_or(state.requests.len());
            state
                .requests
                .insert(insert_at, LockRequest::new(txn.id(), mode));
        } else {
            state.requests.push_back(LockRequest::new(txn.id(), mode));
        }

        loop {
            if txn.state() == TransactionState::Aborted {
                state.requests.retain(|request| request.txn_id != txn.id());
                if state.upgrading == Some(txn.id()) {
                    state.upgrading = None;
                }
                queue.condvar.notify_all();
                return Ok(false);
            }
            if can_grant(&state, txn.id()) {
                break;
            }
            queue.condvar.wait(&mut state);
        }

        if let Some(request) = state
            .requests
            .iter_mut()
            .find(|request| request.txn_id == txn.id())
        {
            request.granted = true;
        }
        if upgrading {
            // waiters held back by the in-flight upgrade re-evaluate now
            state.upgrading = None;
            queue.condvar.notify_all();
        }
        txn.record_row_lock(mode, oid, rid);
        trace!("txn {} locked row {} in {}", txn.id(), rid, mode);
        Ok(true)
    }

    /// Release a granted row lock.
    pub fn unlock_row(
        &self,
        txn: &Transaction,
        oid: TableOid,
        rid: RecordId,
    ) -> VellumResult<bool> {
        let already_done = matches!(
            txn.state(),
            TransactionState::Aborted | TransactionState::Committed
        );
        let Some(queue) = self.existing_row_queue(rid) else {
            if already_done {
                return Ok(false);
            }
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let mut state = queue.state.lock();

        let Some(pos) = state
            .requests
            .iter()
            .position(|request| request.granted && request.txn_id == txn.id())
        else {
            // a victim's requests were already swept; nothing to release
            if already_done {
                return Ok(false);
            }
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mode = state.requests[pos].mode;
        self.transition_on_unlock(txn, mode);
        if state.upgrading == Some(txn.id()) {
            state.upgrading = None;
        }
        state.requests.remove(pos);
        txn.remove_row_lock(mode, oid, rid);
        queue.condvar.notify_all();
        trace!("txn {} unlocked row {} ({})", txn.id(), rid, mode);
        Ok(true)
    }

    /// Release everything a transaction holds or is still waiting for,
    /// without 2PL transition checks, and wake the affected queues. Used by
    /// commit and abort.
    pub fn release_all_locks(&self, txn: &Transaction) {
        self.sweep_transaction(txn.id());
        txn.clear_lock_sets();
    }

    /// Spawn the background deadlock detector. The returned handle stops
    /// and joins the worker when dropped.
    pub fn start_cycle_detection(
        self: &Arc<Self>,
        txn_manager: Arc<TransactionManager>,
        interval: Duration,
    ) -> VellumResult<WorkerHandle> {
        let lock_manager = self.clone();
        spawn_periodic_worker(
            "deadlock-detector",
            WorkerKind::DeadlockDetector,
            interval,
            move || {
                lock_manager.detect_deadlocks(&txn_manager);
            },
        )
    }

    /// One detection sweep: rebuild the wait-for graph, abort the youngest
    /// transaction of each cycle until none remain, then discard the graph.
    /// Returns the victims, oldest sweep first.
    pub fn detect_deadlocks(&self, txn_manager: &TransactionManager) -> Vec<TransactionId> {
        let mut victims = Vec::new();
        loop {
            self.build_wait_for_graph();
            let Some(victim) = self.find_cycle_victim() else {
                break;
            };
            warn!("txn {} aborted: {}", victim, AbortReason::Deadlock);
            if let Some(txn) = txn_manager.get_transaction(victim) {
                txn.set_state(TransactionState::Aborted);
                txn.clear_lock_sets();
            }
            self.sweep_transaction(victim);
            victims.push(victim);
        }
        self.wait_for.lock().clear();
        victims
    }

    /// Current wait-for edges `(waiter, holder)`, sorted; debug/test hook.
    pub fn wait_for_edges(&self) -> Vec<(TransactionId, TransactionId)> {
        self.build_wait_for_graph();
        let graph = self.wait_for.lock();
        graph
            .iter()
            .flat_map(|(waiter, holders)| holders.iter().map(move |holder| (*waiter, *holder)))
            .collect()
    }

    fn build_wait_for_graph(&self) {
        let mut graph: BTreeMap<TransactionId, BTreeSet<TransactionId>> = BTreeMap::new();
        let mut add_queue_edges = |queue: &Arc<LockRequestQueue>| {
            let state = queue.state.lock();
            for waiter in state.requests.iter().filter(|request| !request.granted) {
                for holder in state.requests.iter().filter(|request| request.granted) {
                    if waiter.txn_id != holder.txn_id {
                        graph
                            .entry(waiter.txn_id)
                            .or_default()
                            .insert(holder.txn_id);
                    }
                }
            }
        };

        {
            let table_map = self.table_lock_map.lock();
            for queue in table_map.values() {
                add_queue_edges(queue);
            }
        }
        {
            let row_map = self.row_lock_map.lock();
            for queue in row_map.values() {
                add_queue_edges(queue);
            }
        }
        *self.wait_for.lock() = graph;
    }

    /// DFS over the txn-id-ordered adjacency map; the victim is the largest
    /// transaction id on the first cycle found.
    fn find_cycle_victim(&self) -> Option<TransactionId> {
        let graph = self.wait_for.lock();
        let mut visited: BTreeSet<TransactionId> = BTreeSet::new();

        fn dfs(
            graph: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
            node: TransactionId,
            path: &mut Vec<TransactionId>,
            visited: &mut BTreeSet<TransactionId>,
        ) -> Option<Vec<TransactionId>> {
            path.push(node);
            if let Some(edges) = graph.get(&node) {
                for &next in edges.iter() {
                    if let Some(at) = path.iter().position(|&n| n == next) {
                        return Some(path[at..].to_vec());
                    }
                    if !visited.contains(&next) {
                        if let Some(cycle) = dfs(graph, next, path, visited) {
                            return Some(cycle);
                        }
                    }
                }
            }
            visited.insert(node);
            path.pop();
            None
        }

        for &start in graph.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = dfs(&graph, start, &mut path, &mut visited) {
                return cycle.into_iter().max();
            }
        }
        None
    }

    /// Remove every request of `txn_id` from every queue and wake the
    /// affected waiters.
    fn sweep_transaction(&self, txn_id: TransactionId) {
        let queues: Vec<Arc<LockRequestQueue>> = {
            let table_map = self.table_lock_map.lock();
            table_map.values().cloned().collect()
        };
        for queue in queues {
            Self::sweep_queue(&queue, txn_id);
        }
        let queues: Vec<Arc<LockRequestQueue>> = {
            let row_map = self.row_lock_map.lock();
            row_map.values().cloned().collect()
        };
        for queue in queues {
            Self::sweep_queue(&queue, txn_id);
        }

        let mut graph = self.wait_for.lock();
        graph.remove(&txn_id);
        for edges in graph.values_mut() {
            edges.remove(&txn_id);
        }
    }

    fn sweep_queue(queue: &Arc<LockRequestQueue>, txn_id: TransactionId) {
        let mut state = queue.state.lock();
        let before = state.requests.len();
        state.requests.retain(|request| request.txn_id != txn_id);
        if state.upgrading == Some(txn_id) {
            state.upgrading = None;
        }
        if state.requests.len() != before {
            queue.condvar.notify_all();
        }
    }

    fn check_table_lock_rules(&self, txn: &Transaction, mode: LockMode) -> VellumResult<()> {
        if txn.isolation_level() == IsolationLevel::ReadUncommitted
            && matches!(
                mode,
                LockMode::Shared | LockMode::IntentionShared | LockMode::SharedIntentionExclusive
            )
        {
            return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
        }

        if txn.state() == TransactionState::Shrinking {
            match txn.isolation_level() {
                IsolationLevel::RepeatableRead | IsolationLevel::ReadUncommitted => {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
                IsolationLevel::ReadCommitted => {
                    if !matches!(mode, LockMode::Shared | LockMode::IntentionShared) {
                        return Err(self.abort(txn, AbortReason::LockOnShrinking));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_row_lock_rules(
        &self,
        txn: &Transaction,
        mode: LockMode,
        oid: TableOid,
    ) -> VellumResult<()> {
        if !matches!(mode, LockMode::Shared | LockMode::Exclusive) {
            return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }

        if txn.isolation_level() == IsolationLevel::ReadUncommitted && mode == LockMode::Shared {
            return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
        }

        if txn.state() == TransactionState::Shrinking {
            match txn.isolation_level() {
                IsolationLevel::RepeatableRead | IsolationLevel::ReadUncommitted => {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
                IsolationLevel::ReadCommitted => {
                    if mode != LockMode::Shared {
                        return Err(self.abort(txn, AbortReason::LockOnShrinking));
                    }
                }
            }
        }

        // a row lock needs a covering table lock
        let covering: &[LockMode] = match mode {
            LockMode::Shared => &[
                LockMode::IntentionShared,
                LockMode::Shared,
                LockMode::IntentionExclusive,
                LockMode::SharedIntentionExclusive,
                LockMode::Exclusive,
            ],
            _ => &[
                LockMode::IntentionExclusive,
                LockMode::SharedIntentionExclusive,
                LockMode::Exclusive,
            ],
        };
        if !txn.holds_table_lock_in(oid, covering) {
            return Err(self.abort(txn, AbortReason::TableLockNotPresent));
        }
        Ok(())
    }

    /// Unlocking S or X moves 2PL into the shrinking phase, depending on
    /// the isolation level. Intention modes never transition.
    fn transition_on_unlock(&self, txn: &Transaction, mode: LockMode) {
        match txn.state() {
            TransactionState::Aborted | TransactionState::Committed => return,
            _ => {}
        }
        let shrink = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrink {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn abort(&self, txn: &Transaction, reason: AbortReason) -> VellumError {
        txn.set_state(TransactionState::Aborted);
        warn!("txn {} aborted: {}", txn.id(), reason);
        VellumError::TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        let mut map = self.table_lock_map.lock();
        map.entry(oid).or_default().clone()
    }

    fn existing_table_queue(&self, oid: TableOid) -> Option<Arc<LockRequestQueue>> {
        self.table_lock_map.lock().get(&oid).cloned()
    }

    fn row_queue(&self, rid: RecordId) -> Arc<LockRequestQueue> {
        let mut map = self.row_lock_map.lock();
        map.entry(rid).or_default().clone()
    }

    fn existing_row_queue(&self, rid: RecordId) -> Option<Arc<LockRequestQueue>> {
        self.row_lock_map.lock().get(&rid).cloned()
    }
}

/// Grant rule: a request is admitted iff it is compatible with every
/// granted request, compatible with every earlier waiter (FIFO), and no
/// other transaction's upgrade is in flight.
fn can_grant(state: &QueueState, txn_id: TransactionId) -> bool {
    let Some(pos) = state
        .requests
        .iter()
        .position(|request| request.txn_id == txn_id)
    else {
        return false;
    };
    let request = &state.requests[pos];
    if request.granted {
        return true;
    }

    if let Some(upgrader) = state.upgrading {
        if upgrader != txn_id {
            return false;
        }
    }

    for other in state.requests.iter() {
        if other.granted
            && other.txn_id != txn_id
            && !modes_compatible(other.mode, request.mode)
        {
            return false;
        }
    }

    for other in state.requests.iter().take(pos) {
        if !other.granted && !modes_compatible(other.mode, request.mode) {
            return false;
        }
    }
    true
}

/// The multi-granularity compatibility matrix. Symmetric.
fn modes_compatible(held: LockMode, requested: LockMode) -> bool {
    match held {
        LockMode::IntentionShared => requested != LockMode::Exclusive,
        LockMode::IntentionExclusive => matches!(
            requested,
            LockMode::IntentionShared | LockMode::IntentionExclusive
        ),
        LockMode::Shared => matches!(requested, LockMode::IntentionShared | LockMode::Shared),
        LockMode::SharedIntentionExclusive => requested == LockMode::IntentionShared,
        LockMode::Exclusive => false,
    }
}

/// Legal table upgrades: IS -> {S, X, IX, SIX}; S -> {X, SIX};
/// IX -> {X, SIX}; SIX -> {X}.
fn can_upgrade(held: LockMode, requested: LockMode) -> bool {
    match held {
        LockMode::IntentionShared => requested != LockMode::IntentionShared,
        LockMode::Shared | LockMode::IntentionExclusive => matches!(
            requested,
            LockMode::Exclusive | LockMode::SharedIntentionExclusive
        ),
        LockMode::SharedIntentionExclusive => requested == LockMode::Exclusive,
        LockMode::Exclusive => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::IsolationLevel;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::thread;
    use std::time::Duration;

    fn new_txn(id: TransactionId) -> Arc<Transaction> {
        Arc::new(Transaction::new(id, IsolationLevel::RepeatableRead))
    }

    #[test]
    fn shared_locks_are_compatible() {
        let manager = LockManager::new();
        let txn1 = new_txn(1);
        let txn2 = new_txn(2);

        assert!(manager.lock_table(&txn1, LockMode::Shared, 1).unwrap());
        assert!(manager.lock_table(&txn2, LockMode::Shared, 1).unwrap());

        assert!(manager.unlock_table(&txn1, 1).unwrap());
        assert!(manager.unlock_table(&txn2, 1).unwrap());
    }

    #[test]
    fn compatibility_matrix() {
        use LockMode::*;
        let cases = [
            (IntentionShared, IntentionShared, true),
            (IntentionShared, Exclusive, false),
            (IntentionExclusive, IntentionExclusive, true),
            (IntentionExclusive, Shared, false),
            (Shared, Shared, true),
            (Shared, SharedIntentionExclusive, false),
            (SharedIntentionExclusive, IntentionShared, true),
            (SharedIntentionExclusive, SharedIntentionExclusive, false),
            (Exclusive, IntentionShared, false),
        ];
        for (held, requested, expect) in cases {
            assert_eq!(modes_compatible(held, requested), expect);
            assert_eq!(modes_compatible(requested, held), expect);
        }
    }

    #[test]
    fn exclusive_waits_for_shared() {
        let manager = Arc::new(LockManager::new());
        let txn1 = new_txn(10);
        let txn2 = new_txn(20);

        assert!(manager.lock_table(&txn1, LockMode::Shared, 5).unwrap());

        let acquired = Arc::new(AtomicBool::new(false));
        let acquired_flag = acquired.clone();
        let manager_bg = manager.clone();
        let txn2_bg = txn2.clone();
        let handle = thread::spawn(move || {
            let ok = manager_bg
                .lock_table(&txn2_bg, LockMode::Exclusive, 5)
                .unwrap();
            acquired_flag.store(ok, AtomicOrdering::SeqCst);
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!acquired.load(AtomicOrdering::SeqCst));

        assert!(manager.unlock_table(&txn1, 5).unwrap());
        handle.join().unwrap();
        assert!(acquired.load(AtomicOrdering::SeqCst));
        assert!(manager.unlock_table(&txn2, 5).unwrap());
    }

    #[test]
    fn fifo_waiter_blocks_later_compatible_request() {
        let manager = Arc::new(LockManager::new());
        let holder = new_txn(1);
        let writer = new_txn(2);
        let reader = new_txn(3);

        assert!(manager.lock_table(&holder, LockMode::Shared, 9).unwrap());

        let writer_done = Arc::new(AtomicBool::new(false));
        let reader_done = Arc::new(AtomicBool::new(false));

        let manager_bg = manager.clone();
        let writer_bg = writer.clone();
        let writer_flag = writer_done.clone();
        let writer_handle = thread::spawn(move || {
            assert!(manager_bg
                .lock_table(&writer_bg, LockMode::Exclusive, 9)
                .unwrap());
            writer_flag.store(true, AtomicOrdering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            manager_bg.unlock_table(&writer_bg, 9).unwrap();
        });

        thread::sleep(Duration::from_millis(30));
        let manager_bg = manager.clone();
        let reader_bg = reader.clone();
        let reader_flag = reader_done.clone();
        let reader_handle = thread::spawn(move || {
            assert!(manager_bg
                .lock_table(&reader_bg, LockMode::Shared, 9)
                .unwrap());
            reader_flag.store(true, AtomicOrdering::SeqCst);
        });

        // the reader is compatible with the holder but must not overtake
        // the queued writer
        thread::sleep(Duration::from_millis(30));
        assert!(!writer_done.load(AtomicOrdering::SeqCst));
        assert!(!reader_done.load(AtomicOrdering::SeqCst));

        manager.unlock_table(&holder, 9).unwrap();
        writer_handle.join().unwrap();
        reader_handle.join().unwrap();
        assert!(writer_done.load(AtomicOrdering::SeqCst));
        assert!(reader_done.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn upgrade_waits_for_other_holders() {
        let manager = Arc::new(LockManager::new());
        let txn1 = new_txn(1);
        let txn2 = new_txn(2);

        assert!(manager.lock_table(&txn1, LockMode::Shared, 3).unwrap());
        assert!(manager.lock_table(&txn2, LockMode::Shared, 3).unwrap());

        let upgraded = Arc::new(AtomicBool::new(false));
        let upgraded_flag = upgraded.clone();
        let manager_bg = manager.clone();
        let txn1_bg = txn1.clone();
        let handle = thread::spawn(move || {
            let ok = manager_bg
                .lock_table(&txn1_bg, LockMode::Exclusive, 3)
                .unwrap();
            upgraded_flag.store(ok, AtomicOrdering::SeqCst);
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!upgraded.load(AtomicOrdering::SeqCst));

        assert!(manager.unlock_table(&txn2, 3).unwrap());
        handle.join().unwrap();
        assert!(upgraded.load(AtomicOrdering::SeqCst));

        // the queue now holds exactly one granted X for txn1
        assert!(txn1.holds_table_lock_in(3, &[LockMode::Exclusive]));
        assert!(!txn1.holds_table_lock_in(3, &[LockMode::Shared]));
        assert!(manager.unlock_table(&txn1, 3).unwrap());
    }

    #[test]
    fn concurrent_upgrades_conflict() {
        let manager = Arc::new(LockManager::new());
        let txn1 = new_txn(1);
        let txn2 = new_txn(2);
        let txn3 = new_txn(3);

        assert!(manager.lock_table(&txn1, LockMode::Shared, 4).unwrap());
        assert!(manager.lock_table(&txn2, LockMode::Shared, 4).unwrap());
        assert!(manager.lock_table(&txn3, LockMode::Shared, 4).unwrap());

        let manager_bg = manager.clone();
        let txn2_bg = txn2.clone();
        let handle = thread::spawn(move || {
            // blocks behind txn1 and txn3's shared locks
            manager_bg.lock_table(&txn2_bg, LockMode::Exclusive, 4)
        });

        thread::sleep(Duration::from_millis(30));
        let err = manager
            .lock_table(&txn3, LockMode::Exclusive, 4)
            .unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::UpgradeConflict));
        assert_eq!(txn3.state(), TransactionState::Aborted);

        // unblock txn2's upgrade: txn3's grant and txn1's grant must go
        manager.release_all_locks(&txn3);
        assert!(manager.unlock_table(&txn1, 4).unwrap());
        assert!(handle.join().unwrap().unwrap());
    }

    #[test]
    fn incompatible_upgrade_aborts() {
        let manager = LockManager::new();
        let txn = new_txn(1);
        assert!(manager.lock_table(&txn, LockMode::Exclusive, 2).unwrap());
        let err = manager.lock_table(&txn, LockMode::Shared, 2).unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::IncompatibleUpgrade));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn read_uncommitted_rejects_shared() {
        let manager = LockManager::new();
        let txn = Arc::new(Transaction::new(1, IsolationLevel::ReadUncommitted));
        let err = manager.lock_table(&txn, LockMode::Shared, 1).unwrap_err();
        assert_eq!(
            err.abort_reason(),
            Some(AbortReason::LockSharedOnReadUncommitted)
        );
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn repeatable_read_rejects_lock_while_shrinking() {
        let manager = LockManager::new();
        let txn = new_txn(1);
        assert!(manager.lock_table(&txn, LockMode::Shared, 1).unwrap());
        assert!(manager.unlock_table(&txn, 1).unwrap());
        assert_eq!(txn.state(), TransactionState::Shrinking);

        let err = manager
            .lock_table(&txn, LockMode::IntentionShared, 2)
            .unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::LockOnShrinking));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn read_committed_allows_shared_while_shrinking() {
        let manager = LockManager::new();
        let txn = Arc::new(Transaction::new(1, IsolationLevel::ReadCommitted));
        assert!(manager.lock_table(&txn, LockMode::Exclusive, 1).unwrap());
        assert!(manager.unlock_table(&txn, 1).unwrap());
        assert_eq!(txn.state(), TransactionState::Shrinking);

        assert!(manager.lock_table(&txn, LockMode::Shared, 2).unwrap());
        let err = manager
            .lock_table(&txn, LockMode::IntentionExclusive, 3)
            .unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::LockOnShrinking));
    }

    #[test]
    fn row_lock_rules() {
        let manager = LockManager::new();
        let rid = RecordId::new(1, 1);

        // intention locks are illegal on rows
        let txn = new_txn(1);
        let err = manager
            .lock_row(&txn, LockMode::IntentionShared, 1, rid)
            .unwrap_err();
        assert_eq!(
            err.abort_reason(),
            Some(AbortReason::AttemptedIntentionLockOnRow)
        );

        // a row lock needs a covering table lock
        let txn = new_txn(2);
        let err = manager.lock_row(&txn, LockMode::Shared, 1, rid).unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::TableLockNotPresent));

        // IS covers row S but not row X
        let txn = new_txn(3);
        assert!(manager
            .lock_table(&txn, LockMode::IntentionShared, 1)
            .unwrap());
        assert!(manager.lock_row(&txn, LockMode::Shared, 1, rid).unwrap());
        let err = manager
            .lock_row(&txn, LockMode::Exclusive, 1, RecordId::new(1, 2))
            .unwrap_err();
        assert_eq!(err.abort_reason(), Some(AbortReason::TableLockNotPresent));
    }

    #[test]
    fn row_upgrade_shared_to_exclusive() {
        let manager = LockManager::new();
        let txn = new_txn(1);
        let rid = RecordId::new(2, 7);

        assert!(manager
            .lock_table(&txn, LockMode::IntentionExclusive, 1)
            .unwrap());
        assert!(manager.lock_row(&txn, LockMode::Shared, 1, rid).unwrap());
        assert!(manager.lock_row(&txn, LockMode::Exclusive, 1, rid).unwrap());
        assert!(txn.is_row_exclusive_locked(1, rid));
        assert!(!txn.is_row_shared_locked(1, rid));

        assert!(manager.unlock_row(&txn, 1, rid).unwrap());
        assert!(manager.unlock_table(&txn, 1).unwrap());
    }

    #[test]
    fn table_unlock_requires_rows_released() {
        let manager = LockManager::new();
        let txn = new_txn(1);
        let rid = RecordId::new(1, 1);

        assert!(manager
            .lock_table(&txn, LockMode::IntentionExclusive, 1)
            .unwrap());
        assert!(manager.lock_row(&txn, LockMode::Exclusive, 1, rid).unwrap());

        let err = manager.unlock_table(&txn, 1).unwrap_err();
        assert_eq!(
            err.abort_reason(),
            Some(AbortReason::TableUnlockedBeforeUnlockingRows)
        );
    }

    #[test]
    fn unlock_without_lock_aborts() {
        let manager = LockManager::new();
        let txn = new_txn(1);
        let err = manager.unlock_table(&txn, 42).unwrap_err();
        assert_eq!(
            err.abort_reason(),
            Some(AbortReason::AttemptedUnlockButNoLockHeld)
        );
        assert_eq!(txn.state(), TransactionState::Aborted);
    }
}
