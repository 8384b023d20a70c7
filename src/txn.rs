//! Transaction manager (§4.D): producer-id/epoch, the transaction state
//! machine, and the pending partition/offset/group enlistment bookkeeping
//! the sender drains each round.

use crate::error::{BrokerError, ProducerError};
use crate::types::TopicPartition;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::Notify;
use tracing::info;

/// Transaction state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnState {
    Uninitialized,
    Ready,
    InTransaction,
    Committing,
    Aborting,
    Fenced,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ProducerIdAndEpoch {
    pub producer_id: i64,
    pub producer_epoch: i16,
}

struct Inner {
    transactional_id: Option<String>,
    pid: Option<ProducerIdAndEpoch>,
    state: TxnState,
    txn_partitions: HashSet<TopicPartition>,
    pending_partitions: HashSet<TopicPartition>,
    pending_offsets: HashMap<String, HashMap<TopicPartition, (i64, Option<String>)>>,
    pending_groups: HashSet<String>,
    added_groups: HashSet<String>,
    next_sequence: HashMap<TopicPartition, i32>,
}

/// Owns the transaction/idempotence state machine described in §4.D.
///
/// Guarded by a non-async mutex, never held across an `.await` — the
/// cooperative single-sender-task model means no two logical actors ever
/// race to mutate this state, but a preemptive tokio runtime still requires
/// the lock for soundness (see the concurrency model's binding decision).
pub struct TransactionManager {
    inner: Mutex<Inner>,
    pid_waiter: Notify,
    task_waiter: Notify,
}

impl TransactionManager {
    pub fn new(transactional_id: Option<String>) -> Self {
        let idempotent_only = transactional_id.is_none();
        Self {
            inner: Mutex::new(Inner {
                transactional_id,
                pid: None,
                state: if idempotent_only { TxnState::Ready } else { TxnState::Uninitialized },
                txn_partitions: HashSet::new(),
                pending_partitions: HashSet::new(),
                pending_offsets: HashMap::new(),
                pending_groups: HashSet::new(),
                added_groups: HashSet::new(),
                next_sequence: HashMap::new(),
            }),
            pid_waiter: Notify::new(),
            task_waiter: Notify::new(),
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.inner.lock().transactional_id.is_some()
    }

    pub fn transactional_id(&self) -> Option<String> {
        self.inner.lock().transactional_id.clone()
    }

    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    pub fn has_pid(&self) -> bool {
        self.inner.lock().pid.is_some()
    }

    pub fn pid(&self) -> Option<ProducerIdAndEpoch> {
        self.inner.lock().pid
    }

    /// Wait until a producer-id has been assigned.
    pub async fn wait_for_pid(&self) -> ProducerIdAndEpoch {
        loop {
            if let Some(pid) = self.pid() {
                return pid;
            }
            self.pid_waiter.notified().await;
        }
    }

    pub fn set_pid(&self, pid: ProducerIdAndEpoch) {
        let mut inner = self.inner.lock();
        inner.pid = Some(pid);
        if inner.state == TxnState::Uninitialized {
            inner.state = TxnState::Ready;
        }
        info!(producer_id = pid.producer_id, epoch = pid.producer_epoch, "producer id acquired");
        self.pid_waiter.notify_waiters();
    }

    pub fn begin_transaction(&self) -> Result<(), ProducerError> {
        let mut inner = self.inner.lock();
        self.require_transactional(&inner)?;
        match inner.state {
            TxnState::Ready => {
                inner.state = TxnState::InTransaction;
                info!("begin_transaction");
                Ok(())
            }
            TxnState::Fenced => Err(ProducerError::ProducerFenced),
            other => Err(illegal_state(other, "begin_transaction")),
        }
    }

    fn require_transactional(&self, inner: &Inner) -> Result<(), ProducerError> {
        if inner.transactional_id.is_none() {
            return Err(ProducerError::IllegalOperation(
                "transactional API used without a configured transactional_id",
            ));
        }
        Ok(())
    }

    /// Enlist a partition; if currently `InTransaction` and not already
    /// enlisted, atomically queues it in `pending_partitions` so the
    /// accumulator mutes it until the sender's AddPartitionsToTxn RPC
    /// completes.
    pub fn maybe_add_partition_to_transaction(&self, tp: TopicPartition) -> Result<(), ProducerError> {
        let mut inner = self.inner.lock();
        match inner.state {
            TxnState::InTransaction => {
                if !inner.txn_partitions.contains(&tp) {
                    inner.pending_partitions.insert(tp);
                    self.task_waiter.notify_waiters();
                }
                Ok(())
            }
            TxnState::Fenced => Err(ProducerError::ProducerFenced),
            TxnState::Committing | TxnState::Aborting => {
                Err(ProducerError::IllegalState("cannot enlist partitions while committing or aborting"))
            }
            other => Err(illegal_state(other, "enlist partition")),
        }
    }

    pub fn partitions_to_add(&self) -> Vec<TopicPartition> {
        self.inner.lock().pending_partitions.iter().cloned().collect()
    }

    /// Consume every per-partition outcome from an AddPartitionsToTxn
    /// response — not just the first — per the resolved open question.
    pub fn partitions_added(&self, results: &HashMap<TopicPartition, BrokerError>) -> Result<(), ProducerError> {
        let mut inner = self.inner.lock();
        for (tp, err) in results {
            if *err == BrokerError::None {
                inner.pending_partitions.remove(tp);
                inner.txn_partitions.insert(tp.clone());
            } else if err.is_fatal_fencing() {
                inner.state = TxnState::Fenced;
                return Err(ProducerError::ProducerFenced);
            } else if !err.is_retriable() {
                return Err(ProducerError::Broker(*err));
            }
            // Retriable partition-level errors are left in `pending_partitions`
            // so the next sender round retries them.
        }
        self.task_waiter.notify_waiters();
        Ok(())
    }

    pub fn consumer_group_to_add(&self) -> Option<String> {
        self.inner.lock().pending_groups.iter().next().cloned()
    }

    pub fn add_offsets_to_txn(
        &self,
        offsets: HashMap<TopicPartition, (i64, Option<String>)>,
        group_id: String,
    ) -> Result<(), ProducerError> {
        let mut inner = self.inner.lock();
        if inner.state != TxnState::InTransaction {
            return Err(illegal_state(inner.state, "add_offsets_to_txn"));
        }
        if !inner.added_groups.contains(&group_id) {
            inner.pending_groups.insert(group_id.clone());
        }
        inner.pending_offsets.entry(group_id).or_default().extend(offsets);
        self.task_waiter.notify_waiters();
        Ok(())
    }

    pub fn consumer_group_added(&self, group_id: &str) {
        let mut inner = self.inner.lock();
        inner.pending_groups.remove(group_id);
        inner.added_groups.insert(group_id.to_string());
        self.task_waiter.notify_waiters();
    }

    /// Offsets ready for TxnOffsetCommit: only for groups that have already
    /// cleared AddOffsetsToTxn.
    pub fn offsets_to_commit(&self) -> HashMap<String, HashMap<TopicPartition, (i64, Option<String>)>> {
        let inner = self.inner.lock();
        inner
            .pending_offsets
            .iter()
            .filter(|(g, _)| inner.added_groups.contains(*g) && !inner.pending_groups.contains(*g))
            .map(|(g, m)| (g.clone(), m.clone()))
            .collect()
    }

    /// Whether `group_id` still has unsettled offsets anywhere in the
    /// AddOffsetsToTxn → TxnOffsetCommit pipeline.
    pub fn has_pending_offsets(&self, group_id: &str) -> bool {
        let inner = self.inner.lock();
        inner.pending_groups.contains(group_id) || inner.pending_offsets.get(group_id).is_some_and(|m| !m.is_empty())
    }

    pub fn offset_committed(&self, group_id: &str, results: &HashMap<TopicPartition, BrokerError>) -> Result<(), ProducerError> {
        let mut inner = self.inner.lock();
        if let Some(pending) = inner.pending_offsets.get_mut(group_id) {
            for (tp, err) in results {
                if *err == BrokerError::None {
                    pending.remove(tp);
                } else if err.is_fatal_fencing() {
                    inner.state = TxnState::Fenced;
                    return Err(ProducerError::ProducerFenced);
                }
            }
            if pending.is_empty() {
                inner.pending_offsets.remove(group_id);
            }
        }
        Ok(())
    }

    pub fn committing_transaction(&self) -> Result<(), ProducerError> {
        let mut inner = self.inner.lock();
        match inner.state {
            TxnState::InTransaction => {
                inner.state = TxnState::Committing;
                info!("committing_transaction");
                self.task_waiter.notify_waiters();
                Ok(())
            }
            TxnState::Fenced => Err(ProducerError::ProducerFenced),
            other => Err(illegal_state(other, "committing_transaction")),
        }
    }

    pub fn aborting_transaction(&self) -> Result<(), ProducerError> {
        let mut inner = self.inner.lock();
        match inner.state {
            TxnState::InTransaction => {
                inner.state = TxnState::Aborting;
                info!("aborting_transaction");
                self.task_waiter.notify_waiters();
                Ok(())
            }
            TxnState::Fenced => Err(ProducerError::ProducerFenced),
            other => Err(illegal_state(other, "aborting_transaction")),
        }
    }

    pub fn needs_transaction_commit(&self) -> Option<crate::types::TransactionResult> {
        match self.inner.lock().state {
            TxnState::Committing => Some(crate::types::TransactionResult::Commit),
            TxnState::Aborting => Some(crate::types::TransactionResult::Abort),
            _ => None,
        }
    }

    pub fn is_empty_transaction(&self) -> bool {
        let inner = self.inner.lock();
        inner.txn_partitions.is_empty() && inner.pending_partitions.is_empty() && inner.pending_offsets.is_empty()
    }

    /// Partitions fully enlisted in the current transaction — the set
    /// `flush_for_commit` must drain to zero before `EndTxn` is sent.
    pub fn committed_partitions(&self) -> HashSet<TopicPartition> {
        self.inner.lock().txn_partitions.clone()
    }

    /// Reset transient per-transaction fields back to `Ready`, or re-fence
    /// if an EndTxn response fenced the producer.
    pub fn complete_transaction(&self, fenced: bool) {
        let mut inner = self.inner.lock();
        inner.txn_partitions.clear();
        inner.pending_partitions.clear();
        inner.pending_offsets.clear();
        inner.pending_groups.clear();
        inner.added_groups.clear();
        inner.state = if fenced { TxnState::Fenced } else { TxnState::Ready };
        info!(fenced, "complete_transaction");
    }

    pub fn fence(&self) {
        self.inner.lock().state = TxnState::Fenced;
    }

    /// Muted set the sender must union into `drain_by_nodes`'s
    /// `muted_partitions`: partitions awaiting enlistment must not be
    /// produced to before the coordinator acknowledges them.
    pub fn muted_partitions(&self) -> HashSet<TopicPartition> {
        self.inner.lock().pending_partitions.clone()
    }

    /// Assign and advance the next sequence number for a partition.
    /// Starts at 0; only meaningful once idempotence/transactions are on.
    pub fn maybe_assign_sequence(&self, tp: &TopicPartition, record_count: i32) -> i32 {
        let mut inner = self.inner.lock();
        let seq = *inner.next_sequence.get(tp).unwrap_or(&0);
        inner.next_sequence.insert(tp.clone(), seq + record_count);
        seq
    }

    /// Wakes whenever a transactional sub-task becomes available for the
    /// sender to pick up (partitions/offsets/groups pending, or a commit
    /// requested).
    pub async fn make_task_waiter(&self) {
        self.task_waiter.notified().await;
    }
}

fn illegal_state(state: TxnState, op: &'static str) -> ProducerError {
    match state {
        TxnState::Fenced => ProducerError::ProducerFenced,
        _ => ProducerError::IllegalState(match op {
            "begin_transaction" => "begin_transaction called outside READY",
            "committing_transaction" => "committing_transaction called outside IN_TRANSACTION",
            "aborting_transaction" => "aborting_transaction called outside IN_TRANSACTION",
            "add_offsets_to_txn" => "add_offsets_to_txn called outside IN_TRANSACTION",
            _ => "operation invalid in current transaction state",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(p: i32) -> TopicPartition {
        TopicPartition::new("t", p)
    }

    #[test]
    fn non_transactional_starts_ready() {
        let mgr = TransactionManager::new(None);
        assert_eq!(mgr.state(), TxnState::Ready);
    }

    #[test]
    fn transactional_requires_pid_before_ready() {
        let mgr = TransactionManager::new(Some("t1".into()));
        assert_eq!(mgr.state(), TxnState::Uninitialized);
        mgr.set_pid(ProducerIdAndEpoch {
            producer_id: 1,
            producer_epoch: 0,
        });
        assert_eq!(mgr.state(), TxnState::Ready);
    }

    #[test]
    fn full_commit_cycle_returns_to_ready() {
        let mgr = TransactionManager::new(Some("t1".into()));
        mgr.set_pid(ProducerIdAndEpoch {
            producer_id: 1,
            producer_epoch: 0,
        });
        mgr.begin_transaction().unwrap();
        mgr.maybe_add_partition_to_transaction(tp(0)).unwrap();
        assert_eq!(mgr.partitions_to_add(), vec![tp(0)]);

        let mut results = HashMap::new();
        results.insert(tp(0), BrokerError::None);
        mgr.partitions_added(&results).unwrap();
        assert!(mgr.partitions_to_add().is_empty());

        mgr.committing_transaction().unwrap();
        assert_eq!(mgr.needs_transaction_commit(), Some(crate::types::TransactionResult::Commit));
        mgr.complete_transaction(false);
        assert_eq!(mgr.state(), TxnState::Ready);
        assert!(mgr.is_empty_transaction());
    }

    #[test]
    fn abort_cycle_also_returns_to_ready() {
        let mgr = TransactionManager::new(Some("t1".into()));
        mgr.set_pid(ProducerIdAndEpoch {
            producer_id: 1,
            producer_epoch: 0,
        });
        mgr.begin_transaction().unwrap();
        mgr.aborting_transaction().unwrap();
        assert_eq!(mgr.needs_transaction_commit(), Some(crate::types::TransactionResult::Abort));
        mgr.complete_transaction(false);
        assert_eq!(mgr.state(), TxnState::Ready);
    }

    #[test]
    fn partition_added_fencing_propagates() {
        let mgr = TransactionManager::new(Some("t1".into()));
        mgr.set_pid(ProducerIdAndEpoch {
            producer_id: 1,
            producer_epoch: 0,
        });
        mgr.begin_transaction().unwrap();
        mgr.maybe_add_partition_to_transaction(tp(0)).unwrap();

        let mut results = HashMap::new();
        results.insert(tp(0), BrokerError::InvalidProducerEpoch);
        let err = mgr.partitions_added(&results).unwrap_err();
        assert!(matches!(err, ProducerError::ProducerFenced));
        assert_eq!(mgr.state(), TxnState::Fenced);
    }

    #[test]
    fn every_partition_in_add_partitions_response_is_processed() {
        let mgr = TransactionManager::new(Some("t1".into()));
        mgr.set_pid(ProducerIdAndEpoch {
            producer_id: 1,
            producer_epoch: 0,
        });
        mgr.begin_transaction().unwrap();
        mgr.maybe_add_partition_to_transaction(tp(0)).unwrap();
        mgr.maybe_add_partition_to_transaction(tp(1)).unwrap();

        let mut results = HashMap::new();
        results.insert(tp(0), BrokerError::None);
        results.insert(tp(1), BrokerError::None);
        mgr.partitions_added(&results).unwrap();

        // Both partitions were processed, not just the first.
        assert!(mgr.partitions_to_add().is_empty());
    }

    #[test]
    fn begin_transaction_without_transactional_id_is_illegal() {
        let mgr = TransactionManager::new(None);
        let err = mgr.begin_transaction().unwrap_err();
        assert!(matches!(err, ProducerError::IllegalOperation(_)));
    }

    #[test]
    fn sequence_numbers_start_at_zero_and_advance_by_record_count() {
        let mgr = TransactionManager::new(Some("t1".into()));
        let tp0 = tp(0);
        assert_eq!(mgr.maybe_assign_sequence(&tp0, 3), 0);
        assert_eq!(mgr.maybe_assign_sequence(&tp0, 2), 3);
        assert_eq!(mgr.maybe_assign_sequence(&tp0, 1), 5);
    }

    #[tokio::test]
    async fn wait_for_pid_resolves_after_set_pid() {
        let mgr = std::sync::Arc::new(TransactionManager::new(Some("t1".into())));
        let waiter = mgr.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_pid().await });
        tokio::task::yield_now().await;
        mgr.set_pid(ProducerIdAndEpoch {
            producer_id: 7,
            producer_epoch: 0,
        });
        let pid = handle.await.unwrap();
        assert_eq!(pid.producer_id, 7);
    }
}
