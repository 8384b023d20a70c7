//! Message accumulator (§4.C): per-partition batch queues, admission
//! control, node-scoped draining, and flush/close semantics.

use crate::batch::{Batch, BatchFull, CompletionHandle};
use crate::config::SharedConfig;
use crate::error::ProducerError;
use crate::types::{NodeId, RecordBatchMagic, TopicPartition};
use crate::wire::MetadataCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Per-partition FIFO of batches; head is the oldest undrained batch.
#[derive(Default)]
struct PartitionQueue {
    batches: VecDeque<Batch>,
}

struct AccumulatorState {
    queues: HashMap<TopicPartition, PartitionQueue>,
    bytes_in_use: usize,
    /// Batches created but not yet terminated, per partition. Used by
    /// `flush_for_commit` to know when a transaction's partitions are safe
    /// to end without racing an outstanding produce.
    partition_outstanding: HashMap<TopicPartition, usize>,
    /// Partitions a `flush_for_commit` call has blocked new appends to.
    committing: HashSet<TopicPartition>,
}

/// Batching + backpressure core shared between the facade and the sender.
pub struct Accumulator {
    config: SharedConfig,
    state: Mutex<AccumulatorState>,
    data_waiter: Notify,
    drain_waiter: Notify,
    closed: AtomicBool,
    outstanding: AtomicUsize,
}

impl Accumulator {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AccumulatorState {
                queues: HashMap::new(),
                bytes_in_use: 0,
                partition_outstanding: HashMap::new(),
                committing: HashSet::new(),
            }),
            data_waiter: Notify::new(),
            drain_waiter: Notify::new(),
            closed: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Append one record, starting a new batch if needed. Blocks up to
    /// `wait` on backpressure if the buffer-memory budget is exhausted.
    pub async fn add_message(
        &self,
        tp: TopicPartition,
        magic: RecordBatchMagic,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        record_timestamp: i64,
        wait: Duration,
    ) -> Result<CompletionHandle, ProducerError> {
        timeout(wait, self.add_message_inner(tp, magic, key, value, record_timestamp))
            .await
            .map_err(|_| ProducerError::ProducerQueueFull)?
    }

    async fn add_message_inner(
        &self,
        tp: TopicPartition,
        magic: RecordBatchMagic,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        record_timestamp: i64,
    ) -> Result<CompletionHandle, ProducerError> {
        loop {
            if self.is_closed() {
                return Err(ProducerError::ProducerClosed);
            }

            if self.state.lock().committing.contains(&tp) {
                self.drain_waiter.notified().await;
                continue;
            }

            {
                let mut state = self.state.lock();
                let queue = state.queues.entry(tp.clone()).or_default();

                if let Some(batch) = queue.batches.back_mut() {
                    if !batch.drained {
                        if let Ok(handle) = batch.try_append(record_timestamp, key, value) {
                            self.outstanding.fetch_add(1, Ordering::Relaxed);
                            self.data_waiter.notify_waiters();
                            return Ok(handle);
                        }
                    }
                }

                if state.bytes_in_use + self.config.max_batch_size <= self.config.buffer_memory {
                    state.bytes_in_use += self.config.max_batch_size;
                    let mut batch = Batch::new(tp.clone(), magic, self.config.max_batch_size);
                    match batch.try_append(record_timestamp, key, value) {
                        Ok(handle) => {
                            queue.batches.push_back(batch);
                            *state.partition_outstanding.entry(tp.clone()).or_insert(0) += 1;
                            self.outstanding.fetch_add(1, Ordering::Relaxed);
                            self.data_waiter.notify_waiters();
                            return Ok(handle);
                        }
                        Err(BatchFull) => return Err(ProducerError::MessageTooLarge),
                    }
                }
            }

            // Buffer-memory budget exhausted: wait for a drain to free room.
            self.drain_waiter.notified().await;
        }
    }

    /// Admit a pre-built batch under the same admission rules as
    /// `add_message`.
    pub async fn add_batch(
        &self,
        tp: TopicPartition,
        batch: Batch,
        wait: Duration,
    ) -> Result<(), ProducerError> {
        timeout(wait, self.add_batch_inner(tp, batch))
            .await
            .map_err(|_| ProducerError::ProducerQueueFull)?
    }

    async fn add_batch_inner(&self, tp: TopicPartition, batch: Batch) -> Result<(), ProducerError> {
        loop {
            if self.is_closed() {
                return Err(ProducerError::ProducerClosed);
            }
            if self.state.lock().committing.contains(&tp) {
                self.drain_waiter.notified().await;
                continue;
            }
            {
                let mut state = self.state.lock();
                if state.bytes_in_use + self.config.max_batch_size <= self.config.buffer_memory {
                    state.bytes_in_use += self.config.max_batch_size;
                    state.queues.entry(tp.clone()).or_default().batches.push_back(batch);
                    *state.partition_outstanding.entry(tp).or_insert(0) += 1;
                    self.data_waiter.notify_waiters();
                    return Ok(());
                }
            }
            self.drain_waiter.notified().await;
        }
    }

    /// Drain batches ready to ship, grouped by destination node.
    ///
    /// Never returns the same batch twice: a drained batch is marked and
    /// stays out of the queue until `reenqueue` puts it back.
    pub fn drain_by_nodes(
        &self,
        metadata: &dyn MetadataCache,
        ignore_nodes: &HashSet<NodeId>,
        muted_partitions: &HashSet<TopicPartition>,
    ) -> (HashMap<NodeId, HashMap<TopicPartition, Batch>>, bool) {
        let mut result: HashMap<NodeId, HashMap<TopicPartition, Batch>> = HashMap::new();
        let mut unknown_leaders = false;
        let linger = self.config.linger();

        let mut state = self.state.lock();
        for (tp, queue) in state.queues.iter_mut() {
            if muted_partitions.contains(tp) {
                continue;
            }
            let Some(leader) = metadata.leader_for(tp) else {
                unknown_leaders = true;
                continue;
            };
            if ignore_nodes.contains(&leader) {
                continue;
            }

            let Some(head) = queue.batches.front() else {
                continue;
            };
            if head.drained {
                continue;
            }
            let ready = head.is_full() || head.elapsed() >= linger;
            if !ready {
                continue;
            }

            let mut batch = queue.batches.pop_front().unwrap();
            batch.drained = true;
            trace!(partition = %tp, node = leader, "draining batch");
            result.entry(leader).or_default().insert(tp.clone(), batch);
        }
        (result, unknown_leaders)
    }

    /// Place a drained batch back at the head of its partition queue.
    /// Sequence numbers are never reassigned here.
    pub fn reenqueue(&self, tp: &TopicPartition, mut batch: Batch) {
        batch.drained = false;
        batch.retry_count += 1;
        let mut state = self.state.lock();
        state.queues.entry(tp.clone()).or_default().batches.push_front(batch);
        debug!(partition = %tp, "batch re-enqueued at head");
        self.data_waiter.notify_waiters();
    }

    /// Mark a batch's records resolved and release its buffer-memory slot.
    pub fn complete(&self, tp: &TopicPartition, record_count: usize) {
        let mut state = self.state.lock();
        state.bytes_in_use = state.bytes_in_use.saturating_sub(self.config.max_batch_size);
        if let Some(count) = state.partition_outstanding.get_mut(tp) {
            *count = count.saturating_sub(1);
        }
        self.outstanding.fetch_sub(record_count.max(1), Ordering::Relaxed);
        self.drain_waiter.notify_waiters();
    }

    /// Fires when new data arrives, a drain reenqueues something, or linger
    /// may have elapsed for some batch.
    pub async fn data_waiter(&self) {
        self.data_waiter.notified().await;
    }

    /// Wait until every batch created before this call has terminated.
    pub async fn flush(&self) {
        loop {
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            self.drain_waiter.notified().await;
        }
    }

    /// Wait until every batch already created for `partitions` has
    /// terminated. New appends to `partitions` are refused for the
    /// duration of the call (existing queued batches still drain normally,
    /// so this can't deadlock waiting on itself) so the caller can issue
    /// `EndTxn` immediately after this returns without a produce round for
    /// these partitions starting in between.
    pub async fn flush_for_commit(&self, partitions: &HashSet<TopicPartition>) {
        {
            let mut state = self.state.lock();
            for tp in partitions {
                state.committing.insert(tp.clone());
            }
        }
        loop {
            let done = {
                let state = self.state.lock();
                partitions
                    .iter()
                    .all(|tp| state.partition_outstanding.get(tp).copied().unwrap_or(0) == 0)
            };
            if done {
                break;
            }
            self.drain_waiter.notified().await;
        }
        {
            let mut state = self.state.lock();
            for tp in partitions {
                state.committing.remove(tp);
            }
        }
        self.drain_waiter.notify_waiters();
    }

    /// Stop accepting new records; resolves when all outstanding batches
    /// have terminated.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.data_waiter.notify_waiters();
        self.flush().await;
    }

    #[cfg(test)]
    pub fn queue_len(&self, tp: &TopicPartition) -> usize {
        self.state
            .lock()
            .queues
            .get(tp)
            .map(|q| q.batches.len())
            .unwrap_or(0)
    }
}

pub type SharedAccumulator = Arc<Accumulator>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMetadataCache;

    fn tp() -> TopicPartition {
        TopicPartition::new("t", 0)
    }

    fn cfg() -> SharedConfig {
        Arc::new(crate::config::ProducerConfig::builder().max_batch_size(64).build().unwrap())
    }

    #[tokio::test]
    async fn add_message_then_drain_returns_exactly_once() {
        let acc = Accumulator::new(cfg());
        let _h = acc
            .add_message(tp(), RecordBatchMagic::V2, None, Some(b"v"), 0, Duration::from_secs(1))
            .await
            .unwrap();

        let metadata = FakeMetadataCache::single_leader(0);
        let (drained, unknown) = acc.drain_by_nodes(&metadata, &HashSet::new(), &HashSet::new());
        assert!(!unknown);
        assert_eq!(drained.len(), 1);

        let (drained_again, _) = acc.drain_by_nodes(&metadata, &HashSet::new(), &HashSet::new());
        assert!(drained_again.is_empty(), "must not drain the same batch twice");
    }

    #[tokio::test]
    async fn reenqueue_places_batch_at_head() {
        let acc = Accumulator::new(cfg());
        let metadata = FakeMetadataCache::single_leader(0);

        let _h1 = acc
            .add_message(tp(), RecordBatchMagic::V2, None, Some(b"a"), 0, Duration::from_secs(1))
            .await
            .unwrap();
        let (mut drained, _) = acc.drain_by_nodes(&metadata, &HashSet::new(), &HashSet::new());
        let batch = drained.remove(&0).unwrap().remove(&tp()).unwrap();

        let _h2 = acc
            .add_message(tp(), RecordBatchMagic::V2, None, Some(b"b"), 0, Duration::from_secs(1))
            .await
            .unwrap();

        acc.reenqueue(&tp(), batch);
        assert_eq!(acc.queue_len(&tp()), 2);
    }

    #[tokio::test]
    async fn closed_accumulator_rejects_new_appends() {
        let acc = Accumulator::new(cfg());
        acc.close().await;
        let err = acc
            .add_message(tp(), RecordBatchMagic::V2, None, Some(b"v"), 0, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProducerError::ProducerClosed));
    }

    #[tokio::test]
    async fn queue_full_with_zero_timeout_fails_immediately() {
        let mut builder = crate::config::ProducerConfig::builder();
        builder = builder.max_batch_size(16).buffer_memory(16);
        let cfg = Arc::new(builder.build().unwrap());
        let acc = Accumulator::new(cfg);

        // First batch consumes the entire buffer-memory budget.
        let _h = acc
            .add_message(tp(), RecordBatchMagic::V2, None, Some(b"x"), 0, Duration::from_secs(1))
            .await
            .unwrap();

        let other = TopicPartition::new("t", 1);
        let err = acc
            .add_message(other, RecordBatchMagic::V2, None, Some(b"y"), 0, Duration::from_millis(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ProducerError::ProducerQueueFull));
    }

    #[tokio::test]
    async fn flush_for_commit_waits_for_in_flight_batch_to_terminate() {
        let acc = Arc::new(Accumulator::new(cfg()));
        let t = tp();

        let handle = acc
            .add_message(t.clone(), RecordBatchMagic::V2, None, Some(b"v"), 0, Duration::from_secs(1))
            .await
            .unwrap();

        let metadata = FakeMetadataCache::single_leader(0);
        let (mut drained, _) = acc.drain_by_nodes(&metadata, &HashSet::new(), &HashSet::new());
        let batch = drained.remove(&0).unwrap().remove(&t).unwrap();
        let record_count = batch.record_count();

        let partitions: HashSet<TopicPartition> = [t.clone()].into_iter().collect();
        let acc_for_flush = acc.clone();
        let flush_task = tokio::spawn(async move { acc_for_flush.flush_for_commit(&partitions).await });

        tokio::task::yield_now().await;
        assert!(!flush_task.is_finished(), "flush must wait for the in-flight batch");

        batch.resolve(crate::types::RecordMetadata {
            topic_partition_offset: 0,
            timestamp: 0,
        });
        acc.complete(&t, record_count);
        let _ = handle.await;

        tokio::time::timeout(Duration::from_secs(1), flush_task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn flush_for_commit_blocks_new_appends_until_it_returns() {
        let acc = Arc::new(Accumulator::new(cfg()));
        let t = tp();

        // No outstanding batches: flush_for_commit resolves immediately but
        // still mutes appends for the brief window it holds the lock.
        let acc_for_flush = acc.clone();
        let t_for_flush = t.clone();
        let flush_task = tokio::spawn(async move {
            let partitions: HashSet<TopicPartition> = [t_for_flush].into_iter().collect();
            acc_for_flush.flush_for_commit(&partitions).await
        });
        tokio::time::timeout(Duration::from_secs(1), flush_task).await.unwrap().unwrap();

        // Once flush_for_commit has returned, appends succeed normally again.
        let handle = acc
            .add_message(t, RecordBatchMagic::V2, None, Some(b"v"), 0, Duration::from_secs(1))
            .await
            .unwrap();
        drop(handle);
    }

    #[tokio::test]
    async fn unknown_leader_partitions_are_skipped_and_flag_is_set() {
        let acc = Accumulator::new(cfg());
        let _h = acc
            .add_message(tp(), RecordBatchMagic::V2, None, Some(b"v"), 0, Duration::from_secs(1))
            .await
            .unwrap();

        let metadata = FakeMetadataCache::no_leaders();
        let (drained, unknown) = acc.drain_by_nodes(&metadata, &HashSet::new(), &HashSet::new());
        assert!(unknown);
        assert!(drained.is_empty());
    }
}
