//! Sender loop (§4.E): the single cooperative task that drains the
//! accumulator, dispatches Produce/transaction RPCs, and retries.

use crate::accumulator::SharedAccumulator;
use crate::batch::{Batch, SequenceAssignment};
use crate::config::SharedConfig;
use crate::error::{BrokerError, ProducerError};
use crate::txn::TransactionManager;
use crate::types::{CoordinatorKind, NodeId, RecordMetadata, TopicPartition, TransactionResult};
use crate::wire::{
    AddOffsetsToTxnRequest, AddPartitionsToTxnRequest, BrokerConnections, Compressor, EndTxnRequest,
    FindCoordinatorRequest, InitProducerIdRequest, MetadataCache, ProducePartitionData, ProduceRequest,
    TxnOffsetCommitRequest,
};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Everything the sender loop needs, shared with the facade.
pub struct SenderContext {
    pub config: SharedConfig,
    pub accumulator: SharedAccumulator,
    pub txn: Arc<TransactionManager>,
    pub broker: Arc<dyn BrokerConnections>,
    pub metadata: Arc<dyn MetadataCache>,
    pub compressor: Arc<dyn Compressor>,
    pub closing: AtomicBool,
    pub shutdown: Notify,
    coordinator_cache: Mutex<HashMap<(CoordinatorKind, String), NodeId>>,
    terminal_error: Mutex<Option<ProducerError>>,
}

impl SenderContext {
    pub fn new(
        config: SharedConfig,
        accumulator: SharedAccumulator,
        txn: Arc<TransactionManager>,
        broker: Arc<dyn BrokerConnections>,
        metadata: Arc<dyn MetadataCache>,
        compressor: Arc<dyn Compressor>,
    ) -> Self {
        Self {
            config,
            accumulator,
            txn,
            broker,
            metadata,
            compressor,
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
            coordinator_cache: Mutex::new(HashMap::new()),
            terminal_error: Mutex::new(None),
        }
    }

    pub fn request_shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }

    /// An error raised here is surfaced to every facade call that races the
    /// sender (see the facade's "all user-facing awaits race the sender"
    /// contract).
    pub fn terminal_error(&self) -> Option<ProducerError> {
        self.terminal_error.lock().clone()
    }

    fn invalidate_coordinator(&self, kind: CoordinatorKind, key: &str) {
        self.coordinator_cache.lock().remove(&(kind, key.to_string()));
    }
}

type BoxFuture = Pin<Box<dyn Future<Output = SenderEvent> + Send>>;

enum SenderEvent {
    ProduceDone(NodeId),
    TxnSubtaskDone,
}

/// Run the sender loop until `request_shutdown` is called and every
/// in-flight sub-task has drained. Intended to be `tokio::spawn`ed once by
/// the facade's `start()`.
pub async fn run(ctx: Arc<SenderContext>) {
    let span = info_span!("producer_sender", client_id = %ctx.config.client_id);
    async move {
        if let Err(e) = run_inner(ctx.clone()).await {
            error!(error = %e, "sender loop terminated with error");
            *ctx.terminal_error.lock() = Some(e);
        }
    }
    .instrument(span)
    .await
}

async fn run_inner(ctx: Arc<SenderContext>) -> Result<(), ProducerError> {
    let mut in_flight: FuturesUnordered<BoxFuture> = FuturesUnordered::new();
    let mut busy_nodes: HashSet<NodeId> = HashSet::new();
    let mut txn_in_flight = false;

    let needs_pid = ctx.config.enable_idempotence || ctx.txn.is_transactional();

    loop {
        if needs_pid && !ctx.txn.has_pid() {
            acquire_producer_id(&ctx).await?;
        }

        if ctx.txn.is_transactional() && !txn_in_flight {
            if let Some(fut) = next_txn_subtask(ctx.clone()) {
                txn_in_flight = true;
                in_flight.push(fut);
            }
        }

        let muted = ctx.txn.muted_partitions();
        let (drained, unknown_leaders) = ctx.accumulator.drain_by_nodes(ctx.metadata.as_ref(), &busy_nodes, &muted);

        for (node, batches) in drained {
            busy_nodes.insert(node);
            in_flight.push(spawn_produce(ctx.clone(), node, batches));
        }

        if ctx.closing.load(Ordering::Acquire) && in_flight.is_empty() {
            debug!("sender loop draining complete, shutting down");
            return Ok(());
        }

        tokio::select! {
            biased;
            Some(event) = in_flight.next(), if !in_flight.is_empty() => {
                match event {
                    SenderEvent::ProduceDone(node) => {
                        busy_nodes.remove(&node);
                    }
                    SenderEvent::TxnSubtaskDone => {
                        txn_in_flight = false;
                    }
                }
            }
            _ = ctx.metadata_refresh_gate(), if unknown_leaders => {
                ctx.metadata.request_refresh();
            }
            _ = ctx.accumulator.data_waiter(), if !unknown_leaders => {}
            _ = ctx.shutdown.notified(), if !ctx.closing.load(Ordering::Acquire) => {}
        }
    }
}

impl SenderContext {
    /// Bridges the synchronous `MetadataCache::request_refresh` boundary
    /// into the sender's FIRST_COMPLETED wait set with a bounded pause,
    /// since the trait exposes no async "refreshed" notification.
    async fn metadata_refresh_gate(&self) {
        tokio::time::sleep(self.config.retry_backoff().delay()).await;
    }
}

async fn acquire_producer_id(ctx: &Arc<SenderContext>) -> Result<(), ProducerError> {
    loop {
        let node = if let Some(txn_id) = ctx.txn.transactional_id() {
            find_coordinator(ctx, CoordinatorKind::Transaction, &txn_id).await?
        } else {
            ctx.broker.any_node().ok_or(ProducerError::SenderTerminated(
                "no broker node available to acquire a producer id".into(),
            ))?
        };

        let req = InitProducerIdRequest {
            transactional_id: ctx.txn.transactional_id(),
            transaction_timeout_ms: ctx.config.transaction_timeout_ms as i32,
        };

        match ctx.broker.init_producer_id(node, req).await {
            Ok(resp) if resp.error == BrokerError::None => {
                ctx.txn.set_pid(crate::txn::ProducerIdAndEpoch {
                    producer_id: resp.producer_id,
                    producer_epoch: resp.producer_epoch,
                });
                return Ok(());
            }
            Ok(resp) if resp.error.invalidates_coordinator() => {
                if let Some(txn_id) = ctx.txn.transactional_id() {
                    ctx.invalidate_coordinator(CoordinatorKind::Transaction, &txn_id);
                }
            }
            Ok(resp) if resp.error.is_retriable() => {
                tokio::time::sleep(ctx.config.retry_backoff().delay()).await;
            }
            Ok(resp) => return Err(ProducerError::Broker(resp.error)),
            Err(e) if e.is_retriable() => {
                tokio::time::sleep(ctx.config.retry_backoff().delay()).await;
            }
            Err(e) => return Err(ProducerError::Broker(e)),
        }
    }
}

async fn find_coordinator(
    ctx: &Arc<SenderContext>,
    kind: CoordinatorKind,
    key: &str,
) -> Result<NodeId, ProducerError> {
    if let Some(node) = ctx.coordinator_cache.lock().get(&(kind, key.to_string())).copied() {
        return Ok(node);
    }

    loop {
        let probe_node = ctx.broker.any_node().ok_or(ProducerError::SenderTerminated(
            "no broker node available to locate a coordinator".into(),
        ))?;
        let req = FindCoordinatorRequest {
            kind,
            key: key.to_string(),
        };
        match ctx.broker.find_coordinator(probe_node, req).await {
            Ok(resp) if resp.error == BrokerError::None => {
                if !ctx.broker.is_reachable(resp.node_id).await {
                    ctx.metadata.request_refresh();
                    tokio::time::sleep(ctx.config.retry_backoff().delay()).await;
                    continue;
                }
                ctx.coordinator_cache.lock().insert((kind, key.to_string()), resp.node_id);
                return Ok(resp.node_id);
            }
            Ok(resp) if resp.error.is_retriable() => {
                ctx.metadata.request_refresh();
                tokio::time::sleep(ctx.config.retry_backoff().delay()).await;
            }
            Ok(resp) => return Err(ProducerError::Broker(resp.error)),
            Err(e) if e.is_retriable() => {
                tokio::time::sleep(ctx.config.retry_backoff().delay()).await;
            }
            Err(e) => return Err(ProducerError::Broker(e)),
        }
    }
}

fn spawn_produce(ctx: Arc<SenderContext>, node: NodeId, batches: HashMap<TopicPartition, Batch>) -> BoxFuture {
    Box::pin(async move {
        let handle = tokio::spawn(produce_round(ctx, node, batches));
        match handle.await {
            Ok(()) => SenderEvent::ProduceDone(node),
            Err(join_err) => std::panic::resume_unwind(join_err.into_panic()),
        }
    })
}

async fn produce_round(ctx: Arc<SenderContext>, node: NodeId, mut batches: HashMap<TopicPartition, Batch>) {
    let idempotent = ctx.config.enable_idempotence || ctx.txn.is_transactional();
    let pid = if idempotent { ctx.txn.pid() } else { None };

    for (tp, batch) in batches.iter_mut() {
        if idempotent && batch.sequence.is_none() {
            if let Some(pid) = pid {
                let base_sequence = ctx.txn.maybe_assign_sequence(tp, batch.record_count() as i32);
                batch.sequence = Some(SequenceAssignment {
                    base_sequence,
                    producer_id: pid.producer_id,
                    producer_epoch: pid.producer_epoch,
                });
            }
        }
    }

    let mut topic_data: HashMap<String, Vec<ProducePartitionData>> = HashMap::new();
    for (tp, batch) in &batches {
        let records = batch.finalize(ctx.config.compression_type, ctx.compressor.as_ref());
        topic_data.entry(tp.topic.clone()).or_default().push(ProducePartitionData {
            partition: tp.partition,
            records,
        });
    }

    let req = ProduceRequest {
        transactional_id: ctx.txn.transactional_id(),
        acks: ctx.config.acks.to_wire(),
        timeout_ms: ctx.config.request_timeout_ms as i32,
        topic_data,
    };

    if ctx.config.acks == crate::types::Acks::Zero {
        let fire_and_forget = ctx.broker.clone();
        tokio::spawn(async move {
            let _ = fire_and_forget.produce(node, req).await;
        });
        for (tp, batch) in batches.drain() {
            let record_count = batch.record_count();
            batch.resolve(RecordMetadata {
                topic_partition_offset: -1,
                timestamp: -1,
            });
            ctx.accumulator.complete(&tp, record_count);
        }
        return;
    }

    match ctx.broker.produce(node, req).await {
        Ok(resp) => handle_produce_response(&ctx, batches, resp).await,
        Err(transport_err) => handle_transport_failure(&ctx, batches, transport_err).await,
    }
}

async fn handle_transport_failure(ctx: &Arc<SenderContext>, batches: HashMap<TopicPartition, Batch>, err: BrokerError) {
    let mut any_reenqueued = false;
    for (tp, batch) in batches {
        if should_retry(&ctx.config, &batch, err) {
            any_reenqueued = true;
            ctx.accumulator.reenqueue(&tp, batch);
        } else {
            let record_count = batch.record_count();
            batch.fail(ProducerError::Broker(err));
            ctx.accumulator.complete(&tp, record_count);
        }
    }
    if any_reenqueued {
        tokio::time::sleep(ctx.config.retry_backoff().delay()).await;
        if err.invalidates_metadata() {
            ctx.metadata.request_refresh();
        }
    }
}

async fn handle_produce_response(
    ctx: &Arc<SenderContext>,
    mut batches: HashMap<TopicPartition, Batch>,
    resp: crate::wire::ProduceResponse,
) {
    let mut to_reenqueue: Vec<TopicPartition> = Vec::new();
    let mut invalidate_metadata = false;
    let mut short_backoff = false;

    for (topic, partitions) in resp.topic_responses {
        for p in partitions {
            let tp = TopicPartition::new(topic.clone(), p.partition);
            let Some(batch) = batches.remove(&tp) else {
                continue;
            };

            let record_count = batch.record_count();
            match p.error {
                BrokerError::None => {
                    batch.resolve(RecordMetadata {
                        topic_partition_offset: p.base_offset,
                        timestamp: p.log_append_time,
                    });
                    ctx.accumulator.complete(&tp, record_count);
                }
                BrokerError::DuplicateSequenceNumber => {
                    debug!(partition = %tp, "duplicate sequence number treated as success");
                    batch.resolve(RecordMetadata {
                        topic_partition_offset: p.base_offset,
                        timestamp: p.log_append_time,
                    });
                    ctx.accumulator.complete(&tp, record_count);
                }
                BrokerError::InvalidProducerEpoch => {
                    warn!(partition = %tp, "producer fenced by a newer instance");
                    ctx.txn.fence();
                    batch.fail(ProducerError::ProducerFenced);
                    ctx.accumulator.complete(&tp, record_count);
                }
                err if should_retry(&ctx.config, &batch, err) => {
                    if err.uses_short_backoff(ctx.txn.is_empty_transaction()) {
                        short_backoff = true;
                    }
                    if err.invalidates_metadata() {
                        invalidate_metadata = true;
                    }
                    ctx.accumulator.reenqueue(&tp, batch);
                    to_reenqueue.push(tp);
                }
                err => {
                    batch.fail(ProducerError::Broker(err));
                    ctx.accumulator.complete(&tp, record_count);
                }
            }
        }
    }

    // Anything left with no matching response entry was never acknowledged
    // by this round's reply; re-enqueue it rather than let its handle hang.
    for (tp, batch) in batches.drain() {
        ctx.accumulator.reenqueue(&tp, batch);
        to_reenqueue.push(tp);
    }

    if !to_reenqueue.is_empty() {
        let backoff = if short_backoff {
            crate::retry::CONCURRENT_TRANSACTIONS_SHORT_BACKOFF
        } else {
            ctx.config.retry_backoff().delay()
        };
        tokio::time::sleep(backoff).await;
        if invalidate_metadata {
            ctx.metadata.request_refresh();
        }
    }
}

fn should_retry(config: &SharedConfig, batch: &Batch, err: BrokerError) -> bool {
    if !err.is_retriable() {
        return false;
    }
    if config.enable_idempotence {
        return true;
    }
    batch.elapsed() < config.request_timeout()
}

fn next_txn_subtask(ctx: Arc<SenderContext>) -> Option<BoxFuture> {
    if !ctx.txn.partitions_to_add().is_empty() {
        return Some(Box::pin(add_partitions_subtask(ctx)));
    }
    if let Some(group_id) = ctx.txn.consumer_group_to_add() {
        return Some(Box::pin(add_offsets_subtask(ctx, group_id)));
    }
    if !ctx.txn.offsets_to_commit().is_empty() {
        return Some(Box::pin(txn_offset_commit_subtask(ctx)));
    }
    if ctx.txn.needs_transaction_commit().is_some()
        && ctx.txn.partitions_to_add().is_empty()
        && ctx.txn.consumer_group_to_add().is_none()
        && ctx.txn.offsets_to_commit().is_empty()
    {
        return Some(Box::pin(end_txn_subtask(ctx)));
    }
    None
}

async fn add_partitions_subtask(ctx: Arc<SenderContext>) -> SenderEvent {
    let Some(txn_id) = ctx.txn.transactional_id() else {
        return SenderEvent::TxnSubtaskDone;
    };
    let Some(pid) = ctx.txn.pid() else {
        return SenderEvent::TxnSubtaskDone;
    };
    let partitions = ctx.txn.partitions_to_add();
    if partitions.is_empty() {
        return SenderEvent::TxnSubtaskDone;
    }

    let Ok(node) = find_coordinator(&ctx, CoordinatorKind::Transaction, &txn_id).await else {
        return SenderEvent::TxnSubtaskDone;
    };

    let req = AddPartitionsToTxnRequest {
        transactional_id: txn_id,
        producer_id: pid.producer_id,
        producer_epoch: pid.producer_epoch,
        partitions,
    };

    match ctx.broker.add_partitions_to_txn(node, req).await {
        Ok(resp) => {
            let _ = ctx.txn.partitions_added(&resp.results);
            info!("add_partitions_to_txn completed");
        }
        Err(e) if e.is_retriable() => {
            tokio::time::sleep(ctx.config.retry_backoff().delay()).await;
        }
        Err(_) => {
            ctx.txn.fence();
        }
    }
    SenderEvent::TxnSubtaskDone
}

async fn add_offsets_subtask(ctx: Arc<SenderContext>, group_id: String) -> SenderEvent {
    let (Some(txn_id), Some(pid)) = (ctx.txn.transactional_id(), ctx.txn.pid()) else {
        return SenderEvent::TxnSubtaskDone;
    };
    let Ok(node) = find_coordinator(&ctx, CoordinatorKind::Transaction, &txn_id).await else {
        return SenderEvent::TxnSubtaskDone;
    };

    let req = AddOffsetsToTxnRequest {
        transactional_id: txn_id,
        producer_id: pid.producer_id,
        producer_epoch: pid.producer_epoch,
        group_id: group_id.clone(),
    };

    match ctx.broker.add_offsets_to_txn(node, req).await {
        Ok(resp) if resp.error == BrokerError::None => {
            ctx.txn.consumer_group_added(&group_id);
        }
        Ok(resp) if resp.error.is_fatal_fencing() => {
            ctx.txn.fence();
        }
        _ => {
            tokio::time::sleep(ctx.config.retry_backoff().delay()).await;
        }
    }
    SenderEvent::TxnSubtaskDone
}

async fn txn_offset_commit_subtask(ctx: Arc<SenderContext>) -> SenderEvent {
    let Some(pid) = ctx.txn.pid() else {
        return SenderEvent::TxnSubtaskDone;
    };
    let Some(txn_id) = ctx.txn.transactional_id() else {
        return SenderEvent::TxnSubtaskDone;
    };
    let ready = ctx.txn.offsets_to_commit();
    let Some((group_id, offsets)) = ready.into_iter().next() else {
        return SenderEvent::TxnSubtaskDone;
    };

    let Ok(node) = find_coordinator(&ctx, CoordinatorKind::Group, &group_id).await else {
        return SenderEvent::TxnSubtaskDone;
    };

    let req = TxnOffsetCommitRequest {
        transactional_id: txn_id,
        group_id: group_id.clone(),
        producer_id: pid.producer_id,
        producer_epoch: pid.producer_epoch,
        offsets,
    };

    match ctx.broker.txn_offset_commit(node, req).await {
        Ok(resp) => {
            let _ = ctx.txn.offset_committed(&group_id, &resp.results);
        }
        Err(e) if e.is_retriable() => {
            tokio::time::sleep(ctx.config.retry_backoff().delay()).await;
        }
        Err(_) => {
            ctx.txn.fence();
        }
    }
    SenderEvent::TxnSubtaskDone
}

async fn end_txn_subtask(ctx: Arc<SenderContext>) -> SenderEvent {
    let Some(result) = ctx.txn.needs_transaction_commit() else {
        return SenderEvent::TxnSubtaskDone;
    };

    // An empty transaction (no partitions, no offsets) has nothing for the
    // coordinator to commit or abort; settle it locally without EndTxn.
    if ctx.txn.is_empty_transaction() {
        info!("completing an empty transaction without issuing EndTxn");
        ctx.txn.complete_transaction(false);
        return SenderEvent::TxnSubtaskDone;
    }

    // Every batch already created for this transaction's partitions must
    // terminate, with no new one admitted in the meantime, before EndTxn
    // goes out — otherwise a produce round can still be in flight for a
    // partition the broker is about to consider closed out.
    let partitions = ctx.txn.committed_partitions();
    ctx.accumulator.flush_for_commit(&partitions).await;

    let Some(pid) = ctx.txn.pid() else {
        return SenderEvent::TxnSubtaskDone;
    };
    let Some(txn_id) = ctx.txn.transactional_id() else {
        return SenderEvent::TxnSubtaskDone;
    };

    let Ok(node) = find_coordinator(&ctx, CoordinatorKind::Transaction, &txn_id).await else {
        return SenderEvent::TxnSubtaskDone;
    };

    let req = EndTxnRequest {
        producer_id: pid.producer_id,
        producer_epoch: pid.producer_epoch,
        committed: result == TransactionResult::Commit,
    };

    match ctx.broker.end_txn(node, req).await {
        Ok(resp) if resp.error == BrokerError::None => {
            ctx.txn.complete_transaction(false);
        }
        Ok(resp) if resp.error.is_fatal_fencing() => {
            ctx.txn.complete_transaction(true);
        }
        Ok(resp) if resp.error.is_retriable() => {
            tokio::time::sleep(ctx.config.retry_backoff().delay()).await;
        }
        _ => {
            tokio::time::sleep(ctx.config.retry_backoff().delay()).await;
        }
    }
    SenderEvent::TxnSubtaskDone
}
