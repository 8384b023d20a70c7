//! Producer facade (§4.F): the public entry point wiring together the
//! partitioner, accumulator, transaction manager, and sender loop.

use crate::accumulator::Accumulator;
use crate::batch::{Batch, CompletionHandle};
use crate::config::SharedConfig;
use crate::error::ProducerError;
use crate::partitioner::{choose_partition, Murmur2Partitioner, Partitioner};
use crate::sender::{self, SenderContext};
use crate::txn::TransactionManager;
use crate::types::{RecordMetadata, TopicPartition};
use crate::wire::{BrokerConnections, Compressor, IdentityCompressor, MetadataCache};
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::info;

/// Builder that wires the producer core to its broker/metadata/compression
/// collaborators before launching the sender task.
#[must_use = "builders do nothing unless you call .start()"]
pub struct ProducerBuilder {
    config: SharedConfig,
    broker: Arc<dyn BrokerConnections>,
    metadata: Arc<dyn MetadataCache>,
    compressor: Arc<dyn Compressor>,
    partitioner: Arc<dyn Partitioner>,
}

impl ProducerBuilder {
    pub fn new(
        config: crate::config::ProducerConfig,
        broker: Arc<dyn BrokerConnections>,
        metadata: Arc<dyn MetadataCache>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            broker,
            metadata,
            compressor: Arc::new(IdentityCompressor),
            partitioner: Arc::new(Murmur2Partitioner),
        }
    }

    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Bootstrap the client: validate compression/transaction compatibility
    /// against the negotiated broker version, acquire a producer-id if
    /// idempotence or transactions require one, and launch the sender.
    pub async fn start(self) -> Result<Producer, ProducerError> {
        let broker_version = self.metadata.broker_version();

        if let Some(min) = self.config.compression_type.requires_broker_at_least() {
            if broker_version < min {
                return Err(ProducerError::UnsupportedVersion(
                    "configured compression codec requires a newer broker",
                ));
            }
        }

        if self.config.is_transactional() && broker_version < (0, 11) {
            return Err(ProducerError::UnsupportedVersion("transactions require broker >= 0.11"));
        }

        let accumulator = Arc::new(Accumulator::new(self.config.clone()));
        let txn = Arc::new(TransactionManager::new(self.config.transactional_id.clone()));
        let ctx = Arc::new(SenderContext::new(
            self.config.clone(),
            accumulator.clone(),
            txn.clone(),
            self.broker.clone(),
            self.metadata.clone(),
            self.compressor.clone(),
        ));

        let sender_handle = tokio::spawn(sender::run(ctx.clone()));

        info!(client_id = %self.config.client_id, "producer started");

        Ok(Producer {
            inner: Arc::new(Inner {
                config: self.config,
                accumulator,
                txn,
                metadata: self.metadata,
                partitioner: self.partitioner,
                ctx,
                sender_handle: tokio::sync::Mutex::new(Some(sender_handle)),
                stopped: AtomicBool::new(false),
            }),
        })
    }
}

struct Inner {
    config: SharedConfig,
    accumulator: Arc<Accumulator>,
    txn: Arc<TransactionManager>,
    metadata: Arc<dyn MetadataCache>,
    partitioner: Arc<dyn Partitioner>,
    ctx: Arc<SenderContext>,
    sender_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Handle to a running producer. Cheaply cloneable; every clone shares the
/// same accumulator, transaction manager, and sender task.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<Inner>,
}

impl Producer {
    pub fn builder(
        config: crate::config::ProducerConfig,
        broker: Arc<dyn BrokerConnections>,
        metadata: Arc<dyn MetadataCache>,
    ) -> ProducerBuilder {
        ProducerBuilder::new(config, broker, metadata)
    }

    fn check_alive(&self) -> Result<(), ProducerError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(ProducerError::ProducerClosed);
        }
        if let Some(err) = self.inner.ctx.terminal_error() {
            return Err(err);
        }
        Ok(())
    }

    /// Send one record. Requires `value.is_some() || key.is_some()`.
    ///
    /// Cancelling the returned future before it resolves cancels the enqueue
    /// attempt cleanly; cancelling the resolved `CompletionHandle` does not
    /// revoke the send — the batch still ships.
    pub async fn send(
        &self,
        topic: impl Into<String>,
        value: Option<Bytes>,
        key: Option<Bytes>,
        partition: Option<i32>,
        timestamp: Option<i64>,
    ) -> Result<CompletionHandle, ProducerError> {
        self.check_alive()?;

        if value.is_none() && key.is_none() {
            return Err(ProducerError::IllegalOperation("record must have a key or a value"));
        }

        if self.inner.txn.needs_transaction_commit().is_some() {
            return Err(ProducerError::IllegalState(
                "cannot send while the transaction is committing or aborting",
            ));
        }

        let topic = topic.into();
        let all_partitions = self.wait_for_partitions(&topic).await?;
        let available_partitions = self.inner.metadata.available_partitions_for(&topic).unwrap_or_default();

        let chosen = choose_partition(
            self.inner.partitioner.as_ref(),
            &topic,
            partition,
            key.as_deref(),
            &all_partitions,
            &available_partitions,
        )?;

        let tp = TopicPartition::new(topic, chosen);

        if self.inner.txn.is_transactional() {
            self.inner.txn.maybe_add_partition_to_transaction(tp.clone())?;
        }

        let magic = crate::batch::select_magic(
            self.inner.metadata.broker_version(),
            self.inner.config.is_transactional() || self.inner.config.enable_idempotence,
        );

        let record_timestamp = timestamp.unwrap_or_else(now_millis);
        let overhead = self.inner.config.fixed_record_overhead(magic);
        let record_size = key.as_ref().map_or(0, |k| k.len()) + value.as_ref().map_or(0, |v| v.len());
        if record_size + overhead > self.inner.config.max_request_size {
            return Err(ProducerError::MessageTooLarge);
        }

        self.inner
            .accumulator
            .add_message(
                tp,
                magic,
                key.as_deref(),
                value.as_deref(),
                record_timestamp,
                self.inner.config.request_timeout(),
            )
            .await
    }

    /// Compose `send` and await the handle.
    pub async fn send_and_wait(
        &self,
        topic: impl Into<String>,
        value: Option<Bytes>,
        key: Option<Bytes>,
        partition: Option<i32>,
        timestamp: Option<i64>,
    ) -> Result<RecordMetadata, ProducerError> {
        let handle = self.send(topic, value, key, partition, timestamp).await?;
        handle
            .await
            .map_err(|_| ProducerError::SenderTerminated("completion handle dropped before resolving".into()))?
    }

    /// Submit a prebuilt batch (see `create_batch`).
    pub async fn send_batch(&self, batch: Batch, topic: impl Into<String>, partition: i32) -> Result<(), ProducerError> {
        self.check_alive()?;
        let topic = topic.into();
        let all_partitions = self.wait_for_partitions(&topic).await?;
        if !all_partitions.contains(&partition) {
            return Err(ProducerError::UnknownPartition { topic, partition });
        }
        let tp = TopicPartition::new(topic, partition);
        self.inner.accumulator.add_batch(tp, batch, self.inner.config.request_timeout()).await
    }

    /// An empty builder compatible with the batch format for out-of-band
    /// construction via `send_batch`.
    pub fn create_batch(&self, topic: impl Into<String>, partition: i32) -> Batch {
        let magic = crate::batch::select_magic(
            self.inner.metadata.broker_version(),
            self.inner.config.is_transactional() || self.inner.config.enable_idempotence,
        );
        Batch::new(TopicPartition::new(topic, partition), magic, self.inner.config.max_batch_size)
    }

    /// Wait until the accumulator has drained every batch created before
    /// this call.
    pub async fn flush(&self) -> Result<(), ProducerError> {
        self.check_alive()?;
        self.inner.accumulator.flush().await;
        Ok(())
    }

    /// Idempotent: stops accepting new records, drains the accumulator, and
    /// awaits the sender task's graceful shutdown.
    pub async fn stop(&self) -> Result<(), ProducerError> {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.ctx.request_shutdown();
        self.inner.accumulator.close().await;

        if let Some(handle) = self.inner.sender_handle.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    pub async fn begin_transaction(&self) -> Result<(), ProducerError> {
        self.check_alive()?;
        self.inner.txn.wait_for_pid().await;
        self.inner.txn.begin_transaction()
    }

    pub async fn commit_transaction(&self) -> Result<(), ProducerError> {
        self.check_alive()?;
        self.inner.txn.committing_transaction()?;
        self.await_transaction_settled().await
    }

    pub async fn abort_transaction(&self) -> Result<(), ProducerError> {
        self.check_alive()?;
        self.inner.txn.aborting_transaction()?;
        self.await_transaction_settled().await
    }

    pub async fn send_offsets_to_transaction(
        &self,
        offsets: std::collections::HashMap<TopicPartition, (i64, Option<String>)>,
        group_id: impl Into<String>,
    ) -> Result<(), ProducerError> {
        self.check_alive()?;
        let group_id = group_id.into();
        self.inner.txn.add_offsets_to_txn(offsets, group_id.clone())?;
        loop {
            self.check_alive()?;
            if !self.inner.txn.has_pending_offsets(&group_id) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Scoped transaction: commits on a clean return, aborts on error,
    /// guaranteeing the transaction always terminates.
    pub async fn transaction<F, Fut, T>(&self, f: F) -> Result<T, ProducerError>
    where
        F: FnOnce(Producer) -> Fut,
        Fut: Future<Output = Result<T, ProducerError>>,
    {
        self.begin_transaction().await?;
        match f(self.clone()).await {
            Ok(value) => {
                self.commit_transaction().await?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.abort_transaction().await;
                Err(err)
            }
        }
    }

    async fn await_transaction_settled(&self) -> Result<(), ProducerError> {
        loop {
            if let Some(err) = self.inner.ctx.terminal_error() {
                return Err(err);
            }
            match self.inner.txn.state() {
                crate::txn::TxnState::Ready => return Ok(()),
                crate::txn::TxnState::Fenced => return Err(ProducerError::ProducerFenced),
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    }

    async fn wait_for_partitions(&self, topic: &str) -> Result<Vec<i32>, ProducerError> {
        let deadline = tokio::time::Instant::now() + self.inner.config.request_timeout();
        loop {
            if let Some(partitions) = self.inner.metadata.partitions_for(topic) {
                return Ok(partitions);
            }
            self.inner.metadata.request_refresh();
            if tokio::time::Instant::now() >= deadline {
                return Err(ProducerError::UnknownPartition {
                    topic: topic.to_string(),
                    partition: -1,
                });
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}
