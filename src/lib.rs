//! Idempotent and transactional producer core for a clustered log-broker
//! client.
//!
//! This crate implements the accumulator, sender loop, and transaction
//! state machine an async producer needs to batch records, ship them with
//! in-order delivery guarantees, and optionally coordinate multi-partition
//! transactions. The socket/TLS transport, cluster-metadata refresh, and
//! record-batch compression codecs are externalized behind the
//! [`wire`] module's traits — a full deployment plugs in its own
//! implementations of [`wire::BrokerConnections`], [`wire::MetadataCache`],
//! and [`wire::Compressor`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use kafka_producer_core::{Producer, ProducerConfig};
//! use std::sync::Arc;
//!
//! # async fn run(broker: Arc<dyn kafka_producer_core::wire::BrokerConnections>, metadata: Arc<dyn kafka_producer_core::wire::MetadataCache>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProducerConfig::builder().client_id("my-app").build()?;
//! let producer = Producer::builder(config, broker, metadata).start().await?;
//!
//! let offset = producer
//!     .send_and_wait("my-topic", Some(b"hello".as_slice().into()), None, None, None)
//!     .await?;
//! println!("wrote at offset {}", offset.topic_partition_offset);
//!
//! producer.stop().await?;
//! # Ok(())
//! # }
//! ```

mod accumulator;
mod batch;
mod config;
mod error;
mod partitioner;
mod producer;
mod retry;
mod sender;
#[cfg(test)]
mod testing;
mod txn;
mod types;
pub mod wire;

pub use config::{ClientIdAllocator, ProducerConfig, ProducerConfigBuilder, SharedConfig};
pub use error::{BrokerError, ConfigError, ProducerError};
pub use partitioner::{choose_partition, BytesSerializer, Murmur2Partitioner, Partitioner, Serializer};
pub use producer::{Producer, ProducerBuilder};
pub use retry::{BackoffPolicy, JitterMode};
pub use txn::{ProducerIdAndEpoch, TransactionManager, TxnState};
pub use types::{
    Acks, ApiKey, ApiVersion, CompressionType, CoordinatorKind, NodeId, Record, RecordBatchMagic, RecordMetadata,
    TopicPartition, TransactionResult,
};

pub use batch::{Batch, CompletionHandle};
