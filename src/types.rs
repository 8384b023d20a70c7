//! Core data types shared across the producer core.

use std::fmt;

/// Broker-assigned identifier for a cluster member.
pub type NodeId = i32;

/// A (topic, partition) pair identifying a single log.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Durability gate for a Produce request.
///
/// `None` at the config-builder layer distinguishes "not given" (defaults to
/// `All`, or is forced to `All` by idempotence) from an explicit `Acks::Zero`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acks {
    /// Fire and forget; the sender synthesizes success after the write.
    Zero,
    /// Leader-only acknowledgement.
    One,
    /// All in-sync replicas must acknowledge.
    All,
}

impl Acks {
    pub fn to_wire(self) -> i16 {
        match self {
            Acks::Zero => 0,
            Acks::One => 1,
            Acks::All => -1,
        }
    }
}

/// Record-batch compression codec.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
}

impl CompressionType {
    pub fn wire_id(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Gzip => 1,
            CompressionType::Snappy => 2,
            CompressionType::Lz4 => 3,
        }
    }

    /// LZ4 is only safe to advertise against brokers >= 0.8.2.
    pub fn requires_broker_at_least(self) -> Option<(u16, u16)> {
        match self {
            CompressionType::Lz4 => Some((0, 8)),
            _ => None,
        }
    }
}

/// Record-batch binary format, selected from the negotiated broker API version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordBatchMagic {
    /// No timestamp field.
    V0 = 0,
    /// CREATE_TIME timestamp.
    V1 = 1,
    /// Default records: producer-id/epoch/base-sequence, headers.
    V2 = 2,
}

/// A user record prior to serialization.
///
/// At least one of `key` / `value` must be non-empty; enforced by the
/// facade before the record reaches the partitioner.
#[derive(Clone, Debug, Default)]
pub struct Record {
    pub key: Option<bytes::Bytes>,
    pub value: Option<bytes::Bytes>,
    pub timestamp: Option<i64>,
}

impl Record {
    pub fn is_valid(&self) -> bool {
        self.key.is_some() || self.value.is_some()
    }
}

/// Outcome of a successfully delivered batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic_partition_offset: i64,
    pub timestamp: i64,
}

/// Negotiated broker API version for a single RPC kind.
pub type ApiVersion = i16;

/// Broker wire-protocol RPC identifiers this crate dispatches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApiKey {
    Produce,
    InitProducerId,
    AddPartitionsToTxn,
    AddOffsetsToTxn,
    TxnOffsetCommit,
    EndTxn,
    FindCoordinator,
}

/// Which coordinator role a `FindCoordinator` lookup targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CoordinatorKind {
    Group,
    Transaction,
}

/// Commit or abort outcome requested for the in-flight transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionResult {
    Commit,
    Abort,
}
