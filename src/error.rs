//! Error types for the producer core.

use crate::types::TopicPartition;
use thiserror::Error;

/// Protocol-level error codes a broker response can carry.
///
/// Mirrors the wire error-code taxonomy; `is_retriable` and
/// `invalidates_metadata` drive the sender's retry/refresh decisions (see
/// the produce-response handling rules).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("no error")]
    None,
    #[error("unknown topic or partition")]
    UnknownTopicOrPartition,
    #[error("leader not available")]
    LeaderNotAvailable,
    #[error("not leader for partition")]
    NotLeaderForPartition,
    #[error("request timed out")]
    RequestTimedOut,
    #[error("network exception")]
    NetworkException,
    #[error("duplicate sequence number")]
    DuplicateSequenceNumber,
    #[error("invalid producer epoch")]
    InvalidProducerEpoch,
    #[error("out of order sequence number")]
    OutOfOrderSequenceNumber,
    #[error("coordinator not available")]
    CoordinatorNotAvailable,
    #[error("not coordinator")]
    NotCoordinator,
    #[error("coordinator load in progress")]
    CoordinatorLoadInProgress,
    #[error("concurrent transactions")]
    ConcurrentTransactions,
    #[error("invalid transaction state")]
    InvalidTxnState,
    #[error("unsupported for message format")]
    UnsupportedForMessageFormat,
    #[error("unknown member id")]
    UnknownMemberId,
    #[error("transactional id authorization failed")]
    TransactionalIdAuthorizationFailed,
    #[error("unknown server error")]
    Unknown,
}

impl BrokerError {
    /// Whether the sender should re-enqueue the affected batch/RPC.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            BrokerError::LeaderNotAvailable
                | BrokerError::NotLeaderForPartition
                | BrokerError::NetworkException
                | BrokerError::RequestTimedOut
                | BrokerError::UnknownTopicOrPartition
                | BrokerError::CoordinatorNotAvailable
                | BrokerError::NotCoordinator
                | BrokerError::CoordinatorLoadInProgress
                | BrokerError::ConcurrentTransactions
        )
    }

    /// Whether the sender must force a metadata refresh before retrying.
    pub fn invalidates_metadata(self) -> bool {
        matches!(
            self,
            BrokerError::LeaderNotAvailable
                | BrokerError::NotLeaderForPartition
                | BrokerError::UnknownTopicOrPartition
        )
    }

    /// Whether the coordinator cache entry must be dropped.
    pub fn invalidates_coordinator(self) -> bool {
        matches!(
            self,
            BrokerError::CoordinatorNotAvailable | BrokerError::NotCoordinator
        )
    }

    /// Whether this error fences the producer (terminal).
    pub fn is_fatal_fencing(self) -> bool {
        matches!(self, BrokerError::InvalidProducerEpoch)
    }

    /// Whether a retry should use the shortened 20ms backoff rather than
    /// the configured `retry_backoff_ms`.
    pub fn uses_short_backoff(self, txn_partitions_empty: bool) -> bool {
        self == BrokerError::ConcurrentTransactions && txn_partitions_empty
    }
}

/// Errors raised validating a `ProducerConfig`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("acks={acks:?} is incompatible with enable_idempotence=true, which requires acks=all")]
    AcksIdempotenceMismatch { acks: i16 },

    #[error("unsupported compression codec")]
    UnsupportedCompression,

    #[error("transactional_id requires enable_idempotence=true")]
    TransactionalRequiresIdempotence,

    #[error("max_batch_size must be <= max_request_size")]
    BatchLargerThanRequest,

    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },
}

/// User-facing errors surfaced from facade operations and batch completion
/// handles.
#[derive(Debug, Clone, Error)]
pub enum ProducerError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("record too large: serialized size exceeds max_request_size minus overhead")]
    MessageTooLarge,

    #[error("explicit partition {partition} is not a known partition of topic {topic}")]
    UnknownPartition { topic: String, partition: i32 },

    #[error("producer send queue is full")]
    ProducerQueueFull,

    #[error("producer is closed")]
    ProducerClosed,

    #[error("illegal operation: {0}")]
    IllegalOperation(&'static str),

    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error("producer has been fenced by a newer instance")]
    ProducerFenced,

    #[error("broker version does not support this operation: {0}")]
    UnsupportedVersion(&'static str),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("sender task terminated: {0}")]
    SenderTerminated(String),

    #[error("record rejected at partition {partition}: {source}")]
    BatchFailed {
        partition: TopicPartition,
        #[source]
        source: Box<ProducerError>,
    },
}

impl ProducerError {
    /// True for errors that should poison the idempotent/transactional
    /// sequence stream (any non-retriable, non-duplicate broker error).
    pub fn poisons_sequence(&self) -> bool {
        matches!(self, ProducerError::Broker(e) if !e.is_retriable() && *e != BrokerError::DuplicateSequenceNumber)
    }
}
