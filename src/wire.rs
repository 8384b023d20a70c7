//! Wire-protocol boundary: typed request/response structs and the traits
//! the sender loop depends on instead of owning socket/TLS/codec code.
//!
//! The TCP/TLS transport that actually frames and ships these requests is
//! an external collaborator; this module only pins down the shapes the
//! producer core needs at that boundary.

use crate::error::BrokerError;
use crate::types::{ApiKey, ApiVersion, CoordinatorKind, NodeId, TopicPartition};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;

/// One partition's encoded batch, ready to ship inside a Produce request.
#[derive(Clone, Debug)]
pub struct ProducePartitionData {
    pub partition: i32,
    pub records: Bytes,
}

#[derive(Clone, Debug)]
pub struct ProduceRequest {
    pub transactional_id: Option<String>,
    pub acks: i16,
    pub timeout_ms: i32,
    pub topic_data: HashMap<String, Vec<ProducePartitionData>>,
}

#[derive(Clone, Debug)]
pub struct ProducePartitionResponse {
    pub partition: i32,
    pub error: BrokerError,
    pub base_offset: i64,
    pub log_append_time: i64,
}

#[derive(Clone, Debug, Default)]
pub struct ProduceResponse {
    pub topic_responses: HashMap<String, Vec<ProducePartitionResponse>>,
}

#[derive(Clone, Debug)]
pub struct InitProducerIdRequest {
    pub transactional_id: Option<String>,
    pub transaction_timeout_ms: i32,
}

#[derive(Clone, Debug)]
pub struct InitProducerIdResponse {
    pub error: BrokerError,
    pub producer_id: i64,
    pub producer_epoch: i16,
}

#[derive(Clone, Debug)]
pub struct AddPartitionsToTxnRequest {
    pub transactional_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub partitions: Vec<TopicPartition>,
}

#[derive(Clone, Debug)]
pub struct AddPartitionsToTxnResponse {
    /// Per-partition outcome; every entry must be consumed before the
    /// sender's sub-task returns (see the resolved AddPartitionsToTxn open
    /// question).
    pub results: HashMap<TopicPartition, BrokerError>,
}

#[derive(Clone, Debug)]
pub struct AddOffsetsToTxnRequest {
    pub transactional_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub group_id: String,
}

#[derive(Clone, Debug)]
pub struct AddOffsetsToTxnResponse {
    pub error: BrokerError,
}

#[derive(Clone, Debug)]
pub struct TxnOffsetCommitRequest {
    pub transactional_id: String,
    pub group_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub offsets: HashMap<TopicPartition, (i64, Option<String>)>,
}

#[derive(Clone, Debug)]
pub struct TxnOffsetCommitResponse {
    pub results: HashMap<TopicPartition, BrokerError>,
}

#[derive(Clone, Copy, Debug)]
pub struct EndTxnRequest {
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub committed: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct EndTxnResponse {
    pub error: BrokerError,
}

#[derive(Clone, Debug)]
pub struct FindCoordinatorRequest {
    pub kind: CoordinatorKind,
    pub key: String,
}

#[derive(Clone, Copy, Debug)]
pub struct FindCoordinatorResponse {
    pub error: BrokerError,
    pub node_id: NodeId,
}

/// Boundary to the cluster of broker connections.
///
/// A production implementation multiplexes these calls over pooled TCP/TLS
/// connections per node; this crate depends only on the trait.
#[async_trait]
pub trait BrokerConnections: Send + Sync {
    async fn produce(&self, node: NodeId, req: ProduceRequest) -> Result<ProduceResponse, BrokerError>;

    async fn init_producer_id(
        &self,
        node: NodeId,
        req: InitProducerIdRequest,
    ) -> Result<InitProducerIdResponse, BrokerError>;

    async fn add_partitions_to_txn(
        &self,
        node: NodeId,
        req: AddPartitionsToTxnRequest,
    ) -> Result<AddPartitionsToTxnResponse, BrokerError>;

    async fn add_offsets_to_txn(
        &self,
        node: NodeId,
        req: AddOffsetsToTxnRequest,
    ) -> Result<AddOffsetsToTxnResponse, BrokerError>;

    async fn txn_offset_commit(
        &self,
        node: NodeId,
        req: TxnOffsetCommitRequest,
    ) -> Result<TxnOffsetCommitResponse, BrokerError>;

    async fn end_txn(&self, node: NodeId, req: EndTxnRequest) -> Result<EndTxnResponse, BrokerError>;

    async fn find_coordinator(
        &self,
        node: NodeId,
        req: FindCoordinatorRequest,
    ) -> Result<FindCoordinatorResponse, BrokerError>;

    /// Verify the given node is reachable before the coordinator cache
    /// caches it (see find_coordinator's contract).
    async fn is_reachable(&self, node: NodeId) -> bool;

    /// Any node known to the cluster, used for InitProducerId when no
    /// transactional id is configured.
    fn any_node(&self) -> Option<NodeId>;
}

/// Boundary to the cluster-metadata cache.
pub trait MetadataCache: Send + Sync {
    fn leader_for(&self, tp: &TopicPartition) -> Option<NodeId>;
    fn partitions_for(&self, topic: &str) -> Option<Vec<i32>>;
    fn available_partitions_for(&self, topic: &str) -> Option<Vec<i32>>;
    fn request_refresh(&self);
    fn api_version(&self, key: ApiKey) -> ApiVersion;
    fn broker_version(&self) -> (u16, u16);
}

/// Boundary to a record-batch compression codec.
pub trait Compressor: Send + Sync {
    fn compress(&self, input: &[u8]) -> Vec<u8>;
}

/// Identity compressor used when `CompressionType::None` is configured.
#[derive(Default)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn compress(&self, input: &[u8]) -> Vec<u8> {
        input.to_vec()
    }
}
