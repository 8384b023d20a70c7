//! In-memory fakes for the wire boundary (component K), used by unit and
//! scenario tests across the crate instead of a live broker.

use crate::error::BrokerError;
use crate::types::{ApiKey, ApiVersion, CoordinatorKind, NodeId, TopicPartition};
use crate::wire::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Scriptable `MetadataCache` fake.
pub struct FakeMetadataCache {
    universal_leader: Option<NodeId>,
    per_partition_leader: HashMap<TopicPartition, Option<NodeId>>,
    partitions: Vec<i32>,
    broker_version: (u16, u16),
}

impl FakeMetadataCache {
    pub fn single_leader(node: NodeId) -> Self {
        Self {
            universal_leader: Some(node),
            per_partition_leader: HashMap::new(),
            partitions: (0..8).collect(),
            broker_version: (2, 0),
        }
    }

    pub fn no_leaders() -> Self {
        Self {
            universal_leader: None,
            per_partition_leader: HashMap::new(),
            partitions: (0..8).collect(),
            broker_version: (2, 0),
        }
    }

    pub fn with_broker_version(mut self, version: (u16, u16)) -> Self {
        self.broker_version = version;
        self
    }

    pub fn set_leader(&mut self, tp: TopicPartition, leader: Option<NodeId>) {
        self.per_partition_leader.insert(tp, leader);
    }
}

impl MetadataCache for FakeMetadataCache {
    fn leader_for(&self, tp: &TopicPartition) -> Option<NodeId> {
        if let Some(leader) = self.per_partition_leader.get(tp) {
            return *leader;
        }
        self.universal_leader
    }

    fn partitions_for(&self, _topic: &str) -> Option<Vec<i32>> {
        Some(self.partitions.clone())
    }

    fn available_partitions_for(&self, topic: &str) -> Option<Vec<i32>> {
        self.partitions_for(topic)
    }

    fn request_refresh(&self) {}

    fn api_version(&self, _key: ApiKey) -> ApiVersion {
        3
    }

    fn broker_version(&self) -> (u16, u16) {
        self.broker_version
    }
}

/// Canned outcome for one RPC call.
pub enum Script<T> {
    Ok(T),
    Err(BrokerError),
}

#[derive(Default)]
struct ScriptBank {
    produce: HashMap<NodeId, VecDeque<Script<ProduceResponse>>>,
    init_producer_id: VecDeque<Script<InitProducerIdResponse>>,
    add_partitions: VecDeque<Script<AddPartitionsToTxnResponse>>,
    add_offsets: VecDeque<Script<AddOffsetsToTxnResponse>>,
    txn_offset_commit: VecDeque<Script<TxnOffsetCommitResponse>>,
    end_txn: VecDeque<Script<EndTxnResponse>>,
    find_coordinator: VecDeque<Script<FindCoordinatorResponse>>,
    reachable: bool,
    nodes: Vec<NodeId>,
}

/// Scriptable `BrokerConnections` fake: every call pops the next canned
/// response off its queue; an empty queue falls back to a default success.
pub struct FakeBrokerConnections {
    bank: Mutex<ScriptBank>,
    pub calls: Mutex<Vec<&'static str>>,
}

impl Default for FakeBrokerConnections {
    fn default() -> Self {
        Self {
            bank: Mutex::new(ScriptBank {
                reachable: true,
                nodes: vec![0],
                ..Default::default()
            }),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeBrokerConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: Vec<NodeId>) -> Self {
        let mut s = Self::default();
        s.bank.get_mut().nodes = nodes;
        s
    }

    pub fn push_produce(&self, node: NodeId, script: Script<ProduceResponse>) {
        self.bank.lock().produce.entry(node).or_default().push_back(script);
    }

    pub fn push_init_producer_id(&self, script: Script<InitProducerIdResponse>) {
        self.bank.lock().init_producer_id.push_back(script);
    }

    pub fn push_add_partitions(&self, script: Script<AddPartitionsToTxnResponse>) {
        self.bank.lock().add_partitions.push_back(script);
    }

    pub fn push_end_txn(&self, script: Script<EndTxnResponse>) {
        self.bank.lock().end_txn.push_back(script);
    }

    pub fn push_find_coordinator(&self, script: Script<FindCoordinatorResponse>) {
        self.bank.lock().find_coordinator.push_back(script);
    }

    pub fn call_log(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    fn record(&self, name: &'static str) {
        self.calls.lock().push(name);
    }
}

#[async_trait]
impl BrokerConnections for FakeBrokerConnections {
    async fn produce(&self, node: NodeId, req: ProduceRequest) -> Result<ProduceResponse, BrokerError> {
        self.record("produce");
        let mut bank = self.bank.lock();
        if let Some(queue) = bank.produce.get_mut(&node) {
            if let Some(script) = queue.pop_front() {
                return match script {
                    Script::Ok(r) => Ok(r),
                    Script::Err(e) => Err(e),
                };
            }
        }
        // Default: acknowledge everything at offset 0.
        let mut topic_responses = HashMap::new();
        for (topic, partitions) in req.topic_data {
            topic_responses.insert(
                topic,
                partitions
                    .into_iter()
                    .map(|p| ProducePartitionResponse {
                        partition: p.partition,
                        error: BrokerError::None,
                        base_offset: 0,
                        log_append_time: -1,
                    })
                    .collect(),
            );
        }
        Ok(ProduceResponse { topic_responses })
    }

    async fn init_producer_id(
        &self,
        _node: NodeId,
        _req: InitProducerIdRequest,
    ) -> Result<InitProducerIdResponse, BrokerError> {
        self.record("init_producer_id");
        match self.bank.lock().init_producer_id.pop_front() {
            Some(Script::Ok(r)) => Ok(r),
            Some(Script::Err(e)) => Err(e),
            None => Ok(InitProducerIdResponse {
                error: BrokerError::None,
                producer_id: 1000,
                producer_epoch: 0,
            }),
        }
    }

    async fn add_partitions_to_txn(
        &self,
        _node: NodeId,
        req: AddPartitionsToTxnRequest,
    ) -> Result<AddPartitionsToTxnResponse, BrokerError> {
        self.record("add_partitions_to_txn");
        match self.bank.lock().add_partitions.pop_front() {
            Some(Script::Ok(r)) => Ok(r),
            Some(Script::Err(e)) => Err(e),
            None => {
                let results = req.partitions.into_iter().map(|tp| (tp, BrokerError::None)).collect();
                Ok(AddPartitionsToTxnResponse { results })
            }
        }
    }

    async fn add_offsets_to_txn(
        &self,
        _node: NodeId,
        _req: AddOffsetsToTxnRequest,
    ) -> Result<AddOffsetsToTxnResponse, BrokerError> {
        self.record("add_offsets_to_txn");
        match self.bank.lock().add_offsets.pop_front() {
            Some(Script::Ok(r)) => Ok(r),
            Some(Script::Err(e)) => Err(e),
            None => Ok(AddOffsetsToTxnResponse { error: BrokerError::None }),
        }
    }

    async fn txn_offset_commit(
        &self,
        _node: NodeId,
        req: TxnOffsetCommitRequest,
    ) -> Result<TxnOffsetCommitResponse, BrokerError> {
        self.record("txn_offset_commit");
        match self.bank.lock().txn_offset_commit.pop_front() {
            Some(Script::Ok(r)) => Ok(r),
            Some(Script::Err(e)) => Err(e),
            None => {
                let results = req.offsets.keys().cloned().map(|tp| (tp, BrokerError::None)).collect();
                Ok(TxnOffsetCommitResponse { results })
            }
        }
    }

    async fn end_txn(&self, _node: NodeId, _req: EndTxnRequest) -> Result<EndTxnResponse, BrokerError> {
        self.record("end_txn");
        match self.bank.lock().end_txn.pop_front() {
            Some(Script::Ok(r)) => Ok(r),
            Some(Script::Err(e)) => Err(e),
            None => Ok(EndTxnResponse { error: BrokerError::None }),
        }
    }

    async fn find_coordinator(
        &self,
        _node: NodeId,
        _req: FindCoordinatorRequest,
    ) -> Result<FindCoordinatorResponse, BrokerError> {
        self.record("find_coordinator");
        match self.bank.lock().find_coordinator.pop_front() {
            Some(Script::Ok(r)) => Ok(r),
            Some(Script::Err(e)) => Err(e),
            None => Ok(FindCoordinatorResponse {
                error: BrokerError::None,
                node_id: 0,
            }),
        }
    }

    async fn is_reachable(&self, _node: NodeId) -> bool {
        self.bank.lock().reachable
    }

    fn any_node(&self) -> Option<NodeId> {
        self.bank.lock().nodes.first().copied()
    }
}

#[allow(dead_code)]
fn _assert_coordinator_kind_is_used(_k: CoordinatorKind) {}
