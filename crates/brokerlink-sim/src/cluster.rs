//! Simulated cluster state and fault injection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use brokerlink_core::protocol::TopicConfig;
use brokerlink_core::{
    BrokerEndpoint, BrokerError, BrokerId, BrokerRole, PartitionMetadata, ProduceRecord, Record,
    TopicMetadata, TopicPartition,
};
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::coordinator::{GroupCoordinator, GroupState};

/// Broker API a request belongs to. Used for request counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Api {
    Metadata,
    DescribeConfigs,
    Produce,
    Fetch,
    ListOffsets,
    FindCoordinator,
    JoinGroup,
    SyncGroup,
    Heartbeat,
    LeaveGroup,
    OffsetCommit,
    OffsetFetch,
}

const API_COUNT: usize = 12;

impl Api {
    fn index(self) -> usize {
        self as usize
    }
}

/// Default configuration reported for every topic unless overridden.
pub fn default_topic_config() -> TopicConfig {
    BTreeMap::from([
        ("retention.ms".to_string(), "604800000".to_string()),
        ("cleanup.policy".to_string(), "delete".to_string()),
        ("segment.bytes".to_string(), "1073741824".to_string()),
        ("min.insync.replicas".to_string(), "1".to_string()),
    ])
}

#[derive(Debug)]
pub(crate) struct SimBroker {
    pub(crate) endpoint: BrokerEndpoint,
    pub(crate) up: bool,
}

#[derive(Debug)]
pub(crate) struct SimPartition {
    pub(crate) leader: BrokerId,
    pub(crate) replicas: Vec<BrokerId>,
    pub(crate) log: Vec<Record>,
    pub(crate) log_start: i64,
}

impl SimPartition {
    pub(crate) fn high_watermark(&self) -> i64 {
        self.log_start + self.log.len() as i64
    }

    pub(crate) fn append(&mut self, records: Vec<ProduceRecord>) -> i64 {
        let base = self.high_watermark();
        for (i, record) in records.into_iter().enumerate() {
            self.log.push(record.into_record(base + i as i64));
        }
        base
    }

    pub(crate) fn read(&self, offset: i64, max_records: usize) -> Vec<Record> {
        let start = (offset - self.log_start).max(0) as usize;
        self.log.iter().skip(start).take(max_records).cloned().collect()
    }

    pub(crate) fn offset_for_timestamp(&self, timestamp: i64) -> Option<i64> {
        self.log
            .iter()
            .find(|r| r.timestamp >= timestamp)
            .map(|r| r.offset)
    }
}

#[derive(Debug)]
pub(crate) struct SimTopic {
    pub(crate) partitions: Vec<SimPartition>,
    pub(crate) config: TopicConfig,
}

#[derive(Debug)]
struct Fault {
    broker: Option<BrokerId>,
    api: Api,
    error: BrokerError,
    remaining: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ClusterState {
    pub(crate) brokers: BTreeMap<BrokerId, SimBroker>,
    pub(crate) topics: BTreeMap<String, SimTopic>,
    pub(crate) groups: GroupCoordinator,
    coordinators: HashMap<String, BrokerId>,
    faults: Vec<Fault>,
    latency: Option<Duration>,
}

impl ClusterState {
    pub(crate) fn partition(&self, tp: &TopicPartition) -> Result<&SimPartition, BrokerError> {
        self.topics
            .get(&tp.topic)
            .and_then(|t| usize::try_from(tp.partition).ok().and_then(|p| t.partitions.get(p)))
            .ok_or_else(|| BrokerError::UnknownTopicOrPartition {
                topic: tp.topic.clone(),
                partition: tp.partition,
            })
    }

    pub(crate) fn partition_mut(
        &mut self,
        tp: &TopicPartition,
    ) -> Result<&mut SimPartition, BrokerError> {
        self.topics
            .get_mut(&tp.topic)
            .and_then(|t| {
                usize::try_from(tp.partition)
                    .ok()
                    .and_then(|p| t.partitions.get_mut(p))
            })
            .ok_or_else(|| BrokerError::UnknownTopicOrPartition {
                topic: tp.topic.clone(),
                partition: tp.partition,
            })
    }

    /// Coordinator broker for a group: an explicit placement, else the lowest broker id.
    pub(crate) fn coordinator_for(&self, group_id: &str) -> Option<BrokerId> {
        self.coordinators
            .get(group_id)
            .copied()
            .or_else(|| self.brokers.keys().next().copied())
    }

    pub(crate) fn broker_up(&self, broker_id: BrokerId) -> bool {
        self.brokers.get(&broker_id).is_some_and(|b| b.up)
    }

    pub(crate) fn topic_metadata(&self, name: &str, topic: &SimTopic) -> TopicMetadata {
        let partitions = topic
            .partitions
            .iter()
            .enumerate()
            .map(|(i, p)| {
                // Replicas on a down broker fall out of sync
                let in_sync_replicas: BTreeSet<BrokerId> = p
                    .replicas
                    .iter()
                    .copied()
                    .filter(|id| self.broker_up(*id))
                    .collect();
                PartitionMetadata {
                    tp: TopicPartition::new(name, i as i32),
                    leader: p.leader,
                    replicas: p.replicas.clone(),
                    in_sync_replicas,
                    earliest_offset: p.log_start,
                    latest_offset: p.high_watermark(),
                }
            })
            .collect();
        TopicMetadata {
            name: name.to_string(),
            partitions,
        }
    }

    fn take_fault(&mut self, broker_id: BrokerId, api: Api) -> Option<BrokerError> {
        let index = self.faults.iter().position(|f| {
            f.api == api && f.remaining > 0 && f.broker.map_or(true, |b| b == broker_id)
        })?;
        let fault = &mut self.faults[index];
        fault.remaining -= 1;
        let error = fault.error.clone();
        if fault.remaining == 0 {
            self.faults.remove(index);
        }
        Some(error)
    }
}

/// An in-memory broker cluster.
///
/// Cloning is cheap; every clone shares the same state. Brokers listen on
/// `localhost:9092`, `localhost:9093`, ... with ids starting at 1.
///
/// ```ignore
/// let cluster = SimCluster::builder()
///     .brokers(3)
///     .topic("orders", 3)
///     .build();
/// cluster.set_broker_down(1).await;
/// ```
#[derive(Clone)]
pub struct SimCluster {
    pub(crate) state: Arc<Mutex<ClusterState>>,
    requests: Arc<[AtomicU64; API_COUNT]>,
    connections: Arc<AtomicU64>,
}

impl std::fmt::Debug for SimCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimCluster").finish_non_exhaustive()
    }
}

impl SimCluster {
    pub fn builder() -> SimClusterBuilder {
        SimClusterBuilder::default()
    }

    /// Bootstrap list covering every broker.
    pub async fn bootstrap_servers(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.brokers.values().map(|b| b.endpoint.address()).collect()
    }

    /// Count a request, apply injected latency, then reject it if the broker is
    /// down or a fault is queued for it.
    pub(crate) async fn enter(&self, broker_id: BrokerId, api: Api) -> Result<(), BrokerError> {
        self.requests[api.index()].fetch_add(1, Ordering::Relaxed);
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        if !state.broker_up(broker_id) {
            return Err(BrokerError::Connection {
                broker_id,
                message: "broker is down".to_string(),
            });
        }
        if let Some(error) = state.take_fault(broker_id, api) {
            debug!(broker_id, ?api, %error, "Injected fault");
            return Err(error);
        }
        Ok(())
    }

    pub(crate) fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    // ---- Topics ----

    /// Create a topic with round-robin leaders and the default configuration.
    pub async fn create_topic(&self, name: &str, partitions: usize, replication_factor: usize) {
        let mut state = self.state.lock().await;
        let broker_ids: Vec<BrokerId> = state.brokers.keys().copied().collect();
        let topic = build_topic(&broker_ids, partitions, replication_factor);
        info!(topic = name, partitions, "Created topic");
        state.topics.insert(name.to_string(), topic);
    }

    /// Override one configuration entry of an existing topic.
    pub async fn set_topic_config(&self, topic: &str, key: &str, value: &str) {
        let mut state = self.state.lock().await;
        if let Some(t) = state.topics.get_mut(topic) {
            t.config.insert(key.to_string(), value.to_string());
        }
    }

    /// Append a record directly to a partition log, bypassing leadership.
    pub async fn append(
        &self,
        tp: &TopicPartition,
        key: Option<&str>,
        value: &str,
        timestamp: i64,
    ) -> Result<i64, BrokerError> {
        let mut state = self.state.lock().await;
        let partition = state.partition_mut(tp)?;
        let record = ProduceRecord::new(
            key.map(|k| Bytes::copy_from_slice(k.as_bytes())),
            Bytes::copy_from_slice(value.as_bytes()),
            timestamp,
        );
        Ok(partition.append(vec![record]))
    }

    /// Every record currently in a partition log.
    pub async fn records(&self, tp: &TopicPartition) -> Vec<Record> {
        let state = self.state.lock().await;
        state
            .partition(tp)
            .map(|p| p.log.clone())
            .unwrap_or_default()
    }

    /// Drop every record below `new_start`, as retention would.
    pub async fn truncate_before(&self, tp: &TopicPartition, new_start: i64) {
        let mut state = self.state.lock().await;
        if let Ok(partition) = state.partition_mut(tp) {
            let removed = (new_start - partition.log_start).clamp(0, partition.log.len() as i64);
            partition.log.drain(..removed as usize);
            partition.log_start += removed;
        }
    }

    // ---- Faults ----

    pub async fn set_broker_down(&self, broker_id: BrokerId) {
        self.set_broker_state(broker_id, false).await;
    }

    pub async fn set_broker_up(&self, broker_id: BrokerId) {
        self.set_broker_state(broker_id, true).await;
    }

    async fn set_broker_state(&self, broker_id: BrokerId, up: bool) {
        let mut state = self.state.lock().await;
        if let Some(broker) = state.brokers.get_mut(&broker_id) {
            info!(broker_id, up, "Broker state changed");
            broker.up = up;
        }
    }

    /// Move partition leadership to another broker.
    pub async fn move_leader(&self, tp: &TopicPartition, new_leader: BrokerId) {
        let mut state = self.state.lock().await;
        if let Ok(partition) = state.partition_mut(tp) {
            info!(%tp, from = partition.leader, to = new_leader, "Leader moved");
            partition.leader = new_leader;
            if !partition.replicas.contains(&new_leader) {
                partition.replicas.push(new_leader);
            }
        }
    }

    /// Place a group's coordinator on a specific broker.
    pub async fn set_coordinator(&self, group_id: &str, broker_id: BrokerId) {
        let mut state = self.state.lock().await;
        state.coordinators.insert(group_id.to_string(), broker_id);
    }

    /// Fail the next `times` requests of `api` with `error`, optionally only on one broker.
    pub async fn inject_fault(
        &self,
        broker: Option<BrokerId>,
        api: Api,
        error: BrokerError,
        times: usize,
    ) {
        let mut state = self.state.lock().await;
        state.faults.push(Fault {
            broker,
            api,
            error,
            remaining: times,
        });
    }

    /// Delay every request by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    // ---- Inspection ----

    pub fn request_count(&self, api: Api) -> u64 {
        self.requests[api.index()].load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub async fn committed(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        self.state.lock().await.groups.committed(group_id, tp)
    }

    pub async fn group_generation(&self, group_id: &str) -> Option<i32> {
        self.state.lock().await.groups.generation(group_id)
    }

    pub async fn group_state(&self, group_id: &str) -> Option<GroupState> {
        self.state.lock().await.groups.state(group_id)
    }

    pub async fn group_members(&self, group_id: &str) -> usize {
        self.state.lock().await.groups.member_count(group_id)
    }

    pub async fn leader(&self, tp: &TopicPartition) -> Option<BrokerId> {
        self.state.lock().await.partition(tp).ok().map(|p| p.leader)
    }
}

fn build_topic(broker_ids: &[BrokerId], partitions: usize, replication_factor: usize) -> SimTopic {
    let rf = replication_factor.clamp(1, broker_ids.len().max(1));
    let partitions = (0..partitions)
        .map(|p| {
            let replicas: Vec<BrokerId> = (0..rf)
                .filter_map(|r| broker_ids.get((p + r) % broker_ids.len().max(1)).copied())
                .collect();
            SimPartition {
                leader: replicas.first().copied().unwrap_or(-1),
                replicas,
                log: Vec::new(),
                log_start: 0,
            }
        })
        .collect();
    SimTopic {
        partitions,
        config: default_topic_config(),
    }
}

/// Builder for [`SimCluster`].
#[derive(Debug)]
pub struct SimClusterBuilder {
    brokers: usize,
    host: String,
    base_port: u16,
    replication_factor: usize,
    topics: Vec<(String, usize)>,
}

impl Default for SimClusterBuilder {
    fn default() -> Self {
        Self {
            brokers: 1,
            host: "localhost".to_string(),
            base_port: 9092,
            replication_factor: 1,
            topics: Vec::new(),
        }
    }
}

impl SimClusterBuilder {
    pub fn brokers(mut self, count: usize) -> Self {
        self.brokers = count.max(1);
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    pub fn replication_factor(mut self, rf: usize) -> Self {
        self.replication_factor = rf;
        self
    }

    pub fn topic(mut self, name: impl Into<String>, partitions: usize) -> Self {
        self.topics.push((name.into(), partitions));
        self
    }

    pub fn build(self) -> SimCluster {
        let mut state = ClusterState::default();
        for i in 0..self.brokers {
            let id = i as BrokerId + 1;
            let endpoint = BrokerEndpoint::new(
                id,
                self.host.clone(),
                self.base_port.saturating_add(i as u16),
                BrokerRole::Follower,
            );
            state.brokers.insert(id, SimBroker { endpoint, up: true });
        }
        let broker_ids: Vec<BrokerId> = state.brokers.keys().copied().collect();
        for (name, partitions) in self.topics {
            let topic = build_topic(&broker_ids, partitions, self.replication_factor);
            state.topics.insert(name, topic);
        }

        SimCluster {
            state: Arc::new(Mutex::new(state)),
            requests: Arc::new(std::array::from_fn(|_| AtomicU64::new(0))),
            connections: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_places_leaders_round_robin() {
        let cluster = SimCluster::builder()
            .brokers(3)
            .replication_factor(2)
            .topic("orders", 3)
            .build();

        assert_eq!(cluster.leader(&TopicPartition::new("orders", 0)).await, Some(1));
        assert_eq!(cluster.leader(&TopicPartition::new("orders", 1)).await, Some(2));
        assert_eq!(cluster.leader(&TopicPartition::new("orders", 2)).await, Some(3));
        assert_eq!(
            cluster.bootstrap_servers().await,
            vec!["localhost:9092", "localhost:9093", "localhost:9094"]
        );
    }

    #[tokio::test]
    async fn test_truncate_moves_log_start() {
        let cluster = SimCluster::builder().topic("t", 1).build();
        let tp = TopicPartition::new("t", 0);
        for i in 0..5 {
            cluster.append(&tp, None, "v", i).await.unwrap();
        }
        cluster.truncate_before(&tp, 3).await;

        let records = cluster.records(&tp).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 3);
    }

    #[tokio::test]
    async fn test_fault_is_consumed() {
        let cluster = SimCluster::builder().build();
        cluster
            .inject_fault(None, Api::Produce, BrokerError::Timeout { broker_id: 1 }, 1)
            .await;

        assert!(cluster.enter(1, Api::Produce).await.is_err());
        assert!(cluster.enter(1, Api::Produce).await.is_ok());
        assert_eq!(cluster.request_count(Api::Produce), 2);
    }
}
