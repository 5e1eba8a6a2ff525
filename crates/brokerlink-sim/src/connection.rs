//! Transport implementation backed by the simulated cluster.

use std::sync::Arc;

use async_trait::async_trait;
use brokerlink_core::protocol::{
    FetchRequest, FetchResponse, HeartbeatRequest, JoinGroupRequest, JoinGroupResponse,
    LeaveGroupRequest, ListOffsetsResponse, MetadataResponse, OffsetCommitRequest,
    OffsetFetchRequest, OffsetFetchResponse, OffsetSpec, ProduceRequest, ProduceResponse,
    SyncGroupRequest, SyncGroupResponse, TopicConfig, TopicFilter,
};
use brokerlink_core::{
    BrokerConnection, BrokerEndpoint, BrokerError, BrokerId, BrokerRole, Connector, Result,
    TopicPartition,
};
use tracing::debug;

use crate::cluster::{Api, ClusterState, SimCluster, SimPartition};

#[async_trait]
impl Connector for SimCluster {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerConnection>> {
        let state = self.state.lock().await;
        let broker = state
            .brokers
            .values()
            .find(|b| b.endpoint.host == endpoint.host && b.endpoint.port == endpoint.port)
            .ok_or_else(|| BrokerError::Connection {
                broker_id: endpoint.id,
                message: format!("no broker listening on {}", endpoint.address()),
            })?;
        if !broker.up {
            return Err(BrokerError::Connection {
                broker_id: endpoint.id,
                message: format!("connection refused by {}", endpoint.address()),
            });
        }
        let broker_id = broker.endpoint.id;
        drop(state);

        self.record_connection();
        debug!(broker_id, address = %endpoint.address(), "Simulated connection opened");
        Ok(Arc::new(SimConnection {
            cluster: self.clone(),
            broker_id,
        }))
    }
}

/// A connection to one simulated broker.
#[derive(Debug)]
pub struct SimConnection {
    cluster: SimCluster,
    broker_id: BrokerId,
}

impl SimConnection {
    fn leader_partition<'a>(
        &self,
        state: &'a ClusterState,
        tp: &TopicPartition,
    ) -> Result<&'a SimPartition> {
        let partition = state.partition(tp)?;
        if partition.leader != self.broker_id {
            return Err(BrokerError::NotLeaderForPartition {
                broker_id: self.broker_id,
                topic: tp.topic.clone(),
                partition: tp.partition,
            });
        }
        Ok(partition)
    }

    fn check_coordinator(&self, state: &ClusterState, group_id: &str) -> Result<()> {
        if state.coordinator_for(group_id) != Some(self.broker_id) {
            return Err(BrokerError::NotCoordinator {
                broker_id: self.broker_id,
                group_id: group_id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for SimConnection {
    fn broker_id(&self) -> BrokerId {
        self.broker_id
    }

    async fn metadata(&self, filter: &TopicFilter) -> Result<MetadataResponse> {
        self.cluster.enter(self.broker_id, Api::Metadata).await?;
        let state = self.cluster.state.lock().await;
        let brokers = state.brokers.values().map(|b| b.endpoint.clone()).collect();
        let topics = state
            .topics
            .iter()
            .filter(|(name, _)| filter.matches(name))
            .map(|(name, topic)| state.topic_metadata(name, topic))
            .collect();
        Ok(MetadataResponse { brokers, topics })
    }

    async fn describe_configs(&self, topic: &str) -> Result<TopicConfig> {
        self.cluster.enter(self.broker_id, Api::DescribeConfigs).await?;
        let state = self.cluster.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|t| t.config.clone())
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))
    }

    async fn produce(&self, request: ProduceRequest) -> Result<ProduceResponse> {
        self.cluster.enter(self.broker_id, Api::Produce).await?;
        let mut state = self.cluster.state.lock().await;
        self.leader_partition(&state, &request.tp)?;
        let partition = state.partition_mut(&request.tp)?;
        let count = request.records.len();
        let base_offset = partition.append(request.records);
        debug!(tp = %request.tp, base_offset, count, "Appended records");
        Ok(ProduceResponse { base_offset })
    }

    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        self.cluster.enter(self.broker_id, Api::Fetch).await?;
        let state = self.cluster.state.lock().await;
        let partition = self.leader_partition(&state, &request.tp)?;
        let high_watermark = partition.high_watermark();
        if request.offset < partition.log_start || request.offset > high_watermark {
            return Err(BrokerError::OffsetOutOfRange {
                topic: request.tp.topic,
                partition: request.tp.partition,
                offset: request.offset,
            });
        }
        Ok(FetchResponse {
            records: partition.read(request.offset, request.max_records),
            high_watermark,
            log_start_offset: partition.log_start,
        })
    }

    async fn list_offsets(
        &self,
        tp: &TopicPartition,
        spec: OffsetSpec,
    ) -> Result<ListOffsetsResponse> {
        self.cluster.enter(self.broker_id, Api::ListOffsets).await?;
        let state = self.cluster.state.lock().await;
        let partition = self.leader_partition(&state, tp)?;
        let high_watermark = partition.high_watermark();
        let offset = match spec {
            OffsetSpec::Earliest => Some(partition.log_start),
            OffsetSpec::Latest => Some(high_watermark),
            OffsetSpec::Timestamp(ts) => partition.offset_for_timestamp(ts),
        };
        Ok(ListOffsetsResponse {
            offset,
            high_watermark,
        })
    }

    async fn find_coordinator(&self, group_id: &str) -> Result<BrokerEndpoint> {
        self.cluster.enter(self.broker_id, Api::FindCoordinator).await?;
        let state = self.cluster.state.lock().await;
        let coordinator = state
            .coordinator_for(group_id)
            .filter(|id| state.broker_up(*id))
            .and_then(|id| state.brokers.get(&id))
            .ok_or_else(|| BrokerError::CoordinatorNotAvailable(group_id.to_string()))?;
        Ok(coordinator.endpoint.clone().with_role(BrokerRole::Coordinator))
    }

    async fn join_group(&self, request: JoinGroupRequest) -> Result<JoinGroupResponse> {
        self.cluster.enter(self.broker_id, Api::JoinGroup).await?;
        let mut state = self.cluster.state.lock().await;
        self.check_coordinator(&state, &request.group_id)?;
        Ok(state.groups.join_group(request))
    }

    async fn sync_group(&self, request: SyncGroupRequest) -> Result<SyncGroupResponse> {
        self.cluster.enter(self.broker_id, Api::SyncGroup).await?;
        let mut state = self.cluster.state.lock().await;
        self.check_coordinator(&state, &request.group_id)?;
        state.groups.sync_group(request)
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<()> {
        self.cluster.enter(self.broker_id, Api::Heartbeat).await?;
        let mut state = self.cluster.state.lock().await;
        self.check_coordinator(&state, &request.group_id)?;
        state
            .groups
            .heartbeat(&request.group_id, request.generation, &request.member_id)
    }

    async fn leave_group(&self, request: LeaveGroupRequest) -> Result<()> {
        self.cluster.enter(self.broker_id, Api::LeaveGroup).await?;
        let mut state = self.cluster.state.lock().await;
        self.check_coordinator(&state, &request.group_id)?;
        state.groups.leave_group(&request.group_id, &request.member_id)
    }

    async fn commit_offsets(&self, request: OffsetCommitRequest) -> Result<()> {
        self.cluster.enter(self.broker_id, Api::OffsetCommit).await?;
        let mut state = self.cluster.state.lock().await;
        self.check_coordinator(&state, &request.group_id)?;
        state.groups.commit_offsets(request)
    }

    async fn fetch_offsets(&self, request: OffsetFetchRequest) -> Result<OffsetFetchResponse> {
        self.cluster.enter(self.broker_id, Api::OffsetFetch).await?;
        let mut state = self.cluster.state.lock().await;
        self.check_coordinator(&state, &request.group_id)?;
        Ok(state
            .groups
            .fetch_offsets(&request.group_id, &request.partitions))
    }
}
