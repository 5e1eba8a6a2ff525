//! Broker Transport Abstraction
//!
//! The client core never speaks a wire protocol itself. It talks to brokers through
//! these two traits, so any request/response transport can sit underneath.
//!
//! ## Implementations
//! - An RPC transport for a real cluster (provided by the embedding application)
//! - `brokerlink-sim`: in-memory cluster for tests and local development
//!
//! ## Contract
//! - A connection is bound to one broker. Every call reports failures as [`BrokerError`].
//! - A broker that is not the partition leader answers produce and fetch with
//!   `NotLeaderForPartition`; a broker that is not the group coordinator answers group
//!   calls with `NotCoordinator`.
//! - Connections may be shared by concurrent callers; implementations serialize
//!   requests internally if the underlying channel requires it.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{
    FetchRequest, FetchResponse, HeartbeatRequest, JoinGroupRequest, JoinGroupResponse,
    LeaveGroupRequest, ListOffsetsResponse, MetadataResponse, OffsetCommitRequest,
    OffsetFetchRequest, OffsetFetchResponse, OffsetSpec, ProduceRequest, ProduceResponse,
    SyncGroupRequest, SyncGroupResponse, TopicConfig, TopicFilter,
};
use crate::types::{BrokerEndpoint, BrokerId, TopicPartition};

/// Opens connections to brokers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the broker at `endpoint`.
    ///
    /// The returned connection reports the broker's real id, which may differ from
    /// `endpoint.id` when the endpoint came from the bootstrap list.
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerConnection>>;
}

/// An established connection to a single broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn broker_id(&self) -> BrokerId;

    // ---- Metadata ----

    async fn metadata(&self, filter: &TopicFilter) -> Result<MetadataResponse>;

    async fn describe_configs(&self, topic: &str) -> Result<TopicConfig>;

    // ---- Data plane ----

    async fn produce(&self, request: ProduceRequest) -> Result<ProduceResponse>;

    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;

    async fn list_offsets(&self, tp: &TopicPartition, spec: OffsetSpec)
        -> Result<ListOffsetsResponse>;

    // ---- Group coordination ----

    async fn find_coordinator(&self, group_id: &str) -> Result<BrokerEndpoint>;

    async fn join_group(&self, request: JoinGroupRequest) -> Result<JoinGroupResponse>;

    async fn sync_group(&self, request: SyncGroupRequest) -> Result<SyncGroupResponse>;

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<()>;

    async fn leave_group(&self, request: LeaveGroupRequest) -> Result<()>;

    async fn commit_offsets(&self, request: OffsetCommitRequest) -> Result<()>;

    async fn fetch_offsets(&self, request: OffsetFetchRequest) -> Result<OffsetFetchResponse>;
}
