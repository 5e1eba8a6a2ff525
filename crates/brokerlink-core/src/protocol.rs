//! Request and response shapes exchanged with brokers.
//!
//! These are protocol-agnostic: a transport maps them to whatever wire format the
//! broker speaks. Group-protocol messages follow the classic join/sync/heartbeat
//! cycle where the group leader computes the assignment client-side.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::record::{ProduceRecord, Record};
use crate::types::{BrokerEndpoint, TopicMetadata, TopicPartition};

/// Which topics a metadata request asks about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    /// Every topic the cluster knows, internal ones included
    All,
    /// Only the named topics; unknown names are omitted from the response
    Only(Vec<String>),
}

impl TopicFilter {
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Only(topics) => topics.iter().any(|t| t == topic),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub brokers: Vec<BrokerEndpoint>,
    pub topics: Vec<TopicMetadata>,
}

impl MetadataResponse {
    pub fn topic(&self, name: &str) -> Option<&TopicMetadata> {
        self.topics.iter().find(|t| t.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub tp: TopicPartition,
    pub records: Vec<ProduceRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProduceResponse {
    /// Offset assigned to the first record of the request
    pub base_offset: i64,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub tp: TopicPartition,
    pub offset: i64,
    pub max_records: usize,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub records: Vec<Record>,
    pub high_watermark: i64,
    pub log_start_offset: i64,
}

/// Which offset a list-offsets lookup asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetSpec {
    Earliest,
    Latest,
    /// Earliest offset whose record timestamp is at or after the given milliseconds
    Timestamp(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOffsetsResponse {
    /// `None` when a timestamp lookup found no record at or after the target
    pub offset: Option<i64>,
    pub high_watermark: i64,
}

#[derive(Debug, Clone)]
pub struct JoinGroupRequest {
    pub group_id: String,
    /// `None` on first join; the coordinator assigns one
    pub member_id: Option<String>,
    pub client_id: String,
    pub session_timeout_ms: u64,
    pub topics: Vec<String>,
}

/// A member's subscription as reported to the group leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub member_id: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct JoinGroupResponse {
    pub generation: i32,
    pub member_id: String,
    pub leader_id: String,
    /// Populated only for the leader
    pub members: Vec<GroupMember>,
}

impl JoinGroupResponse {
    pub fn is_leader(&self) -> bool {
        self.member_id == self.leader_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAssignment {
    pub member_id: String,
    pub partitions: Vec<TopicPartition>,
}

#[derive(Debug, Clone)]
pub struct SyncGroupRequest {
    pub group_id: String,
    pub generation: i32,
    pub member_id: String,
    /// Empty for followers
    pub assignments: Vec<MemberAssignment>,
}

#[derive(Debug, Clone)]
pub struct SyncGroupResponse {
    pub partitions: Vec<TopicPartition>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatRequest {
    pub group_id: String,
    pub generation: i32,
    pub member_id: String,
}

#[derive(Debug, Clone)]
pub struct LeaveGroupRequest {
    pub group_id: String,
    pub member_id: String,
}

#[derive(Debug, Clone)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    /// `-1` commits outside group membership
    pub generation: i32,
    pub member_id: String,
    pub offsets: BTreeMap<TopicPartition, i64>,
}

#[derive(Debug, Clone)]
pub struct OffsetFetchRequest {
    pub group_id: String,
    pub partitions: Vec<TopicPartition>,
}

/// Committed offsets; partitions without a commit are absent.
pub type OffsetFetchResponse = BTreeMap<TopicPartition, i64>;

/// Topic configuration entries keyed by property name.
pub type TopicConfig = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_filter() {
        assert!(TopicFilter::All.matches("__consumer_offsets"));
        let only = TopicFilter::Only(vec!["orders".to_string()]);
        assert!(only.matches("orders"));
        assert!(!only.matches("payments"));
    }
}
