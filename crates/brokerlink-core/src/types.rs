//! Cluster Data Model
//!
//! Identifiers and routing metadata shared by every brokerlink component.
//!
//! ## Types Overview
//!
//! ### BrokerEndpoint
//! Network location of a broker node plus the role it plays for the request at hand.
//! Bootstrap endpoints parsed from `host:port` strings have negative synthetic ids
//! until a metadata response names the real brokers.
//!
//! ### TopicPartition
//! The routing and offset-bookkeeping key. Immutable and hashable.
//!
//! ### PartitionMetadata
//! Leadership, replica placement and watermarks for one partition. A metadata refresh
//! replaces these wholesale; nothing patches individual fields.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::BrokerError;

/// Broker node identifier. Negative ids belong to bootstrap endpoints.
pub type BrokerId = i32;

/// Role a broker plays relative to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrokerRole {
    Leader,
    Follower,
    Coordinator,
}

/// Network location of a broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    pub id: BrokerId,
    pub host: String,
    pub port: u16,
    pub role: BrokerRole,
}

impl BrokerEndpoint {
    pub fn new(id: BrokerId, host: impl Into<String>, port: u16, role: BrokerRole) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            role,
        }
    }

    /// Parse a `host:port` bootstrap entry.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::InvalidAddress` if the entry has no port, an empty host,
    /// or a port that is not a valid `u16`.
    pub fn parse(id: BrokerId, address: &str) -> Result<Self, BrokerError> {
        let address = address.trim();
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| BrokerError::InvalidAddress(address.to_string()))?;
        if host.is_empty() {
            return Err(BrokerError::InvalidAddress(address.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| BrokerError::InvalidAddress(address.to_string()))?;
        Ok(Self::new(id, host, port, BrokerRole::Follower))
    }

    /// `host:port` form of the endpoint.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Same endpoint with a different role.
    pub fn with_role(mut self, role: BrokerRole) -> Self {
        self.role = role;
        self
    }

    pub fn is_bootstrap(&self) -> bool {
        self.id < 0
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

/// Topic name plus partition index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
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

/// Routing metadata for a single partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub tp: TopicPartition,

    /// Broker currently leading the partition
    pub leader: BrokerId,

    /// Replica brokers in preference order
    pub replicas: Vec<BrokerId>,

    /// Replicas currently in sync with the leader
    pub in_sync_replicas: BTreeSet<BrokerId>,

    /// First offset still present in the log
    pub earliest_offset: i64,

    /// High-water mark (one past the last replicated record)
    pub latest_offset: i64,
}

/// All partitions of one topic as reported by a metadata response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
}

impl TopicMetadata {
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bootstrap_endpoint() {
        let endpoint = BrokerEndpoint::parse(-1, "localhost:9092").unwrap();
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 9092);
        assert!(endpoint.is_bootstrap());
        assert_eq!(endpoint.address(), "localhost:9092");
    }

    #[test]
    fn test_parse_rejects_bad_addresses() {
        assert!(BrokerEndpoint::parse(-1, "localhost").is_err());
        assert!(BrokerEndpoint::parse(-1, ":9092").is_err());
        assert!(BrokerEndpoint::parse(-1, "localhost:notaport").is_err());
        assert!(BrokerEndpoint::parse(-1, "localhost:70000").is_err());
    }

    #[test]
    fn test_topic_partition_display_and_order() {
        let a = TopicPartition::new("orders", 0);
        let b = TopicPartition::new("orders", 2);
        assert_eq!(a.to_string(), "orders-0");
        assert!(a < b);
    }
}
