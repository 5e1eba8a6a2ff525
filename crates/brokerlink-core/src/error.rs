//! Broker Error Types
//!
//! Errors a broker (or the transport in front of it) can report back to a client.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - `Connection`: broker unreachable or the connection dropped mid-request
//! - `Timeout`: the broker did not answer within the request timeout
//!
//! ### Routing Errors
//! - `NotLeaderForPartition`: leadership moved since the client last refreshed metadata
//! - `CoordinatorNotAvailable` / `NotCoordinator`: the group coordinator moved or is loading
//! - `UnknownTopicOrPartition`: the topic or partition does not exist (or no longer does)
//!
//! ### Group Protocol Errors
//! - `RebalanceInProgress`: the group is rebalancing; the member must rejoin
//! - `IllegalGeneration`: the member's generation is older than the group's
//! - `UnknownMember`: the coordinator has expired or never knew the member
//!
//! ### Fetch Errors
//! - `OffsetOutOfRange`: the requested fetch offset is outside the retained log
//!
//! ## Classification
//! Clients drive their retry loops from two questions:
//! - [`BrokerError::is_retriable`]: can the same request succeed if sent again later?
//! - [`BrokerError::is_stale_routing`]: must cached routing be refreshed before retrying?

use thiserror::Error;

use crate::types::BrokerId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Connection to broker {broker_id} failed: {message}")]
    Connection { broker_id: BrokerId, message: String },

    #[error("Request to broker {broker_id} timed out")]
    Timeout { broker_id: BrokerId },

    #[error("Broker {broker_id} is not the leader for {topic}-{partition}")]
    NotLeaderForPartition {
        broker_id: BrokerId,
        topic: String,
        partition: i32,
    },

    #[error("Unknown topic or partition: {topic}-{partition}")]
    UnknownTopicOrPartition { topic: String, partition: i32 },

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Coordinator not available for group {0}")]
    CoordinatorNotAvailable(String),

    #[error("Broker {broker_id} is not the coordinator for group {group_id}")]
    NotCoordinator { broker_id: BrokerId, group_id: String },

    #[error("Group {0} is rebalancing")]
    RebalanceInProgress(String),

    #[error("Illegal generation {generation} for group {group_id}")]
    IllegalGeneration { group_id: String, generation: i32 },

    #[error("Unknown member {member_id} in group {group_id}")]
    UnknownMember { group_id: String, member_id: String },

    #[error("Offset {offset} out of range for {topic}-{partition}")]
    OffsetOutOfRange {
        topic: String,
        partition: i32,
        offset: i64,
    },

    #[error("Invalid broker address: {0}")]
    InvalidAddress(String),

    #[error("Broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether resending the same request later can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection { .. }
                | BrokerError::Timeout { .. }
                | BrokerError::NotLeaderForPartition { .. }
                | BrokerError::CoordinatorNotAvailable(_)
                | BrokerError::NotCoordinator { .. }
                | BrokerError::RebalanceInProgress(_)
        )
    }

    /// Whether the error means the client's cached routing is out of date.
    pub fn is_stale_routing(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection { .. }
                | BrokerError::NotLeaderForPartition { .. }
                | BrokerError::CoordinatorNotAvailable(_)
                | BrokerError::NotCoordinator { .. }
        )
    }

    /// Group membership is gone and the member must join again.
    pub fn requires_rejoin(&self) -> bool {
        matches!(
            self,
            BrokerError::RebalanceInProgress(_)
                | BrokerError::IllegalGeneration { .. }
                | BrokerError::UnknownMember { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let not_leader = BrokerError::NotLeaderForPartition {
            broker_id: 1,
            topic: "orders".to_string(),
            partition: 0,
        };
        assert!(not_leader.is_retriable());
        assert!(not_leader.is_stale_routing());

        let rebalance = BrokerError::RebalanceInProgress("g".to_string());
        assert!(rebalance.is_retriable());
        assert!(!rebalance.is_stale_routing());
        assert!(rebalance.requires_rejoin());

        let out_of_range = BrokerError::OffsetOutOfRange {
            topic: "orders".to_string(),
            partition: 0,
            offset: 99,
        };
        assert!(!out_of_range.is_retriable());
        assert!(!out_of_range.requires_rejoin());

        assert!(!BrokerError::UnknownTopic("x".to_string()).is_retriable());
    }

    #[test]
    fn test_display() {
        let err = BrokerError::Connection {
            broker_id: 2,
            message: "refused".to_string(),
        };
        assert_eq!(err.to_string(), "Connection to broker 2 failed: refused");
    }
}
