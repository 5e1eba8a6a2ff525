//! Error types for brokerlink client operations.
//!
//! Every fallible client call returns [`ClientError`]. Each variant maps to a stable
//! [`ErrorKind`] so callers (and the handle layer) can branch on the kind without
//! matching on message text, while `Display` carries the human-readable detail.
//!
//! ## Error Handling Strategy
//!
//! - **Retried internally**: `NotLeaderForPartition`, transient `Broker` errors
//! - **Retryable by caller**: `Connection`, `MetadataUnavailable`, `Timeout`
//! - **Terminal**: `SendFailed`, `SubscriptionError`, `InvalidArgument`, `Config`
//! - **Informational**: `RebalanceInProgress`, `Cancelled`
//!
//! ## Examples
//!
//! ```ignore
//! use brokerlink_client::{ClientError, ErrorKind};
//!
//! match producer.send_and_wait(message, Duration::from_secs(5)).await {
//!     Ok(ack) => println!("stored at {}-{}@{}", ack.topic, ack.partition, ack.offset),
//!     Err(e) if e.kind() == ErrorKind::NotFound => eprintln!("no such topic"),
//!     Err(e) => eprintln!("send failed: {}", e),
//! }
//! ```

use std::time::Duration;

use brokerlink_core::BrokerError;
use thiserror::Error;

/// Convenience type alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Stable classification of a [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    MetadataUnavailable,
    NotLeaderForPartition,
    SendFailed,
    SubscriptionError,
    RebalanceInProgress,
    Cancelled,
    NotFound,
    Timeout,
    InvalidArgument,
    Config,
    Closed,
    Broker,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::MetadataUnavailable => "MetadataUnavailable",
            ErrorKind::NotLeaderForPartition => "NotLeaderForPartition",
            ErrorKind::SendFailed => "SendFailed",
            ErrorKind::SubscriptionError => "SubscriptionError",
            ErrorKind::RebalanceInProgress => "RebalanceInProgress",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::Config => "Config",
            ErrorKind::Closed => "Closed",
            ErrorKind::Broker => "Broker",
            ErrorKind::Internal => "Internal",
        }
    }
}

/// Error type for brokerlink client operations.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// A broker could not be reached.
    ///
    /// ## Causes
    /// - Broker is down or restarting
    /// - Address book has no entry for the broker (it left the cluster)
    /// - Connect did not finish within the connect timeout
    ///
    /// ## Resolution
    /// - Retry after a backoff; the client refreshes routing on the next attempt
    #[error("Connection to broker {broker} failed: {message}")]
    Connection { broker: String, message: String },

    /// Routing metadata could not be obtained and no cached copy exists.
    ///
    /// Stale cached metadata never produces this error; it is served with a warning.
    #[error("Metadata unavailable for {0}")]
    MetadataUnavailable(String),

    /// The broker the client routed to no longer leads the partition.
    ///
    /// Handled internally by refresh and retry; only surfaced when retries run out
    /// outside the producer (which wraps it in `SendFailed`).
    #[error("Broker {broker_id} is not the leader for {topic}-{partition}")]
    NotLeaderForPartition {
        broker_id: i32,
        topic: String,
        partition: i32,
    },

    /// A send was abandoned after exhausting retries or hitting a permanent error.
    #[error("Send to {topic}-{partition} failed after {attempts} attempt(s): {source}")]
    SendFailed {
        topic: String,
        partition: i32,
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },

    /// Subscribing failed: a topic does not exist or the coordinator is unreachable.
    #[error("Subscription failed: {0}")]
    SubscriptionError(String),

    /// The consumer group is rebalancing. Transient.
    #[error("Rebalance in progress for group '{0}'")]
    RebalanceInProgress(String),

    /// The operation was cancelled before completing.
    ///
    /// Returned to pending sends when a producer closes, and to callers whose
    /// delivery future lost its sender.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Topic or partition does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation exceeded its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid client configuration.
    ///
    /// ## Causes
    /// - Unknown property key passed to `set`
    /// - Value that does not parse for its key (e.g. `linger.ms=soon`)
    /// - Missing required field (bootstrap servers, group id)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The handle was closed.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// A broker rejected the request.
    #[error("Broker error: {0}")]
    Broker(#[source] BrokerError),

    /// Internal error that shouldn't normally occur.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Connection { .. } => ErrorKind::Connection,
            ClientError::MetadataUnavailable(_) => ErrorKind::MetadataUnavailable,
            ClientError::NotLeaderForPartition { .. } => ErrorKind::NotLeaderForPartition,
            ClientError::SendFailed { .. } => ErrorKind::SendFailed,
            ClientError::SubscriptionError(_) => ErrorKind::SubscriptionError,
            ClientError::RebalanceInProgress(_) => ErrorKind::RebalanceInProgress,
            ClientError::Cancelled(_) => ErrorKind::Cancelled,
            ClientError::NotFound(_) => ErrorKind::NotFound,
            ClientError::Timeout(_) => ErrorKind::Timeout,
            ClientError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ClientError::Config(_) => ErrorKind::Config,
            ClientError::Closed(_) => ErrorKind::Closed,
            ClientError::Broker(_) => ErrorKind::Broker,
            ClientError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether repeating the operation after a backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Connection { .. }
            | ClientError::MetadataUnavailable(_)
            | ClientError::NotLeaderForPartition { .. }
            | ClientError::RebalanceInProgress(_)
            | ClientError::Timeout(_) => true,
            ClientError::Broker(e) => e.is_retriable(),
            _ => false,
        }
    }

    /// Whether cached routing (partition leader, coordinator, connection) should be
    /// dropped before the next attempt.
    pub fn is_stale_routing(&self) -> bool {
        match self {
            ClientError::Connection { .. } | ClientError::NotLeaderForPartition { .. } => true,
            ClientError::Broker(e) => e.is_stale_routing(),
            _ => false,
        }
    }

    /// Convert a broker-reported error, lifting the kinds the client distinguishes.
    pub fn from_broker(error: BrokerError) -> Self {
        match error {
            BrokerError::Connection { broker_id, message } => ClientError::Connection {
                broker: broker_id.to_string(),
                message,
            },
            BrokerError::Timeout { broker_id } => ClientError::Connection {
                broker: broker_id.to_string(),
                message: "request timed out".to_string(),
            },
            BrokerError::NotLeaderForPartition {
                broker_id,
                topic,
                partition,
            } => ClientError::NotLeaderForPartition {
                broker_id,
                topic,
                partition,
            },
            BrokerError::UnknownTopic(topic) => ClientError::NotFound(format!("topic '{}'", topic)),
            BrokerError::UnknownTopicOrPartition { topic, partition } => {
                ClientError::NotFound(format!("partition {}-{}", topic, partition))
            }
            BrokerError::RebalanceInProgress(group) => ClientError::RebalanceInProgress(group),
            other => ClientError::Broker(other),
        }
    }
}

impl From<BrokerError> for ClientError {
    fn from(error: BrokerError) -> Self {
        ClientError::from_broker(error)
    }
}
