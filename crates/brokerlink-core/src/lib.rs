//! brokerlink core types
//!
//! Data model, broker transport contract and broker-side errors shared by the
//! client and by transport implementations.

pub mod error;
pub mod protocol;
pub mod record;
pub mod transport;
pub mod types;

pub use error::{BrokerError, Result};
pub use protocol::{OffsetSpec, TopicFilter};
pub use record::{ProduceRecord, Record};
pub use transport::{BrokerConnection, Connector};
pub use types::{
    BrokerEndpoint, BrokerId, BrokerRole, PartitionMetadata, TopicMetadata, TopicPartition,
};
