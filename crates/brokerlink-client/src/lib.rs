//! brokerlink client: Producer, Consumer and Admin APIs
//!
//! This crate talks to a cluster of partitioned message brokers through the
//! transport contract in `brokerlink-core`. It handles broker discovery, partition
//! routing, batching, consumer-group membership, offset management and retries.
//!
//! # Examples
//!
//! ## Producer
//!
//! ```ignore
//! use brokerlink_client::{Message, Producer};
//!
//! let producer = Producer::builder()
//!     .bootstrap_servers(["localhost:9092"])
//!     .connector(connector)
//!     .build()
//!     .await?;
//!
//! let ack = producer
//!     .send(Message::new("orders", "order-1").with_key("cust-42"))
//!     .await?
//!     .await?;
//! ```
//!
//! ## Consumer
//!
//! ```ignore
//! use brokerlink_client::{Consumer, OffsetReset};
//!
//! let consumer = Consumer::builder()
//!     .bootstrap_servers(["localhost:9092"])
//!     .group_id("analytics")
//!     .auto_offset_reset(OffsetReset::Earliest)
//!     .connector(connector)
//!     .build()
//!     .await?;
//!
//! consumer.subscribe(&["orders"]).await?;
//! for record in consumer.poll(Duration::from_secs(1)).await? {
//!     println!("Received: {:?}", record);
//! }
//! ```

pub mod admin;
pub mod assignor;
pub mod batch;
pub mod cluster;
pub mod config;
pub mod connection_pool;
pub mod consumer;
pub mod error;
pub mod handle;
pub mod metadata;
pub mod offsets;
pub mod partitioner;
pub mod producer;
pub mod retry;

pub use admin::{Admin, PartitionDetails, TopicInfo};
pub use cluster::Cluster;
pub use config::{ClientConfig, ConsumerConfig, OffsetReset, ProducerConfig};
pub use connection_pool::ConnectionPool;
pub use consumer::{ConsumedRecord, Consumer, ConsumerBuilder, MemberState, PollBatch};
pub use error::{ClientError, ErrorKind, Result};
pub use handle::{ClientHandle, ConsumerHandle, ProducerHandle};
pub use metadata::MetadataCache;
pub use offsets::{OffsetResolver, TimestampOffset};
pub use partitioner::Partitioner;
pub use producer::{DeliveryFuture, Message, Producer, ProducerBuilder, RecordAck};
pub use retry::{retry_with_deadline, retry_with_jittered_backoff, RetryPolicy};

pub use brokerlink_core::{OffsetSpec, TopicPartition};
