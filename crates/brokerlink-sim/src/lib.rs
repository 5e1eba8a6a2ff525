//! brokerlink-sim: an in-memory broker cluster
//!
//! Implements the brokerlink transport traits against shared in-process state so the
//! client can be exercised without a real cluster.
//!
//! ## What It Models
//!
//! - Brokers that can be taken down and brought back
//! - Partition logs with leaders, replicas and a retention start offset
//! - Leadership moves (clients see `NotLeaderForPartition` until they refresh)
//! - A group coordinator running the join/sync/heartbeat protocol with generations,
//!   leader-provided assignments, session expiry and committed offsets
//! - Per-topic configuration
//! - Injected faults and latency per API
//!
//! ## What It Does Not Model
//!
//! Replication lag, automatic leader election and request pipelining. Every append is
//! immediately committed (the high-water mark is the log end).
//!
//! ## Example
//!
//! ```ignore
//! use brokerlink_sim::{Api, SimCluster};
//!
//! let cluster = SimCluster::builder().brokers(3).topic("orders", 3).build();
//! cluster.move_leader(&TopicPartition::new("orders", 0), 2).await;
//! let producer = Producer::builder()
//!     .bootstrap_servers(vec!["localhost:9092".to_string()])
//!     .connector(Arc::new(cluster.clone()))
//!     .build()
//!     .await?;
//! ```

pub mod cluster;
pub mod connection;
pub mod coordinator;

pub use cluster::{default_topic_config, Api, SimCluster, SimClusterBuilder};
pub use connection::SimConnection;
pub use coordinator::GroupState;
