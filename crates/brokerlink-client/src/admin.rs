//! Admin Queries
//!
//! Read-only cluster inspection: topic listings, per-topic summaries, partition
//! layouts with live watermarks, and topic configuration.
//!
//! Every result is an owned value the caller keeps after the handle is closed.

use std::time::Duration;

use brokerlink_core::protocol::TopicConfig;
use brokerlink_core::{BrokerId, TopicPartition};
use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::cluster::Cluster;
use crate::connection_pool::call;
use crate::error::{ClientError, Result};
use crate::offsets::OffsetResolver;
use crate::retry::retry_with_deadline;

/// Topic summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicInfo {
    pub name: String,
    pub partition_count: i32,

    /// Average replica count per partition, rounded down
    pub replication_factor: i32,
}

/// Layout and watermarks of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionDetails {
    pub id: i32,
    pub leader: BrokerId,
    pub replicas: Vec<BrokerId>,
    pub in_sync_replicas: Vec<BrokerId>,
    pub earliest_offset: i64,
    pub latest_offset: i64,
}

#[derive(Clone)]
pub struct Admin {
    cluster: Cluster,
    resolver: OffsetResolver,
}

impl Admin {
    pub fn new(cluster: Cluster) -> Self {
        Self {
            resolver: OffsetResolver::new(&cluster),
            cluster,
        }
    }

    /// Non-internal topic names, sorted.
    ///
    /// Transient failures are retried until `timeout` runs out.
    pub async fn list_topics(&self, timeout: Duration) -> Result<Vec<String>> {
        let deadline = Instant::now() + timeout;
        let metadata = self.cluster.metadata();
        let listing = retry_with_deadline(&self.cluster.config().retry, Some(deadline), || {
            metadata.list_topics()
        });
        tokio::time::timeout_at(deadline, listing)
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
    }

    pub async fn topic_info(&self, topic: &str) -> Result<TopicInfo> {
        let metadata = self.cluster.metadata().topic_metadata(topic).await?;
        let partition_count = metadata.partition_count() as i32;
        let total_replicas: usize = metadata.partitions.iter().map(|p| p.replicas.len()).sum();
        let replication_factor = if partition_count > 0 {
            total_replicas as i32 / partition_count
        } else {
            0
        };

        Ok(TopicInfo {
            name: metadata.name,
            partition_count,
            replication_factor,
        })
    }

    /// Partition layout of `topic` with live watermarks.
    ///
    /// When a live watermark lookup fails, the offsets from the last metadata
    /// response are reported instead.
    pub async fn partition_details(&self, topic: &str) -> Result<Vec<PartitionDetails>> {
        let partitions = self.cluster.metadata().get_partitions(topic).await?;

        let lookups = partitions.into_iter().map(|p| async move {
            let (earliest_offset, latest_offset) = match self.resolver.watermarks(&p.tp).await {
                Ok(watermarks) => watermarks,
                Err(e) => {
                    debug!(partition = %p.tp, error = %e, "Live watermarks unavailable, using cached offsets");
                    (p.earliest_offset, p.latest_offset)
                }
            };
            PartitionDetails {
                id: p.tp.partition,
                leader: p.leader,
                replicas: p.replicas,
                in_sync_replicas: p.in_sync_replicas.into_iter().collect(),
                earliest_offset,
                latest_offset,
            }
        });

        Ok(join_all(lookups).await)
    }

    /// Configuration entries of `topic`, asked of the leader of its first partition.
    pub async fn describe_topic_config(&self, topic: &str) -> Result<TopicConfig> {
        let metadata = self.cluster.metadata();
        let first = TopicPartition::new(topic, 0);
        let broker_id = metadata.leader_for(&first.topic, first.partition).await?;
        let conn = self.cluster.pool().acquire(broker_id).await?;
        call(
            self.cluster.config().request_timeout,
            conn.describe_configs(topic),
        )
        .await
    }
}

impl std::fmt::Debug for Admin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admin").field("cluster", &self.cluster).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::error::ErrorKind;
    use brokerlink_sim::SimCluster;
    use std::sync::Arc;

    async fn admin_for(sim: &SimCluster) -> Admin {
        let config = ClientConfig::builder()
            .bootstrap_servers(["localhost:9092"])
            .build();
        Admin::new(Cluster::connect(Arc::new(sim.clone()), config).await.unwrap())
    }

    #[tokio::test]
    async fn test_list_topics_hides_internal() {
        let sim = SimCluster::builder()
            .topic("orders", 3)
            .topic("__consumer_offsets", 1)
            .build();
        let admin = admin_for(&sim).await;

        let topics = admin.list_topics(Duration::from_secs(1)).await.unwrap();
        assert_eq!(topics, vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_list_topics_rides_out_broker_outage() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let admin = admin_for(&sim).await;
        sim.set_broker_down(1).await;

        let restarter = sim.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            restarter.set_broker_up(1).await;
        });

        let topics = admin.list_topics(Duration::from_secs(5)).await.unwrap();
        assert_eq!(topics, vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_list_topics_gives_up_at_timeout() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let admin = admin_for(&sim).await;
        sim.set_broker_down(1).await;

        let started = std::time::Instant::now();
        let err = admin.list_topics(Duration::from_millis(150)).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Connection | ErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_topic_info_replication_factor() {
        let sim = SimCluster::builder().brokers(3).build();
        sim.create_topic("orders", 4, 2).await;
        let admin = admin_for(&sim).await;

        let info = admin.topic_info("orders").await.unwrap();
        assert_eq!(info.partition_count, 4);
        assert_eq!(info.replication_factor, 2);

        let err = admin.topic_info("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_partition_details_live_watermarks() {
        let sim = SimCluster::builder().brokers(2).topic("orders", 2).build();
        let p1 = TopicPartition::new("orders", 1);
        for i in 0..3 {
            sim.append(&p1, None, "v", i).await.unwrap();
        }
        let admin = admin_for(&sim).await;

        let details = admin.partition_details("orders").await.unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[1].id, 1);
        assert_eq!(details[1].leader, 2);
        assert_eq!((details[1].earliest_offset, details[1].latest_offset), (0, 3));
        assert_eq!((details[0].earliest_offset, details[0].latest_offset), (0, 0));
    }

    #[tokio::test]
    async fn test_partition_details_falls_back_to_cached_offsets() {
        let sim = SimCluster::builder().brokers(2).topic("orders", 2).build();
        let p1 = TopicPartition::new("orders", 1);
        sim.append(&p1, None, "v", 1).await.unwrap();
        let admin = admin_for(&sim).await;
        admin.topic_info("orders").await.unwrap();

        sim.set_broker_down(2).await;
        let details = admin.partition_details("orders").await.unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[1].leader, 2);
    }

    #[tokio::test]
    async fn test_describe_topic_config() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        sim.set_topic_config("orders", "retention.ms", "604800000").await;
        let admin = admin_for(&sim).await;

        let config = admin.describe_topic_config("orders").await.unwrap();
        assert_eq!(config.get("retention.ms").map(String::as_str), Some("604800000"));

        let err = admin.describe_topic_config("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
