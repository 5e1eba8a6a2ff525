//! Metadata Cache
//!
//! Tracks topic → partition → leader routing and group → coordinator placement.
//!
//! ## Freshness
//!
//! Every topic entry carries its fetch time. An entry is **stale** once it is older
//! than `metadata_max_age` or after [`MetadataCache::invalidate`] marks it. Lookups
//! behave as follows:
//!
//! | Cache state | Refresh outcome | Result                                  |
//! |-------------|-----------------|-----------------------------------------|
//! | fresh       | not attempted   | cached entry                            |
//! | stale       | in background   | cached entry, warning logged            |
//! | missing     | succeeds        | new entry, or `NotFound` if absent      |
//! | missing     | fails           | `MetadataUnavailable`                   |
//!
//! Background refreshes are de-duplicated per topic.
//!
//! ## Refresh
//!
//! A refresh sends one metadata request with an explicit topic filter to the first
//! known broker that answers (real brokers first, then the bootstrap list), replaces
//! the returned entries and the connection pool's address book, and drops entries
//! for requested topics the cluster no longer reports.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use brokerlink_core::protocol::MetadataResponse;
use brokerlink_core::{BrokerEndpoint, BrokerId, PartitionMetadata, TopicFilter, TopicMetadata};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection_pool::{call, ConnectionPool};
use crate::error::{ClientError, Result};
use crate::retry::{retry_with_jittered_backoff, RetryPolicy};

/// Internal topics carry this prefix and are hidden from listings.
pub const INTERNAL_TOPIC_PREFIX: &str = "__";

#[derive(Debug, Clone)]
struct TopicEntry {
    metadata: TopicMetadata,
    fetched_at: Instant,
    invalidated: bool,
}

impl TopicEntry {
    fn is_stale(&self, max_age: Duration) -> bool {
        self.invalidated || self.fetched_at.elapsed() > max_age
    }
}

/// Shared routing cache for one cluster.
pub struct MetadataCache {
    pool: Arc<ConnectionPool>,
    topics: RwLock<HashMap<String, TopicEntry>>,
    coordinators: RwLock<HashMap<String, BrokerEndpoint>>,
    refreshing: Mutex<HashSet<String>>,
    max_age: Duration,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl MetadataCache {
    pub fn new(pool: Arc<ConnectionPool>, config: &ClientConfig) -> Self {
        Self {
            pool,
            topics: RwLock::new(HashMap::new()),
            coordinators: RwLock::new(HashMap::new()),
            refreshing: Mutex::new(HashSet::new()),
            max_age: config.metadata_max_age,
            request_timeout: config.request_timeout,
            retry: config.retry.clone(),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Partition metadata for a topic, ordered by partition index.
    pub async fn get_partitions(self: &Arc<Self>, topic: &str) -> Result<Vec<PartitionMetadata>> {
        Ok(self.topic_metadata(topic).await?.partitions)
    }

    /// Full topic metadata, refreshing on a miss and in the background when stale.
    pub async fn topic_metadata(self: &Arc<Self>, topic: &str) -> Result<TopicMetadata> {
        {
            let topics = self.topics.read().await;
            if let Some(entry) = topics.get(topic) {
                if entry.is_stale(self.max_age) {
                    warn!(
                        topic,
                        age_ms = entry.fetched_at.elapsed().as_millis() as u64,
                        "Serving stale metadata, refreshing in background"
                    );
                    let metadata = entry.metadata.clone();
                    drop(topics);
                    self.schedule_refresh(topic).await;
                    return Ok(metadata);
                }
                return Ok(entry.metadata.clone());
            }
        }

        // Cold miss: the caller cannot proceed without routing
        match self.refresh(&[topic.to_string()], true).await {
            Ok(()) => {}
            Err(e @ ClientError::NotFound(_)) => return Err(e),
            Err(e) => {
                return Err(ClientError::MetadataUnavailable(format!(
                    "topic '{}': {}",
                    topic, e
                )))
            }
        }

        let topics = self.topics.read().await;
        topics
            .get(topic)
            .map(|e| e.metadata.clone())
            .ok_or_else(|| ClientError::NotFound(format!("topic '{}'", topic)))
    }

    /// Number of partitions of a topic.
    pub async fn partition_count(self: &Arc<Self>, topic: &str) -> Result<usize> {
        Ok(self.topic_metadata(topic).await?.partition_count())
    }

    /// Current leader of a partition.
    pub async fn leader_for(self: &Arc<Self>, topic: &str, partition: i32) -> Result<BrokerId> {
        let metadata = self.topic_metadata(topic).await?;
        metadata
            .partitions
            .iter()
            .find(|p| p.tp.partition == partition)
            .map(|p| p.leader)
            .ok_or_else(|| ClientError::NotFound(format!("partition {}-{}", topic, partition)))
    }

    /// Refresh the given topics.
    ///
    /// With `force = false`, topics whose entries are still fresh are skipped. Topics
    /// missing from a successful response are dropped from the cache; if every
    /// requested topic is missing the result is `NotFound`.
    pub async fn refresh(&self, topics: &[String], force: bool) -> Result<()> {
        let wanted: Vec<String> = if force {
            topics.to_vec()
        } else {
            let cached = self.topics.read().await;
            topics
                .iter()
                .filter(|t| cached.get(*t).map_or(true, |e| e.is_stale(self.max_age)))
                .cloned()
                .collect()
        };
        if wanted.is_empty() {
            return Ok(());
        }

        let response = self.fetch(&TopicFilter::Only(wanted.clone())).await?;
        self.apply(&response, &wanted).await;

        if response.topics.is_empty() {
            return Err(ClientError::NotFound(format!("topic(s) {}", wanted.join(", "))));
        }
        Ok(())
    }

    /// Every topic name in the cluster except internal ones, sorted.
    pub async fn list_topics(&self) -> Result<Vec<String>> {
        let response = self.fetch(&TopicFilter::All).await?;
        let names: Vec<String> = response.topics.iter().map(|t| t.name.clone()).collect();
        self.apply(&response, &[]).await;

        let mut visible: Vec<String> = names
            .into_iter()
            .filter(|name| !name.starts_with(INTERNAL_TOPIC_PREFIX))
            .collect();
        visible.sort();
        Ok(visible)
    }

    /// Mark a topic's entry stale so the next lookup refreshes it.
    pub async fn invalidate(&self, topic: &str) {
        let mut topics = self.topics.write().await;
        if let Some(entry) = topics.get_mut(topic) {
            debug!(topic, "Invalidated metadata");
            entry.invalidated = true;
        }
    }

    /// Group coordinator, discovered on first use and cached.
    pub async fn get_coordinator(&self, group_id: &str) -> Result<BrokerEndpoint> {
        if let Some(endpoint) = self.coordinators.read().await.get(group_id) {
            return Ok(endpoint.clone());
        }

        let mut last_error = None;
        for broker in self.pool.known_brokers().await {
            let conn = match self.pool.acquire(broker.id).await {
                Ok(conn) => conn,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            match call(self.request_timeout, conn.find_coordinator(group_id)).await {
                Ok(endpoint) => {
                    info!(group_id, coordinator = %endpoint, "Discovered group coordinator");
                    self.pool.add_broker(endpoint.clone()).await;
                    self.coordinators
                        .write()
                        .await
                        .insert(group_id.to_string(), endpoint.clone());
                    return Ok(endpoint);
                }
                Err(e) if matches!(e, ClientError::Connection { .. } | ClientError::Timeout(_)) => {
                    self.pool.invalidate(broker.id).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ClientError::MetadataUnavailable(format!("no brokers known for group '{}'", group_id))
        }))
    }

    /// Forget a group's coordinator so the next lookup rediscovers it.
    pub async fn invalidate_coordinator(&self, group_id: &str) {
        if self.coordinators.write().await.remove(group_id).is_some() {
            debug!(group_id, "Invalidated coordinator");
        }
    }

    /// Issue a metadata request to the first broker that answers.
    async fn fetch(&self, filter: &TopicFilter) -> Result<MetadataResponse> {
        let brokers = self.pool.known_brokers().await;
        if brokers.is_empty() {
            return Err(ClientError::MetadataUnavailable(
                "no brokers known".to_string(),
            ));
        }

        let mut last_error = None;
        for broker in brokers {
            let result = async {
                let conn = self.pool.acquire(broker.id).await?;
                call(self.request_timeout, conn.metadata(filter)).await
            }
            .await;
            match result {
                Ok(response) => {
                    debug!(
                        broker_id = broker.id,
                        topics = response.topics.len(),
                        brokers = response.brokers.len(),
                        "Fetched metadata"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    debug!(broker_id = broker.id, error = %e, "Metadata request failed, trying next broker");
                    if e.is_stale_routing() || matches!(e, ClientError::Timeout(_)) {
                        self.pool.invalidate(broker.id).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let cause = last_error.map_or_else(|| "unknown".to_string(), |e| e.to_string());
        Err(ClientError::MetadataUnavailable(format!(
            "no broker answered the metadata request: {}",
            cause
        )))
    }

    async fn apply(&self, response: &MetadataResponse, requested: &[String]) {
        if !response.brokers.is_empty() {
            self.pool.set_brokers(response.brokers.clone()).await;
        }

        let now = Instant::now();
        let mut topics = self.topics.write().await;
        for topic in &response.topics {
            topics.insert(
                topic.name.clone(),
                TopicEntry {
                    metadata: topic.clone(),
                    fetched_at: now,
                    invalidated: false,
                },
            );
        }
        for name in requested {
            if response.topic(name).is_none() && topics.remove(name).is_some() {
                info!(topic = %name, "Topic no longer exists, dropped from cache");
            }
        }
    }

    async fn schedule_refresh(self: &Arc<Self>, topic: &str) {
        {
            let mut refreshing = self.refreshing.lock().await;
            if !refreshing.insert(topic.to_string()) {
                return;
            }
        }

        let cache = Arc::clone(self);
        let topic = topic.to_string();
        tokio::spawn(async move {
            let topics = [topic.clone()];
            let result =
                retry_with_jittered_backoff(&cache.retry, || cache.refresh(&topics, false)).await;
            if let Err(e) = result {
                warn!(topic = %topic, error = %e, "Background metadata refresh failed");
            }
            cache.refreshing.lock().await.remove(&topic);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brokerlink_core::{BrokerRole, TopicPartition};
    use brokerlink_sim::{Api, SimCluster};

    async fn cache_for(cluster: &SimCluster, max_age: Duration) -> Arc<MetadataCache> {
        let config = ClientConfig::builder()
            .metadata_max_age(max_age)
            .retry_policy(RetryPolicy::new(
                1,
                Duration::from_millis(1),
                Duration::from_millis(5),
                2.0,
            ))
            .build();
        let pool = Arc::new(ConnectionPool::new(Arc::new(cluster.clone()), &config));
        pool.set_brokers(vec![BrokerEndpoint::new(
            -1,
            "localhost",
            9092,
            BrokerRole::Follower,
        )])
        .await;
        Arc::new(MetadataCache::new(pool, &config))
    }

    #[tokio::test]
    async fn test_cold_miss_refreshes() {
        let cluster = SimCluster::builder().brokers(2).topic("orders", 3).build();
        let cache = cache_for(&cluster, Duration::from_secs(60)).await;

        let partitions = cache.get_partitions("orders").await.unwrap();
        assert_eq!(partitions.len(), 3);
        assert_eq!(cache.leader_for("orders", 1).await.unwrap(), 2);

        // Bootstrap entry replaced by the real brokers
        let known = cache.pool().known_brokers().await;
        assert_eq!(known.len(), 2);

        // Second lookup is served from cache
        cache.get_partitions("orders").await.unwrap();
        assert_eq!(cluster.request_count(Api::Metadata), 1);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_not_found() {
        let cluster = SimCluster::builder().topic("orders", 1).build();
        let cache = cache_for(&cluster, Duration::from_secs(60)).await;

        let err = cache.get_partitions("missing").await.unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_miss_with_no_reachable_broker_is_unavailable() {
        let cluster = SimCluster::builder().topic("orders", 1).build();
        cluster.set_broker_down(1).await;
        let cache = cache_for(&cluster, Duration::from_secs(60)).await;

        let err = cache.get_partitions("orders").await.unwrap_err();
        assert!(matches!(err, ClientError::MetadataUnavailable(_)));
    }

    #[tokio::test]
    async fn test_stale_entry_served_when_refresh_fails() {
        let cluster = SimCluster::builder().topic("orders", 2).build();
        let cache = cache_for(&cluster, Duration::from_secs(60)).await;
        cache.get_partitions("orders").await.unwrap();

        cluster.set_broker_down(1).await;
        cache.invalidate("orders").await;

        let partitions = cache.get_partitions("orders").await.unwrap();
        assert_eq!(partitions.len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_then_forced_refresh_sees_new_leader() {
        let cluster = SimCluster::builder().brokers(2).topic("orders", 1).build();
        let cache = cache_for(&cluster, Duration::from_secs(60)).await;
        assert_eq!(cache.leader_for("orders", 0).await.unwrap(), 1);

        cluster.move_leader(&TopicPartition::new("orders", 0), 2).await;
        cache.invalidate("orders").await;
        cache.refresh(&["orders".to_string()], true).await.unwrap();

        assert_eq!(cache.leader_for("orders", 0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unforced_refresh_skips_fresh_entries() {
        let cluster = SimCluster::builder().topic("orders", 1).build();
        let cache = cache_for(&cluster, Duration::from_secs(60)).await;
        cache.get_partitions("orders").await.unwrap();

        cache.refresh(&["orders".to_string()], false).await.unwrap();
        assert_eq!(cluster.request_count(Api::Metadata), 1);

        cache.refresh(&["orders".to_string()], true).await.unwrap();
        assert_eq!(cluster.request_count(Api::Metadata), 2);
    }

    #[tokio::test]
    async fn test_expired_entry_triggers_background_refresh() {
        let cluster = SimCluster::builder().topic("orders", 1).build();
        let cache = cache_for(&cluster, Duration::from_millis(10)).await;
        cache.get_partitions("orders").await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.get_partitions("orders").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(cluster.request_count(Api::Metadata) >= 2);
    }

    #[tokio::test]
    async fn test_list_topics_hides_internal() {
        let cluster = SimCluster::builder()
            .topic("orders", 1)
            .topic("__consumer_offsets", 1)
            .topic("audit", 1)
            .build();
        let cache = cache_for(&cluster, Duration::from_secs(60)).await;

        assert_eq!(cache.list_topics().await.unwrap(), vec!["audit", "orders"]);
    }

    #[tokio::test]
    async fn test_coordinator_cached_until_invalidated() {
        let cluster = SimCluster::builder().brokers(2).topic("orders", 1).build();
        cluster.set_coordinator("g", 2).await;
        let cache = cache_for(&cluster, Duration::from_secs(60)).await;

        assert_eq!(cache.get_coordinator("g").await.unwrap().id, 2);
        assert_eq!(cache.get_coordinator("g").await.unwrap().id, 2);
        assert_eq!(cluster.request_count(Api::FindCoordinator), 1);

        cache.invalidate_coordinator("g").await;
        cache.get_coordinator("g").await.unwrap();
        assert_eq!(cluster.request_count(Api::FindCoordinator), 2);
    }
}
