//! Cluster context shared by producers, consumers and admin queries.
//!
//! A [`Cluster`] bundles the client configuration with one [`ConnectionPool`] and
//! one [`MetadataCache`]. Cloning it is cheap; every clone shares the same pool and
//! cache, so handles built from one cluster reuse connections and routing.

use std::sync::Arc;

use brokerlink_core::{BrokerEndpoint, Connector};
use tracing::info;

use crate::config::ClientConfig;
use crate::connection_pool::ConnectionPool;
use crate::error::{ClientError, Result};
use crate::metadata::MetadataCache;

#[derive(Clone)]
pub struct Cluster {
    config: Arc<ClientConfig>,
    pool: Arc<ConnectionPool>,
    metadata: Arc<MetadataCache>,
}

impl Cluster {
    /// Seed the pool with the bootstrap list and fetch the first metadata.
    ///
    /// Bootstrap brokers get ids -1, -2, ... until the first metadata response names
    /// the real brokers. Fails with `Connection` if no bootstrap broker answers.
    pub async fn connect(connector: Arc<dyn Connector>, config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let bootstrap = bootstrap_endpoints(&config.bootstrap_servers)?;
        let pool = Arc::new(ConnectionPool::new(connector, &config));
        pool.set_brokers(bootstrap).await;
        let metadata = Arc::new(MetadataCache::new(Arc::clone(&pool), &config));

        let topics = metadata.list_topics().await.map_err(|e| ClientError::Connection {
            broker: config.bootstrap_servers.join(","),
            message: e.to_string(),
        })?;

        info!(
            client_id = %config.client_id,
            brokers = pool.known_brokers().await.len(),
            topics = topics.len(),
            "Connected to cluster"
        );

        Ok(Self {
            config: Arc::new(config),
            pool,
            metadata,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    /// Drop every pooled connection. Handles still holding the cluster reconnect on
    /// their next request.
    pub async fn close(&self) {
        self.pool.close_all().await;
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("client_id", &self.config.client_id)
            .field("bootstrap_servers", &self.config.bootstrap_servers)
            .finish()
    }
}

fn bootstrap_endpoints(servers: &[String]) -> Result<Vec<BrokerEndpoint>> {
    servers
        .iter()
        .enumerate()
        .map(|(i, server)| {
            BrokerEndpoint::parse(-(i as i32) - 1, server).map_err(|e| {
                ClientError::Config(format!("invalid bootstrap server '{}': {}", server, e))
            })
        })
        .collect()
}
