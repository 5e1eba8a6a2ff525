//! Broker Connection Pool
//!
//! Owns every connection the client holds to broker nodes. Producers, consumers and
//! admin queries built from one [`Cluster`](crate::Cluster) share a single pool.
//!
//! ## Design
//!
//! The pool keeps two maps:
//! - an **address book** (`broker id → endpoint`), seeded with the bootstrap list
//!   (synthetic ids -1, -2, ...) and replaced wholesale by every metadata refresh
//! - the **connections** per broker, each with an in-flight counter and a last-used
//!   timestamp
//!
//! `acquire` prefers an idle pooled connection. While the broker has fewer than
//! `max_connections_per_broker` connections, a caller that finds them all busy opens
//! another; at the limit callers share the least-loaded one. Connections idle longer
//! than `idle_timeout` are evicted on the next acquire.
//!
//! ## Thread Safety
//!
//! ConnectionPool is Send + Sync; both maps sit behind `tokio::sync::RwLock` with a
//! read-lock fast path.
//!
//! ## Examples
//!
//! ```ignore
//! let pool = ConnectionPool::new(connector, &config);
//! pool.set_brokers(bootstrap_endpoints).await;
//!
//! let conn = pool.acquire(1).await?;
//! let response = conn.produce(request).await?;
//! // Lease returned to the pool when `conn` is dropped
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use brokerlink_core::{BrokerConnection, BrokerEndpoint, BrokerId, Connector};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Connection pool entry with load tracking.
struct PooledConnection {
    conn: Arc<dyn BrokerConnection>,

    /// Leases currently outstanding on this connection
    in_flight: Arc<AtomicUsize>,

    /// Milliseconds since pool creation at last lease
    last_used: AtomicU64,
}

impl PooledConnection {
    fn lease(&self, broker_id: BrokerId, now_ms: u64) -> Connection {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.last_used.store(now_ms, Ordering::Relaxed);
        Connection {
            broker_id,
            conn: self.conn.clone(),
            in_flight: Some(self.in_flight.clone()),
        }
    }

    fn load(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn is_idle_expired(&self, now_ms: u64, idle_timeout: Duration) -> bool {
        self.load() == 0
            && now_ms.saturating_sub(self.last_used.load(Ordering::Relaxed))
                > idle_timeout.as_millis() as u64
    }
}

/// A leased connection to one broker.
///
/// Dereferences to the underlying [`BrokerConnection`]. Dropping the lease (or
/// passing it to [`ConnectionPool::release`]) returns it to the pool.
pub struct Connection {
    broker_id: BrokerId,
    conn: Arc<dyn BrokerConnection>,
    in_flight: Option<Arc<AtomicUsize>>,
}

impl Connection {
    /// Broker id the lease was requested for.
    pub fn broker_id(&self) -> BrokerId {
        self.broker_id
    }
}

impl Deref for Connection {
    type Target = dyn BrokerConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("broker_id", &self.broker_id)
            .finish_non_exhaustive()
    }
}

/// Pool of connections to broker nodes.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,

    /// Broker id → endpoint, replaced on every metadata refresh
    brokers: RwLock<HashMap<BrokerId, BrokerEndpoint>>,

    /// Broker id → pooled connections
    pools: RwLock<HashMap<BrokerId, Vec<PooledConnection>>>,

    max_connections_per_broker: usize,

    idle_timeout: Duration,

    connect_timeout: Duration,

    epoch: Instant,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: &ClientConfig) -> Self {
        Self {
            connector,
            brokers: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            max_connections_per_broker: config.max_connections_per_broker.max(1),
            idle_timeout: config.idle_timeout,
            connect_timeout: config.connect_timeout,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Replace the address book. Connections to brokers that disappeared or moved
    /// to a different address are dropped.
    pub async fn set_brokers(&self, endpoints: Vec<BrokerEndpoint>) {
        let new_book: HashMap<BrokerId, BrokerEndpoint> =
            endpoints.into_iter().map(|e| (e.id, e)).collect();

        let stale: Vec<BrokerId> = {
            let mut brokers = self.brokers.write().await;
            let stale = brokers
                .iter()
                .filter(|(id, old)| {
                    new_book
                        .get(id)
                        .map_or(true, |new| new.host != old.host || new.port != old.port)
                })
                .map(|(id, _)| *id)
                .collect();
            *brokers = new_book;
            stale
        };

        if !stale.is_empty() {
            let mut pools = self.pools.write().await;
            for id in &stale {
                pools.remove(id);
            }
            debug!(removed = ?stale, "Dropped connections to departed brokers");
        }
    }

    /// Current address book entries.
    pub async fn known_brokers(&self) -> Vec<BrokerEndpoint> {
        let brokers = self.brokers.read().await;
        let mut known: Vec<BrokerEndpoint> = brokers.values().cloned().collect();
        // Real brokers first, then bootstrap entries in list order
        known.sort_by_key(|e| if e.id >= 0 { (0, e.id) } else { (1, -e.id) });
        known
    }

    /// Add or update a single address book entry without touching the others.
    pub async fn add_broker(&self, endpoint: BrokerEndpoint) {
        self.brokers.write().await.insert(endpoint.id, endpoint);
    }

    pub async fn endpoint(&self, broker_id: BrokerId) -> Option<BrokerEndpoint> {
        self.brokers.read().await.get(&broker_id).cloned()
    }

    /// Lease a connection to a broker, creating one if necessary.
    ///
    /// # Errors
    ///
    /// `ClientError::Connection` if the broker is not in the address book, refuses
    /// the connection, or does not answer within the connect timeout.
    pub async fn acquire(&self, broker_id: BrokerId) -> Result<Connection> {
        let now_ms = self.now_ms();

        // Fast path: an idle pooled connection, or the least-loaded one at the limit
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(&broker_id) {
                if let Some(conn) = self.pick(pool, now_ms) {
                    return Ok(conn.lease(broker_id, now_ms));
                }
            }
        }

        // Slow path: evict idle connections, check again, then connect
        {
            let mut pools = self.pools.write().await;
            let pool = pools.entry(broker_id).or_default();

            let before_cleanup = pool.len();
            pool.retain(|c| !c.is_idle_expired(now_ms, self.idle_timeout));
            let removed = before_cleanup - pool.len();
            if removed > 0 {
                debug!(broker_id, removed, "Removed idle connections");
            }

            if let Some(conn) = self.pick(pool, now_ms) {
                return Ok(conn.lease(broker_id, now_ms));
            }
        }

        let endpoint = self.endpoint(broker_id).await.ok_or_else(|| ClientError::Connection {
            broker: broker_id.to_string(),
            message: "broker is not in the address book".to_string(),
        })?;

        debug!(broker_id, address = %endpoint.address(), "Creating new connection");
        let conn = self.connect(&endpoint).await?;

        let mut pools = self.pools.write().await;
        let pool = pools.entry(broker_id).or_default();
        let pooled = PooledConnection {
            conn,
            in_flight: Arc::new(AtomicUsize::new(0)),
            last_used: AtomicU64::new(now_ms),
        };
        let lease = pooled.lease(broker_id, now_ms);
        if pool.len() < self.max_connections_per_broker {
            pool.push(pooled);
            debug!(broker_id, pool_size = pool.len(), "Added new connection to pool");
        } else {
            debug!(
                broker_id,
                max = self.max_connections_per_broker,
                "Pool at max capacity, connection not pooled"
            );
        }
        Ok(lease)
    }

    /// Choose a pooled connection, or `None` when a new one should be opened.
    fn pick<'a>(&self, pool: &'a [PooledConnection], now_ms: u64) -> Option<&'a PooledConnection> {
        let live = || pool.iter().filter(|c| !c.is_idle_expired(now_ms, self.idle_timeout));
        if let Some(idle) = live().find(|c| c.load() == 0) {
            return Some(idle);
        }
        if pool.len() < self.max_connections_per_broker {
            return None;
        }
        live().min_by_key(|c| c.load())
    }

    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerConnection>> {
        match tokio::time::timeout(self.connect_timeout, self.connector.connect(endpoint)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => {
                warn!(broker_id = endpoint.id, address = %endpoint.address(), error = %e, "Connect failed");
                Err(ClientError::Connection {
                    broker: endpoint.address(),
                    message: e.to_string(),
                })
            }
            Err(_) => Err(ClientError::Connection {
                broker: endpoint.address(),
                message: format!("connect timed out after {:?}", self.connect_timeout),
            }),
        }
    }

    /// Return a lease to the pool. Equivalent to dropping it.
    pub fn release(&self, conn: Connection) {
        drop(conn);
    }

    /// Drop every connection to a broker so the next acquire reconnects.
    pub async fn invalidate(&self, broker_id: BrokerId) {
        let mut pools = self.pools.write().await;
        if pools.remove(&broker_id).is_some() {
            warn!(broker_id, "Invalidated connections to broker");
        }
    }

    /// Close all connections in the pool.
    pub async fn close_all(&self) {
        let mut pools = self.pools.write().await;
        pools.clear();
        debug!("Closed all connections");
    }

    /// Pool statistics: (total_connections, brokers_with_connections).
    pub async fn stats(&self) -> (usize, usize) {
        let pools = self.pools.read().await;
        let total = pools.values().map(|p| p.len()).sum();
        let brokers = pools.values().filter(|p| !p.is_empty()).count();
        (total, brokers)
    }
}

/// Run one broker request under a deadline.
pub(crate) async fn call<T, F>(timeout: Duration, request: F) -> Result<T>
where
    F: Future<Output = brokerlink_core::Result<T>>,
{
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result.map_err(ClientError::from),
        Err(_) => Err(ClientError::Timeout(timeout)),
    }
}
