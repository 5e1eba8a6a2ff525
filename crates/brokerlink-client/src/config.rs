//! Client configuration.
//!
//! Three layers, each with documented defaults:
//!
//! - [`ClientConfig`]: settings shared by everything built on one [`Cluster`](crate::Cluster)
//!   (bootstrap list, timeouts, retry policy, connection limits)
//! - [`ProducerConfig`]: batching and delivery settings
//! - [`ConsumerConfig`]: group membership, offset reset and auto-commit settings
//!
//! Every layer can be built with typed builder methods or populated from string
//! properties through `set(key, value)`, using the familiar dotted keys:
//!
//! ```ignore
//! let mut config = ConsumerConfig::default();
//! config.set("bootstrap.servers", "localhost:9092")?;
//! config.set("group.id", "billing")?;
//! config.set("auto.offset.reset", "earliest")?;
//! config.set("enable.auto.commit", "false")?;
//! ```
//!
//! Unknown keys and values that do not parse are `ClientError::Config`.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;

pub const DEFAULT_PRODUCER_CLIENT_ID: &str = "brokerlink-producer";
pub const DEFAULT_CONSUMER_CLIENT_ID: &str = "brokerlink-consumer";

/// Settings shared by producers, consumers and admin queries of one cluster.
///
/// ## Defaults
///
/// - `client_id`: `"brokerlink"` (producers and consumers substitute their own)
/// - `request_timeout`: 30s
/// - `connect_timeout`: 3s
/// - `metadata_max_age`: 5 minutes
/// - `max_connections_per_broker`: 1
/// - `idle_timeout`: 60s
/// - `retry`: 3 retries, 100ms initial backoff, 10s max, 2x multiplier
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` entries contacted first
    pub bootstrap_servers: Vec<String>,

    pub client_id: String,

    /// Deadline for a single broker request
    pub request_timeout: Duration,

    /// Deadline for establishing a broker connection
    pub connect_timeout: Duration,

    /// Cached metadata older than this is stale and refreshed in the background
    pub metadata_max_age: Duration,

    pub max_connections_per_broker: usize,

    /// Pooled connections unused for this long are evicted
    pub idle_timeout: Duration,

    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: Vec::new(),
            client_id: "brokerlink".to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(3),
            metadata_max_age: Duration::from_secs(300),
            max_connections_per_broker: 1,
            idle_timeout: Duration::from_secs(60),
            retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(10), 2.0),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Apply a string property.
    ///
    /// Keys: `bootstrap.servers`, `client.id`, `request.timeout.ms`,
    /// `metadata.max.age.ms`, `retries`, `retry.backoff.ms`,
    /// `max.connections.per.broker`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "bootstrap.servers" => {
                self.bootstrap_servers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
            "client.id" => self.client_id = value.to_string(),
            "request.timeout.ms" => self.request_timeout = parse_millis(key, value)?,
            "metadata.max.age.ms" => self.metadata_max_age = parse_millis(key, value)?,
            "retries" => self.retry.max_retries = parse(key, value)?,
            "retry.backoff.ms" => self.retry.initial_backoff = parse_millis(key, value)?,
            "max.connections.per.broker" => {
                let max: usize = parse(key, value)?;
                if max == 0 {
                    return Err(ClientError::Config(format!("{} must be at least 1", key)));
                }
                self.max_connections_per_broker = max;
            }
            _ => return Err(ClientError::Config(format!("unknown property '{}'", key))),
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.bootstrap_servers.is_empty() {
            return Err(ClientError::Config(
                "bootstrap.servers must name at least one broker".to_string(),
            ));
        }
        if self.max_connections_per_broker == 0 {
            return Err(ClientError::Config(
                "max.connections.per.broker must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn bootstrap_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.bootstrap_servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn metadata_max_age(mut self, age: Duration) -> Self {
        self.config.metadata_max_age = age;
        self
    }

    pub fn max_connections_per_broker(mut self, max: usize) -> Self {
        self.config.max_connections_per_broker = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Where a consumer starts when its group has no committed offset for a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    /// Start from the earliest retained offset
    Earliest,
    /// Start from the high-water mark (only new records)
    Latest,
    /// Fail the poll with `NotFound` if no committed offset exists
    None,
}

impl FromStr for OffsetReset {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" | "smallest" | "beginning" => Ok(OffsetReset::Earliest),
            "latest" | "largest" | "end" => Ok(OffsetReset::Latest),
            "none" | "error" => Ok(OffsetReset::None),
            other => Err(ClientError::Config(format!(
                "invalid auto.offset.reset '{}'",
                other
            ))),
        }
    }
}

/// Producer settings.
///
/// ## Defaults
///
/// - `linger`: 5ms
/// - `batch_size`: 100 records
/// - `max_batch_bytes`: 1MB
/// - `delivery_timeout`: 120s
/// - `close_timeout`: 5s
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub client: ClientConfig,

    /// Maximum age of a batch before it is flushed
    pub linger: Duration,

    /// Records per batch before it is flushed
    pub batch_size: usize,

    /// Bytes per batch before it is flushed
    pub max_batch_bytes: usize,

    /// Budget for a send from enqueue to acknowledgement, retries included
    pub delivery_timeout: Duration,

    /// How long `close` waits for pending sends
    pub close_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig {
                client_id: DEFAULT_PRODUCER_CLIENT_ID.to_string(),
                ..ClientConfig::default()
            },
            linger: Duration::from_millis(5),
            batch_size: 100,
            max_batch_bytes: 1024 * 1024,
            delivery_timeout: Duration::from_secs(120),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ProducerConfig {
    /// Apply a string property. Keys not specific to producers fall through to
    /// [`ClientConfig::set`].
    ///
    /// `batch.size` is in bytes; `batch.num.messages` bounds the record count.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "linger.ms" => self.linger = parse_millis(key, value)?,
            "batch.size" => self.max_batch_bytes = parse(key, value)?,
            "batch.num.messages" => self.batch_size = parse(key, value)?,
            "delivery.timeout.ms" => self.delivery_timeout = parse_millis(key, value)?,
            _ => self.client.set(key, value)?,
        }
        Ok(())
    }
}

/// Consumer settings.
///
/// ## Defaults
///
/// - `auto_offset_reset`: `Latest`
/// - `enable_auto_commit`: true
/// - `auto_commit_interval`: 5s
/// - `session_timeout`: 45s
/// - `heartbeat_interval`: 3s
/// - `max_poll_records`: 500
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub client: ClientConfig,

    /// Consumer group id (required)
    pub group_id: String,

    pub auto_offset_reset: OffsetReset,

    pub enable_auto_commit: bool,

    pub auto_commit_interval: Duration,

    /// Coordinator evicts the member if it stays silent this long
    pub session_timeout: Duration,

    pub heartbeat_interval: Duration,

    /// Upper bound on records returned by one poll
    pub max_poll_records: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig {
                client_id: DEFAULT_CONSUMER_CLIENT_ID.to_string(),
                ..ClientConfig::default()
            },
            group_id: String::new(),
            auto_offset_reset: OffsetReset::Latest,
            enable_auto_commit: true,
            auto_commit_interval: Duration::from_secs(5),
            session_timeout: Duration::from_secs(45),
            heartbeat_interval: Duration::from_secs(3),
            max_poll_records: 500,
        }
    }
}

impl ConsumerConfig {
    /// Apply a string property. Keys not specific to consumers fall through to
    /// [`ClientConfig::set`].
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "group.id" => self.group_id = value.to_string(),
            "auto.offset.reset" => self.auto_offset_reset = value.parse()?,
            "enable.auto.commit" => self.enable_auto_commit = parse_bool(key, value)?,
            "auto.commit.interval.ms" => self.auto_commit_interval = parse_millis(key, value)?,
            "session.timeout.ms" => self.session_timeout = parse_millis(key, value)?,
            "heartbeat.interval.ms" => self.heartbeat_interval = parse_millis(key, value)?,
            "max.poll.records" => {
                let max: usize = parse(key, value)?;
                if max == 0 {
                    return Err(ClientError::Config(format!("{} must be at least 1", key)));
                }
                self.max_poll_records = max;
            }
            _ => self.client.set(key, value)?,
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.client.validate()?;
        if self.group_id.is_empty() {
            return Err(ClientError::Config("group.id is required".to_string()));
        }
        if self.heartbeat_interval >= self.session_timeout {
            return Err(ClientError::Config(
                "heartbeat.interval.ms must be lower than session.timeout.ms".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ClientError::Config(format!("invalid value '{}' for {}", value, key)))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    parse::<u64>(key, value).map(Duration::from_millis)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ClientError::Config(format!(
            "invalid value '{}' for {}",
            value, key
        ))),
    }
}
