//! Producer API for sending messages to a broker cluster.
//!
//! The Producer takes care of partition selection, batching, leader routing and
//! retries. Callers get a [`DeliveryFuture`] per message that resolves to a
//! [`RecordAck`] once the partition leader stored the record.
//!
//! ## Delivery Pipeline
//!
//! ```text
//! send(message)
//!   │  partition = explicit | siphash(key) % n | round-robin
//!   ▼
//! BatchManager (per partition)
//!   │  flush task: every linger tick, or flush()/close()
//!   ▼
//! send_batch ── leader from MetadataCache ── ConnectionPool ── produce
//!   │
//!   ├─ ok:              ack every record with base_offset + index
//!   ├─ stale routing:   invalidate cache + connections, forced refresh, backoff, retry
//!   ├─ non-retryable:   fail every record with SendFailed
//!   └─ retries/deadline exhausted: fail with SendFailed (last cause attached)
//! ```
//!
//! At most one batch per partition is in flight, so records of one partition are
//! stored in the order they were sent.
//!
//! ## Delivery Guarantee
//!
//! At-least-once. A produce request that timed out on the client may still have
//! been stored by the broker; its retry then stores the records a second time.
//!
//! ## Examples
//!
//! ```ignore
//! use brokerlink_client::{Message, Producer};
//!
//! let producer = Producer::builder()
//!     .bootstrap_servers(["localhost:9092"])
//!     .connector(connector)
//!     .linger(Duration::from_millis(10))
//!     .build()
//!     .await?;
//!
//! // Fire and forget, then wait for the acknowledgement later
//! let delivery = producer.send(Message::new("orders", "order-1").with_key("cust-42")).await?;
//! let ack = delivery.await?;
//!
//! // Or block on a single message
//! let ack = producer
//!     .send_and_wait(Message::new("orders", "order-2"), Duration::from_secs(5))
//!     .await?;
//!
//! producer.close().await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use brokerlink_core::protocol::ProduceRequest;
use brokerlink_core::{Connector, ProduceRecord, TopicPartition};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchManager, PendingSend};
use crate::cluster::Cluster;
use crate::config::ProducerConfig;
use crate::connection_pool::call;
use crate::error::{ClientError, Result};
use crate::partitioner::Partitioner;
use crate::retry::RetryPolicy;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A message to produce.
///
/// The partition is chosen by the producer unless set explicitly. The timestamp
/// defaults to the wall clock at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub partition: Option<i32>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl Message {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: value.into(),
            partition: None,
            timestamp: now_millis(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Where an acknowledged record was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordAck {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
}

/// Resolves once the record is acknowledged or has permanently failed.
///
/// Dropping the future does not cancel the send.
#[derive(Debug)]
pub struct DeliveryFuture {
    tp: TopicPartition,
    rx: oneshot::Receiver<Result<RecordAck>>,
}

impl DeliveryFuture {
    /// Partition the record was routed to.
    pub fn partition(&self) -> &TopicPartition {
        &self.tp
    }
}

impl Future for DeliveryFuture {
    type Output = Result<RecordAck>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let polled = Pin::new(&mut self.rx).poll(cx);
        match polled {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::Cancelled(format!(
                "delivery of record for {} abandoned",
                self.tp
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct ProducerInner {
    cluster: Cluster,
    config: ProducerConfig,
    batches: Mutex<BatchManager>,
    partitioner: Partitioner,

    /// Sends accepted and not yet settled
    outstanding: AtomicUsize,

    /// Fired whenever a batch settles
    progress: Notify,

    /// Flips to true on close; wakes batches sleeping in backoff
    shutdown: watch::Sender<bool>,

    closed: AtomicBool,

    /// Close drops the pool when the producer created its own cluster
    owns_cluster: bool,
}

/// Batching, routing and retrying message producer.
///
/// Producer is Send + Sync; share it across tasks with `Arc`.
pub struct Producer {
    inner: Arc<ProducerInner>,
    flush_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Producer {
    pub fn builder() -> ProducerBuilder {
        ProducerBuilder::new()
    }

    /// Build a producer on an existing cluster context.
    pub fn from_cluster(cluster: Cluster, config: ProducerConfig) -> Self {
        Self::start(cluster, config, false)
    }

    fn start(cluster: Cluster, config: ProducerConfig, owns_cluster: bool) -> Self {
        let batches = BatchManager::new(config.batch_size, config.max_batch_bytes, config.linger);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ProducerInner {
            cluster,
            config,
            batches: Mutex::new(batches),
            partitioner: Partitioner::new(),
            outstanding: AtomicUsize::new(0),
            progress: Notify::new(),
            shutdown,
            closed: AtomicBool::new(false),
            owns_cluster,
        });

        let flush_handle = spawn_flush_task(Arc::clone(&inner));
        info!(
            client_id = %inner.config.client.client_id,
            linger_ms = inner.config.linger.as_millis() as u64,
            batch_size = inner.config.batch_size,
            "Producer started"
        );

        Self {
            inner,
            flush_handle: std::sync::Mutex::new(Some(flush_handle)),
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.inner.cluster
    }

    /// Enqueue a message and return its delivery future.
    ///
    /// Suspends only for partition metadata on first use of a topic.
    ///
    /// # Errors
    ///
    /// - `Closed` after [`close`](Self::close)
    /// - `NotFound` for an unknown topic or an out-of-range explicit partition
    /// - `MetadataUnavailable` when routing cannot be fetched
    pub async fn send(&self, message: Message) -> Result<DeliveryFuture> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed("producer"));
        }

        let partition_count = self
            .inner
            .cluster
            .metadata()
            .partition_count(&message.topic)
            .await?;
        let partition = self.inner.partitioner.select(
            &message.topic,
            message.partition,
            message.key.as_deref(),
            partition_count,
        )?;

        let tp = TopicPartition::new(message.topic, partition);
        let record = ProduceRecord::new(message.key, message.value, message.timestamp);
        let (pending, rx) =
            PendingSend::new(record, Instant::now() + self.inner.config.delivery_timeout);

        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        self.inner.batches.lock().await.append(tp.clone(), pending);

        Ok(DeliveryFuture { tp, rx })
    }

    /// Send one message and wait for its acknowledgement.
    ///
    /// On timeout the send stays queued and may still be delivered.
    pub async fn send_and_wait(&self, message: Message, timeout: Duration) -> Result<RecordAck> {
        let delivery = self.send(message).await?;
        match tokio::time::timeout(timeout, delivery).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }

    /// Sends accepted and not yet acknowledged or failed.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Ship every buffered batch and wait until all pending sends settle.
    ///
    /// Returns the number of sends still outstanding when `timeout` elapsed
    /// (0 when everything settled).
    pub async fn flush(&self, timeout: Duration) -> usize {
        self.inner.flush(timeout).await
    }

    /// Stop accepting sends, flush with the close timeout, then fail whatever is
    /// left with `Cancelled`.
    ///
    /// Idempotent: later calls return `Ok(())` immediately.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("Producer already closed");
            return Ok(());
        }

        let remaining = self.inner.flush(self.inner.config.close_timeout).await;
        if let Some(handle) = self.take_flush_handle() {
            handle.abort();
        }
        self.inner.shutdown.send_replace(true);

        let leftovers = self.inner.batches.lock().await.take_all();
        for pending in leftovers {
            self.inner
                .settle(pending, Err(ClientError::Cancelled("producer closed".to_string())));
        }

        if remaining > 0 {
            warn!(remaining, "Producer closed with unacknowledged sends");
        }
        if self.inner.owns_cluster {
            self.inner.cluster.close().await;
        }
        info!(client_id = %self.inner.config.client.client_id, "Producer closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn take_flush_handle(&self) -> Option<JoinHandle<()>> {
        self.flush_handle.lock().ok().and_then(|mut guard| guard.take())
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if let Some(handle) = self.take_flush_handle() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("client_id", &self.inner.config.client.client_id)
            .field("outstanding", &self.outstanding())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Drains ready batches on every linger tick until aborted.
fn spawn_flush_task(inner: Arc<ProducerInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = inner.config.linger.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            inner.dispatch(false).await;
        }
    })
}

impl ProducerInner {
    /// Start a send task for each batch that may go out now.
    async fn dispatch(self: &Arc<Self>, force: bool) {
        let batches = {
            let mut manager = self.batches.lock().await;
            if force {
                manager.flush_all()
            } else {
                manager.ready_batches()
            }
        };

        for (tp, sends) in batches {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.send_batch(tp, sends).await });
        }
    }

    async fn flush(self: &Arc<Self>, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let progress = self.progress.notified();
            tokio::pin!(progress);
            progress.as_mut().enable();

            self.dispatch(true).await;
            let remaining = self.outstanding.load(Ordering::Acquire);
            if remaining == 0 {
                return 0;
            }
            if tokio::time::timeout_at(deadline, progress).await.is_err() {
                let remaining = self.outstanding.load(Ordering::Acquire);
                debug!(remaining, "Flush timed out");
                return remaining;
            }
        }
    }

    /// Deliver one batch, retrying per policy, and settle every send in it.
    async fn send_batch(self: Arc<Self>, tp: TopicPartition, mut sends: Vec<PendingSend>) {
        let retry: &RetryPolicy = &self.config.client.retry;
        let mut shutdown = self.shutdown.subscribe();
        let mut last_error: Option<ClientError> = None;

        loop {
            let now = Instant::now();
            let (expired, live): (Vec<_>, Vec<_>) =
                sends.into_iter().partition(|s| s.deadline <= now);
            sends = live;
            for pending in expired {
                let attempts = pending.attempts;
                let cause = last_error
                    .clone()
                    .unwrap_or(ClientError::Timeout(self.config.delivery_timeout));
                self.settle(pending, Err(send_failed(&tp, attempts, cause)));
            }
            if sends.is_empty() {
                break;
            }

            for pending in sends.iter_mut() {
                pending.attempts += 1;
            }
            let attempts = sends.iter().map(|s| s.attempts).max().unwrap_or(1);
            let records: Vec<ProduceRecord> = sends.iter().map(|s| s.record.clone()).collect();

            match self.produce_once(&tp, records).await {
                Ok(base_offset) => {
                    debug!(
                        topic = %tp.topic,
                        partition = tp.partition,
                        base_offset,
                        record_count = sends.len(),
                        attempts,
                        "Batch acknowledged"
                    );
                    for (i, pending) in sends.into_iter().enumerate() {
                        let ack = RecordAck {
                            topic: tp.topic.clone(),
                            partition: tp.partition,
                            offset: base_offset + i as i64,
                            timestamp: pending.record.timestamp,
                        };
                        self.settle(pending, Ok(ack));
                    }
                    break;
                }
                Err(e) => {
                    if e.is_stale_routing() {
                        if let Err(refresh_err) = self
                            .cluster
                            .metadata()
                            .refresh(&[tp.topic.clone()], true)
                            .await
                        {
                            debug!(topic = %tp.topic, error = %refresh_err, "Metadata refresh after send failure failed");
                        }
                    }

                    if !e.is_retryable() || attempts as usize > retry.max_retries {
                        error!(
                            topic = %tp.topic,
                            partition = tp.partition,
                            attempts,
                            record_count = sends.len(),
                            error = %e,
                            "Failed to send batch"
                        );
                        for pending in sends {
                            let attempts = pending.attempts;
                            self.settle(pending, Err(send_failed(&tp, attempts, e.clone())));
                        }
                        break;
                    }

                    let backoff = retry.jittered_backoff(attempts as usize - 1);
                    warn!(
                        topic = %tp.topic,
                        partition = tp.partition,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Produce failed, retrying"
                    );
                    last_error = Some(e);

                    let earliest_deadline = sends.iter().map(|s| s.deadline).min();
                    let wake_at = match earliest_deadline {
                        Some(deadline) => (Instant::now() + backoff).min(deadline),
                        None => Instant::now() + backoff,
                    };
                    if *shutdown.borrow() {
                        self.cancel_all(sends);
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep_until(wake_at) => {}
                        _ = shutdown.changed() => {
                            self.cancel_all(sends);
                            break;
                        }
                    }
                }
            }
        }

        self.batches.lock().await.complete(&tp);
        self.progress.notify_waiters();
    }

    /// One produce request to the partition's current leader.
    ///
    /// On a stale-routing failure the topic entry and the leader's connections are
    /// invalidated before the error is returned.
    async fn produce_once(&self, tp: &TopicPartition, records: Vec<ProduceRecord>) -> Result<i64> {
        let metadata = self.cluster.metadata();
        let leader = metadata.leader_for(&tp.topic, tp.partition).await?;

        let result = async {
            let conn = self.cluster.pool().acquire(leader).await?;
            let request = ProduceRequest {
                tp: tp.clone(),
                records,
            };
            call(
                self.config.client.request_timeout,
                conn.produce(request),
            )
            .await
        }
        .await;

        match result {
            Ok(response) => Ok(response.base_offset),
            Err(e) => {
                if e.is_stale_routing() || matches!(e, ClientError::Timeout(_)) {
                    metadata.invalidate(&tp.topic).await;
                    self.cluster.pool().invalidate(leader).await;
                }
                Err(e)
            }
        }
    }

    fn cancel_all(&self, sends: Vec<PendingSend>) {
        for pending in sends {
            self.settle(
                pending,
                Err(ClientError::Cancelled("producer closed".to_string())),
            );
        }
    }

    fn settle(&self, pending: PendingSend, result: Result<RecordAck>) {
        // Receiver may be gone; the caller dropped its delivery future
        let _ = pending.ack.send(result);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

fn send_failed(tp: &TopicPartition, attempts: u32, cause: ClientError) -> ClientError {
    ClientError::SendFailed {
        topic: tp.topic.clone(),
        partition: tp.partition,
        attempts,
        source: Box::new(cause),
    }
}

/// Builder for [`Producer`].
///
/// Either hand it an existing [`Cluster`] or a [`Connector`] plus bootstrap servers,
/// in which case `build` connects a cluster of its own.
///
/// ## Defaults
///
/// See [`ProducerConfig`].
pub struct ProducerBuilder {
    config: ProducerConfig,
    connector: Option<Arc<dyn Connector>>,
    cluster: Option<Cluster>,
}

impl ProducerBuilder {
    pub fn new() -> Self {
        Self {
            config: ProducerConfig::default(),
            connector: None,
            cluster: None,
        }
    }

    pub fn config(mut self, config: ProducerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Share an existing cluster context instead of connecting a new one.
    pub fn cluster(mut self, cluster: Cluster) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn bootstrap_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.client.bootstrap_servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client.client_id = client_id.into();
        self
    }

    pub fn linger(mut self, linger: Duration) -> Self {
        self.config.linger = linger;
        self
    }

    /// Records per batch.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn max_batch_bytes(mut self, bytes: usize) -> Self {
        self.config.max_batch_bytes = bytes;
        self
    }

    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.config.delivery_timeout = timeout;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.client.request_timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.client.retry = policy;
        self
    }

    /// Apply a string property (see [`ProducerConfig::set`]).
    pub fn set(mut self, key: &str, value: &str) -> Result<Self> {
        self.config.set(key, value)?;
        Ok(self)
    }

    pub async fn build(self) -> Result<Producer> {
        if self.config.batch_size == 0 || self.config.max_batch_bytes == 0 {
            return Err(ClientError::Config(
                "batch size limits must be at least 1".to_string(),
            ));
        }

        match self.cluster {
            Some(cluster) => Ok(Producer::start(cluster, self.config, false)),
            None => {
                let connector = self.connector.ok_or_else(|| {
                    ClientError::Config("a connector or cluster is required".to_string())
                })?;
                let cluster = Cluster::connect(connector, self.config.client.clone()).await?;
                Ok(Producer::start(cluster, self.config, true))
            }
        }
    }
}

impl Default for ProducerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use brokerlink_sim::SimCluster;

    fn fast_retry(max_retries: usize) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        )
    }

    async fn producer_for(sim: &SimCluster) -> Producer {
        Producer::builder()
            .bootstrap_servers(["localhost:9092"])
            .connector(Arc::new(sim.clone()))
            .linger(Duration::from_millis(1))
            .retry_policy(fast_retry(3))
            .build()
            .await
            .unwrap()
    }

    #[test]
    fn test_message_defaults() {
        let before = now_millis();
        let message = Message::new("orders", "order-1").with_key("cust-42");
        assert_eq!(message.topic, "orders");
        assert_eq!(message.key, Some(Bytes::from("cust-42")));
        assert!(message.partition.is_none());
        assert!(message.timestamp >= before);
    }

    #[tokio::test]
    async fn test_send_and_wait_assigns_offsets() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let producer = producer_for(&sim).await;

        let first = producer
            .send_and_wait(Message::new("orders", "a"), Duration::from_secs(5))
            .await
            .unwrap();
        let second = producer
            .send_and_wait(Message::new("orders", "b"), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 1);
        assert_eq!(producer.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let producer = producer_for(&sim).await;

        let mut deliveries = Vec::new();
        for i in 0..20 {
            deliveries.push(
                producer
                    .send(Message::new("orders", format!("v{}", i)).with_partition(0))
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(producer.flush(Duration::from_secs(5)).await, 0);

        for (i, delivery) in deliveries.into_iter().enumerate() {
            assert_eq!(delivery.await.unwrap().offset, i as i64);
        }
        let stored = sim.records(&TopicPartition::new("orders", 0)).await;
        assert_eq!(stored[7].value, Bytes::from("v7"));
    }

    #[tokio::test]
    async fn test_unknown_topic_rejected_at_send() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let producer = producer_for(&sim).await;

        let err = producer.send(Message::new("missing", "x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_sends() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let producer = producer_for(&sim).await;
        producer.send(Message::new("orders", "a")).await.unwrap();

        producer.close().await.unwrap();
        producer.close().await.unwrap();
        assert!(producer.is_closed());
        assert_eq!(sim.records(&TopicPartition::new("orders", 0)).await.len(), 1);

        let err = producer.send(Message::new("orders", "b")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn test_builder_requires_connector() {
        let err = Producer::builder()
            .bootstrap_servers(["localhost:9092"])
            .build()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_builder_accepts_properties() {
        let builder = Producer::builder()
            .set("linger.ms", "20")
            .unwrap()
            .set("batch.num.messages", "7")
            .unwrap();
        assert_eq!(builder.config.linger, Duration::from_millis(20));
        assert_eq!(builder.config.batch_size, 7);
        assert!(Producer::builder().set("linger.ms", "soon").is_err());
    }
}
