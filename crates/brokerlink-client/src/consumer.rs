//! Consumer API for reading records as part of a consumer group.
//!
//! ## Group Membership
//!
//! ```text
//!  Unjoined ──subscribe──▶ Joining ──join──▶ Syncing ──sync──▶ Stable ──subscribe──▶ Joining
//!                                              ▲                 │
//!                                              └── Rebalancing ◀─┘ heartbeat / commit answered
//!                                                   (rejoin)       with a rebalance signal
//!
//!  any state ──close──▶ Closed
//! ```
//!
//! The group leader computes the assignment with the range strategy
//! ([`range_assign`](crate::assignor::range_assign)) and ships it in its sync request.
//! Followers that sync before the leader are told the rebalance is still in
//! progress and retry on their next poll.
//!
//! ## Positions
//!
//! A newly assigned partition starts at the group's committed offset, else per
//! `auto_offset_reset`. The consumer also remembers, per partition, one past the
//! highest offset it returned since `subscribe` (the delivery floor). Positions
//! never start below the floor, so a rejoin can not replay records this consumer
//! already returned. An explicit seek clears the floor of its partition.
//!
//! ## Background Work
//!
//! A worker task sends heartbeats every `heartbeat_interval` and runs the
//! auto-commit timer. It takes the same session lock as `poll`, so it never runs
//! during a fetch round.
//!
//! ## Examples
//!
//! ```ignore
//! let consumer = Consumer::builder()
//!     .bootstrap_servers(["localhost:9092"])
//!     .group_id("analytics")
//!     .auto_offset_reset(OffsetReset::Earliest)
//!     .connector(connector)
//!     .build()
//!     .await?;
//!
//! consumer.subscribe(&["orders"]).await?;
//! loop {
//!     let batch = consumer.poll(Duration::from_secs(1)).await?;
//!     for record in batch {
//!         println!("{}-{}@{}: {:?}", record.topic, record.partition, record.offset, record.value);
//!     }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use brokerlink_core::protocol::{
    FetchRequest, FetchResponse, GroupMember, HeartbeatRequest, JoinGroupRequest,
    LeaveGroupRequest, OffsetCommitRequest, OffsetFetchRequest, SyncGroupRequest,
};
use brokerlink_core::{BrokerError, Connector, OffsetSpec, TopicPartition};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::assignor::range_assign;
use crate::cluster::Cluster;
use crate::config::{ConsumerConfig, OffsetReset};
use crate::connection_pool::{call, Connection};
use crate::error::{ClientError, Result};
use crate::offsets::OffsetResolver;
use crate::retry::RetryPolicy;

/// Membership state of one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemberState {
    Unjoined,
    Joining,
    Syncing,
    Stable,
    Rebalancing,
    Closed,
}

/// A record returned by [`Consumer::poll`]. Owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl ConsumedRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Default)]
pub struct PollBatch {
    pub records: Vec<ConsumedRecord>,

    /// The group handshake did not complete before the poll deadline
    pub rebalance_in_progress: bool,
}

impl PollBatch {
    fn rebalancing() -> Self {
        Self {
            records: Vec::new(),
            rebalance_in_progress: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

impl IntoIterator for PollBatch {
    type Item = ConsumedRecord;
    type IntoIter = std::vec::IntoIter<ConsumedRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Group membership and offset state, guarded by the consumer's session lock.
#[derive(Debug)]
struct GroupSession {
    state: MemberState,
    topics: Vec<String>,
    member_id: Option<String>,
    generation: i32,
    is_leader: bool,

    /// Members reported by the last join, when this consumer leads
    members: Vec<GroupMember>,

    assignment: BTreeSet<TopicPartition>,

    /// Next offset to fetch per assigned partition
    positions: BTreeMap<TopicPartition, i64>,

    /// One past the highest offset returned since subscribe
    floors: BTreeMap<TopicPartition, i64>,

    /// Last known committed offset per partition
    committed: BTreeMap<TopicPartition, i64>,

    /// Seeks for partitions not assigned yet
    pending_seeks: BTreeMap<TopicPartition, i64>,

    last_heartbeat: Instant,
    last_auto_commit: Instant,

    /// Rotates the first partition fetched in each round
    next_partition: usize,
}

impl GroupSession {
    fn new() -> Self {
        Self {
            state: MemberState::Unjoined,
            topics: Vec::new(),
            member_id: None,
            generation: -1,
            is_leader: false,
            members: Vec::new(),
            assignment: BTreeSet::new(),
            positions: BTreeMap::new(),
            floors: BTreeMap::new(),
            committed: BTreeMap::new(),
            pending_seeks: BTreeMap::new(),
            last_heartbeat: Instant::now(),
            last_auto_commit: Instant::now(),
            next_partition: 0,
        }
    }

    fn transition_to(&mut self, new_state: MemberState) {
        if self.state != new_state {
            debug!(
                member_id = ?self.member_id,
                generation = self.generation,
                from = ?self.state,
                to = ?new_state,
                "Member state transition"
            );
        }
        self.state = new_state;
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }

    /// Delivered positions ahead of the last known commit, for assigned partitions.
    fn uncommitted(&self) -> BTreeMap<TopicPartition, i64> {
        self.floors
            .iter()
            .filter(|(tp, floor)| {
                self.assignment.contains(*tp)
                    && self.committed.get(*tp).map_or(true, |c| **floor > *c)
            })
            .map(|(tp, floor)| (tp.clone(), *floor))
            .collect()
    }
}

struct ConsumerInner {
    cluster: Cluster,
    config: ConsumerConfig,
    resolver: OffsetResolver,
    session: Mutex<GroupSession>,
    closed: AtomicBool,
    owns_cluster: bool,
}

/// Consumer group member.
///
/// Consumer is Send + Sync; `poll`, `commit` and `seek` may be called from
/// different tasks and are serialized by the session lock.
pub struct Consumer {
    inner: Arc<ConsumerInner>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    pub fn builder() -> ConsumerBuilder {
        ConsumerBuilder::new()
    }

    /// Build a consumer on an existing cluster context.
    pub fn from_cluster(cluster: Cluster, config: ConsumerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::start(cluster, config, false))
    }

    fn start(cluster: Cluster, config: ConsumerConfig, owns_cluster: bool) -> Self {
        let inner = Arc::new(ConsumerInner {
            resolver: OffsetResolver::new(&cluster),
            cluster,
            config,
            session: Mutex::new(GroupSession::new()),
            closed: AtomicBool::new(false),
            owns_cluster,
        });
        let worker = spawn_worker(Arc::clone(&inner));
        info!(
            group_id = %inner.config.group_id,
            client_id = %inner.config.client.client_id,
            "Consumer started"
        );
        Self {
            inner,
            worker: std::sync::Mutex::new(Some(worker)),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.inner.config.group_id
    }

    pub fn cluster(&self) -> &Cluster {
        &self.inner.cluster
    }

    /// Replace the subscription and attempt the group handshake.
    ///
    /// # Errors
    ///
    /// `SubscriptionError` if a topic does not exist or the group coordinator can not
    /// be reached. A handshake that is merely still in progress is not an error; the
    /// next poll completes it. Only an `Unjoined` or `Stable` member can subscribe;
    /// otherwise `RebalanceInProgress`.
    pub async fn subscribe<S: AsRef<str>>(&self, topics: &[S]) -> Result<()> {
        let topics: Vec<String> = topics.iter().map(|t| t.as_ref().to_string()).collect();
        if topics.is_empty() {
            return Err(ClientError::InvalidArgument(
                "subscribe needs at least one topic".to_string(),
            ));
        }
        let mut session = self.inner.lock_open().await?;
        if !matches!(session.state, MemberState::Unjoined | MemberState::Stable) {
            return Err(ClientError::RebalanceInProgress(format!(
                "group '{}' handshake not complete ({:?}); poll until stable before resubscribing",
                self.inner.config.group_id, session.state
            )));
        }

        let metadata = self.inner.cluster.metadata();
        for topic in &topics {
            metadata.partition_count(topic).await.map_err(|e| match e {
                ClientError::NotFound(_) => {
                    ClientError::SubscriptionError(format!("topic '{}' does not exist", topic))
                }
                other => ClientError::SubscriptionError(format!("topic '{}': {}", topic, other)),
            })?;
        }
        metadata
            .get_coordinator(&self.inner.config.group_id)
            .await
            .map_err(|e| {
                ClientError::SubscriptionError(format!(
                    "coordinator for group '{}' unreachable: {}",
                    self.inner.config.group_id, e
                ))
            })?;

        if session.state == MemberState::Stable && self.inner.config.enable_auto_commit {
            self.inner.commit_uncommitted(&mut session).await;
        }

        session.pending_seeks.retain(|tp, _| topics.contains(&tp.topic));
        session.topics = topics;
        session.assignment.clear();
        session.positions.clear();
        session.floors.clear();
        session.transition_to(MemberState::Joining);
        info!(
            group_id = %self.inner.config.group_id,
            topics = ?session.topics,
            "Subscribed"
        );

        match self.inner.ensure_active(&mut session).await {
            Ok(()) => Ok(()),
            Err(e) if is_transient(&e) => {
                debug!(error = %e, "Group handshake not complete yet, finishing on poll");
                Ok(())
            }
            Err(e) => Err(ClientError::SubscriptionError(e.to_string())),
        }
    }

    /// Fetch up to `max_poll_records` records.
    ///
    /// Returns an empty batch on timeout. If the group handshake can not complete
    /// before the deadline, the batch is empty and flagged `rebalance_in_progress`.
    pub async fn poll(&self, timeout: Duration) -> Result<PollBatch> {
        let deadline = Instant::now() + timeout;
        let pause = self
            .inner
            .config
            .client
            .retry
            .initial_backoff
            .min(Duration::from_millis(50));

        loop {
            {
                let mut session = self.inner.lock_open().await?;
                if session.topics.is_empty() {
                    return Err(ClientError::SubscriptionError(
                        "poll called before subscribe".to_string(),
                    ));
                }

                self.inner.maintain(&mut session).await;

                let active = match session.state {
                    MemberState::Stable => true,
                    _ => match self.inner.ensure_active(&mut session).await {
                        Ok(()) => true,
                        Err(e) if is_transient(&e) => {
                            debug!(error = %e, "Group handshake in progress");
                            false
                        }
                        Err(e) => return Err(e),
                    },
                };

                if active {
                    let records = self.inner.fetch_round(&mut session).await?;
                    if !records.is_empty() {
                        return Ok(PollBatch {
                            records,
                            rebalance_in_progress: false,
                        });
                    }
                }

                if Instant::now() >= deadline {
                    return Ok(if session.state == MemberState::Stable {
                        PollBatch::default()
                    } else {
                        PollBatch::rebalancing()
                    });
                }
            }

            let wake_at = (Instant::now() + pause).min(deadline);
            tokio::time::sleep_until(wake_at).await;
        }
    }

    /// Commit `offset` (the next offset to consume) for one partition.
    ///
    /// A commit at or below the last known committed offset is ignored.
    pub async fn commit(&self, tp: &TopicPartition, offset: i64) -> Result<()> {
        if offset < 0 {
            return Err(ClientError::InvalidArgument(format!(
                "commit offset {} for {} is negative",
                offset, tp
            )));
        }
        let mut session = self.inner.lock_open().await?;
        if !session.committed.contains_key(tp) {
            self.inner
                .load_committed(&mut session, vec![tp.clone()])
                .await?;
        }
        if let Some(current) = session.committed.get(tp) {
            if offset <= *current {
                debug!(partition = %tp, offset, committed = *current, "Ignoring commit below committed offset");
                return Ok(());
            }
        }

        let mut offsets = BTreeMap::new();
        offsets.insert(tp.clone(), offset);
        self.inner.commit_offsets(&mut session, offsets).await
    }

    /// Commit the delivered position of every assigned partition.
    pub async fn commit_delivered(&self) -> Result<()> {
        let mut session = self.inner.lock_open().await?;
        let offsets = session.uncommitted();
        if offsets.is_empty() {
            return Ok(());
        }
        self.inner.commit_offsets(&mut session, offsets).await
    }

    /// Position the next fetch of `tp` at `offset`.
    ///
    /// Seeks for partitions of a subscribed topic that are not assigned yet are
    /// applied when the partition is assigned.
    pub async fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<()> {
        if offset < 0 {
            return Err(ClientError::InvalidArgument(format!(
                "seek offset {} for {} is negative",
                offset, tp
            )));
        }
        let mut session = self.inner.lock_open().await?;
        apply_seek(&mut session, tp, offset)
    }

    /// Position every partition of `topic` at the first record with a timestamp at
    /// or after `timestamp_ms` (the high-water mark when there is none).
    ///
    /// Returns the offsets applied. Partitions whose lookup failed keep their
    /// position; the call fails only if every lookup failed.
    pub async fn seek_to_timestamp(
        &self,
        topic: &str,
        timestamp_ms: i64,
    ) -> Result<BTreeMap<TopicPartition, i64>> {
        // held across lookup and apply so the subscription can not change in between
        let mut session = self.inner.lock_open().await?;
        if !session.is_subscribed(topic) {
            return Err(ClientError::InvalidArgument(format!(
                "topic '{}' is not subscribed",
                topic
            )));
        }

        let resolved = self
            .inner
            .resolver
            .resolve_by_timestamp(topic, timestamp_ms)
            .await?;

        let mut applied = BTreeMap::new();
        let mut last_error = None;
        for (tp, status) in resolved {
            match status.offset() {
                Some(offset) => {
                    apply_seek(&mut session, &tp, offset)?;
                    applied.insert(tp, offset);
                }
                None => {
                    if let crate::offsets::TimestampOffset::Unavailable(e) = status {
                        warn!(partition = %tp, error = %e, "Timestamp lookup failed, position unchanged");
                        last_error = Some(e);
                    }
                }
            }
        }

        if applied.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        info!(topic, timestamp_ms, partitions = applied.len(), "Seeked to timestamp");
        Ok(applied)
    }

    /// Next offset the consumer will fetch for `tp`, if known.
    pub async fn position(&self, tp: &TopicPartition) -> Option<i64> {
        let session = self.inner.session.lock().await;
        session
            .positions
            .get(tp)
            .or_else(|| session.pending_seeks.get(tp))
            .copied()
    }

    /// Partitions currently assigned to this member.
    pub async fn assignment(&self) -> Vec<TopicPartition> {
        self.inner
            .session
            .lock()
            .await
            .assignment
            .iter()
            .cloned()
            .collect()
    }

    /// Last committed offset this consumer knows of for `tp`.
    pub async fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.inner.session.lock().await.committed.get(tp).copied()
    }

    pub async fn member_state(&self) -> MemberState {
        self.inner.session.lock().await.state
    }

    /// Commit delivered offsets (with auto-commit on), leave the group and stop
    /// the background worker.
    ///
    /// Idempotent: later calls return `Ok(())` immediately.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("Consumer already closed");
            return Ok(());
        }
        if let Some(worker) = self.take_worker() {
            worker.abort();
        }

        let mut session = self.inner.session.lock().await;
        if session.state == MemberState::Stable && self.inner.config.enable_auto_commit {
            self.inner.commit_uncommitted(&mut session).await;
        }
        if let Some(member_id) = session.member_id.take() {
            let request = LeaveGroupRequest {
                group_id: self.inner.config.group_id.clone(),
                member_id,
            };
            if let Err(e) = self
                .inner
                .with_coordinator(|conn| async move { conn.leave_group(request).await })
                .await
            {
                debug!(error = %e, "Leave group failed");
            }
        }
        session.assignment.clear();
        session.positions.clear();
        session.pending_seeks.clear();
        session.transition_to(MemberState::Closed);
        drop(session);

        if self.inner.owns_cluster {
            self.inner.cluster.close().await;
        }
        info!(group_id = %self.inner.config.group_id, "Consumer closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().ok().and_then(|mut guard| guard.take())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(worker) = self.take_worker() {
            worker.abort();
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("group_id", &self.inner.config.group_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn apply_seek(session: &mut GroupSession, tp: &TopicPartition, offset: i64) -> Result<()> {
    if session.assignment.contains(tp) {
        session.positions.insert(tp.clone(), offset);
        session.floors.remove(tp);
        debug!(partition = %tp, offset, "Seek applied");
        Ok(())
    } else if session.is_subscribed(&tp.topic) {
        session.pending_seeks.insert(tp.clone(), offset);
        debug!(partition = %tp, offset, "Seek held until assignment");
        Ok(())
    } else {
        Err(ClientError::InvalidArgument(format!(
            "{} is not part of the subscription",
            tp
        )))
    }
}

/// Errors the group handshake recovers from by trying again.
fn is_transient(error: &ClientError) -> bool {
    error.is_retryable() || requires_rejoin(error)
}

fn requires_rejoin(error: &ClientError) -> bool {
    match error {
        ClientError::RebalanceInProgress(_) => true,
        ClientError::Broker(e) => e.requires_rejoin(),
        _ => false,
    }
}

fn is_unknown_member(error: &ClientError) -> bool {
    matches!(error, ClientError::Broker(BrokerError::UnknownMember { .. }))
}

/// Heartbeats and auto-commits between polls.
fn spawn_worker(inner: Arc<ConsumerInner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut period = inner.config.heartbeat_interval;
        if inner.config.enable_auto_commit {
            period = period.min(inner.config.auto_commit_interval);
        }
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if inner.closed.load(Ordering::Acquire) {
                break;
            }
            let mut session = inner.session.lock().await;
            inner.maintain(&mut session).await;
        }
    })
}

impl ConsumerInner {
    async fn lock_open(&self) -> Result<MutexGuard<'_, GroupSession>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed("consumer"));
        }
        let session = self.session.lock().await;
        if session.state == MemberState::Closed {
            return Err(ClientError::Closed("consumer"));
        }
        Ok(session)
    }

    /// Run one request against the group coordinator, forgetting the coordinator on
    /// stale routing so the next call rediscovers it.
    async fn with_coordinator<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = brokerlink_core::Result<T>>,
    {
        let metadata = self.cluster.metadata();
        let group_id = &self.config.group_id;
        let coordinator = metadata.get_coordinator(group_id).await?;

        let result = async {
            let conn = self.cluster.pool().acquire(coordinator.id).await?;
            call(self.config.client.request_timeout, op(conn)).await
        }
        .await;

        if let Err(e) = &result {
            if e.is_stale_routing() || matches!(e, ClientError::Timeout(_)) {
                debug!(group_id = %group_id, coordinator = %coordinator, error = %e, "Coordinator request failed, rediscovering");
                metadata.invalidate_coordinator(group_id).await;
                self.cluster.pool().invalidate(coordinator.id).await;
            }
        }
        result
    }

    /// Heartbeat and auto-commit when due. Only acts while `Stable`.
    async fn maintain(&self, session: &mut GroupSession) {
        if session.state != MemberState::Stable {
            return;
        }

        if self.config.enable_auto_commit
            && session.last_auto_commit.elapsed() >= self.config.auto_commit_interval
        {
            session.last_auto_commit = Instant::now();
            self.commit_uncommitted(session).await;
            if session.state != MemberState::Stable {
                return;
            }
        }

        if session.last_heartbeat.elapsed() < self.config.heartbeat_interval {
            return;
        }
        let Some(member_id) = session.member_id.clone() else {
            return;
        };
        let request = HeartbeatRequest {
            group_id: self.config.group_id.clone(),
            generation: session.generation,
            member_id,
        };
        match self
            .with_coordinator(|conn| async move { conn.heartbeat(request).await })
            .await
        {
            Ok(()) => session.last_heartbeat = Instant::now(),
            Err(e) if requires_rejoin(&e) => {
                debug!(group_id = %self.config.group_id, error = %e, "Heartbeat signalled rebalance");
                if self.config.enable_auto_commit {
                    self.commit_uncommitted(session).await;
                }
                self.begin_rejoin(session, &e);
            }
            Err(e) => warn!(group_id = %self.config.group_id, error = %e, "Heartbeat failed"),
        }
    }

    fn begin_rejoin(&self, session: &mut GroupSession, cause: &ClientError) {
        if is_unknown_member(cause) {
            session.member_id = None;
        }
        session.transition_to(MemberState::Rebalancing);
    }

    /// Drive the handshake until `Stable` or the first error.
    async fn ensure_active(&self, session: &mut GroupSession) -> Result<()> {
        loop {
            match session.state {
                MemberState::Stable => return Ok(()),
                MemberState::Closed => return Err(ClientError::Closed("consumer")),
                MemberState::Unjoined | MemberState::Joining | MemberState::Rebalancing => {
                    self.join(session).await?;
                }
                MemberState::Syncing => self.sync(session).await?,
            }
        }
    }

    /// Send a join request. A rebalancing member rejoins in place and moves
    /// straight to `Syncing`.
    async fn join(&self, session: &mut GroupSession) -> Result<()> {
        if session.state != MemberState::Rebalancing {
            session.transition_to(MemberState::Joining);
        }
        let request = JoinGroupRequest {
            group_id: self.config.group_id.clone(),
            member_id: session.member_id.clone(),
            client_id: self.config.client.client_id.clone(),
            session_timeout_ms: self.config.session_timeout.as_millis() as u64,
            topics: session.topics.clone(),
        };

        let response = match self
            .with_coordinator(|conn| async move { conn.join_group(request).await })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if is_unknown_member(&e) {
                    session.member_id = None;
                }
                return Err(e);
            }
        };

        info!(
            group_id = %self.config.group_id,
            member_id = %response.member_id,
            generation = response.generation,
            leader = response.is_leader(),
            "Joined group"
        );
        session.is_leader = response.is_leader();
        session.member_id = Some(response.member_id);
        session.generation = response.generation;
        session.members = response.members;
        session.transition_to(MemberState::Syncing);
        Ok(())
    }

    async fn sync(&self, session: &mut GroupSession) -> Result<()> {
        let member_id = session
            .member_id
            .clone()
            .ok_or_else(|| ClientError::Internal("sync without a member id".to_string()))?;

        let assignments = if session.is_leader {
            let mut topics: BTreeSet<&str> = BTreeSet::new();
            for member in &session.members {
                topics.extend(member.topics.iter().map(String::as_str));
            }
            let mut counts = BTreeMap::new();
            for topic in topics {
                match self.cluster.metadata().partition_count(topic).await {
                    Ok(count) => {
                        counts.insert(topic.to_string(), count);
                    }
                    Err(e) => warn!(topic, error = %e, "Skipping topic in assignment"),
                }
            }
            range_assign(&session.members, &counts)
        } else {
            Vec::new()
        };

        let request = SyncGroupRequest {
            group_id: self.config.group_id.clone(),
            generation: session.generation,
            member_id,
            assignments,
        };
        match self
            .with_coordinator(|conn| async move { conn.sync_group(request).await })
            .await
        {
            Ok(response) => {
                let gained: Vec<TopicPartition> = response
                    .partitions
                    .iter()
                    .filter(|tp| !session.assignment.contains(*tp))
                    .cloned()
                    .collect();
                self.apply_assignment(session, response.partitions);
                session.last_heartbeat = Instant::now();
                session.transition_to(MemberState::Stable);

                // other members may have committed while these were elsewhere
                for tp in &gained {
                    session.committed.remove(tp);
                }
                if !gained.is_empty() {
                    if let Err(e) = self.load_committed(session, gained).await {
                        debug!(error = %e, "Committed offset lookup after sync failed");
                    }
                }
                Ok(())
            }
            Err(e @ ClientError::RebalanceInProgress(_)) => Err(e),
            Err(e) if requires_rejoin(&e) => {
                self.begin_rejoin(session, &e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn apply_assignment(&self, session: &mut GroupSession, partitions: Vec<TopicPartition>) {
        let assignment: BTreeSet<TopicPartition> = partitions.into_iter().collect();
        session.positions.retain(|tp, _| assignment.contains(tp));
        info!(
            group_id = %self.config.group_id,
            generation = session.generation,
            partitions = ?assignment.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Assignment received"
        );
        session.assignment = assignment;
    }

    /// Give every assigned partition without a position its starting offset.
    ///
    /// Partitions whose lookup fails are left for the next round.
    async fn initialize_positions(&self, session: &mut GroupSession) -> Result<()> {
        let missing: Vec<TopicPartition> = session
            .assignment
            .iter()
            .filter(|tp| !session.positions.contains_key(*tp))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let mut needs_committed = Vec::new();
        for tp in missing {
            if let Some(offset) = session.pending_seeks.remove(&tp) {
                session.floors.remove(&tp);
                session.positions.insert(tp, offset);
            } else {
                needs_committed.push(tp);
            }
        }
        if needs_committed.is_empty() {
            return Ok(());
        }

        let request = OffsetFetchRequest {
            group_id: self.config.group_id.clone(),
            partitions: needs_committed.clone(),
        };
        let committed = match self
            .with_coordinator(|conn| async move { conn.fetch_offsets(request).await })
            .await
        {
            Ok(committed) => committed,
            Err(e) => {
                debug!(error = %e, "Committed offset lookup failed, retrying next poll");
                return Ok(());
            }
        };

        for tp in needs_committed {
            let start = match committed.get(&tp) {
                Some(offset) => {
                    session.committed.insert(tp.clone(), *offset);
                    *offset
                }
                None => match self.reset_offset(&tp).await {
                    Ok(offset) => offset,
                    Err(e @ ClientError::NotFound(_)) => return Err(e),
                    Err(e) => {
                        debug!(partition = %tp, error = %e, "Offset reset lookup failed, retrying next poll");
                        continue;
                    }
                },
            };
            let position = session.floors.get(&tp).map_or(start, |floor| start.max(*floor));
            debug!(partition = %tp, position, "Initialized position");
            session.positions.insert(tp, position);
        }
        Ok(())
    }

    /// Refresh the cached committed offsets of `partitions` from the coordinator.
    async fn load_committed(
        &self,
        session: &mut GroupSession,
        partitions: Vec<TopicPartition>,
    ) -> Result<()> {
        let request = OffsetFetchRequest {
            group_id: self.config.group_id.clone(),
            partitions,
        };
        let committed = self
            .with_coordinator(|conn| async move { conn.fetch_offsets(request).await })
            .await?;
        for (tp, offset) in committed {
            let known = session.committed.entry(tp).or_insert(offset);
            *known = (*known).max(offset);
        }
        Ok(())
    }

    async fn reset_offset(&self, tp: &TopicPartition) -> Result<i64> {
        match self.config.auto_offset_reset {
            OffsetReset::Earliest => self.resolver.resolve(tp, OffsetSpec::Earliest).await,
            OffsetReset::Latest => self.resolver.resolve(tp, OffsetSpec::Latest).await,
            OffsetReset::None => Err(ClientError::NotFound(format!(
                "no committed offset for {} and auto.offset.reset is none",
                tp
            ))),
        }
    }

    /// Fetch once from each assigned partition, up to `max_poll_records` in total.
    async fn fetch_round(&self, session: &mut GroupSession) -> Result<Vec<ConsumedRecord>> {
        self.initialize_positions(session).await?;

        let mut partitions: Vec<TopicPartition> = session.positions.keys().cloned().collect();
        if partitions.is_empty() {
            return Ok(Vec::new());
        }
        let start = session.next_partition % partitions.len();
        partitions.rotate_left(start);
        session.next_partition = session.next_partition.wrapping_add(1);

        let mut records = Vec::new();
        for tp in partitions {
            let budget = self.config.max_poll_records.saturating_sub(records.len());
            if budget == 0 {
                break;
            }
            let Some(&offset) = session.positions.get(&tp) else {
                continue;
            };

            let response = match self.fetch_partition(&tp, offset, budget).await {
                Ok(response) => response,
                Err(ClientError::Broker(BrokerError::OffsetOutOfRange { .. })) => {
                    match self.reset_offset(&tp).await {
                        Ok(reset) => {
                            warn!(partition = %tp, offset, reset, "Offset out of range, reset applied");
                            session.positions.insert(tp, reset);
                        }
                        Err(e) => warn!(partition = %tp, error = %e, "Offset out of range and reset failed"),
                    }
                    continue;
                }
                Err(e) => {
                    debug!(partition = %tp, error = %e, "Fetch failed, skipping partition this round");
                    continue;
                }
            };

            let floor = session.floors.get(&tp).copied().unwrap_or(i64::MIN);
            let mut next = offset;
            for record in response.records {
                next = next.max(record.offset + 1);
                if record.offset < floor {
                    continue;
                }
                records.push(ConsumedRecord {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset: record.offset,
                    timestamp: record.timestamp,
                    key: record.key,
                    value: record.value,
                });
            }
            if next > offset {
                session.positions.insert(tp.clone(), next);
                let floor = session.floors.entry(tp).or_insert(next);
                *floor = (*floor).max(next);
            }
        }
        Ok(records)
    }

    async fn fetch_partition(
        &self,
        tp: &TopicPartition,
        offset: i64,
        max_records: usize,
    ) -> Result<FetchResponse> {
        let metadata = self.cluster.metadata();
        let leader = metadata.leader_for(&tp.topic, tp.partition).await?;
        let result = async {
            let conn = self.cluster.pool().acquire(leader).await?;
            let request = FetchRequest {
                tp: tp.clone(),
                offset,
                max_records,
            };
            call(self.config.client.request_timeout, conn.fetch(request)).await
        }
        .await;

        if let Err(e) = &result {
            if e.is_stale_routing() || matches!(e, ClientError::Timeout(_)) {
                self.cluster.pool().invalidate(leader).await;
                metadata.invalidate(&tp.topic).await;
                if let Err(refresh_err) = metadata.refresh(&[tp.topic.clone()], true).await {
                    debug!(topic = %tp.topic, error = %refresh_err, "Metadata refresh after fetch failure failed");
                }
            }
        }
        result
    }

    async fn commit_offsets(
        &self,
        session: &mut GroupSession,
        offsets: BTreeMap<TopicPartition, i64>,
    ) -> Result<()> {
        let (generation, member_id) = match (&session.member_id, session.state) {
            (Some(id), MemberState::Stable) => (session.generation, id.clone()),
            _ => (-1, String::new()),
        };
        let request = OffsetCommitRequest {
            group_id: self.config.group_id.clone(),
            generation,
            member_id,
            offsets: offsets.clone(),
        };

        match self
            .with_coordinator(|conn| async move { conn.commit_offsets(request).await })
            .await
        {
            Ok(()) => {
                debug!(group_id = %self.config.group_id, partitions = offsets.len(), "Committed offsets");
                for (tp, offset) in offsets {
                    let committed = session.committed.entry(tp).or_insert(offset);
                    *committed = (*committed).max(offset);
                }
                Ok(())
            }
            Err(e) => {
                if requires_rejoin(&e) {
                    self.begin_rejoin(session, &e);
                }
                Err(e)
            }
        }
    }

    /// Auto-commit path: commit delivered positions, logging failures.
    async fn commit_uncommitted(&self, session: &mut GroupSession) {
        let offsets = session.uncommitted();
        if offsets.is_empty() {
            return;
        }
        if let Err(e) = self.commit_offsets(session, offsets).await {
            warn!(group_id = %self.config.group_id, error = %e, "Auto-commit failed");
        }
    }
}

/// Builder for [`Consumer`].
///
/// `group_id` is required. Either hand it an existing [`Cluster`] or a
/// [`Connector`] plus bootstrap servers.
pub struct ConsumerBuilder {
    config: ConsumerConfig,
    connector: Option<Arc<dyn Connector>>,
    cluster: Option<Cluster>,
}

impl ConsumerBuilder {
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
            connector: None,
            cluster: None,
        }
    }

    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

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

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    pub fn auto_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.config.auto_offset_reset = reset;
        self
    }

    pub fn enable_auto_commit(mut self, enabled: bool) -> Self {
        self.config.enable_auto_commit = enabled;
        self
    }

    pub fn auto_commit_interval(mut self, interval: Duration) -> Self {
        self.config.auto_commit_interval = interval;
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn max_poll_records(mut self, max: usize) -> Self {
        self.config.max_poll_records = max;
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

    /// Apply a string property (see [`ConsumerConfig::set`]).
    pub fn set(mut self, key: &str, value: &str) -> Result<Self> {
        self.config.set(key, value)?;
        Ok(self)
    }

    pub async fn build(mut self) -> Result<Consumer> {
        if let Some(cluster) = &self.cluster {
            if self.config.client.bootstrap_servers.is_empty() {
                self.config.client.bootstrap_servers = cluster.config().bootstrap_servers.clone();
            }
        }
        self.config.validate()?;
        if self.config.max_poll_records == 0 {
            return Err(ClientError::Config(
                "max.poll.records must be at least 1".to_string(),
            ));
        }

        match self.cluster {
            Some(cluster) => Ok(Consumer::start(cluster, self.config, false)),
            None => {
                let connector = self.connector.ok_or_else(|| {
                    ClientError::Config("a connector or cluster is required".to_string())
                })?;
                let cluster = Cluster::connect(connector, self.config.client.clone()).await?;
                Ok(Consumer::start(cluster, self.config, true))
            }
        }
    }
}

impl Default for ConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use brokerlink_sim::{Api, SimCluster};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(20), 2.0)
    }

    async fn consumer_for(sim: &SimCluster, group: &str, reset: OffsetReset) -> Consumer {
        Consumer::builder()
            .bootstrap_servers(["localhost:9092"])
            .group_id(group)
            .auto_offset_reset(reset)
            .enable_auto_commit(false)
            .heartbeat_interval(Duration::from_millis(50))
            .retry_policy(fast_retry())
            .connector(Arc::new(sim.clone()))
            .build()
            .await
            .unwrap()
    }

    async fn seed(sim: &SimCluster, tp: &TopicPartition, count: usize) {
        for i in 0..count {
            sim.append(tp, None, &format!("v{}", i), 1_000 + i as i64)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_subscribe_joins_and_becomes_stable() {
        let sim = SimCluster::builder().topic("orders", 3).build();
        let consumer = consumer_for(&sim, "g1", OffsetReset::Earliest).await;

        consumer.subscribe(&["orders"]).await.unwrap();

        assert_eq!(consumer.member_state().await, MemberState::Stable);
        assert_eq!(consumer.assignment().await.len(), 3);
        assert_eq!(sim.group_members("g1").await, 1);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_topic() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let consumer = consumer_for(&sim, "g1", OffsetReset::Earliest).await;

        let err = consumer.subscribe(&["missing"]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SubscriptionError);
    }

    #[tokio::test]
    async fn test_poll_before_subscribe() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let consumer = consumer_for(&sim, "g1", OffsetReset::Earliest).await;

        let err = consumer.poll(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SubscriptionError);
    }

    #[tokio::test]
    async fn test_poll_respects_max_poll_records() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let tp = TopicPartition::new("orders", 0);
        seed(&sim, &tp, 10).await;
        let consumer = Consumer::builder()
            .bootstrap_servers(["localhost:9092"])
            .group_id("g1")
            .auto_offset_reset(OffsetReset::Earliest)
            .max_poll_records(4)
            .connector(Arc::new(sim.clone()))
            .build()
            .await
            .unwrap();
        consumer.subscribe(&["orders"]).await.unwrap();

        let batch = consumer.poll(Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(consumer.position(&tp).await, Some(4));
    }

    #[tokio::test]
    async fn test_latest_reset_skips_existing_records() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let tp = TopicPartition::new("orders", 0);
        seed(&sim, &tp, 3).await;
        let consumer = consumer_for(&sim, "g1", OffsetReset::Latest).await;
        consumer.subscribe(&["orders"]).await.unwrap();

        let batch = consumer.poll(Duration::from_millis(50)).await.unwrap();
        assert!(batch.is_empty());
        assert!(!batch.rebalance_in_progress);

        sim.append(&tp, None, "new", 5_000).await.unwrap();
        let batch = consumer.poll(Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.records[0].offset, 3);
    }

    #[tokio::test]
    async fn test_reset_none_without_commit_fails() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let consumer = consumer_for(&sim, "g1", OffsetReset::None).await;
        consumer.subscribe(&["orders"]).await.unwrap();

        let err = consumer.poll(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let tp = TopicPartition::new("orders", 0);
        let consumer = consumer_for(&sim, "g1", OffsetReset::Earliest).await;
        consumer.subscribe(&["orders"]).await.unwrap();

        consumer.commit(&tp, 5).await.unwrap();
        consumer.commit(&tp, 3).await.unwrap();

        assert_eq!(sim.committed("g1", &tp).await, Some(5));
        assert_eq!(consumer.committed(&tp).await, Some(5));
    }

    #[tokio::test]
    async fn test_seek_resets_floor() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let tp = TopicPartition::new("orders", 0);
        seed(&sim, &tp, 5).await;
        let consumer = consumer_for(&sim, "g1", OffsetReset::Earliest).await;
        consumer.subscribe(&["orders"]).await.unwrap();
        assert_eq!(consumer.poll(Duration::from_secs(1)).await.unwrap().len(), 5);

        consumer.seek(&tp, 2).await.unwrap();
        let batch = consumer.poll(Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.records[0].offset, 2);
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn test_seek_outside_subscription() {
        let sim = SimCluster::builder().topic("orders", 1).topic("events", 1).build();
        let consumer = consumer_for(&sim, "g1", OffsetReset::Earliest).await;
        consumer.subscribe(&["orders"]).await.unwrap();

        let err = consumer
            .seek(&TopicPartition::new("events", 0), 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_seek_to_timestamp_waits_for_subscribe() {
        let sim = SimCluster::builder().topic("orders", 2).topic("events", 1).build();
        let tp = TopicPartition::new("orders", 1);
        seed(&sim, &tp, 4).await;
        let consumer = consumer_for(&sim, "g1", OffsetReset::Earliest).await;
        consumer.subscribe(&["orders"]).await.unwrap();
        sim.set_latency(Some(Duration::from_millis(20))).await;

        let (sought, resubscribed) = tokio::join!(
            consumer.seek_to_timestamp("orders", 1_002),
            consumer.subscribe(&["events"]),
        );
        resubscribed.unwrap();
        let applied = sought.unwrap();
        assert_eq!(applied.get(&tp), Some(&2));

        // the seek finished before the subscription moved to "events"
        assert_eq!(consumer.position(&tp).await, None);
        assert_eq!(
            consumer.assignment().await,
            vec![TopicPartition::new("events", 0)]
        );
    }

    #[tokio::test]
    async fn test_offset_out_of_range_reapplies_reset() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let tp = TopicPartition::new("orders", 0);
        seed(&sim, &tp, 6).await;
        let consumer = consumer_for(&sim, "g1", OffsetReset::Earliest).await;
        consumer.subscribe(&["orders"]).await.unwrap();

        consumer.seek(&tp, 1).await.unwrap();
        sim.truncate_before(&tp, 4).await;

        let batch = consumer.poll(Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.records[0].offset, 4);
    }

    #[tokio::test]
    async fn test_close_twice_and_use_after_close() {
        let sim = SimCluster::builder().topic("orders", 1).build();
        let consumer = consumer_for(&sim, "g1", OffsetReset::Earliest).await;
        consumer.subscribe(&["orders"]).await.unwrap();

        consumer.close().await.unwrap();
        consumer.close().await.unwrap();

        assert_eq!(sim.group_members("g1").await, 0);
        let err = consumer.poll(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn test_rebalancing_member_rejoins_into_syncing() {
        let sim = SimCluster::builder().topic("orders", 2).build();
        let consumer = consumer_for(&sim, "g1", OffsetReset::Earliest).await;
        consumer.subscribe(&["orders"]).await.unwrap();

        sim.inject_fault(
            None,
            Api::Heartbeat,
            BrokerError::IllegalGeneration {
                group_id: "g1".to_string(),
                generation: 1,
            },
            1,
        )
        .await;
        for _ in 0..100 {
            if consumer.member_state().await == MemberState::Rebalancing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(consumer.member_state().await, MemberState::Rebalancing);

        let err = consumer.subscribe(&["orders"]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RebalanceInProgress);

        // a failed rejoin leaves the member rebalancing, not joining
        sim.inject_fault(None, Api::JoinGroup, BrokerError::Timeout { broker_id: 1 }, 1)
            .await;
        let batch = consumer.poll(Duration::ZERO).await.unwrap();
        assert!(batch.rebalance_in_progress);
        assert_eq!(consumer.member_state().await, MemberState::Rebalancing);

        consumer.poll(Duration::from_secs(1)).await.unwrap();
        assert_eq!(consumer.member_state().await, MemberState::Stable);
        assert_eq!(consumer.assignment().await.len(), 2);
    }

    #[tokio::test]
    async fn test_builder_requires_group_id() {
        let sim = SimCluster::builder().build();
        let err = Consumer::builder()
            .bootstrap_servers(["localhost:9092"])
            .connector(Arc::new(sim))
            .build()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
