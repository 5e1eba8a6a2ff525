//! Offset Resolver
//!
//! Translates earliest/latest/timestamp positions into concrete offsets by asking
//! each partition's leader.
//!
//! Timestamp lookups return the earliest offset whose record timestamp is at or
//! after the target. A partition with no such record resolves to its high-water
//! mark ([`TimestampOffset::EndOfLog`]), so a consumer positioned there only sees
//! records produced later.
//!
//! Lookups that fail on stale routing (leader moved, broker gone) are retried once
//! after a forced metadata refresh.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use brokerlink_core::protocol::ListOffsetsResponse;
use brokerlink_core::{OffsetSpec, TopicPartition};
use futures::future::join_all;
use tracing::debug;

use crate::cluster::Cluster;
use crate::connection_pool::call;
use crate::error::{ClientError, Result};
use crate::metadata::MetadataCache;

/// Outcome of a timestamp lookup for one partition.
#[derive(Debug, Clone)]
pub enum TimestampOffset {
    /// First offset with a timestamp at or after the target
    Found(i64),
    /// No such record; the high-water mark at lookup time
    EndOfLog(i64),
    /// The lookup for this partition failed
    Unavailable(ClientError),
}

impl TimestampOffset {
    /// Offset to position at, if the lookup succeeded.
    pub fn offset(&self) -> Option<i64> {
        match self {
            TimestampOffset::Found(offset) | TimestampOffset::EndOfLog(offset) => Some(*offset),
            TimestampOffset::Unavailable(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct OffsetResolver {
    metadata: Arc<MetadataCache>,
    request_timeout: Duration,
}

impl OffsetResolver {
    pub fn new(cluster: &Cluster) -> Self {
        Self {
            metadata: Arc::clone(cluster.metadata()),
            request_timeout: cluster.config().request_timeout,
        }
    }

    /// Resolve `spec` for one partition.
    pub async fn resolve(&self, tp: &TopicPartition, spec: OffsetSpec) -> Result<i64> {
        let response = self.lookup(tp, spec).await?;
        Ok(response.offset.unwrap_or(response.high_watermark))
    }

    /// `(earliest, latest)` offsets of a partition, where latest is the high-water mark.
    pub async fn watermarks(&self, tp: &TopicPartition) -> Result<(i64, i64)> {
        let (earliest, latest) = futures::try_join!(
            self.lookup(tp, OffsetSpec::Earliest),
            self.lookup(tp, OffsetSpec::Latest)
        )?;
        Ok((
            earliest.offset.unwrap_or(0),
            latest.offset.unwrap_or(latest.high_watermark),
        ))
    }

    /// Resolve a timestamp for every partition of `topic`, concurrently.
    ///
    /// Fails only if the topic's partitions cannot be listed; individual lookup
    /// failures are reported per partition.
    pub async fn resolve_by_timestamp(
        &self,
        topic: &str,
        timestamp_ms: i64,
    ) -> Result<BTreeMap<TopicPartition, TimestampOffset>> {
        let partitions = self.metadata.get_partitions(topic).await?;

        let lookups = partitions.into_iter().map(|p| async move {
            let status = match self.lookup(&p.tp, OffsetSpec::Timestamp(timestamp_ms)).await {
                Ok(ListOffsetsResponse {
                    offset: Some(offset),
                    ..
                }) => TimestampOffset::Found(offset),
                Ok(response) => TimestampOffset::EndOfLog(response.high_watermark),
                Err(e) => {
                    debug!(partition = %p.tp, error = %e, "Timestamp lookup failed");
                    TimestampOffset::Unavailable(e)
                }
            };
            (p.tp, status)
        });

        Ok(join_all(lookups).await.into_iter().collect())
    }

    async fn lookup(&self, tp: &TopicPartition, spec: OffsetSpec) -> Result<ListOffsetsResponse> {
        let mut refreshed = false;
        loop {
            let leader = self.metadata.leader_for(&tp.topic, tp.partition).await?;
            let result = async {
                let conn = self.metadata.pool().acquire(leader).await?;
                call(self.request_timeout, conn.list_offsets(tp, spec)).await
            }
            .await;

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_stale_routing() && !refreshed => {
                    debug!(partition = %tp, broker_id = leader, error = %e, "Offset lookup hit stale routing, refreshing");
                    self.metadata.pool().invalidate(leader).await;
                    self.metadata.invalidate(&tp.topic).await;
                    self.metadata.refresh(&[tp.topic.clone()], true).await?;
                    refreshed = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
