//! Batching Logic for the Producer
//!
//! Pending sends are accumulated per partition until a size, byte or time threshold
//! is met, then shipped to the partition leader in one produce request.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐
//! │  send(...)   │ Producer API
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │  BatchBuffer                 │ Per-partition buffer
//! │  - sends: Vec<PendingSend>   │
//! │  - size_bytes: usize         │
//! │  - created_at: Instant       │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Flush on size (batch_size records or max_batch_bytes)
//!        ├─→ Flush on time (linger)
//!        ├─→ Flush on explicit flush() / close()
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │  ProduceRequest              │
//! │  topic-partition, records[]  │
//! └──────────────────────────────┘
//! ```
//!
//! ## Ordering
//!
//! [`BatchManager`] hands out at most one batch per partition at a time. A partition
//! whose batch is in flight is skipped by [`BatchManager::ready_batches`] until the
//! producer calls [`BatchManager::complete`], so retries of one batch can never be
//! overtaken by the next.
//!
//! ## Thread Safety
//!
//! Neither type is thread-safe. The producer keeps the manager behind a
//! `tokio::sync::Mutex`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use brokerlink_core::{ProduceRecord, TopicPartition};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::Result;
use crate::producer::RecordAck;

/// A message accepted by the producer and not yet acknowledged.
#[derive(Debug)]
pub struct PendingSend {
    pub record: ProduceRecord,

    /// Completes the caller's delivery future
    pub ack: oneshot::Sender<Result<RecordAck>>,

    /// Produce attempts made so far
    pub attempts: u32,

    /// Point after which no further attempt is made
    pub deadline: Instant,
}

impl PendingSend {
    pub fn new(
        record: ProduceRecord,
        deadline: Instant,
    ) -> (Self, oneshot::Receiver<Result<RecordAck>>) {
        let (ack, rx) = oneshot::channel();
        (
            Self {
                record,
                ack,
                attempts: 0,
                deadline,
            },
            rx,
        )
    }

    /// key + value + 16 bytes for timestamp and bookkeeping.
    pub fn size_bytes(&self) -> usize {
        self.record.key.as_ref().map_or(0, |k| k.len()) + self.record.value.len() + 16
    }
}

/// Buffer for pending sends destined for a single partition.
///
/// # Flush Triggers
///
/// - Size: `sends.len() >= max_batch_size`
/// - Bytes: `size_bytes >= max_batch_bytes`
/// - Time: `age >= linger`
#[derive(Debug)]
pub struct BatchBuffer {
    sends: Vec<PendingSend>,

    /// Sum of all buffered send sizes
    size_bytes: usize,

    /// When the oldest buffered send arrived
    created_at: Instant,

    max_batch_size: usize,
    max_batch_bytes: usize,
    linger: Duration,
}

impl BatchBuffer {
    pub fn new(max_batch_size: usize, max_batch_bytes: usize, linger: Duration) -> Self {
        Self {
            sends: Vec::new(),
            size_bytes: 0,
            created_at: Instant::now(),
            max_batch_size: max_batch_size.max(1),
            max_batch_bytes: max_batch_bytes.max(1),
            linger,
        }
    }

    pub fn append(&mut self, send: PendingSend) {
        if self.sends.is_empty() {
            self.created_at = Instant::now();
        }
        self.size_bytes += send.size_bytes();
        self.sends.push(send);
        trace!(
            record_count = self.sends.len(),
            size_bytes = self.size_bytes,
            "Appended record to batch"
        );
    }

    /// Whether any flush trigger has fired.
    pub fn should_flush(&self) -> bool {
        if self.sends.is_empty() {
            return false;
        }

        if self.sends.len() >= self.max_batch_size {
            trace!(
                record_count = self.sends.len(),
                max_batch_size = self.max_batch_size,
                "Batch should flush: size threshold"
            );
            return true;
        }

        if self.size_bytes >= self.max_batch_bytes {
            trace!(
                size_bytes = self.size_bytes,
                max_batch_bytes = self.max_batch_bytes,
                "Batch should flush: bytes threshold"
            );
            return true;
        }

        let age = self.created_at.elapsed();
        if age >= self.linger {
            trace!(
                age_ms = age.as_millis() as u64,
                linger_ms = self.linger.as_millis() as u64,
                "Batch should flush: time threshold"
            );
            return true;
        }

        false
    }

    /// Take the oldest sends, up to one batch worth of records and bytes.
    ///
    /// Always takes at least one send, so an oversized record still ships alone.
    /// Whatever is left keeps its original age.
    pub fn drain(&mut self) -> Vec<PendingSend> {
        let mut count = 0;
        let mut bytes = 0;
        for send in &self.sends {
            let size = send.size_bytes();
            if count > 0 && (count >= self.max_batch_size || bytes + size > self.max_batch_bytes) {
                break;
            }
            count += 1;
            bytes += size;
        }

        let rest = self.sends.split_off(count);
        let batch = std::mem::replace(&mut self.sends, rest);
        self.size_bytes -= bytes;
        debug!(
            record_count = batch.len(),
            remaining = self.sends.len(),
            "Drained batch buffer"
        );
        batch
    }

    /// Take every buffered send regardless of batch limits.
    pub fn take_all(&mut self) -> Vec<PendingSend> {
        self.size_bytes = 0;
        std::mem::take(&mut self.sends)
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sends.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Manager for the per-partition buffers of one producer.
///
/// ```text
/// ┌──────────────────────────────────────────────┐
/// │  BatchManager                                │
/// ├──────────────────────────────────────────────┤
/// │  buffers:   HashMap<TopicPartition, Buffer>  │
/// │  in_flight: HashSet<TopicPartition>          │
/// └──────────────────────────────────────────────┘
///       │
///       ├─→ orders-0 → BatchBuffer { 50 records, 128KB }
///       ├─→ orders-1 → BatchBuffer { 20 records, 64KB }   (in flight)
///       └─→ events-0 → BatchBuffer { 100 records, 512KB }
/// ```
#[derive(Debug)]
pub struct BatchManager {
    buffers: HashMap<TopicPartition, BatchBuffer>,

    /// Partitions with a batch currently being sent
    in_flight: HashSet<TopicPartition>,

    max_batch_size: usize,
    max_batch_bytes: usize,
    linger: Duration,
}

impl BatchManager {
    pub fn new(max_batch_size: usize, max_batch_bytes: usize, linger: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            in_flight: HashSet::new(),
            max_batch_size,
            max_batch_bytes,
            linger,
        }
    }

    /// Append a send to its partition's buffer, creating the buffer on first use.
    pub fn append(&mut self, tp: TopicPartition, send: PendingSend) {
        let (max_batch_size, max_batch_bytes, linger) =
            (self.max_batch_size, self.max_batch_bytes, self.linger);
        self.buffers
            .entry(tp)
            .or_insert_with(|| BatchBuffer::new(max_batch_size, max_batch_bytes, linger))
            .append(send);
    }

    /// Batches whose flush trigger fired, for partitions with nothing in flight.
    ///
    /// Every returned partition is marked in flight.
    pub fn ready_batches(&mut self) -> Vec<(TopicPartition, Vec<PendingSend>)> {
        self.take_batches(false)
    }

    /// One batch from every non-empty partition with nothing in flight, ignoring
    /// flush triggers.
    ///
    /// Every returned partition is marked in flight.
    pub fn flush_all(&mut self) -> Vec<(TopicPartition, Vec<PendingSend>)> {
        self.take_batches(true)
    }

    fn take_batches(&mut self, force: bool) -> Vec<(TopicPartition, Vec<PendingSend>)> {
        let mut ready = Vec::new();
        for (tp, buffer) in &mut self.buffers {
            if self.in_flight.contains(tp) || buffer.is_empty() {
                continue;
            }
            if force || buffer.should_flush() {
                ready.push((tp.clone(), buffer.drain()));
            }
        }
        for (tp, _) in &ready {
            self.in_flight.insert(tp.clone());
        }
        if !ready.is_empty() {
            debug!(batch_count = ready.len(), force, "Found ready batches");
        }
        ready
    }

    /// Mark a partition's batch as finished so its next batch may go out.
    pub fn complete(&mut self, tp: &TopicPartition) {
        self.in_flight.remove(tp);
    }

    /// Remove every buffered send (in-flight batches are not touched).
    pub fn take_all(&mut self) -> Vec<PendingSend> {
        let sends: Vec<PendingSend> = self
            .buffers
            .values_mut()
            .flat_map(|buffer| buffer.take_all())
            .collect();
        self.buffers.clear();
        sends
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// (partitions, buffered records, buffered bytes)
    pub fn stats(&self) -> (usize, usize, usize) {
        let partition_count = self.buffers.len();
        let total_records: usize = self.buffers.values().map(|b| b.len()).sum();
        let total_bytes: usize = self.buffers.values().map(|b| b.size_bytes()).sum();
        (partition_count, total_records, total_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pending(value: &str) -> PendingSend {
        let record = ProduceRecord::new(None, Bytes::from(value.to_string()), 1000);
        PendingSend::new(record, Instant::now() + Duration::from_secs(60)).0
    }

    fn tp(topic: &str, partition: i32) -> TopicPartition {
        TopicPartition::new(topic, partition)
    }

    #[test]
    fn test_pending_send_size() {
        let record = ProduceRecord::new(Some(Bytes::from("key")), Bytes::from("value"), 1);
        let (send, _rx) = PendingSend::new(record, Instant::now());
        // key (3) + value (5) + overhead (16) = 24
        assert_eq!(send.size_bytes(), 24);
        assert_eq!(send.attempts, 0);
    }

    #[tokio::test]
    async fn test_batch_buffer_flush_on_size() {
        let mut buffer = BatchBuffer::new(2, 1024 * 1024, Duration::from_secs(60));

        buffer.append(pending("test1"));
        assert!(!buffer.should_flush());

        buffer.append(pending("test2"));
        assert!(buffer.should_flush());
    }

    #[tokio::test]
    async fn test_batch_buffer_flush_on_bytes() {
        let mut buffer = BatchBuffer::new(100, 50, Duration::from_secs(60));

        // 20 bytes each, 3 records = 60 bytes > 50 byte limit
        buffer.append(pending("test"));
        buffer.append(pending("test"));
        assert!(!buffer.should_flush());

        buffer.append(pending("test"));
        assert!(buffer.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_buffer_flush_on_linger() {
        let mut buffer = BatchBuffer::new(100, 1024 * 1024, Duration::from_millis(10));
        buffer.append(pending("test"));
        assert!(!buffer.should_flush());

        tokio::time::advance(Duration::from_millis(11)).await;
        assert!(buffer.should_flush());
    }

    #[tokio::test]
    async fn test_drain_respects_batch_limits() {
        let mut buffer = BatchBuffer::new(2, 1024 * 1024, Duration::from_secs(60));
        for v in ["a", "b", "c"] {
            buffer.append(pending(v));
        }

        let first = buffer.drain();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].record.value, Bytes::from("a"));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.size_bytes(), 17);

        let second = buffer.drain();
        assert_eq!(second[0].record.value, Bytes::from("c"));
        assert!(buffer.is_empty());
        assert_eq!(buffer.size_bytes(), 0);
    }

    #[tokio::test]
    async fn test_oversized_record_ships_alone() {
        let mut buffer = BatchBuffer::new(10, 8, Duration::from_secs(60));
        buffer.append(pending("much larger than eight bytes"));
        buffer.append(pending("x"));

        assert_eq!(buffer.drain().len(), 1);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_manager_one_batch_in_flight_per_partition() {
        let mut manager = BatchManager::new(1, 1024 * 1024, Duration::from_secs(60));

        manager.append(tp("orders", 0), pending("a"));
        manager.append(tp("orders", 0), pending("b"));
        manager.append(tp("orders", 1), pending("c"));

        let ready = manager.ready_batches();
        assert_eq!(ready.len(), 2);
        assert_eq!(manager.in_flight_count(), 2);

        // orders-0 still has "b" buffered but its first batch is in flight
        assert!(manager.ready_batches().is_empty());

        manager.complete(&tp("orders", 0));
        let ready = manager.ready_batches();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, tp("orders", 0));
        assert_eq!(ready[0].1[0].record.value, Bytes::from("b"));
    }

    #[tokio::test]
    async fn test_manager_flush_all_ignores_triggers() {
        let mut manager = BatchManager::new(100, 1024 * 1024, Duration::from_secs(60));

        manager.append(tp("orders", 0), pending("test1"));
        manager.append(tp("events", 0), pending("test2"));
        assert!(manager.ready_batches().is_empty());

        let all = manager.flush_all();
        assert_eq!(all.len(), 2);

        let (partitions, records, bytes) = manager.stats();
        assert_eq!(partitions, 2);
        assert_eq!(records, 0);
        assert_eq!(bytes, 0);
    }

    #[tokio::test]
    async fn test_manager_take_all() {
        let mut manager = BatchManager::new(100, 1024 * 1024, Duration::from_secs(60));
        manager.append(tp("orders", 0), pending("a"));
        manager.append(tp("orders", 2), pending("b"));

        assert_eq!(manager.take_all().len(), 2);
        assert_eq!(manager.stats(), (0, 0, 0));
    }
}
