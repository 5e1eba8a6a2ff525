//! Partition selection for outgoing messages.
//!
//! 1. **Explicit**: `Message::partition` is used as-is after a range check.
//! 2. **Key-based**: the key is hashed with SipHash and taken modulo the partition
//!    count, so a key keeps its partition while the count does not change.
//! 3. **Round-robin**: keyless messages rotate through partitions using a counter
//!    owned by the producer.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{ClientError, Result};

#[derive(Debug, Default)]
pub struct Partitioner {
    counter: AtomicUsize,
}

impl Partitioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a partition in `[0, partition_count)`.
    pub fn select(
        &self,
        topic: &str,
        explicit: Option<i32>,
        key: Option<&[u8]>,
        partition_count: usize,
    ) -> Result<i32> {
        if partition_count == 0 {
            return Err(ClientError::NotFound(format!(
                "topic '{}' has no partitions",
                topic
            )));
        }

        if let Some(partition) = explicit {
            if partition < 0 || partition as usize >= partition_count {
                return Err(ClientError::NotFound(format!(
                    "partition {}-{} (topic has {} partitions)",
                    topic, partition, partition_count
                )));
            }
            return Ok(partition);
        }

        match key {
            Some(k) => Ok(hash_partition(k, partition_count)),
            None => {
                let next = self.counter.fetch_add(1, Ordering::Relaxed);
                Ok((next % partition_count) as i32)
            }
        }
    }
}

/// SipHash of `key` modulo `partition_count`.
pub fn hash_partition(key: &[u8], partition_count: usize) -> i32 {
    let mut hasher = siphasher::sip::SipHasher::new();
    key.hash(&mut hasher);
    let hash = hasher.finish();
    (hash % partition_count as u64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_same_partition() {
        let partitioner = Partitioner::new();
        let first = partitioner
            .select("orders", None, Some(b"cust-42"), 3)
            .unwrap();
        for _ in 0..10 {
            assert_eq!(
                partitioner
                    .select("orders", None, Some(b"cust-42"), 3)
                    .unwrap(),
                first
            );
        }
    }

    #[test]
    fn test_keys_spread_across_partitions() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            let key = format!("key-{}", i);
            seen.insert(hash_partition(key.as_bytes(), 8));
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn test_round_robin_without_key() {
        let partitioner = Partitioner::new();
        let picks: Vec<i32> = (0..6)
            .map(|_| partitioner.select("orders", None, None, 3).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_explicit_partition_wins_over_key() {
        let partitioner = Partitioner::new();
        let p = partitioner
            .select("orders", Some(2), Some(b"cust-42"), 3)
            .unwrap();
        assert_eq!(p, 2);
    }

    #[test]
    fn test_explicit_partition_out_of_range() {
        let partitioner = Partitioner::new();
        let err = partitioner.select("orders", Some(3), None, 3).unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
        let err = partitioner.select("orders", Some(-1), None, 3).unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
    }
}
