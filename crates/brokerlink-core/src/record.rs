//! Record Data Structures
//!
//! This module defines the two shapes a record takes on its way through a broker:
//!
//! - [`ProduceRecord`]: what a producer ships in a produce request. It has no offset
//!   yet; the partition leader assigns one when it appends the record.
//! - [`Record`]: what a fetch returns. It carries the offset the broker assigned.
//!
//! ## Design Decisions
//! - Uses `bytes::Bytes` for zero-copy payloads (cloning a record never copies data)
//! - Offsets are `i64` and timestamps are milliseconds since the Unix epoch
//! - Key is optional because not all use cases need keys
//!
//! ## Example
//! ```ignore
//! let record = Record::new(
//!     100,                              // offset
//!     1_700_000_000_000,                // timestamp
//!     Some(Bytes::from("cust-42")),     // key
//!     Bytes::from("order-1"),           // value
//! );
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A record stored in a partition log, as returned by a fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Offset of this record in the partition
    pub offset: i64,

    /// Timestamp in milliseconds since epoch
    pub timestamp: i64,

    /// Optional key
    pub key: Option<Bytes>,

    /// Value (payload)
    pub value: Bytes,
}

impl Record {
    pub fn new(offset: i64, timestamp: i64, key: Option<Bytes>, value: Bytes) -> Self {
        Self {
            offset,
            timestamp,
            key,
            value,
        }
    }

    /// Approximate in-memory size: key + value + 16 bytes for offset and timestamp.
    pub fn size_bytes(&self) -> usize {
        self.key.as_ref().map_or(0, |k| k.len()) + self.value.len() + 16
    }
}

/// A record inside a produce request. The leader assigns its offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRecord {
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp: i64,
}

impl ProduceRecord {
    pub fn new(key: Option<Bytes>, value: Bytes, timestamp: i64) -> Self {
        Self {
            key,
            value,
            timestamp,
        }
    }

    /// Convert into a stored record at the given offset.
    pub fn into_record(self, offset: i64) -> Record {
        Record::new(offset, self.timestamp, self.key, self.value)
    }
}
