pub mod rocks;

pub use rocks::RocksRecordLog;

use anyhow::Result;

use crate::codec::StoredRecord;

/// Append-only log of call records, ordered by insertion time.
///
/// The log supports no update or delete: "the current cached value" for a
/// descriptor hash is defined as the most recently inserted matching record.
/// Implementations must be safe for concurrent readers and writers; two
/// writers racing on the same hash both land, and read-time recency picks a
/// winner.
pub trait RecordLog: Send + Sync {
    /// Append a record.
    fn insert(&self, record: &StoredRecord) -> Result<()>;

    /// The most recently inserted record whose descriptor hash matches.
    fn find_latest(&self, descriptor_hash: &str) -> Result<Option<StoredRecord>>;
}
