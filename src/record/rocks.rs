use anyhow::{Context, Result};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::RecordLog;
use crate::codec::StoredRecord;

/// RocksDB column families.
///
/// - "default": records keyed by big-endian insertion sequence (append-only)
/// - "index_hash": secondary index keyed by `descriptor_hash ++ seq`, scanned
///   in reverse to resolve "most recent record for this hash"
const CF_RECORDS: &str = "default";
const CF_INDEX_HASH: &str = "index_hash";

/// RocksDB-backed append-only record log.
///
/// Every insert gets the next sequence number; nothing is ever updated or
/// deleted. Recency resolution is a reverse prefix scan over the hash index,
/// so concurrent same-hash writers race benignly: both records land and the
/// highest sequence wins at read time.
pub struct RocksRecordLog {
    db: DB,
    next_seq: AtomicU64,
}

impl RocksRecordLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Snappy);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_statistics_level(rocksdb::statistics::StatsLevel::DisableAll);

        let db = DB::open_cf(&opts, path, vec![CF_RECORDS, CF_INDEX_HASH])
            .context("failed to open record log database")?;

        // Resume the sequence after the highest existing key.
        let next_seq = {
            let mut iter = db.iterator(IteratorMode::End);
            match iter.next() {
                Some(Ok((key, _))) if key.len() == 8 => {
                    u64::from_be_bytes(key.as_ref().try_into().unwrap()) + 1
                }
                _ => 0,
            }
        };

        Ok(Self {
            db,
            next_seq: AtomicU64::new(next_seq),
        })
    }
}

impl RecordLog for RocksRecordLog {
    fn insert(&self, record: &StoredRecord) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let key = seq.to_be_bytes();
        let value = serde_json::to_vec(record).context("failed to encode record")?;

        let cf_index = self
            .db
            .cf_handle(CF_INDEX_HASH)
            .context("missing index_hash column family")?;

        let mut index_key = record.descriptor_hash.as_bytes().to_vec();
        index_key.extend_from_slice(&key);

        let mut batch = WriteBatch::default();
        batch.put(key, &value);
        batch.put_cf(cf_index, index_key, b"");
        self.db.write(batch).context("failed to append record")?;

        debug!(
            operation = "log.insert",
            descriptor_hash = %record.descriptor_hash,
            seq,
            "record appended"
        );
        Ok(())
    }

    fn find_latest(&self, descriptor_hash: &str) -> Result<Option<StoredRecord>> {
        let cf_index = self
            .db
            .cf_handle(CF_INDEX_HASH)
            .context("missing index_hash column family")?;

        let prefix = descriptor_hash.as_bytes();
        let mut upper = prefix.to_vec();
        upper.extend_from_slice(&u64::MAX.to_be_bytes());

        // Reverse scan from the highest possible key for this hash; the first
        // entry still carrying the prefix is the latest insertion.
        let mut iter = self
            .db
            .iterator_cf(cf_index, IteratorMode::From(&upper, Direction::Reverse));

        match iter.next() {
            Some(Ok((key, _))) if key.starts_with(prefix) && key.len() == prefix.len() + 8 => {
                let seq_bytes: [u8; 8] = key[prefix.len()..].try_into().unwrap();
                let record_bytes = self
                    .db
                    .get(seq_bytes)
                    .context("failed to read record")?
                    .context("index points at a missing record")?;
                let record: StoredRecord =
                    serde_json::from_slice(&record_bytes).context("failed to decode record")?;
                Ok(Some(record))
            }
            Some(Err(e)) => Err(e).context("record log iteration failed"),
            _ => Ok(None),
        }
    }
}
