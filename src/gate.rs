use tracing::{debug, info, warn};

use crate::codec::{self, CallResult};
use crate::error::{EngineError, Result};
use crate::record::RecordLog;
use crate::store::ContentStore;

/// The miss/hit protocol in front of the record log.
///
/// Cache-layer inconsistency is never surfaced: a missing or partially
/// resolvable record is absorbed into a miss so the call re-executes instead
/// of failing.
pub struct CacheGate<'a> {
    log: &'a dyn RecordLog,
    store: &'a dyn ContentStore,
}

impl<'a> CacheGate<'a> {
    pub fn new(log: &'a dyn RecordLog, store: &'a dyn ContentStore) -> Self {
        Self { log, store }
    }

    /// Find the current cached result for a descriptor hash.
    ///
    /// Forced re-execution skips the lookup entirely. Any failure along the
    /// read path (log error, missing record, unreachable blob) is a miss.
    pub fn lookup(&self, descriptor_hash: &str, force_run: bool) -> Option<CallResult> {
        if force_run {
            debug!(
                operation = "gate.lookup",
                descriptor_hash = %descriptor_hash,
                "forced re-execution, skipping lookup"
            );
            return None;
        }

        let record = match self.log.find_latest(descriptor_hash) {
            Ok(Some(record)) => record,
            Ok(None) => {
                info!(
                    operation = "gate.lookup",
                    status = "miss",
                    descriptor_hash = %descriptor_hash,
                    "no record"
                );
                return None;
            }
            Err(e) => {
                warn!(
                    operation = "gate.lookup",
                    status = "error",
                    descriptor_hash = %descriptor_hash,
                    "record log read failed, treating as miss: {:#}",
                    e
                );
                return None;
            }
        };

        match codec::deserialize(&record, self.store) {
            Some(result) => {
                info!(
                    operation = "gate.lookup",
                    status = "hit",
                    descriptor_hash = %descriptor_hash,
                    "using cached result"
                );
                Some(result)
            }
            None => {
                info!(
                    operation = "gate.lookup",
                    status = "miss",
                    descriptor_hash = %descriptor_hash,
                    "record incomplete, re-executing"
                );
                None
            }
        }
    }

    /// Persist a fresh result. Always inserts a new record, even when an
    /// equivalent one already exists: dedup happens at read time via recency.
    pub fn store(&self, result: &CallResult) -> Result<()> {
        let record = codec::serialize(result, self.store)?;
        self.log
            .insert(&record)
            .map_err(EngineError::Storage)?;
        debug!(
            operation = "gate.store",
            descriptor_hash = %result.descriptor_hash,
            "record stored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::RuntimeInfo;
    use crate::descriptor::CallDescriptor;
    use crate::record::RocksRecordLog;
    use crate::store::FilesystemStore;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn result_for(store: &FilesystemStore, value: i64) -> CallResult {
        let descriptor = CallDescriptor {
            api_version: crate::descriptor::API_VERSION.to_string(),
            name: "f".to_string(),
            version: "1".to_string(),
            input_files: BTreeMap::new(),
            output_files: BTreeMap::new(),
            parameters: BTreeMap::new(),
        };
        let descriptor_hash = descriptor.canonical_hash(store);
        CallResult {
            descriptor,
            descriptor_hash,
            runtime_info: RuntimeInfo::default(),
            return_value: serde_json::json!(value),
            outputs: BTreeMap::new(),
            from_cache: false,
        }
    }

    #[test]
    fn test_lookup_miss_then_hit() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemStore::new(temp.path().join("store")).unwrap();
        let log = RocksRecordLog::open(temp.path().join("log")).unwrap();
        let gate = CacheGate::new(&log, &store);

        let result = result_for(&store, 9);
        assert!(gate.lookup(&result.descriptor_hash, false).is_none());

        gate.store(&result).unwrap();
        let hit = gate.lookup(&result.descriptor_hash, false).unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.return_value, serde_json::json!(9));
    }

    #[test]
    fn test_force_run_skips_lookup() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemStore::new(temp.path().join("store")).unwrap();
        let log = RocksRecordLog::open(temp.path().join("log")).unwrap();
        let gate = CacheGate::new(&log, &store);

        let result = result_for(&store, 9);
        gate.store(&result).unwrap();
        assert!(gate.lookup(&result.descriptor_hash, true).is_none());
    }

    #[test]
    fn test_store_never_deduplicates() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemStore::new(temp.path().join("store")).unwrap();
        let log = RocksRecordLog::open(temp.path().join("log")).unwrap();
        let gate = CacheGate::new(&log, &store);

        let first = result_for(&store, 1);
        let second = result_for(&store, 2);
        assert_eq!(first.descriptor_hash, second.descriptor_hash);

        gate.store(&first).unwrap();
        gate.store(&second).unwrap();

        // Most recent insertion wins on read.
        let hit = gate.lookup(&first.descriptor_hash, false).unwrap();
        assert_eq!(hit.return_value, serde_json::json!(2));
    }
}
