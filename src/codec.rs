use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::capture::RuntimeInfo;
use crate::descriptor::CallDescriptor;
use crate::error::{EngineError, Result};
use crate::handle::FileHandle;
use crate::store::ContentStore;

/// Record kind tag, kept in every stored record for forward compatibility.
pub const RECORD_KIND: &str = "call_result";

/// Console output with text replaced by content references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRuntimeInfo {
    pub stdout: String,
    pub stderr: String,
}

/// The persisted form of a call result.
///
/// Text and file content live in the content store; the record carries only
/// references, the descriptor, and its hash. Records are append-only: the
/// current cached value for a hash is the most recently inserted match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub kind: String,
    pub descriptor: CallDescriptor,
    pub descriptor_hash: String,
    pub runtime_info: StoredRuntimeInfo,
    pub return_value: Value,
    pub output_files: BTreeMap<String, String>,
    pub stored_at: DateTime<Utc>,
}

/// The outcome of one call, fresh or reconstructed from a record.
///
/// Never mutated after construction.
#[derive(Debug)]
pub struct CallResult {
    pub descriptor: CallDescriptor,
    pub descriptor_hash: String,
    pub runtime_info: RuntimeInfo,
    pub return_value: Value,
    pub outputs: BTreeMap<String, FileHandle>,
    pub from_cache: bool,
}

impl CallResult {
    /// The handle for a named output, if the call produced it.
    pub fn output(&self, name: &str) -> Option<&FileHandle> {
        self.outputs.get(name)
    }
}

/// Serialize a result into its storage record, pushing console text and
/// output file bytes into the content store.
pub fn serialize(result: &CallResult, store: &dyn ContentStore) -> Result<StoredRecord> {
    let stdout = store
        .store_text(&result.runtime_info.stdout)
        .map_err(EngineError::Storage)?;
    let stderr = store
        .store_text(&result.runtime_info.stderr)
        .map_err(EngineError::Storage)?;

    let mut output_files = BTreeMap::new();
    for (name, handle) in &result.outputs {
        let reference = match handle.reference() {
            Some(reference) => reference.to_string(),
            None => {
                // Output not yet persisted: push its bytes now.
                let path = handle.path().ok_or_else(|| {
                    EngineError::Storage(anyhow::anyhow!(
                        "output {} has neither reference nor path",
                        name
                    ))
                })?;
                store.store_file(path).map_err(EngineError::Storage)?
            }
        };
        output_files.insert(name.clone(), reference);
    }

    Ok(StoredRecord {
        kind: RECORD_KIND.to_string(),
        descriptor: result.descriptor.clone(),
        descriptor_hash: result.descriptor_hash.clone(),
        runtime_info: StoredRuntimeInfo { stdout, stderr },
        return_value: result.return_value.clone(),
        output_files,
        stored_at: Utc::now(),
    })
}

/// Reconstruct a result from its storage record.
///
/// Returns `None` if any referenced blob cannot be fetched. Callers treat
/// that as a cache miss, never as a fatal error: a record whose backing blobs
/// became unreachable must trigger re-execution, not block progress.
pub fn deserialize(record: &StoredRecord, store: &dyn ContentStore) -> Option<CallResult> {
    let stdout = match store.load_text(&record.runtime_info.stdout) {
        Ok(Some(text)) => text,
        _ => {
            debug!(
                operation = "codec.deserialize",
                status = "miss",
                reference = %record.runtime_info.stdout,
                "stdout blob unreachable"
            );
            return None;
        }
    };
    let stderr = match store.load_text(&record.runtime_info.stderr) {
        Ok(Some(text)) => text,
        _ => {
            debug!(
                operation = "codec.deserialize",
                status = "miss",
                reference = %record.runtime_info.stderr,
                "stderr blob unreachable"
            );
            return None;
        }
    };

    let mut outputs = BTreeMap::new();
    for (name, reference) in &record.output_files {
        let path = match store.load_file(reference) {
            Ok(Some(path)) => path,
            _ => {
                debug!(
                    operation = "codec.deserialize",
                    status = "miss",
                    reference = %reference,
                    "output blob unreachable"
                );
                return None;
            }
        };
        let mut handle = FileHandle::from_reference(reference.clone());
        // Point the handle at the store-local copy so callers can read it
        // without another fetch.
        let _ = handle.materialize(store);
        debug_assert_eq!(handle.path(), Some(path.as_path()));
        outputs.insert(name.clone(), handle);
    }

    Some(CallResult {
        descriptor: record.descriptor.clone(),
        descriptor_hash: record.descriptor_hash.clone(),
        runtime_info: RuntimeInfo { stdout, stderr },
        return_value: record.return_value.clone(),
        outputs,
        from_cache: true,
    })
}
