pub mod filesystem;

pub use filesystem::FilesystemStore;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Scheme prefix distinguishing content references from filesystem paths.
pub const REFERENCE_SCHEME: &str = "sha256://";

/// True if the string is a content reference rather than a local path.
pub fn is_reference(value: &str) -> bool {
    value.starts_with(REFERENCE_SCHEME)
}

/// Content fingerprint of a local file.
///
/// All fields participate in descriptor hashing; paths never do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub sha256: String,
    pub size_bytes: u64,
}

/// Hash raw bytes to a lowercase hex SHA-256 digest.
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Content-addressing primitives the engine depends on.
///
/// References are opaque `sha256://<hex>` strings. Loads return `Ok(None)`
/// when a valid reference has no backing blob; malformed references are
/// errors.
pub trait ContentStore: Send + Sync {
    /// Store a blob, returning its content reference.
    fn store_bytes(&self, data: &[u8]) -> Result<String>;

    /// Retrieve a blob by reference.
    fn load_bytes(&self, reference: &str) -> Result<Option<Vec<u8>>>;

    /// Materialize a blob to a local path without copying it out of the store.
    fn load_file(&self, reference: &str) -> Result<Option<PathBuf>>;

    /// Compute the content fingerprint of a local file.
    fn fingerprint(&self, path: &Path) -> Result<FileFingerprint>;

    /// Store a UTF-8 text blob.
    fn store_text(&self, text: &str) -> Result<String> {
        self.store_bytes(text.as_bytes())
    }

    /// Retrieve a UTF-8 text blob.
    fn load_text(&self, reference: &str) -> Result<Option<String>> {
        match self.load_bytes(reference)? {
            Some(data) => Ok(Some(String::from_utf8(data)?)),
            None => Ok(None),
        }
    }

    /// Store a local file's bytes.
    fn store_file(&self, path: &Path) -> Result<String> {
        let data = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        self.store_bytes(&data)
    }

    /// Deterministic hash of a structured object's canonical encoding.
    ///
    /// `serde_json` maps are BTree-backed, so rendering is key-sorted and
    /// independent of insertion order.
    fn canonical_hash(&self, value: &serde_json::Value) -> String {
        let encoded = serde_json::to_vec(value).expect("JSON value encoding cannot fail");
        hash_data(&encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_reference() {
        assert!(is_reference("sha256://abcdef"));
        assert!(!is_reference("/tmp/file.txt"));
        assert!(!is_reference("relative/path"));
    }

    #[test]
    fn test_hash_data_deterministic() {
        assert_eq!(hash_data(b"hello"), hash_data(b"hello"));
        assert_ne!(hash_data(b"hello"), hash_data(b"world"));
        assert_eq!(hash_data(b"hello").len(), 64);
    }
}
