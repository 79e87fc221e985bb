use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::debug;

use super::{hash_data, ContentStore, FileFingerprint, REFERENCE_SCHEME};

/// Filesystem-backed content store.
///
/// Layout: `<root>/objects/ab/cdef...` with git-style sharding (first 2 hex
/// chars as subdirectory). Writes are atomic (temp file, then rename) so
/// concurrent writers of the same blob are safe.
pub struct FilesystemStore {
    objects_dir: PathBuf,
}

impl FilesystemStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let objects_dir = root.as_ref().join("objects");
        fs::create_dir_all(&objects_dir).context("failed to create objects directory")?;
        Ok(Self { objects_dir })
    }

    /// Convert a hex digest to its sharded object path.
    fn object_path(&self, hex_digest: &str) -> PathBuf {
        let (prefix, suffix) = hex_digest.split_at(2);
        self.objects_dir.join(prefix).join(suffix)
    }

    /// Parse a `sha256://<hex>` reference into its digest.
    fn parse_reference(reference: &str) -> Result<&str> {
        let digest = reference
            .strip_prefix(REFERENCE_SCHEME)
            .ok_or_else(|| anyhow!("not a content reference: {}", reference))?;
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(anyhow!("malformed content reference: {}", reference));
        }
        Ok(digest)
    }
}

impl ContentStore for FilesystemStore {
    fn store_bytes(&self, data: &[u8]) -> Result<String> {
        let digest = hash_data(data);
        let path = self.object_path(&digest);

        if !path.exists() {
            let parent = path.parent().expect("object path always has a parent");
            fs::create_dir_all(parent).context("failed to create object directory")?;

            // Write atomically; PID + thread id avoids collisions between
            // concurrent writers of the same blob.
            let temp_name = format!(
                "{}.tmp.{}.{:?}",
                path.file_name().unwrap().to_str().unwrap(),
                std::process::id(),
                thread::current().id()
            );
            let temp_path = parent.join(temp_name);

            let mut file = fs::File::create(&temp_path).context("failed to create temp file")?;
            file.write_all(data).context("failed to write blob")?;
            file.sync_all().context("failed to sync blob")?;
            fs::rename(&temp_path, &path).context("failed to rename temp file")?;

            debug!(
                operation = "store.put",
                reference = %digest,
                size_bytes = data.len(),
                "stored blob"
            );
        }

        Ok(format!("{}{}", REFERENCE_SCHEME, digest))
    }

    fn load_bytes(&self, reference: &str) -> Result<Option<Vec<u8>>> {
        let digest = Self::parse_reference(reference)?;
        let path = self.object_path(digest);

        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(&path).context("failed to read blob")?;
        Ok(Some(data))
    }

    fn load_file(&self, reference: &str) -> Result<Option<PathBuf>> {
        let digest = Self::parse_reference(reference)?;
        let path = self.object_path(digest);

        if path.exists() {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    fn fingerprint(&self, path: &Path) -> Result<FileFingerprint> {
        let data =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(FileFingerprint {
            sha256: hash_data(&data),
            size_bytes: data.len() as u64,
        })
    }
}
