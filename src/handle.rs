use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::store::ContentStore;

/// A local file wrapped with ownership semantics.
///
/// Borrowed handles point at caller-supplied paths and are never deleted by
/// the engine. Temporary handles are engine-owned scratch outputs: before a
/// call returns they are either persisted into the content store (and the
/// local file removed) or discarded. No temporary path outlives its call.
#[derive(Debug, Clone)]
pub struct FileHandle {
    path: Option<PathBuf>,
    reference: Option<String>,
    is_temporary: bool,
}

impl FileHandle {
    /// Wrap a caller-supplied path. The engine will not delete it.
    pub fn borrowed<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: Some(path.into()),
            reference: None,
            is_temporary: false,
        }
    }

    /// Wrap a content reference with no local path yet.
    pub fn from_reference<S: Into<String>>(reference: S) -> Self {
        Self {
            path: None,
            reference: Some(reference.into()),
            is_temporary: false,
        }
    }

    /// Allocate a fresh engine-owned scratch destination.
    ///
    /// Only the name is reserved: the placeholder file is removed again, so a
    /// destination counts as populated exactly when the function created it.
    pub fn temporary() -> std::io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("speicher_output_")
            .tempfile()?;
        let (_, path) = file.keep().map_err(|e| e.error)?;
        fs::remove_file(&path)?;
        Ok(Self {
            path: Some(path),
            reference: None,
            is_temporary: true,
        })
    }

    /// True if the handle points at an existing local file.
    pub fn is_populated(&self) -> bool {
        self.path.as_deref().map(Path::exists).unwrap_or(false)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn is_temporary(&self) -> bool {
        self.is_temporary
    }

    /// Push the file's bytes into the content store. Temporary handles lose
    /// their local path (the scratch file is removed); borrowed handles keep
    /// theirs.
    pub fn persist(&mut self, store: &dyn ContentStore) -> Result<String> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| anyhow!("cannot persist a handle without a local path"))?;
        let reference = store.store_file(&path)?;

        if self.is_temporary {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove scratch file {}", path.display()))?;
            self.path = None;
            debug!(
                operation = "handle.persist",
                reference = %reference,
                "temporary output persisted and cleaned"
            );
        }

        self.reference = Some(reference.clone());
        Ok(reference)
    }

    /// Delete an unpopulated or unwanted temporary file. Borrowed handles are
    /// left untouched.
    pub fn discard(&mut self) {
        if !self.is_temporary {
            return;
        }
        if let Some(path) = self.path.take() {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(
                        operation = "handle.discard",
                        status = "error",
                        "failed to remove {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }
    }

    /// Produce a local path for this handle, fetching from the content store
    /// if it is currently reference-only.
    pub fn materialize(&mut self, store: &dyn ContentStore) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let reference = self
            .reference
            .clone()
            .ok_or_else(|| anyhow!("handle has neither path nor reference"))?;
        let path = store
            .load_file(&reference)?
            .ok_or_else(|| anyhow!("content reference has no backing blob: {}", reference))?;
        self.path = Some(path.clone());
        Ok(path)
    }
}
