//! Source tree packaging for container execution.
//!
//! Native bodies cannot cross the isolation boundary, so a container-eligible
//! function registers a [`SourceUnit`]: the directory holding its defining
//! module plus any local dependency modules. Packaging copies that tree,
//! adds an entry point re-exporting the target function under a fixed name,
//! and ships the engine's own runtime support module alongside.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::Pattern;
use walkdir::WalkDir;

/// Runtime support shipped into every packaged tree, importable by the
/// containerized function as `speicher_support`.
const SUPPORT_MODULE: &str = r#""""Runtime support for functions executing inside a sandbox."""

import os


def store_dir():
    """Root of the content store bind-mounted into the container."""
    return os.environ.get('SPEICHER_STORE_DIR', '/content-store')


def outputs_dir():
    """Fixed staging directory collected by the host after the run."""
    return '/outputs'
"#;

/// The portable source form of a registered function.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    /// Directory containing the function's defining module.
    pub source_dir: PathBuf,
    /// File stem of the defining module (e.g. `"sorters"` for `sorters.py`).
    pub entry_module: String,
    /// Runtime command invoked inside the container.
    pub runtime: String,
    /// Extra filename patterns packaged beyond `*.py`.
    pub include: Vec<String>,
    /// Local dependency module directories, relative to `source_dir` unless
    /// absolute.
    pub local_modules: Vec<PathBuf>,
}

impl SourceUnit {
    pub fn new(source_dir: impl Into<PathBuf>, entry_module: impl Into<String>) -> Self {
        Self {
            source_dir: source_dir.into(),
            entry_module: entry_module.into(),
            runtime: "python3".to_string(),
            include: Vec::new(),
            local_modules: Vec::new(),
        }
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    pub fn with_include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    pub fn with_local_module(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_modules.push(dir.into());
        self
    }
}

/// Assemble the isolated source tree under `dest_root/function_src`.
///
/// The entry point re-exports `function_name` so the generated driver can
/// always `from function_src import <name>` regardless of module layout.
pub fn package_source(unit: &SourceUnit, function_name: &str, dest_root: &Path) -> Result<PathBuf> {
    let src_root = dest_root.join("function_src");
    fs::create_dir(&src_root)
        .with_context(|| format!("failed to create {}", src_root.display()))?;

    let patterns = file_patterns(unit)?;
    copy_filtered_tree(&unit.source_dir, &src_root, &patterns, true)?;

    let init = format!(
        "from .{} import {}\n",
        unit.entry_module, function_name
    );
    fs::write(src_root.join("__init__.py"), init).context("failed to write entry point")?;

    let locals_root = src_root.join("_local_modules");
    fs::create_dir(&locals_root).context("failed to create _local_modules")?;

    for module_dir in &unit.local_modules {
        let source = if module_dir.is_absolute() {
            module_dir.clone()
        } else {
            unit.source_dir.join(module_dir)
        };
        let name = source
            .file_name()
            .with_context(|| format!("local module has no name: {}", source.display()))?;
        let dest = locals_root.join(name);
        fs::create_dir(&dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        copy_filtered_tree(&source, &dest, &patterns, false)?;
    }

    let support_dir = locals_root.join("speicher_support");
    fs::create_dir(&support_dir).context("failed to create support module")?;
    fs::write(support_dir.join("__init__.py"), SUPPORT_MODULE)
        .context("failed to write support module")?;

    Ok(src_root)
}

fn file_patterns(unit: &SourceUnit) -> Result<Vec<Pattern>> {
    let mut patterns = vec![Pattern::new("*.py").unwrap()];
    for raw in &unit.include {
        patterns.push(
            Pattern::new(raw).with_context(|| format!("invalid include pattern: {}", raw))?,
        );
    }
    Ok(patterns)
}

/// Copy matching files from `src` into `dest`, preserving layout. Dunder and
/// hidden directories are skipped; `exclude_top_init` drops the tree's own
/// top-level `__init__.py` so the generated entry point can replace it.
fn copy_filtered_tree(
    src: &Path,
    dest: &Path,
    patterns: &[Pattern],
    exclude_top_init: bool,
) -> Result<()> {
    let walker = WalkDir::new(src).min_depth(1).into_iter().filter_entry(|e| {
        if !e.file_type().is_dir() {
            return true;
        }
        let name = e.file_name().to_string_lossy();
        !name.starts_with("__") && !name.starts_with('.')
    });

    for entry in walker {
        let entry = entry.context("failed to walk source tree")?;
        if entry.file_type().is_dir() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walked entries live under the source root");
        if exclude_top_init && rel == Path::new("__init__.py") {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if !patterns.iter().any(|p| p.matches(&name)) {
            continue;
        }

        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(entry.path(), &target)
            .with_context(|| format!("failed to copy {}", entry.path().display()))?;
    }

    Ok(())
}
