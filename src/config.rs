use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Complete engine configuration (loaded from a TOML file or built in code).
///
/// An explicit value handed to the engine's constructor; there is no
/// process-wide configuration state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub record_log: RecordLogConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub presets: PresetConfig,
}

/// Content store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

/// Record log location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordLogConfig {
    #[serde(default = "default_record_log_dir")]
    pub dir: PathBuf,
}

impl Default for RecordLogConfig {
    fn default() -> Self {
        Self {
            dir: default_record_log_dir(),
        }
    }
}

/// Container engine used for sandboxed execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Command name or path, resolved from PATH at launch time.
    #[serde(default = "default_container_engine")]
    pub engine: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            engine: default_container_engine(),
        }
    }
}

/// Remote preset resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetConfig {
    /// URL of the preset document; presets are unavailable without one.
    #[serde(default)]
    pub url: Option<String>,

    /// Directory holding the short-lived local copy of the document.
    #[serde(default = "default_preset_cache_dir")]
    pub cache_dir: PathBuf,

    /// Age under which the local copy is used without refetching.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Backoff between fetch attempts; length bounds the retries.
    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,
}

impl Default for PresetConfig {
    fn default() -> Self {
        Self {
            url: None,
            cache_dir: default_preset_cache_dir(),
            cache_ttl_secs: default_cache_ttl_secs(),
            retry_delays_ms: default_retry_delays_ms(),
        }
    }
}

fn cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".speicher-cache"))
        .join("speicher")
}

fn default_store_dir() -> PathBuf {
    cache_root().join("store")
}

fn default_record_log_dir() -> PathBuf {
    cache_root().join("record-log")
}

fn default_container_engine() -> String {
    "docker".to_string()
}

fn default_preset_cache_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".speicher"))
        .join("speicher")
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_retry_delays_ms() -> Vec<u64> {
    vec![200, 500]
}

/// The remote preset document: named configuration fragments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetDocument {
    pub configurations: BTreeMap<String, PresetEntry>,
}

/// One named preset; absent fields leave the current value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresetEntry {
    #[serde(default)]
    pub store_dir: Option<PathBuf>,

    #[serde(default)]
    pub record_log_dir: Option<PathBuf>,

    #[serde(default)]
    pub container_engine: Option<String>,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| EngineError::InvalidConfig {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Overlay a named remote preset onto this configuration.
    ///
    /// The preset document is fetched from `presets.url` with bounded retry
    /// and cached locally for `cache_ttl_secs`; a stale local copy is still
    /// used when every fetch attempt fails.
    pub fn apply_preset(&mut self, name: &str) -> Result<()> {
        let document = self.load_preset_document()?;
        let entry = document.configurations.get(name).ok_or_else(|| {
            EngineError::ConfigUnavailable(format!("preset not found: {}", name))
        })?;

        if let Some(dir) = &entry.store_dir {
            self.store.dir = dir.clone();
        }
        if let Some(dir) = &entry.record_log_dir {
            self.record_log.dir = dir.clone();
        }
        if let Some(engine) = &entry.container_engine {
            self.sandbox.engine = engine.clone();
        }
        Ok(())
    }

    fn load_preset_document(&self) -> Result<PresetDocument> {
        let url = self.presets.url.as_deref().ok_or_else(|| {
            EngineError::ConfigUnavailable("no preset url configured".to_string())
        })?;
        let cache_path = self.presets.cache_dir.join("preset_configuration.json");

        let cached = read_cached_document(&cache_path);
        if let Some((document, age)) = &cached {
            if *age <= Duration::from_secs(self.presets.cache_ttl_secs) {
                debug!(
                    operation = "presets.load",
                    status = "success",
                    "using local preset copy ({} s old)",
                    age.as_secs()
                );
                return Ok(document.clone());
            }
        }

        match fetch_with_retry(url, &self.presets.retry_delays_ms) {
            Ok(document) => {
                if let Err(e) = write_cached_document(&cache_path, &document) {
                    warn!(
                        operation = "presets.load",
                        "failed to cache preset document: {:#}",
                        e
                    );
                }
                Ok(document)
            }
            Err(fetch_error) => {
                // A stale local copy still beats failing the call outright.
                if let Some((document, age)) = cached {
                    warn!(
                        operation = "presets.load",
                        "fetch failed, using stale local copy ({} s old)",
                        age.as_secs()
                    );
                    return Ok(document);
                }
                Err(fetch_error)
            }
        }
    }
}

fn read_cached_document(path: &Path) -> Option<(PresetDocument, Duration)> {
    let metadata = fs::metadata(path).ok()?;
    let age = metadata.modified().ok()?.elapsed().unwrap_or_default();
    let text = fs::read_to_string(path).ok()?;
    let document: PresetDocument = serde_json::from_str(&text).ok()?;
    if document.configurations.is_empty() {
        return None;
    }
    Some((document, age))
}

fn write_cached_document(path: &Path, document: &PresetDocument) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(document).context("failed to encode document")?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

/// Fetch the preset document, retrying with the configured backoff. Every
/// attempt is an explicit outcome; exhaustion is a hard failure.
fn fetch_with_retry(url: &str, delays_ms: &[u64]) -> Result<PresetDocument> {
    let attempts = delays_ms.len() + 1;

    for attempt in 0..attempts {
        match fetch_once(url) {
            Ok(document) => return Ok(document),
            Err(e) => {
                if attempt < delays_ms.len() {
                    let delay = delays_ms[attempt];
                    warn!(
                        operation = "presets.fetch",
                        status = "error",
                        attempt = attempt + 1,
                        "fetch failed ({:#}), retrying in {} ms",
                        e,
                        delay
                    );
                    std::thread::sleep(Duration::from_millis(delay));
                } else {
                    warn!(
                        operation = "presets.fetch",
                        status = "error",
                        attempt = attempt + 1,
                        "fetch failed ({:#}), giving up",
                        e
                    );
                }
            }
        }
    }

    Err(EngineError::RemoteFetchFailed {
        url: url.to_string(),
        attempts,
    })
}

fn fetch_once(url: &str) -> anyhow::Result<PresetDocument> {
    let response = ureq::get(url)
        .call()
        .map_err(|e| anyhow!("http GET {}: {}", url, e))?;
    let mut reader = response.into_body().into_reader();
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .context("failed to read preset response")?;

    let document: PresetDocument =
        serde_json::from_slice(&buf).context("failed to parse preset document")?;
    if document.configurations.is_empty() {
        anyhow::bail!("preset document has no configurations");
    }
    Ok(document)
}
