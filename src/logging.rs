//! Structured logging utilities.
//!
//! All logs use structured fields for easy parsing and analysis:
//!
//! - `operation`: the operation being performed (e.g., "gate.lookup", "log.insert")
//! - `status`: the result status ("success", "miss", "error")
//! - `descriptor_hash`: canonical call fingerprint (hex-encoded)
//! - `size_bytes`: size in bytes

use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

/// Custom formatter that shows "speicher" instead of full module path
struct SpeicherFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for SpeicherFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6fZ")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(
                writer,
                "{}{:5}(speicher)\x1b[0m: ",
                level_style,
                meta.level()
            )?;
        } else {
            write!(writer, "{:5}(speicher): ", meta.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format (default for development)
    Pretty,
    /// Compact format (for CI/production)
    Compact,
    /// JSON format (for log aggregation systems)
    Json,
}

impl LogFormat {
    /// Parse from environment variable (SPEICHER_LOG_FORMAT)
    pub fn from_env() -> Self {
        match std::env::var("SPEICHER_LOG_FORMAT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => Self::Json,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            _ => {
                if std::env::var("CI").is_ok() {
                    Self::Compact
                } else {
                    Self::Pretty
                }
            }
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` sets the filter (defaults to "info"); `SPEICHER_LOG_FORMAT`
/// selects pretty/compact/json output. Logs go to stderr so captured and
/// replayed stdout stays clean.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    let format = LogFormat::from_env();

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .event_format(SpeicherFormatter { with_ansi: true })
                        .with_writer(io::stderr),
                )
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .event_format(SpeicherFormatter { with_ansi: false })
                        .with_writer(io::stderr),
                )
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_file(false)
                        .with_line_number(false)
                        .with_ansi(false)
                        .with_writer(io::stderr)
                        .json(),
                )
                .init();
        }
    }
}

/// Standard field names for consistent logging
#[allow(dead_code)]
pub mod fields {
    /// Operation name (e.g., "gate.lookup", "log.insert", "sandbox.launch")
    pub const OPERATION: &str = "operation";
    /// Status (e.g., "success", "hit", "miss", "error")
    pub const STATUS: &str = "status";
    /// Canonical call fingerprint (hex-encoded)
    pub const DESCRIPTOR_HASH: &str = "descriptor_hash";
    /// Content reference (scheme-prefixed hash)
    pub const REFERENCE: &str = "reference";
    /// Size in bytes
    pub const SIZE_BYTES: &str = "size_bytes";
    /// Function name
    pub const FUNCTION: &str = "function";
}

/// Status values for consistent logging
#[allow(dead_code)]
pub mod status {
    pub const SUCCESS: &str = "success";
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const ERROR: &str = "error";
}
