use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Captured console output of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy)]
enum StreamTarget {
    Stdout,
    Stderr,
}

/// Buffers everything written through it while forwarding to the real stream,
/// so output stays interactively visible and is still captured in full.
#[derive(Clone)]
pub struct TeeWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
    target: StreamTarget,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .expect("capture buffer poisoned")
            .extend_from_slice(buf);
        match self.target {
            StreamTarget::Stdout => io::stdout().write_all(buf)?,
            StreamTarget::Stderr => io::stderr().write_all(buf)?,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.target {
            StreamTarget::Stdout => io::stdout().flush(),
            StreamTarget::Stderr => io::stderr().flush(),
        }
    }
}

/// Capture scope for one execution's stdout/stderr.
#[derive(Default)]
pub struct OutputCapture {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout_writer(&self) -> TeeWriter {
        TeeWriter {
            buffer: Arc::clone(&self.stdout),
            target: StreamTarget::Stdout,
        }
    }

    pub fn stderr_writer(&self) -> TeeWriter {
        TeeWriter {
            buffer: Arc::clone(&self.stderr),
            target: StreamTarget::Stderr,
        }
    }

    /// Consume the capture and expose the buffered streams.
    pub fn finish(self) -> RuntimeInfo {
        let stdout = self.stdout.lock().expect("capture buffer poisoned").clone();
        let stderr = self.stderr.lock().expect("capture buffer poisoned").clone();
        RuntimeInfo {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }
    }
}

/// Re-emit previously captured output on the real streams. Used when a cache
/// hit replays a recorded execution.
pub fn replay(info: &RuntimeInfo) {
    if !info.stdout.is_empty() {
        let _ = io::stdout().write_all(info.stdout.as_bytes());
    }
    if !info.stderr.is_empty() {
        let _ = io::stderr().write_all(info.stderr.as_bytes());
    }
}
