//! Host log sink
//!
//! The host displays short, human-readable log lines (`writeLog`). Those go
//! through [`LogSink`]; structured diagnostics go through `tracing` as usual.

use parking_lot::Mutex;

/// Fire-and-forget log output provided by the host
pub trait LogSink: Send + Sync {
    /// Write one log line. Must never fail the caller.
    fn write_log(&self, message: &str);
}

/// Forwards host log lines to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write_log(&self, message: &str) {
        tracing::info!(target: "canrelay::host", "{}", message);
    }
}

/// Keeps every log line in memory
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Whether any line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }
}

impl LogSink for MemoryLogSink {
    fn write_log(&self, message: &str) {
        self.lines.lock().push(message.to_string());
    }
}

/// Format bytes as space separated upper-case hex ("19 02 FF")
pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(" ")
}
