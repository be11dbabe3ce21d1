//! Diagnostic logging.
//!
//! The session does not log through the global logger directly; it is handed
//! a [`DiagnosticSink`] at construction. [`LogSink`] forwards to the `log`
//! facade (and from there to `env_logger`), [`MemorySink`] keeps records in
//! memory.

use std::sync::{Arc, Mutex};

use log::Level;

use crate::config::Config;

/// Destination for session diagnostics.
pub trait DiagnosticSink: Send + Sync {
    /// Records one diagnostic line.
    fn record(&self, level: Level, message: &str);
}

/// Forwards diagnostics to the `log` facade under a fixed target.
#[derive(Debug, Clone)]
pub struct LogSink {
    target: &'static str,
}

impl LogSink {
    /// Sink logging under `target`.
    pub fn new(target: &'static str) -> Self {
        Self { target }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new("channel_tail::session")
    }
}

impl DiagnosticSink for LogSink {
    fn record(&self, level: Level, message: &str) {
        log::log!(target: self.target, level, "{}", message);
    }
}

/// Keeps diagnostics in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<(Level, String)>>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<(Level, String)> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Returns `true` if any record at `level` contains `needle`.
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|(l, message)| *l == level && message.contains(needle))
    }
}

impl DiagnosticSink for MemorySink {
    fn record(&self, level: Level, message: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.push((level, message.to_string()));
        }
    }
}

/// Initialises the process logger on stderr.
///
/// The level follows the quiet/debug flags unless `RUST_LOG` is set.
pub fn init_logging(config: &Config) {
    // Dependencies stay at warn; only this crate follows the flags.
    let default_filter = format!(
        "warn,channel_tail={}",
        config.log_level().to_string().to_lowercase()
    );
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .format_timestamp_secs()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.record(Level::Info, "connected");
        sink.record(Level::Debug, "dropped message 'pong'");

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (Level::Info, "connected".to_string()));
        assert!(sink.contains(Level::Debug, "pong"));
        assert!(!sink.contains(Level::Info, "pong"));
    }

    #[test]
    fn test_memory_sink_clones_share_records() {
        let sink = MemorySink::new();
        let clone = sink.clone();
        clone.record(Level::Warn, "stale");
        assert!(sink.contains(Level::Warn, "stale"));
    }

    #[test]
    fn test_log_sink_does_not_panic_without_logger() {
        LogSink::default().record(Level::Error, "no logger installed");
    }
}
