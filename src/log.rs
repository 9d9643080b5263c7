//! Engine diagnostic log capture.
//!
//! Engines receive an [`EngineLogger`] when they are constructed. The logger
//! only holds a weak reference to the session's [`LogSink`], so messages
//! emitted after the owning session is gone are silently dropped. Every
//! message is also forwarded to `tracing`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};

/// Rows kept in the log table; older rows are dropped first.
pub const MAX_LOG_ENTRIES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    /// Continuation of the previous message.
    Cont,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Cont => "CONT",
        }
    }
}

/// One row of the `ai_log` table.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub text: String,
}

#[derive(Default)]
struct LogShared {
    entries: Mutex<VecDeque<LogEntry>>,
    info_enabled: AtomicBool,
}

/// Session-owned log table.
#[derive(Clone, Default)]
pub struct LogSink {
    shared: Arc<LogShared>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A logger handle for an engine. It does not keep the sink alive.
    pub fn logger(&self) -> EngineLogger {
        EngineLogger {
            sink: Arc::downgrade(&self.shared),
        }
    }

    pub fn set_info_enabled(&self, enabled: bool) {
        self.shared.info_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn info_enabled(&self) -> bool {
        self.shared.info_enabled.load(Ordering::Relaxed)
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        match self.shared.entries.lock() {
            Ok(entries) => entries.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Logger threaded into engine construction.
#[derive(Clone, Default)]
pub struct EngineLogger {
    sink: Weak<LogShared>,
}

impl EngineLogger {
    /// A logger that is not attached to any session.
    pub fn detached() -> Self {
        Self { sink: Weak::new() }
    }

    pub fn is_attached(&self) -> bool {
        self.sink.strong_count() > 0
    }

    pub fn log(&self, level: LogLevel, text: &str) {
        let text = text.trim_end_matches('\n');
        match level {
            LogLevel::Debug => tracing::debug!(target: "sqlite_ai::engine", "{}", text),
            LogLevel::Info => tracing::info!(target: "sqlite_ai::engine", "{}", text),
            LogLevel::Warn => tracing::warn!(target: "sqlite_ai::engine", "{}", text),
            LogLevel::Error => tracing::error!(target: "sqlite_ai::engine", "{}", text),
            LogLevel::Cont => tracing::trace!(target: "sqlite_ai::engine", "{}", text),
        }

        let Some(shared) = self.sink.upgrade() else {
            return;
        };
        if level == LogLevel::Info && !shared.info_enabled.load(Ordering::Relaxed) {
            return;
        }
        let Ok(mut entries) = shared.entries.lock() else {
            return;
        };

        if level == LogLevel::Cont {
            if let Some(last) = entries.back_mut() {
                last.text.push_str(text);
            }
            return;
        }

        if entries.len() == MAX_LOG_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            text: text.to_string(),
        });
    }

    pub fn debug(&self, text: &str) {
        self.log(LogLevel::Debug, text);
    }

    pub fn info(&self, text: &str) {
        self.log(LogLevel::Info, text);
    }

    pub fn warn(&self, text: &str) {
        self.log(LogLevel::Warn, text);
    }

    pub fn error(&self, text: &str) {
        self.log(LogLevel::Error, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_is_filtered_until_enabled() {
        let sink = LogSink::new();
        let logger = sink.logger();

        logger.info("loading");
        logger.warn("context larger than training window");
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.entries()[0].level, LogLevel::Warn);

        sink.set_info_enabled(true);
        logger.info("loaded");
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn continuation_appends_to_previous_row() {
        let sink = LogSink::new();
        let logger = sink.logger();
        logger.error("decode failed:");
        logger.log(LogLevel::Cont, " no KV slot");
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "decode failed: no KV slot");
    }

    #[test]
    fn oldest_rows_are_dropped_at_capacity() {
        let sink = LogSink::new();
        let logger = sink.logger();
        for i in 0..MAX_LOG_ENTRIES + 5 {
            logger.warn(&format!("message {}", i));
        }
        let entries = sink.entries();
        assert_eq!(entries.len(), MAX_LOG_ENTRIES);
        assert_eq!(entries[0].text, "message 5");
        assert_eq!(
            entries[MAX_LOG_ENTRIES - 1].text,
            format!("message {}", MAX_LOG_ENTRIES + 4)
        );
    }

    #[test]
    fn logger_is_noop_after_sink_dropped() {
        let sink = LogSink::new();
        let logger = sink.logger();
        assert!(logger.is_attached());
        drop(sink);
        assert!(!logger.is_attached());
        logger.error("late message");
    }
}
