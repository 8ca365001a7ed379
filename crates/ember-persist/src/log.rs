//! Logger contract.
//!
//! The persistence layer reports cache, batch and reference failures through
//! a [`Logger`] so applications can route them wherever they keep their
//! audit trail. [`TracingLogger`] forwards to `tracing` and is the default;
//! [`MemoryLogger`] keeps records in memory for assertions.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a log record, in increasing order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    None,
    Debug,
    Fine,
    Info,
    Business,
    Warning,
    Error,
    Emergency,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Debug => "debug",
            Self::Fine => "fine",
            Self::Info => "info",
            Self::Business => "business",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

/// Sink for persistence-layer log records.
///
/// Implementations must not panic; the core calls this from drop handlers.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, source: &str, feature: &str, message: &str, data: &Value);
}

/// Forwards records to `tracing`.
#[derive(Clone, Debug)]
pub struct TracingLogger {
    threshold: LogLevel,
}

impl TracingLogger {
    pub fn new(threshold: LogLevel) -> Self {
        Self { threshold }
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new(LogLevel::Debug)
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, source: &str, feature: &str, message: &str, data: &Value) {
        if level == LogLevel::None || level < self.threshold {
            return;
        }
        match level {
            LogLevel::None => {}
            LogLevel::Debug | LogLevel::Fine => {
                tracing::debug!(%level, source, feature, %data, "{message}")
            }
            LogLevel::Info | LogLevel::Business => {
                tracing::info!(%level, source, feature, %data, "{message}")
            }
            LogLevel::Warning => tracing::warn!(%level, source, feature, %data, "{message}"),
            LogLevel::Error | LogLevel::Emergency => {
                tracing::error!(%level, source, feature, %data, "{message}")
            }
        }
    }
}

/// A captured log record.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub source: String,
    pub feature: String,
    pub message: String,
    pub data: Value,
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().expect("logger lock poisoned").clone()
    }

    /// Records at exactly `level`.
    pub fn at(&self, level: LogLevel) -> Vec<LogRecord> {
        self.records
            .lock()
            .expect("logger lock poisoned")
            .iter()
            .filter(|r| r.level == level)
            .cloned()
            .collect()
    }

    /// Number of records whose message contains `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.records
            .lock()
            .expect("logger lock poisoned")
            .iter()
            .filter(|r| r.message.contains(needle))
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("logger lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().expect("logger lock poisoned").clear();
    }
}

impl Logger for MemoryLogger {
    fn log(&self, level: LogLevel, source: &str, feature: &str, message: &str, data: &Value) {
        let record = LogRecord {
            level,
            source: source.to_string(),
            feature: feature.to_string(),
            message: message.to_string(),
            data: data.clone(),
        };
        // A poisoned lock must not turn logging into a panic.
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
