//! Logging sink injected into every client.
//!
//! The client never reaches for a global logger. Callers hand it an
//! `Arc<dyn LogSink>`; [`TracingSink`] forwards to `tracing`, and
//! [`RecordingSink`] keeps records in memory so tests can assert on them.
//! Each record is tagged with the [`LogContext`] correlation id of the call
//! that produced it.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// Correlation id threaded through publish and consume calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogContext {
    correlation_id: String,
}

impl LogContext {
    /// Context with a freshly generated correlation id.
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Reuse a caller-supplied id. An empty id gets a generated one instead.
    pub fn with_id(id: impl Into<String>) -> Self {
        let id = id.into();
        if id.is_empty() {
            Self::new()
        } else {
            Self { correlation_id: id }
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One structured key/value pair attached to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub key: &'static str,
    pub value: String,
}

impl Field {
    pub fn new(key: &'static str, value: impl fmt::Display) -> Self {
        Self {
            key,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, ctx: &LogContext, message: &str, fields: &[Field]);

    fn debug(&self, ctx: &LogContext, message: &str, fields: &[Field]) {
        self.log(Level::Debug, ctx, message, fields);
    }

    fn info(&self, ctx: &LogContext, message: &str, fields: &[Field]) {
        self.log(Level::Info, ctx, message, fields);
    }

    fn warn(&self, ctx: &LogContext, message: &str, fields: &[Field]) {
        self.log(Level::Warn, ctx, message, fields);
    }

    fn error(&self, ctx: &LogContext, message: &str, fields: &[Field]) {
        self.log(Level::Error, ctx, message, fields);
    }
}

/// Forwards records to the `tracing` dispatcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: Level, ctx: &LogContext, message: &str, fields: &[Field]) {
        let rendered = render(fields);
        let id = ctx.correlation_id();
        match level {
            Level::Debug => tracing::debug!(correlation_id = %id, fields = %rendered, "{message}"),
            Level::Info => tracing::info!(correlation_id = %id, fields = %rendered, "{message}"),
            Level::Warn => tracing::warn!(correlation_id = %id, fields = %rendered, "{message}"),
            Level::Error => tracing::error!(correlation_id = %id, fields = %rendered, "{message}"),
        }
    }
}

fn render(fields: &[Field]) -> String {
    fields
        .iter()
        .map(Field::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub level: Level,
    pub correlation_id: String,
    pub message: String,
    pub fields: Vec<Field>,
}

impl Record {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.key == key)
            .map(|f| f.value.as_str())
    }
}

/// Keeps every record in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<Record>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records at `level` whose message equals `message`.
    pub fn find(&self, level: Level, message: &str) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|r| r.level == level && r.message == message)
            .collect()
    }

    pub fn contains(&self, level: Level, message: &str) -> bool {
        !self.find(level, message).is_empty()
    }
}

impl LogSink for RecordingSink {
    fn log(&self, level: Level, ctx: &LogContext, message: &str, fields: &[Field]) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Record {
                level,
                correlation_id: ctx.correlation_id().to_string(),
                message: message.to_string(),
                fields: fields.to_vec(),
            });
    }
}

/// Initialize tracing/logging for the application.
///
/// Uses `try_init`, so binaries and tests may call it more than once.
pub fn init(default_level: &str) {
    let lvl = match default_level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(lvl)
        .with_target(false)
        .try_init();
}
