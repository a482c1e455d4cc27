//! Structured log records and their queue envelope.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    /// Very fine-grained diagnostics.
    Trace,
    /// Diagnostics.
    Debug,
    /// Normal operation.
    Info,
    /// Something unexpected that was handled.
    Warn,
    /// A failed operation.
    Error,
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            _ => Self::Error,
        }
    }
}

/// Partition key deciding which file a record lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Application logs.
    Application,
    /// Data-access (SQL) logs.
    Sql,
    /// HTTP access logs.
    Access,
}

impl Category {
    /// Every category, in drain order.
    pub const ALL: [Self; 3] = [Self::Application, Self::Sql, Self::Access];

    /// Stable lowercase name, used in queue keys and file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Sql => "sql",
            Self::Access => "access",
        }
    }

    /// Parses a name produced by [`Category::as_str`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// Picks the category for a `tracing` target / logger name.
    #[must_use]
    pub fn for_target(target: &str) -> Self {
        if target.starts_with("sqlx") || target.starts_with("service_infra::db") {
            Self::Sql
        } else if target.starts_with("tower_http") {
            Self::Access
        } else {
            Self::Application
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar context value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Text.
    Str(String),
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for ContextValue {
    fn from(v: u64) -> Self {
        i64::try_from(v).map_or_else(|_| Self::Str(v.to_string()), Self::Int)
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Key/value context attached to a record.
pub type Context = BTreeMap<String, ContextValue>;

/// One structured log event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    timestamp: DateTime<Utc>,
    level: Level,
    category: Category,
    logger_name: String,
    message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    context: Context,
    process_id: u32,
}

impl LogRecord {
    /// Builds a record stamped with the current time and process id.
    #[must_use]
    pub fn new(
        level: Level,
        category: Category,
        logger_name: impl Into<String>,
        message: impl Into<String>,
        context: Context,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            category,
            logger_name: logger_name.into(),
            message: message.into(),
            context,
            process_id: std::process::id(),
        }
    }

    /// Returns the same record with a different timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// When the event happened.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Severity.
    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    /// Partition key.
    #[must_use]
    pub fn category(&self) -> Category {
        self.category
    }

    /// Emitting logger (or `tracing` target).
    #[must_use]
    pub fn logger_name(&self) -> &str {
        &self.logger_name
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Structured context.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Id of the emitting process.
    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.process_id
    }
}

/// A record as carried on the transport queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// When the producer handed the record to the transport.
    pub enqueued_at: DateTime<Utc>,
    /// The record itself.
    pub record: LogRecord,
}

impl QueueItem {
    /// Wraps a record, stamping the enqueue time.
    #[must_use]
    pub fn new(record: LogRecord) -> Self {
        Self {
            enqueued_at: Utc::now(),
            record,
        }
    }

    /// Serializes to the wire form.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error if serialization fails.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses the wire form.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error on malformed input.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn targets_map_to_categories() {
        assert_eq!(Category::for_target("sqlx::query"), Category::Sql);
        assert_eq!(Category::for_target("service_infra::db::pool"), Category::Sql);
        assert_eq!(Category::for_target("tower_http::trace::on_response"), Category::Access);
        assert_eq!(Category::for_target("billing::invoices"), Category::Application);
    }

    #[test]
    fn category_names_parse_back() {
        for category in Category::ALL {
            assert_eq!(Category::from_name(category.as_str()), Some(category));
        }
        assert_eq!(Category::from_name("metrics"), None);
    }

    #[test]
    fn queue_item_keeps_context_types() {
        let mut context = Context::new();
        context.insert("user_id".to_string(), 42_i64.into());
        context.insert("ratio".to_string(), 0.5_f64.into());
        context.insert("cached".to_string(), true.into());
        context.insert("path".to_string(), "/api/v1/campaigns".into());
        let record = LogRecord::new(Level::Warn, Category::Application, "api", "slow request", context);

        let Ok(wire) = QueueItem::new(record.clone()).encode() else {
            panic!("encode");
        };
        assert!(wire.contains("\"level\":\"WARN\""));
        assert!(wire.contains("\"category\":\"application\""));

        let Ok(item) = QueueItem::decode(&wire) else {
            panic!("decode");
        };
        assert_eq!(item.record, record);
        assert_eq!(item.record.context().get("user_id"), Some(&ContextValue::Int(42)));
    }

    #[test]
    fn huge_unsigned_values_degrade_to_text() {
        assert_eq!(
            ContextValue::from(u64::MAX),
            ContextValue::Str(u64::MAX.to_string())
        );
    }
}
