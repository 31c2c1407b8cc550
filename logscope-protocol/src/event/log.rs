use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ContextMap, LogLevel, LogValue, Source};

/// A single stored log record. Immutable once it has been appended to a
/// store; eviction and `clear` are the only ways it disappears.
///
/// `id`, `timestamp`, `level` and `message` are mandatory on the wire; the
/// remaining fields default, which is what lets persisted records from an
/// older session be validated by deserialisation alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub id: Uuid,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub data: Vec<LogValue>,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<Uuid>,
}

impl LogEvent {
    /// Minimal record with a fresh time-ordered id; mostly useful for
    /// imports and tests; live events are built by the store pipeline.
    pub fn new(level: LogLevel, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp,
            level,
            message: message.into(),
            data: Vec::new(),
            source: Source::unknown(),
            session_id: String::new(),
            context: None,
            span_id: None,
        }
    }

    /// Validates an untrusted JSON record, returning `None` when it lacks
    /// the required shape.
    pub fn from_untrusted(value: serde_json::Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    /// Compact JSON rendering of `data`, used for substring search.
    pub fn data_text(&self) -> String {
        if self.data.is_empty() {
            return String::new();
        }
        serde_json::to_string(&self.data).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamp_travels_as_epoch_millis() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let event = LogEvent::new(LogLevel::Info, "hello", at);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["timestamp"], json!(1_700_000_000_123_i64));
        assert_eq!(value["level"], json!("info"));
        assert!(value.get("spanId").is_none());
    }

    #[test]
    fn untrusted_records_need_the_minimal_shape() {
        let valid = json!({
            "id": "018f4d6e-8a3b-7c2d-9e1f-0a1b2c3d4e5f",
            "timestamp": 1_700_000_000_000_i64,
            "level": "warn",
            "message": "disk almost full"
        });
        let parsed = LogEvent::from_untrusted(valid).expect("valid record");
        assert_eq!(parsed.source, Source::unknown());
        assert!(parsed.data.is_empty());

        assert!(LogEvent::from_untrusted(json!({"message": "no id"})).is_none());
        assert!(LogEvent::from_untrusted(json!("just a string")).is_none());
        assert!(LogEvent::from_untrusted(json!({
            "id": "018f4d6e-8a3b-7c2d-9e1f-0a1b2c3d4e5f",
            "timestamp": 1,
            "level": "fatal",
            "message": "bad level"
        }))
        .is_none());
    }
}
