use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ContextMap, Source};

/// Lifecycle of a span. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Running,
    Success,
    Error,
}

impl SpanStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SpanStatus::Running)
    }
}

impl Default for SpanStatus {
    fn default() -> Self {
        SpanStatus::Running
    }
}

/// A named, timed grouping of log events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanEvent {
    pub id: Uuid,
    pub name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds between start and end, never negative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default)]
    pub status: SpanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextMap>,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub session_id: String,
}

impl SpanEvent {
    pub fn start(name: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            start_time,
            end_time: None,
            duration: None,
            status: SpanStatus::Running,
            parent_id: None,
            context: None,
            source: Source::unknown(),
            session_id: String::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Moves a running span into `status`, stamping end time and duration.
    /// Returns `false` and leaves the span untouched when it had already
    /// finished or when `status` is not terminal.
    pub fn finish(&mut self, status: SpanStatus, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        let elapsed = (at - self.start_time).num_milliseconds().max(0);
        self.status = status;
        self.end_time = Some(at);
        self.duration = Some(elapsed);
        true
    }
}
