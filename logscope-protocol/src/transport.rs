use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::LogEvent;

/// Well-known name of the channel shared by a store and its detached viewers.
pub const CHANNEL_NAME: &str = "logscope-channel";

/// Messages exchanged between windows mirroring the same store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportMessage {
    NewLog { payload: LogEvent },
    ClearLogs,
    SyncRequest,
    SyncResponse { payload: Vec<LogEvent> },
}

impl TransportMessage {
    pub fn event(&self) -> &'static str {
        match self {
            TransportMessage::NewLog { .. } => "NEW_LOG",
            TransportMessage::ClearLogs => "CLEAR_LOGS",
            TransportMessage::SyncRequest => "SYNC_REQUEST",
            TransportMessage::SyncResponse { .. } => "SYNC_RESPONSE",
        }
    }
}

/// A message tagged with its sender so peers can drop their own echoes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEnvelope {
    pub sender_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub message: TransportMessage,
}

impl TransportEnvelope {
    pub fn new(sender_id: impl Into<String>, message: TransportMessage) -> Self {
        Self {
            sender_id: sender_id.into(),
            timestamp: Utc::now(),
            message,
        }
    }

    pub fn is_from(&self, sender_id: &str) -> bool {
        self.sender_id == sender_id
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
