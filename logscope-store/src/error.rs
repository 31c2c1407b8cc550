use std::io;

use logscope_core::LogScopeError;
use thiserror::Error;

/// Failures reported by a [`crate::DurableStorage`] backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("durable storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage quota exceeded: {needed} bytes needed, {limit} allowed")]
    QuotaExceeded { needed: usize, limit: usize },

    #[error("storage I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("stored payload is corrupted: {0}")]
    Corrupted(String),
}

impl StorageError {
    /// Capacity failures get one reduced-size retry; nothing else does.
    pub fn is_quota(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

impl From<StorageError> for LogScopeError {
    fn from(value: StorageError) -> Self {
        LogScopeError::Storage(value.to_string())
    }
}

/// Failures publishing to an inter-window [`crate::Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport channel closed")]
    Closed,

    #[error("envelope could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<TransportError> for LogScopeError {
    fn from(value: TransportError) -> Self {
        LogScopeError::General(value.to_string())
    }
}
