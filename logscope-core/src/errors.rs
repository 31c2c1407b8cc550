use std::io;

use thiserror::Error;

/// Result type used across the LogScope core crate.
pub type Result<T> = std::result::Result<T, LogScopeError>;

/// Canonical error representation shared by all LogScope crates.
///
/// Public logging operations never return it; it travels between internal
/// helpers until the zero-throw boundary absorbs it.
#[derive(Debug, Error)]
pub enum LogScopeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("durable storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("tracing setup failed: {0}")]
    Tracing(String),

    #[error("{0}")]
    General(String),
}

impl From<serde_json::Error> for LogScopeError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            LogScopeError::Deserialization(err.to_string())
        } else {
            LogScopeError::Serialization(err.to_string())
        }
    }
}

impl From<anyhow::Error> for LogScopeError {
    fn from(err: anyhow::Error) -> Self {
        LogScopeError::General(err.to_string())
    }
}

/// Dedicated configuration error used by the configuration module.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("no home directory available for the default data directory")]
    NoDataDir,
}

impl From<ConfigError> for LogScopeError {
    fn from(value: ConfigError) -> Self {
        LogScopeError::Config(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_syntax_errors_map_to_deserialization() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let mapped = LogScopeError::from(err);
        assert!(matches!(mapped, LogScopeError::Deserialization(_)));
    }

    #[test]
    fn config_errors_keep_their_message() {
        let err: LogScopeError = ConfigError::InvalidValue {
            key: "LOGSCOPE_MAX_LOGS".into(),
            value: "lots".into(),
            reason: "invalid digit found in string".into(),
        }
        .into();
        assert!(matches!(err, LogScopeError::Config(_)));
        assert!(err.to_string().contains("LOGSCOPE_MAX_LOGS"));
    }
}
