//! Crash-survivable mirroring of a store into durable storage.
//!
//! [`CrashPersistence`] subscribes to an [`crate::EventStore`], coalesces
//! bursts of activity through a [`Debouncer`] and writes the whole current
//! snapshot under one key. A liveness marker written on enable and removed
//! on clean shutdown tells the next session whether the previous one
//! crashed.

mod bridge;
mod debounce;
mod storage;

use std::time::Duration;

use logscope_core::config::{DEFAULT_PERSIST_DEBOUNCE, DEFAULT_PERSIST_MAX};
use logscope_core::LogScopeConfig;

pub use bridge::{CrashPersistence, TeardownGuard};
pub use debounce::{DebounceState, Debouncer};
pub use storage::{DurableStorage, FileStorage, MemoryStorage};

pub const DEFAULT_LOGS_KEY: &str = "logscope:logs";
pub const DEFAULT_MARKER_KEY: &str = "logscope:alive";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Quiet period before a scheduled write fires.
    pub debounce: Duration,
    /// Newest events kept in the durable snapshot.
    pub max_persisted: usize,
    pub logs_key: String,
    pub marker_key: String,
    pub session_key: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_PERSIST_DEBOUNCE,
            max_persisted: DEFAULT_PERSIST_MAX,
            logs_key: DEFAULT_LOGS_KEY.to_string(),
            marker_key: DEFAULT_MARKER_KEY.to_string(),
            session_key: crate::store::DEFAULT_SESSION_KEY.to_string(),
        }
    }
}

impl From<&LogScopeConfig> for PersistenceConfig {
    fn from(config: &LogScopeConfig) -> Self {
        Self {
            debounce: config.persist_debounce,
            max_persisted: config.persist_max,
            ..Self::default()
        }
    }
}
