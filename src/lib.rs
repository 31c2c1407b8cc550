//! LogScope: structured, span-aware logging with crash recovery.
//!
//! The workspace is split into three crates:
//!
//! * `logscope-protocol`: the event model shared with viewers
//! * `logscope-core`: errors, environment configuration and tracing setup
//! * `logscope-store`: the event store and everything built on it
//!
//! This crate re-exports the common surface and adds a process-wide store
//! plus [`LogScope`], which wires a store to file-backed crash persistence
//! from `LOGSCOPE_*` environment variables.

use std::sync::{Arc, OnceLock};

pub use logscope_core::logging::init_tracing;
pub use logscope_core::{ConfigError, CoreResult, Environment, LogScopeConfig, LogScopeError};
pub use logscope_protocol::context;
pub use logscope_protocol::event::{
    merge_context, ContextMap, ContextValue, LogEvent, LogLevel, LogValue, Source, SpanEvent,
    SpanStatus,
};
pub use logscope_protocol::transport::{TransportEnvelope, TransportMessage, CHANNEL_NAME};
pub use logscope_store::{
    capture_error, diff, export, install_panic_hook, normalize, BoundLogger, CaptureOptions,
    Change, ChangeKind, Clock, ConfigPatch, CrashPersistence, Datum, DiffSummary, DurableStorage,
    ErrorInfo, EventStore, ExportFormat, ExportOptions, FileStorage, FilterState, IgnorePattern,
    LocalBroadcast, ManualClock, MemoryStorage, NetworkCapture, ObjectDiff, ObjectRef,
    PanicHookOptions, PersistenceConfig, RequestInfo, ResponseInfo, ResponseMeta, SpanHandle,
    StorageError, StoreConfig, Subscription, SystemClock, Transport, TransportBridge,
    TransportError,
};

pub mod prelude {
    pub use crate::{
        context, global, BoundLogger, ContextMap, Datum, EventStore, LogEvent, LogLevel,
        SpanHandle, SpanStatus,
    };
}

static GLOBAL: OnceLock<EventStore> = OnceLock::new();

/// The process-wide store, created with defaults on first use unless
/// [`init_global`] ran first.
pub fn global() -> &'static EventStore {
    GLOBAL.get_or_init(EventStore::default)
}

/// Installs `store` as the process-wide store. Returns `false` if one was
/// already in place.
pub fn init_global(store: EventStore) -> bool {
    GLOBAL.set(store).is_ok()
}

#[track_caller]
pub fn debug(message: impl Into<String>) {
    global().log(LogLevel::Debug, message, Vec::new());
}

#[track_caller]
pub fn info(message: impl Into<String>) {
    global().log(LogLevel::Info, message, Vec::new());
}

#[track_caller]
pub fn warn(message: impl Into<String>) {
    global().log(LogLevel::Warn, message, Vec::new());
}

#[track_caller]
pub fn error(message: impl Into<String>) {
    global().log(LogLevel::Error, message, Vec::new());
}

/// Opens a span on the process-wide store.
#[track_caller]
pub fn span(name: impl Into<String>) -> SpanHandle {
    global().start_span(name, None, None)
}

/// A store wired to durable storage and crash persistence.
#[derive(Debug, Clone)]
pub struct LogScope {
    store: EventStore,
    persistence: CrashPersistence,
}

/// What [`LogScope::start`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartReport {
    pub persistence_active: bool,
    pub had_crash: bool,
    /// Valid entries found in the previous session's snapshot.
    pub rehydrated: usize,
}

impl LogScope {
    /// Builds from `LOGSCOPE_*` environment variables (after `.env`),
    /// persisting to `LOGSCOPE_DATA_DIR` or `~/.logscope/data`.
    pub fn from_env() -> CoreResult<Self> {
        let config = LogScopeConfig::from_env()?;
        let dir = config.resolve_data_dir()?;
        let storage = FileStorage::new(dir)?;
        Ok(Self::with_storage(&config, Arc::new(storage)))
    }

    pub fn with_storage(config: &LogScopeConfig, storage: Arc<dyn DurableStorage>) -> Self {
        let persistence_config = PersistenceConfig::from(config);
        let store = EventStore::with_storage_key(
            StoreConfig::from(config),
            storage.clone(),
            persistence_config.session_key.clone(),
        );
        let persistence = CrashPersistence::new(store.clone(), storage, persistence_config);
        Self { store, persistence }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn persistence(&self) -> &CrashPersistence {
        &self.persistence
    }

    /// Enables crash persistence, restores the previous snapshot if that
    /// session crashed, and starts the debounce driver when running inside
    /// a tokio runtime.
    pub fn start(&self) -> StartReport {
        let persistence_active = self.persistence.enable();
        let had_crash = self.persistence.had_crash();
        let rehydrated = if had_crash {
            self.persistence.rehydrate()
        } else {
            0
        };
        if persistence_active {
            self.persistence.spawn_driver();
        }
        tracing::info!(persistence_active, had_crash, rehydrated, "logscope started");
        StartReport {
            persistence_active,
            had_crash,
            rehydrated,
        }
    }

    /// Final flush and clean-shutdown marker.
    pub fn shutdown(&self) {
        self.persistence.shutdown();
    }
}
