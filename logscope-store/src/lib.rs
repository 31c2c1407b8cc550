//! LogScope store - event pipeline, span tracker and crash persistence.

pub mod callsite;
pub mod clock;
pub mod context;
pub mod diff;
pub mod error;
pub mod export;
pub mod filter;
pub mod hooks;
pub mod network;
pub mod normalize;
pub mod persistence;
pub mod span;
pub mod store;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::BoundLogger;
pub use diff::{diff, Change, ChangeKind, DiffSummary, ObjectDiff};
pub use error::{StorageError, TransportError};
pub use export::{export, ExportFormat, ExportOptions};
pub use filter::FilterState;
pub use hooks::{capture_error, install_panic_hook, PanicHookOptions};
pub use network::{
    CaptureOptions, IgnorePattern, NetworkCapture, RequestInfo, ResponseInfo, ResponseMeta,
};
pub use normalize::{normalize, Datum, ErrorInfo, ObjectRef};
pub use persistence::{
    CrashPersistence, DurableStorage, FileStorage, MemoryStorage, PersistenceConfig,
};
pub use span::SpanHandle;
pub use store::{ConfigPatch, EventStore, StoreConfig, Subscription};
pub use transport::{LocalBroadcast, Transport, TransportBridge};
