use std::panic::Location;

use logscope_protocol::event::{merge_context, ContextMap, LogLevel};

use crate::normalize::Datum;
use crate::span::SpanHandle;
use crate::store::{EventStore, LogRequest, SourceHint};

/// A logger that tags every event with a fixed context.
///
/// The bound context is merged over the store's global context when each
/// event is recorded, so later global changes are still picked up.
/// Deriving a logger never changes the one it was derived from.
#[derive(Debug, Clone)]
pub struct BoundLogger {
    store: EventStore,
    context: ContextMap,
}

impl BoundLogger {
    pub(crate) fn new(store: EventStore, context: ContextMap) -> Self {
        Self { store, context }
    }

    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    /// A new logger with `extra` merged over this one's context.
    pub fn with_context(&self, extra: ContextMap) -> BoundLogger {
        BoundLogger::new(self.store.clone(), merge_context(&self.context, &extra))
    }

    #[track_caller]
    pub fn log(&self, level: LogLevel, message: impl Into<String>, data: Vec<Datum>) {
        self.store.ingest(LogRequest {
            level,
            message: message.into(),
            data: &data,
            local_context: Some(&self.context),
            span_id: None,
            source: SourceHint::Caller(Location::caller()),
        });
    }

    #[track_caller]
    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message, Vec::new());
    }

    #[track_caller]
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, Vec::new());
    }

    #[track_caller]
    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message, Vec::new());
    }

    #[track_caller]
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message, Vec::new());
    }

    /// Opens a span that carries this logger's context.
    #[track_caller]
    pub fn span(&self, name: impl Into<String>) -> SpanHandle {
        self.store.open_span(
            name.into(),
            self.context.clone(),
            None,
            SourceHint::Caller(Location::caller()),
        )
    }
}
