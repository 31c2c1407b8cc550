//! Handles for grouped, timed operations.

use std::panic::{catch_unwind, AssertUnwindSafe, Location};

use logscope_protocol::event::{merge_context, ContextMap, LogLevel, SpanStatus};
use uuid::Uuid;

use crate::normalize::Datum;
use crate::store::{EventStore, LogRequest, SourceHint};

/// A running (or finished) span.
///
/// Logs written through the handle carry the span's id and context. Once
/// the span reaches a terminal status, or disappears from the store, the
/// handle silently refuses further logs. `end` and `fail` are idempotent.
#[derive(Debug, Clone)]
pub struct SpanHandle {
    store: EventStore,
    id: Uuid,
    name: String,
    context: ContextMap,
}

impl SpanHandle {
    pub(crate) fn new(store: EventStore, id: Uuid, name: String, context: ContextMap) -> Self {
        Self {
            store,
            id,
            name,
            context,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Context this span was opened with, excluding the global context.
    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    /// `Running` while open; also reported for an inert handle or a span
    /// that was cleared from the store.
    pub fn status(&self) -> SpanStatus {
        self.store
            .span(self.id)
            .map(|span| span.status)
            .unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        !self.store.span_is_running(self.id)
    }

    #[track_caller]
    pub fn log(&self, level: LogLevel, message: impl Into<String>, data: Vec<Datum>) {
        self.emit(level, message.into(), &data, SourceHint::Caller(Location::caller()));
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

    #[track_caller]
    pub fn info_with(&self, message: impl Into<String>, data: Vec<Datum>) {
        self.log(LogLevel::Info, message, data);
    }

    /// Logs with a call site captured elsewhere, e.g. where an instrumented
    /// request was issued.
    pub(crate) fn log_at(
        &self,
        level: LogLevel,
        message: String,
        data: Vec<Datum>,
        location: &'static Location<'static>,
    ) {
        self.emit(level, message, &data, SourceHint::Caller(location));
    }

    fn emit(&self, level: LogLevel, message: String, data: &[Datum], source: SourceHint) {
        if !self.store.span_is_running(self.id) {
            return;
        }
        self.store.ingest(LogRequest {
            level,
            message,
            data,
            local_context: Some(&self.context),
            span_id: Some(self.id),
            source,
        });
    }

    /// Opens a child span. Its context is this span's context with `extra`
    /// merged on top.
    #[track_caller]
    pub fn span(&self, name: impl Into<String>, extra: Option<ContextMap>) -> SpanHandle {
        let context = match extra {
            Some(extra) => merge_context(&self.context, &extra),
            None => self.context.clone(),
        };
        self.store.open_span(
            name.into(),
            context,
            Some(self.id),
            SourceHint::Caller(Location::caller()),
        )
    }

    /// Marks the span successful. No-op once terminal.
    pub fn end(&self) {
        self.store.finish_span(self.id, SpanStatus::Success);
    }

    /// Marks the span failed without logging anything.
    pub fn fail(&self) {
        self.store.finish_span(self.id, SpanStatus::Error);
    }

    /// Logs `cause` at error level against this span, then marks it
    /// failed. Does nothing if the span is already terminal.
    #[track_caller]
    pub fn fail_with(&self, cause: impl Into<Datum>) {
        let location = Location::caller();
        if !self.store.span_is_running(self.id) {
            return;
        }
        let cause = cause.into();
        let message = catch_unwind(AssertUnwindSafe(|| cause.to_message()))
            .unwrap_or_else(|_| "span failed".to_string());
        self.emit(
            LogLevel::Error,
            message,
            std::slice::from_ref(&cause),
            SourceHint::Caller(location),
        );
        self.fail();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::ErrorInfo;
    use crate::store::{ConfigPatch, StoreConfig};
    use logscope_protocol::context;
    use logscope_protocol::event::{LogValue, SpanEvent};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn span_lifecycle_with_attributed_log() {
        let store = EventStore::default();
        let span = store.start_span("checkout", None, None);
        span.info("charging card");
        span.end();

        let recorded = store.span(span.id()).unwrap();
        assert_eq!(recorded.status, SpanStatus::Success);
        assert!(recorded.duration.unwrap() >= 0);
        assert_eq!(store.span_logs(span.id()).len(), 1);
    }

    #[test]
    fn end_and_fail_are_idempotent() {
        let store = EventStore::default();
        let span = store.start_span("once", None, None);
        span.end();
        let first = store.span(span.id()).unwrap();

        span.end();
        span.fail_with("late");
        let second = store.span(span.id()).unwrap();

        assert_eq!(second.status, SpanStatus::Success);
        assert_eq!(second.end_time, first.end_time);
        assert_eq!(second.duration, first.duration);
        assert!(store.is_empty());
    }

    #[test]
    fn finished_spans_refuse_new_logs() {
        let store = EventStore::default();
        let span = store.start_span("short", None, None);
        span.fail();
        span.warn("too late");

        assert!(span.is_finished());
        assert_eq!(span.status(), SpanStatus::Error);
        assert!(store.span_logs(span.id()).is_empty());
    }

    #[test]
    fn fail_with_logs_the_cause_first() {
        let store = EventStore::default();
        let span = store.start_span("upload", None, None);
        span.fail_with(ErrorInfo::new("TimeoutError", "gateway timed out"));

        let logs = store.span_logs(span.id());
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
        assert_eq!(logs[0].message, "gateway timed out");
        assert!(matches!(
            &logs[0].data[0],
            LogValue::Error { name, .. } if name == "TimeoutError"
        ));
        assert_eq!(span.status(), SpanStatus::Error);
    }

    #[test]
    fn children_inherit_and_extend_context() {
        let store = EventStore::default();
        store.set_global_context(context! { "env" => "dev" });
        let parent = store.start_span("order", Some(context! { "order" => 7, "step" => "a" }), None);
        let child = parent.span("payment", Some(context! { "step" => "b" }));
        child.info("inside child");

        let child_span = store.span(child.id()).unwrap();
        assert_eq!(child_span.parent_id, Some(parent.id()));
        assert_eq!(
            child_span.context,
            Some(context! { "env" => "dev", "order" => 7, "step" => "b" })
        );
        assert_eq!(
            store.span_logs(child.id())[0].context,
            Some(context! { "env" => "dev", "order" => 7, "step" => "b" })
        );
        assert_eq!(parent.context(), &context! { "order" => 7, "step" => "a" });
    }

    #[test]
    fn span_subscribers_see_start_before_end() {
        let store = EventStore::default();
        let seen: Arc<Mutex<Vec<SpanStatus>>> = Arc::default();
        let sink = seen.clone();
        store.subscribe_spans(move |span: &SpanEvent| sink.lock().push(span.status));

        let span = store.start_span("observed", None, None);
        assert_eq!(*seen.lock(), vec![SpanStatus::Running]);
        span.end();
        span.end();
        assert_eq!(*seen.lock(), vec![SpanStatus::Running, SpanStatus::Success]);
    }

    #[test]
    fn disabled_store_hands_out_inert_spans() {
        let store = EventStore::default();
        store.configure(ConfigPatch::default().enabled(false));
        let span = store.start_span("ghost", None, None);
        span.info("nothing");
        span.end();

        assert!(span.is_finished());
        assert!(store.spans().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn spans_map_prefers_evicting_finished_spans() {
        let store = EventStore::new(StoreConfig {
            max_spans: 2,
            ..StoreConfig::default()
        });
        let running = store.start_span("long-lived", None, None);
        let done = store.start_span("quick", None, None);
        done.end();
        let newest = store.start_span("newest", None, None);

        assert!(store.span(running.id()).is_some());
        assert!(store.span(done.id()).is_none());
        assert!(store.span(newest.id()).is_some());
    }

    #[test]
    fn in_span_maps_results_to_status() {
        let store = EventStore::default();
        let ok: Result<u8, String> = store.in_span("parse", |span| {
            span.debug("parsing");
            Ok(1)
        });
        assert_eq!(ok, Ok(1));

        let err: Result<u8, String> = store.in_span("validate", |_| Err("bad input".to_string()));
        assert!(err.is_err());

        let mut spans = store.spans();
        spans.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(spans[0].status, SpanStatus::Success);
        assert_eq!(spans[1].status, SpanStatus::Error);
        assert_eq!(store.logs().last().unwrap().message, "bad input");
    }
}
