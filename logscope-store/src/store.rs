//! The event store: bounded log retention, the spans map, global context and
//! subscriber fan-out, plus the ingestion pipeline that feeds them.
//!
//! Every public method is zero-throw. State lives behind one `parking_lot`
//! mutex that is never held while user callbacks run, so subscribers may
//! log, clear or (un)subscribe from inside their own callback.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use logscope_core::config::{DEFAULT_MAX_LOGS, DEFAULT_MAX_SPANS};
use logscope_core::LogScopeConfig;
use logscope_protocol::event::{
    merge_context, ContextMap, LogEvent, LogLevel, LogValue, Source, SpanEvent, SpanStatus,
    UNCLONEABLE_SENTINEL,
};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::callsite::resolve_location;
use crate::clock::{Clock, SystemClock};
use crate::context::BoundLogger;
use crate::diff::diff;
use crate::export::{export, ExportOptions};
use crate::filter::FilterState;
use crate::normalize::{normalize, normalize_all, panic_message, Datum};
use crate::persistence::DurableStorage;
use crate::span::SpanHandle;

/// Key under which a store with durable storage keeps its session id.
pub const DEFAULT_SESSION_KEY: &str = "logscope:session";

pub type LogSubscriber = Arc<dyn Fn(&LogEvent) + Send + Sync>;
pub type SpanSubscriber = Arc<dyn Fn(&SpanEvent) + Send + Sync>;
pub type ClearSubscriber = Arc<dyn Fn() + Send + Sync>;

/// Runtime configuration of a store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Hard cap on retained events; older events are evicted first.
    /// Zero disables retention while still notifying subscribers.
    pub max_logs: usize,
    pub min_level: LogLevel,
    pub enabled: bool,
    /// Cap on the spans map; finished spans are evicted before running ones.
    pub max_spans: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_logs: DEFAULT_MAX_LOGS,
            min_level: LogLevel::Debug,
            enabled: true,
            max_spans: DEFAULT_MAX_SPANS,
        }
    }
}

impl From<&LogScopeConfig> for StoreConfig {
    fn from(config: &LogScopeConfig) -> Self {
        Self {
            max_logs: config.max_logs,
            min_level: config.min_level,
            enabled: config.enabled,
            max_spans: config.max_spans,
        }
    }
}

/// Partial update for [`EventStore::configure`]; `None` fields are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfigPatch {
    pub max_logs: Option<usize>,
    pub min_level: Option<LogLevel>,
    pub enabled: Option<bool>,
    pub max_spans: Option<usize>,
}

impl ConfigPatch {
    pub fn max_logs(mut self, max_logs: usize) -> Self {
        self.max_logs = Some(max_logs);
        self
    }

    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = Some(level);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn max_spans(mut self, max_spans: usize) -> Self {
        self.max_spans = Some(max_spans);
        self
    }

    fn apply_to(self, config: &mut StoreConfig) {
        if let Some(max_logs) = self.max_logs {
            config.max_logs = max_logs;
        }
        if let Some(min_level) = self.min_level {
            config.min_level = min_level;
        }
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(max_spans) = self.max_spans {
            config.max_spans = max_spans;
        }
    }
}

/// Where the call site of an event comes from.
#[derive(Debug, Clone)]
pub(crate) enum SourceHint {
    Caller(&'static Location<'static>),
    Explicit(Source),
}

impl SourceHint {
    fn resolve(self) -> Source {
        match self {
            SourceHint::Caller(location) => {
                catch_unwind(|| resolve_location(location)).unwrap_or_default()
            }
            SourceHint::Explicit(source) => source,
        }
    }
}

/// Everything the pipeline needs to build one event.
pub(crate) struct LogRequest<'a> {
    pub level: LogLevel,
    pub message: String,
    pub data: &'a [Datum],
    pub local_context: Option<&'a ContextMap>,
    pub span_id: Option<Uuid>,
    pub source: SourceHint,
}

enum SessionSource {
    Fixed(String),
    Durable {
        storage: Arc<dyn DurableStorage>,
        key: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubscriberKind {
    Logs,
    Spans,
    Clears,
}

struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, T)>,
    /// Subscribers that have panicked at least once.
    faulted: HashSet<u64>,
}

impl<T: Clone> Registry<T> {
    fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
            faulted: HashSet::new(),
        }
    }

    fn add(&mut self, entry: T) -> u64 {
        self.next_id += 1;
        self.entries.push((self.next_id, entry));
        self.next_id
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| *existing != id);
        self.faulted.remove(&id);
        before != self.entries.len()
    }

    fn snapshot(&self) -> Vec<T> {
        self.entries.iter().map(|(_, entry)| entry.clone()).collect()
    }

    fn snapshot_with_ids(&self, skip_faulted: bool) -> Vec<(u64, T)> {
        self.entries
            .iter()
            .filter(|(id, _)| !(skip_faulted && self.faulted.contains(id)))
            .cloned()
            .collect()
    }

    fn mark_faulted(&mut self, id: u64) {
        self.faulted.insert(id);
    }
}

struct State {
    config: StoreConfig,
    logs: VecDeque<LogEvent>,
    spans: HashMap<Uuid, SpanEvent>,
    span_order: VecDeque<Uuid>,
    global_context: ContextMap,
    session_id: Option<String>,
}

impl State {
    fn enforce_log_cap(&mut self) {
        while self.logs.len() > self.config.max_logs {
            self.logs.pop_front();
        }
    }

    fn enforce_span_cap(&mut self) {
        while self.spans.len() > self.config.max_spans {
            let finished = self.span_order.iter().position(|id| {
                self.spans
                    .get(id)
                    .map_or(true, |span| span.status.is_terminal())
            });
            let index = finished.unwrap_or(0);
            match self.span_order.remove(index) {
                Some(id) => {
                    self.spans.remove(&id);
                }
                None => break,
            }
        }
    }
}

pub(crate) struct Inner {
    state: Mutex<State>,
    log_subscribers: Mutex<Registry<LogSubscriber>>,
    span_subscribers: Mutex<Registry<SpanSubscriber>>,
    clear_subscribers: Mutex<Registry<ClearSubscriber>>,
    session: SessionSource,
    clock: Arc<dyn Clock>,
}

/// Handle returned by the `subscribe*` methods.
///
/// Dropping it keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to remove exactly that subscriber.
#[derive(Debug)]
pub struct Subscription {
    kind: SubscriberKind,
    id: u64,
    store: Weak<Inner>,
}

impl Subscription {
    /// Removes the subscriber. Returns `false` if it was already gone or
    /// the store has been dropped.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.store.upgrade() else {
            return false;
        };
        match self.kind {
            SubscriberKind::Logs => inner.log_subscribers.lock().remove(self.id),
            SubscriberKind::Spans => inner.span_subscribers.lock().remove(self.id),
            SubscriberKind::Clears => inner.clear_subscribers.lock().remove(self.id),
        }
    }
}

/// In-memory log and span store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<Inner>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("EventStore")
            .field("config", &state.config)
            .field("logs", &state.logs.len())
            .field("spans", &state.spans.len())
            .finish()
    }
}

impl EventStore {
    /// A store whose session id is generated once, at construction.
    pub fn new(config: StoreConfig) -> Self {
        Self::build(
            config,
            SessionSource::Fixed(Uuid::new_v4().to_string()),
            Arc::new(SystemClock),
        )
    }

    /// A store that keeps its session id in `storage`, so it survives a
    /// restart against the same storage. If the storage fails, each event
    /// gets an ephemeral id instead.
    pub fn with_storage(config: StoreConfig, storage: Arc<dyn DurableStorage>) -> Self {
        Self::with_storage_key(config, storage, DEFAULT_SESSION_KEY)
    }

    /// [`EventStore::with_storage`] with a custom session key.
    pub fn with_storage_key(
        config: StoreConfig,
        storage: Arc<dyn DurableStorage>,
        key: impl Into<String>,
    ) -> Self {
        Self::build(
            config,
            SessionSource::Durable {
                storage,
                key: key.into(),
            },
            Arc::new(SystemClock),
        )
    }

    /// Replaces the clock. Intended for construction time, before any
    /// other clone of the store exists.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => Self::build(inner.state.into_inner().config, inner.session, clock),
            Err(inner) => {
                warn!("with_clock called on a shared store; clock left unchanged");
                Self { inner }
            }
        }
    }

    fn build(config: StoreConfig, session: SessionSource, clock: Arc<dyn Clock>) -> Self {
        let state = State {
            config,
            logs: VecDeque::new(),
            spans: HashMap::new(),
            span_order: VecDeque::new(),
            global_context: ContextMap::new(),
            session_id: match &session {
                SessionSource::Fixed(id) => Some(id.clone()),
                SessionSource::Durable { .. } => None,
            },
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                log_subscribers: Mutex::new(Registry::new()),
                span_subscribers: Mutex::new(Registry::new()),
                clear_subscribers: Mutex::new(Registry::new()),
                session,
                clock,
            }),
        }
    }

    // ---- ingestion -------------------------------------------------------

    /// Records an event. Never fails: events below the minimum level or
    /// logged while disabled are dropped silently.
    #[track_caller]
    pub fn log(&self, level: LogLevel, message: impl Into<String>, data: Vec<Datum>) {
        self.ingest(LogRequest {
            level,
            message: message.into(),
            data: &data,
            local_context: None,
            span_id: None,
            source: SourceHint::Caller(Location::caller()),
        });
    }

    /// Like [`EventStore::log`] for a message that is not a string; it is
    /// stringified (JSON for structured values).
    #[track_caller]
    pub fn log_value(&self, level: LogLevel, message: Datum, data: Vec<Datum>) {
        let location = Location::caller();
        let message = catch_unwind(AssertUnwindSafe(|| message.to_message()))
            .unwrap_or_else(|_| UNCLONEABLE_SENTINEL.to_string());
        self.ingest(LogRequest {
            level,
            message,
            data: &data,
            local_context: None,
            span_id: None,
            source: SourceHint::Caller(location),
        });
    }

    /// Records an event with a call site supplied by the producer, e.g. a
    /// panic location or a frame parsed from a foreign stack trace.
    pub fn log_with_source(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        data: Vec<Datum>,
        source: Source,
    ) {
        self.ingest(LogRequest {
            level,
            message: message.into(),
            data: &data,
            local_context: None,
            span_id: None,
            source: SourceHint::Explicit(source),
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

    #[track_caller]
    pub fn debug_with(&self, message: impl Into<String>, data: Vec<Datum>) {
        self.log(LogLevel::Debug, message, data);
    }

    #[track_caller]
    pub fn info_with(&self, message: impl Into<String>, data: Vec<Datum>) {
        self.log(LogLevel::Info, message, data);
    }

    #[track_caller]
    pub fn warn_with(&self, message: impl Into<String>, data: Vec<Datum>) {
        self.log(LogLevel::Warn, message, data);
    }

    #[track_caller]
    pub fn error_with(&self, message: impl Into<String>, data: Vec<Datum>) {
        self.log(LogLevel::Error, message, data);
    }

    /// Normalises both values, diffs them and logs the result at `info`
    /// with the diff as the only data item.
    #[track_caller]
    pub fn log_diff(&self, message: impl Into<String>, before: &Datum, after: &Datum) {
        let location = Location::caller();
        let changes = catch_unwind(AssertUnwindSafe(|| {
            diff(&normalize(before), &normalize(after)).to_log_value()
        }))
        .unwrap_or(LogValue::Uncloneable);
        self.ingest(LogRequest {
            level: LogLevel::Info,
            message: message.into(),
            data: &[Datum::Json(changes.to_json())],
            local_context: None,
            span_id: None,
            source: SourceHint::Caller(location),
        });
    }

    /// The pipeline: gate, enrich, store, distribute. Returns the stored
    /// event, or `None` when it was gated out or something failed.
    pub(crate) fn ingest(&self, request: LogRequest<'_>) -> Option<LogEvent> {
        match catch_unwind(AssertUnwindSafe(|| self.try_ingest(request))) {
            Ok(event) => event,
            Err(payload) => {
                warn!(reason = %panic_message(payload.as_ref()), "log pipeline aborted");
                None
            }
        }
    }

    fn try_ingest(&self, request: LogRequest<'_>) -> Option<LogEvent> {
        let (global_context, max_logs) = {
            let state = self.inner.state.lock();
            if !state.config.enabled || !request.level.passes(state.config.min_level) {
                return None;
            }
            (state.global_context.clone(), state.config.max_logs)
        };

        let event = self.enrich(request, &global_context);

        {
            let mut state = self.inner.state.lock();
            if max_logs > 0 {
                state.logs.push_back(event.clone());
            }
            state.enforce_log_cap();
        }

        self.notify_logs(&event);
        Some(event)
    }

    fn enrich(&self, request: LogRequest<'_>, global_context: &ContextMap) -> LogEvent {
        let source = request.source.resolve();
        let data = catch_unwind(AssertUnwindSafe(|| normalize_all(request.data)))
            .unwrap_or_else(|_| vec![LogValue::Uncloneable; request.data.len()]);
        let context = match request.local_context {
            Some(local) => merge_context(global_context, local),
            None => global_context.clone(),
        };

        LogEvent {
            id: Uuid::now_v7(),
            timestamp: self.now(),
            level: request.level,
            message: request.message,
            data,
            source,
            session_id: self.session_id(),
            context: if context.is_empty() {
                None
            } else {
                Some(context)
            },
            span_id: request.span_id,
        }
    }

    // ---- queries ---------------------------------------------------------

    /// Retained events, oldest first.
    pub fn logs(&self) -> Vec<LogEvent> {
        self.inner.state.lock().logs.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained events that pass `filter`.
    pub fn query(&self, filter: &FilterState) -> Vec<LogEvent> {
        let state = self.inner.state.lock();
        state
            .logs
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect()
    }

    pub fn export(&self, options: &ExportOptions) -> String {
        export(&self.logs(), options, self.now())
    }

    pub fn config(&self) -> StoreConfig {
        self.inner.state.lock().config.clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        catch_unwind(AssertUnwindSafe(|| self.inner.clock.now())).unwrap_or_else(|_| Utc::now())
    }

    /// Session identifier stamped on every event.
    pub fn session_id(&self) -> String {
        if let Some(id) = self.inner.state.lock().session_id.clone() {
            return id;
        }
        match self.resolve_durable_session() {
            Some(id) => {
                self.inner.state.lock().session_id = Some(id.clone());
                id
            }
            None => format!("ephemeral-{}", Uuid::new_v4()),
        }
    }

    fn resolve_durable_session(&self) -> Option<String> {
        let SessionSource::Durable { storage, key } = &self.inner.session else {
            return None;
        };
        match storage.get(key) {
            Ok(Some(existing)) if !existing.trim().is_empty() => Some(existing),
            Ok(_) => {
                let fresh = Uuid::new_v4().to_string();
                match storage.set(key, &fresh) {
                    Ok(()) => Some(fresh),
                    Err(err) => {
                        debug!(error = %err, "session id not persisted");
                        None
                    }
                }
            }
            Err(err) => {
                debug!(error = %err, "durable session unavailable");
                None
            }
        }
    }

    // ---- mutation --------------------------------------------------------

    /// Drops every event and span. Session id and global context survive.
    pub fn clear(&self) {
        {
            let mut state = self.inner.state.lock();
            state.logs.clear();
            state.spans.clear();
            state.span_order.clear();
        }
        let subscribers = self.inner.clear_subscribers.lock().snapshot();
        for subscriber in subscribers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| subscriber())) {
                debug!(reason = %panic_message(payload.as_ref()), "clear subscriber panicked");
            }
        }
    }

    /// Puts foreign events in front of the current ones, skipping ids that
    /// are already present (or repeated in `foreign`), then re-applies the
    /// cap. Returns how many were actually added. Subscribers are not
    /// notified.
    pub fn import_logs(&self, foreign: Vec<LogEvent>) -> usize {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut state = self.inner.state.lock();
            let mut seen: HashSet<Uuid> = state.logs.iter().map(|event| event.id).collect();
            let fresh: Vec<LogEvent> = foreign
                .into_iter()
                .filter(|event| seen.insert(event.id))
                .collect();
            let imported = fresh.len();
            for event in fresh.into_iter().rev() {
                state.logs.push_front(event);
            }
            state.enforce_log_cap();
            imported
        }));
        outcome.unwrap_or(0)
    }

    /// Appends an already-built event (e.g. one received from another
    /// window) and notifies subscribers. Duplicates by id are ignored.
    pub fn append_external(&self, event: LogEvent) -> bool {
        {
            let mut state = self.inner.state.lock();
            if !state.config.enabled || state.logs.iter().any(|existing| existing.id == event.id) {
                return false;
            }
            if state.config.max_logs > 0 {
                state.logs.push_back(event.clone());
            }
            state.enforce_log_cap();
        }
        self.notify_logs(&event);
        true
    }

    /// Merges `patch` into the current configuration. Shrinking the caps
    /// evicts immediately.
    pub fn configure(&self, patch: ConfigPatch) {
        let mut state = self.inner.state.lock();
        patch.apply_to(&mut state.config);
        state.enforce_log_cap();
        state.enforce_span_cap();
    }

    // ---- global context --------------------------------------------------

    pub fn set_global_context(&self, context: ContextMap) {
        self.inner.state.lock().global_context = context;
    }

    /// Shallow merge into the global context; incoming keys win.
    pub fn update_global_context(&self, context: ContextMap) {
        let mut state = self.inner.state.lock();
        state.global_context.extend(context);
    }

    pub fn global_context(&self) -> ContextMap {
        self.inner.state.lock().global_context.clone()
    }

    pub fn clear_global_context(&self) {
        self.inner.state.lock().global_context.clear();
    }

    /// A logger that tags everything it records with `context`.
    pub fn with_context(&self, context: ContextMap) -> BoundLogger {
        BoundLogger::new(self.clone(), context)
    }

    // ---- spans -----------------------------------------------------------

    /// Opens a running span and notifies span subscribers before returning.
    #[track_caller]
    pub fn start_span(
        &self,
        name: impl Into<String>,
        context: Option<ContextMap>,
        parent_id: Option<Uuid>,
    ) -> SpanHandle {
        self.open_span(
            name.into(),
            context.unwrap_or_default(),
            parent_id,
            SourceHint::Caller(Location::caller()),
        )
    }

    /// Runs `work` inside a span: `Ok` ends it, `Err` fails it with the
    /// error's text.
    #[track_caller]
    pub fn in_span<T, E, F>(&self, name: impl Into<String>, work: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnOnce(&SpanHandle) -> Result<T, E>,
    {
        let span = self.start_span(name, None, None);
        let result = work(&span);
        match &result {
            Ok(_) => span.end(),
            Err(err) => span.fail_with(Datum::Str(err.to_string())),
        }
        result
    }

    pub(crate) fn open_span(
        &self,
        name: String,
        local_context: ContextMap,
        parent_id: Option<Uuid>,
        source: SourceHint,
    ) -> SpanHandle {
        let recorded = catch_unwind(AssertUnwindSafe(|| {
            self.record_span(&name, &local_context, parent_id, source)
        }));
        let id = match recorded {
            Ok(Some(span)) => {
                let id = span.id;
                self.notify_spans(&span);
                id
            }
            // Disabled store or internal failure: the handle is inert.
            Ok(None) | Err(_) => Uuid::nil(),
        };
        SpanHandle::new(self.clone(), id, name, local_context)
    }

    fn record_span(
        &self,
        name: &str,
        local_context: &ContextMap,
        parent_id: Option<Uuid>,
        source: SourceHint,
    ) -> Option<SpanEvent> {
        let global_context = {
            let state = self.inner.state.lock();
            if !state.config.enabled {
                return None;
            }
            state.global_context.clone()
        };

        let context = merge_context(&global_context, local_context);
        let mut span = SpanEvent::start(name, self.now());
        span.parent_id = parent_id;
        span.context = if context.is_empty() {
            None
        } else {
            Some(context)
        };
        span.source = source.resolve();
        span.session_id = self.session_id();

        let mut state = self.inner.state.lock();
        state.span_order.push_back(span.id);
        state.spans.insert(span.id, span.clone());
        state.enforce_span_cap();
        Some(span)
    }

    /// Applies a terminal status. `None` if the span is unknown or had
    /// already finished.
    pub(crate) fn finish_span(&self, id: Uuid, status: SpanStatus) -> Option<SpanEvent> {
        let now = self.now();
        let finished = {
            let mut state = self.inner.state.lock();
            let span = state.spans.get_mut(&id)?;
            if !span.finish(status, now) {
                return None;
            }
            span.clone()
        };
        self.notify_spans(&finished);
        Some(finished)
    }

    pub(crate) fn span_is_running(&self, id: Uuid) -> bool {
        self.inner
            .state
            .lock()
            .spans
            .get(&id)
            .map_or(false, SpanEvent::is_running)
    }

    /// All known spans, in no particular order.
    pub fn spans(&self) -> Vec<SpanEvent> {
        self.inner.state.lock().spans.values().cloned().collect()
    }

    pub fn span(&self, id: Uuid) -> Option<SpanEvent> {
        self.inner.state.lock().spans.get(&id).cloned()
    }

    /// Retained events attributed to span `id`, oldest first.
    pub fn span_logs(&self, id: Uuid) -> Vec<LogEvent> {
        self.inner
            .state
            .lock()
            .logs
            .iter()
            .filter(|event| event.span_id == Some(id))
            .cloned()
            .collect()
    }

    // ---- subscribers -----------------------------------------------------

    pub fn subscribe<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn(&LogEvent) + Send + Sync + 'static,
    {
        let id = self.inner.log_subscribers.lock().add(Arc::new(subscriber));
        self.subscription(SubscriberKind::Logs, id)
    }

    /// Span subscribers see each span twice: when it opens and when it
    /// reaches a terminal status.
    pub fn subscribe_spans<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn(&SpanEvent) + Send + Sync + 'static,
    {
        let id = self.inner.span_subscribers.lock().add(Arc::new(subscriber));
        self.subscription(SubscriberKind::Spans, id)
    }

    pub fn subscribe_clear<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.clear_subscribers.lock().add(Arc::new(subscriber));
        self.subscription(SubscriberKind::Clears, id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.log_subscribers.lock().entries.len()
    }

    fn subscription(&self, kind: SubscriberKind, id: u64) -> Subscription {
        Subscription {
            kind,
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    // Fan-out iterates a snapshot so callbacks can mutate the registry, and
    // each callback is isolated so one panic cannot starve its siblings.
    fn notify_logs(&self, event: &LogEvent) {
        // A panic raised from inside the panic hook aborts the process, so
        // subscribers that panicked before are skipped there.
        let in_hook = crate::hooks::in_panic_hook();
        let subscribers = self.inner.log_subscribers.lock().snapshot_with_ids(in_hook);
        for (id, subscriber) in subscribers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                debug!(reason = %panic_message(payload.as_ref()), "log subscriber panicked");
                self.inner.log_subscribers.lock().mark_faulted(id);
            }
        }
    }

    fn notify_spans(&self, span: &SpanEvent) {
        let subscribers = self.inner.span_subscribers.lock().snapshot();
        for subscriber in subscribers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| subscriber(span))) {
                debug!(reason = %panic_message(payload.as_ref()), "span subscriber panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::normalize::ObjectRef;
    use crate::persistence::MemoryStorage;
    use logscope_protocol::context;
    use logscope_protocol::event::CIRCULAR_SENTINEL;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_case::test_case;

    fn messages(store: &EventStore) -> Vec<String> {
        store.logs().into_iter().map(|event| event.message).collect()
    }

    #[test]
    fn fifo_eviction_keeps_most_recent() {
        let store = EventStore::new(StoreConfig {
            max_logs: 3,
            ..StoreConfig::default()
        });
        for message in ["1", "2", "3", "4"] {
            store.info(message);
        }
        assert_eq!(messages(&store), vec!["2", "3", "4"]);
    }

    #[test]
    fn long_runs_stay_at_the_cap_in_call_order() {
        let store = EventStore::new(StoreConfig {
            max_logs: 10,
            ..StoreConfig::default()
        });
        for index in 0..57 {
            store.debug(index.to_string());
        }
        let expected: Vec<String> = (47..57).map(|index: i32| index.to_string()).collect();
        assert_eq!(messages(&store), expected);
    }

    #[test_case(LogLevel::Debug, LogLevel::Debug, true)]
    #[test_case(LogLevel::Debug, LogLevel::Info, false)]
    #[test_case(LogLevel::Warn, LogLevel::Info, true)]
    #[test_case(LogLevel::Warn, LogLevel::Error, false)]
    #[test_case(LogLevel::Error, LogLevel::Error, true)]
    fn min_level_gates_ingestion(level: LogLevel, min_level: LogLevel, stored: bool) {
        let store = EventStore::new(StoreConfig {
            min_level,
            ..StoreConfig::default()
        });
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.log(level, "probe", Vec::new());
        assert_eq!(store.len() == 1, stored);
        assert_eq!(notified.load(Ordering::SeqCst) == 1, stored);
    }

    #[test]
    fn disabled_store_discards_silently() {
        let store = EventStore::default();
        store.configure(ConfigPatch::default().enabled(false));
        store.error("dropped");
        assert!(store.is_empty());

        store.configure(ConfigPatch::default().enabled(true));
        store.error("kept");
        assert_eq!(messages(&store), vec!["kept"]);
    }

    #[test]
    fn partial_configure_keeps_other_fields() {
        let store = EventStore::default();
        store.configure(ConfigPatch::default().min_level(LogLevel::Warn));
        store.configure(ConfigPatch::default().max_logs(5));

        let config = store.config();
        assert_eq!(config.min_level, LogLevel::Warn);
        assert_eq!(config.max_logs, 5);
        assert!(config.enabled);
    }

    #[test]
    fn shrinking_the_cap_evicts_immediately() {
        let store = EventStore::default();
        for message in ["a", "b", "c", "d"] {
            store.info(message);
        }
        store.configure(ConfigPatch::default().max_logs(2));
        assert_eq!(messages(&store), vec!["c", "d"]);
    }

    #[test]
    fn zero_cap_retains_nothing_but_still_notifies() {
        let store = EventStore::new(StoreConfig {
            max_logs: 0,
            ..StoreConfig::default()
        });
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.info("transient");
        assert!(store.is_empty());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn enrichment_fills_every_field() {
        let clock = Arc::new(ManualClock::default());
        let store = EventStore::default().with_clock(clock.clone());
        store.set_global_context(context! { "env" => "dev" });

        store.info_with("hello", vec![Datum::from(1), Datum::from("two")]);
        let event = store.logs().pop().unwrap();

        assert_eq!(event.timestamp, clock.now());
        assert_eq!(event.source.file, "src/store.rs");
        assert!(event.source.line > 0);
        assert_eq!(event.session_id, store.session_id());
        assert_eq!(event.context, Some(context! { "env" => "dev" }));
        assert_eq!(serde_json::to_value(&event.data).unwrap(), json!([1, "two"]));
        assert!(event.span_id.is_none());
    }

    #[test]
    fn cyclic_payloads_are_normalised() {
        let store = EventStore::default();
        let object = ObjectRef::from_fields([("a", 1)]);
        object.insert("self", object.clone());

        store.info_with("cyclic", vec![Datum::Object(object.clone())]);
        let event = store.logs().pop().unwrap();
        assert_eq!(
            serde_json::to_value(&event.data[0]).unwrap(),
            json!({"a": 1, "self": CIRCULAR_SENTINEL})
        );
        object.clear();
    }

    #[test]
    fn non_string_messages_are_stringified() {
        let store = EventStore::default();
        store.log_value(LogLevel::Info, Datum::from(json!({"k": 1})), Vec::new());
        assert_eq!(messages(&store), vec![r#"{"k":1}"#]);
    }

    #[test]
    fn panicking_subscribers_are_isolated() {
        let store = EventStore::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = calls.clone();
        store.subscribe(move |_| {
            first.fetch_add(1, Ordering::SeqCst);
        });
        store.subscribe(|_| panic!("subscriber bug"));
        let last = calls.clone();
        store.subscribe(move |_| {
            last.fetch_add(1, Ordering::SeqCst);
        });

        store.info("one");
        store.info("two");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn unsubscribe_removes_exactly_one_subscriber() {
        let store = EventStore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let a = calls.clone();
        let first = store.subscribe(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let b = calls.clone();
        let _second = store.subscribe(move |_| {
            b.fetch_add(10, Ordering::SeqCst);
        });

        assert!(first.unsubscribe());
        store.info("after");
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(store.subscriber_count(), 1);
    }

    #[test]
    fn subscribers_may_log_and_resubscribe_during_fan_out() {
        let store = EventStore::default();
        let echo_store = store.clone();
        store.subscribe(move |event| {
            if !event.message.starts_with("echo") {
                echo_store.info(format!("echo {}", event.message));
                echo_store.subscribe(|_| {});
            }
        });

        store.info("ping");
        assert_eq!(messages(&store), vec!["ping", "echo ping"]);
        assert_eq!(store.subscriber_count(), 3);
    }

    #[test]
    fn subscribers_may_unsubscribe_during_fan_out() {
        let store = EventStore::default();
        let counter = |calls: &Arc<AtomicUsize>| {
            let calls = calls.clone();
            move |_: &LogEvent| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        };
        let first = Arc::new(AtomicUsize::new(0));
        let quitter = Arc::new(AtomicUsize::new(0));
        let victim = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));

        store.subscribe(counter(&first));

        let own_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let own = {
            let slot = own_slot.clone();
            let quitter = quitter.clone();
            store.subscribe(move |_| {
                quitter.fetch_add(1, Ordering::SeqCst);
                if let Some(subscription) = slot.lock().take() {
                    assert!(subscription.unsubscribe());
                }
            })
        };
        *own_slot.lock() = Some(own);

        let victim_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot = victim_slot.clone();
        store.subscribe(move |_| {
            if let Some(subscription) = slot.lock().take() {
                assert!(subscription.unsubscribe());
            }
        });
        *victim_slot.lock() = Some(store.subscribe(counter(&victim)));
        store.subscribe(counter(&last));
        assert_eq!(store.subscriber_count(), 5);

        store.info("one");
        store.info("two");

        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(last.load(Ordering::SeqCst), 2);
        assert_eq!(quitter.load(Ordering::SeqCst), 1);
        // Removal takes effect from the next event on.
        assert_eq!(victim.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(), 3);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn subscribers_may_clear_during_fan_out() {
        let store = EventStore::default();
        let clearing = store.clone();
        store.subscribe(move |event| {
            if event.message == "reset" {
                clearing.clear();
            }
        });

        store.info("a");
        store.info("reset");
        store.info("b");
        assert_eq!(messages(&store), vec!["b"]);
    }

    #[test]
    fn clear_keeps_session_and_global_context() {
        let store = EventStore::default();
        store.set_global_context(context! { "tenant" => "acme" });
        let session = store.session_id();
        store.info("x");
        store.start_span("s", None, None).end();

        store.clear();
        assert!(store.is_empty());
        assert!(store.spans().is_empty());
        assert_eq!(store.session_id(), session);
        assert_eq!(store.global_context(), context! { "tenant" => "acme" });
    }

    #[test]
    fn import_prepends_and_deduplicates() {
        let store = EventStore::default();
        store.info("live");
        let foreign: Vec<LogEvent> = ["old-1", "old-2"]
            .iter()
            .map(|message| LogEvent::new(LogLevel::Info, *message, Utc::now()))
            .collect();

        assert_eq!(store.import_logs(foreign.clone()), 2);
        assert_eq!(store.import_logs(foreign), 0);
        assert_eq!(messages(&store), vec!["old-1", "old-2", "live"]);

        let snapshot = store.logs();
        let other = EventStore::default();
        other.import_logs(snapshot.clone());
        other.import_logs(snapshot);
        assert_eq!(other.len(), 3);
    }

    #[test]
    fn import_respects_the_cap_by_dropping_oldest() {
        let store = EventStore::new(StoreConfig {
            max_logs: 2,
            ..StoreConfig::default()
        });
        store.info("live");
        let foreign = vec![
            LogEvent::new(LogLevel::Info, "old-1", Utc::now()),
            LogEvent::new(LogLevel::Info, "old-2", Utc::now()),
        ];
        store.import_logs(foreign);
        assert_eq!(messages(&store), vec!["old-2", "live"]);
    }

    #[test]
    fn append_external_notifies_and_deduplicates() {
        let store = EventStore::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let event = LogEvent::new(LogLevel::Warn, "remote", Utc::now());
        assert!(store.append_external(event.clone()));
        assert!(!store.append_external(event));
        assert_eq!(store.len(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn durable_session_survives_store_restart() {
        let storage = Arc::new(MemoryStorage::new());
        let first = EventStore::with_storage(StoreConfig::default(), storage.clone());
        let session = first.session_id();

        let second = EventStore::with_storage(StoreConfig::default(), storage);
        assert_eq!(second.session_id(), session);
    }

    #[test]
    fn unavailable_storage_falls_back_to_ephemeral_sessions() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_available(false);
        let store = EventStore::with_storage(StoreConfig::default(), storage);

        store.info("a");
        store.info("b");
        let logs = store.logs();
        assert!(logs[0].session_id.starts_with("ephemeral-"));
        assert_ne!(logs[0].session_id, logs[1].session_id);
    }

    #[test]
    fn query_never_mutates_the_store() {
        let store = EventStore::default();
        store.info("keep me");
        store.error("boom");

        let errors = store.query(&FilterState::default().with_levels([LogLevel::Error]));
        assert_eq!(errors.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn log_diff_records_changes() {
        let store = EventStore::default();
        store.log_diff(
            "profile updated",
            &Datum::from(json!({"name": "ana", "age": 30})),
            &Datum::from(json!({"name": "ana", "age": 31})),
        );

        let event = store.logs().pop().unwrap();
        let data = serde_json::to_value(&event.data[0]).unwrap();
        assert_eq!(data["summary"]["changed"], json!(1));
        assert_eq!(data["changes"][0]["path"], json!("age"));
    }
}
