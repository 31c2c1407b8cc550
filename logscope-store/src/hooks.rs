//! Producers that feed failures the application did not log itself.

use std::backtrace::Backtrace;
use std::cell::Cell;
use std::panic::{self, Location};

use logscope_protocol::event::{LogLevel, Source};
use serde_json::json;

use crate::callsite::resolve_location;
use crate::normalize::{panic_message, Datum};
use crate::store::EventStore;

thread_local! {
    static IN_PANIC_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is recording a panic from the hook.
pub(crate) fn in_panic_hook() -> bool {
    IN_PANIC_HOOK.with(Cell::get)
}

/// Runs `record` with the panic-hook flag set on this thread.
pub(crate) fn while_in_panic_hook<R>(record: impl FnOnce() -> R) -> R {
    struct Reset(bool);
    impl Drop for Reset {
        fn drop(&mut self) {
            IN_PANIC_HOOK.with(|flag| flag.set(self.0));
        }
    }

    let _reset = Reset(IN_PANIC_HOOK.with(|flag| flag.replace(true)));
    record()
}

/// Options for [`install_panic_hook`].
///
/// Log subscribers run inside the hook, where a second panic aborts the
/// process instead of unwinding. Subscribers that panicked earlier are
/// skipped there; one that panics for the first time inside the hook still
/// aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanicHookOptions {
    /// Skip the previously installed hook (normally the one printing to
    /// stderr).
    pub suppress_default: bool,
    pub capture_backtrace: bool,
}

impl Default for PanicHookOptions {
    fn default() -> Self {
        Self {
            suppress_default: false,
            capture_backtrace: true,
        }
    }
}

/// Records every panic as an `error` event, then runs the previously
/// installed hook unless suppressed.
///
/// The hook runs while the thread is already panicking; see
/// [`PanicHookOptions`] for what that means for log subscribers.
pub fn install_panic_hook(store: EventStore, options: PanicHookOptions) {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let message = panic_message(info.payload());
        let stack = options
            .capture_backtrace
            .then(|| Backtrace::force_capture().to_string());
        let (source, record) = panic_record(&message, info.location(), stack);
        while_in_panic_hook(|| {
            store.log_with_source(LogLevel::Error, message, vec![Datum::Json(record)], source)
        });

        if !options.suppress_default {
            previous(info);
        }
    }));
}

/// Call site and data payload recorded for one panic.
pub(crate) fn panic_record(
    message: &str,
    location: Option<&Location<'_>>,
    stack: Option<String>,
) -> (Source, serde_json::Value) {
    let source = location.map(resolve_location).unwrap_or_default();
    let record = json!({
        "name": "Panic",
        "message": message,
        "file": location.map(|location| location.file()),
        "line": location.map(|location| location.line()),
        "column": location.map(|location| location.column()),
        "stack": stack,
    });
    (source, record)
}

/// Logs an error that escaped a background task, the way an unhandled
/// rejection would be reported.
#[track_caller]
pub fn capture_error<E>(store: &EventStore, err: &E)
where
    E: std::error::Error + ?Sized,
{
    store.log(LogLevel::Error, err.to_string(), vec![Datum::error(err)]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use logscope_protocol::event::LogValue;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn panic_records_carry_location_fields() {
        let location = Location::caller();
        let (source, record) = panic_record("index out of bounds", Some(location), None);

        assert_eq!(source.file, "src/hooks.rs");
        assert_eq!(record["name"], "Panic");
        assert_eq!(record["message"], "index out of bounds");
        assert_eq!(record["line"], location.line());
        assert!(record["stack"].is_null());
    }

    #[test]
    fn panic_records_without_location_fall_back() {
        let (source, record) = panic_record("boom", None, Some("0: main".into()));
        assert!(source.is_unknown());
        assert!(record["file"].is_null());
        assert_eq!(record["stack"], "0: main");
    }

    #[test]
    fn hook_logging_skips_subscribers_that_panicked_before() {
        let store = EventStore::default();
        let healthy = Arc::new(AtomicUsize::new(0));
        let flaky = Arc::new(AtomicUsize::new(0));
        {
            let flaky = flaky.clone();
            store.subscribe(move |_| {
                flaky.fetch_add(1, Ordering::SeqCst);
                panic!("subscriber bug");
            });
        }
        {
            let healthy = healthy.clone();
            store.subscribe(move |_| {
                healthy.fetch_add(1, Ordering::SeqCst);
            });
        }

        store.info("ordinary");
        assert_eq!(flaky.load(Ordering::SeqCst), 1);

        while_in_panic_hook(|| {
            assert!(in_panic_hook());
            store.error("from the hook");
        });
        assert!(!in_panic_hook());
        assert_eq!(flaky.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 2);

        store.info("ordinary again");
        assert_eq!(flaky.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn captured_errors_keep_their_chain() {
        let store = EventStore::default();
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "peer went away");
        capture_error(&store, &err);

        let event = store.logs().pop().unwrap();
        assert_eq!(event.level, LogLevel::Error);
        assert_eq!(event.message, "peer went away");
        assert_eq!(event.source.file, "src/hooks.rs");
        assert!(matches!(&event.data[0], LogValue::Error { message, .. } if message == "peer went away"));
    }
}
