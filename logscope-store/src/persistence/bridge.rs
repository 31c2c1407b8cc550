use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use logscope_core::serde_utils::{parse_array_lenient, to_json_string};
use logscope_protocol::event::LogEvent;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::debounce::Debouncer;
use super::storage::DurableStorage;
use super::PersistenceConfig;
use crate::error::StorageError;
use crate::store::{EventStore, Subscription};

/// Mirrors a store into durable storage and detects unclean shutdowns.
///
/// Every operation is zero-throw: storage failures turn persistence off
/// (or skip one write) and never affect in-memory logging.
#[derive(Clone)]
pub struct CrashPersistence {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    store: EventStore,
    storage: Arc<dyn DurableStorage>,
    config: PersistenceConfig,
    debouncer: Mutex<Debouncer>,
    active: AtomicBool,
    had_crash: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
    wake: Arc<Notify>,
}

impl Drop for BridgeInner {
    // The liveness marker stays: dropping without `shutdown` counts as a crash.
    fn drop(&mut self) {
        for subscription in self.subscriptions.get_mut().drain(..) {
            subscription.unsubscribe();
        }
        // Lets a parked driver observe that the bridge is gone.
        self.wake.notify_one();
    }
}

impl std::fmt::Debug for CrashPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashPersistence")
            .field("active", &self.is_active())
            .field("had_crash", &self.had_crash())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl CrashPersistence {
    pub fn new(
        store: EventStore,
        storage: Arc<dyn DurableStorage>,
        config: PersistenceConfig,
    ) -> Self {
        let debouncer = Debouncer::new(config.debounce);
        Self {
            inner: Arc::new(BridgeInner {
                store,
                storage,
                config,
                debouncer: Mutex::new(debouncer),
                active: AtomicBool::new(false),
                had_crash: AtomicBool::new(false),
                subscriptions: Mutex::new(Vec::new()),
                wake: Arc::new(Notify::new()),
            }),
        }
    }

    /// Starts mirroring. A liveness marker left behind by the previous
    /// session is read before the new one is written. Returns whether
    /// persistence is active afterwards.
    pub fn enable(&self) -> bool {
        if self.is_active() {
            return true;
        }
        let inner = &self.inner;

        match inner.storage.get(&inner.config.marker_key) {
            Ok(Some(_)) => {
                inner.had_crash.store(true, Ordering::SeqCst);
                warn!("previous session did not shut down cleanly");
            }
            Ok(None) => {}
            Err(err) => {
                debug!(error = %err, "crash persistence inactive");
                return false;
            }
        }

        let marker = inner.store.now().timestamp_millis().to_string();
        if let Err(err) = inner.storage.set(&inner.config.marker_key, &marker) {
            debug!(error = %err, "liveness marker not written; crash persistence inactive");
            return false;
        }

        let on_log = {
            let weak = Arc::downgrade(&self.inner);
            inner.store.subscribe(move |_| BridgeInner::schedule_weak(&weak))
        };
        let on_clear = {
            let weak = Arc::downgrade(&self.inner);
            inner.store.subscribe_clear(move || BridgeInner::schedule_weak(&weak))
        };
        inner.subscriptions.lock().extend([on_log, on_clear]);
        inner.active.store(true, Ordering::SeqCst);

        info!(had_crash = self.had_crash(), "crash persistence enabled");
        true
    }

    /// Stops mirroring and removes the liveness marker without writing a
    /// final snapshot.
    pub fn disable(&self) {
        let inner = &self.inner;
        inner.active.store(false, Ordering::SeqCst);
        inner.debouncer.lock().cancel();

        let subscriptions: Vec<Subscription> = inner.subscriptions.lock().drain(..).collect();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        if let Err(err) = inner.storage.remove(&inner.config.marker_key) {
            debug!(error = %err, "liveness marker not removed");
        }
        inner.wake.notify_one();
    }

    /// Whether the previous session ended without a clean shutdown.
    pub fn had_crash(&self) -> bool {
        self.inner.had_crash.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Next scheduled write, if any.
    pub fn next_write(&self) -> Option<DateTime<Utc>> {
        self.inner.debouncer.lock().deadline()
    }

    /// Performs the scheduled write if it is due at `now`. Returns whether
    /// a snapshot was written.
    pub fn poll(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active() {
            return false;
        }
        {
            let mut debouncer = self.inner.debouncer.lock();
            if !debouncer.due(now) || !debouncer.begin_flush() {
                return false;
            }
        }
        self.inner.write_and_settle()
    }

    /// Cancels any scheduled write and writes the current snapshot now.
    pub fn flush(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        {
            let mut debouncer = self.inner.debouncer.lock();
            debouncer.cancel();
            if !debouncer.begin_flush() {
                return false;
            }
        }
        self.inner.write_and_settle()
    }

    /// Clean teardown: a final flush, then the marker is cleared so the
    /// next session does not report a crash.
    pub fn shutdown(&self) {
        if !self.is_active() {
            return;
        }
        self.flush();
        self.disable();
        info!("crash persistence shut down cleanly");
    }

    /// Imports the durable snapshot into the store. Returns how many valid
    /// entries were found, which may exceed the number actually added when
    /// some were already present.
    pub fn rehydrate(&self) -> usize {
        let persisted = self.persisted_logs();
        let found = persisted.len();
        let imported = self.inner.store.import_logs(persisted);
        debug!(found, imported, "rehydrated persisted logs");
        found
    }

    /// Valid entries of the durable snapshot, without touching the store.
    pub fn persisted_logs(&self) -> Vec<LogEvent> {
        match self.inner.read_persisted() {
            Ok(entries) => entries,
            Err(err) => {
                debug!(error = %err, "persisted logs unusable");
                Vec::new()
            }
        }
    }

    pub fn clear_persisted(&self) -> bool {
        match self.inner.storage.remove(&self.inner.config.logs_key) {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "persisted logs not cleared");
                false
            }
        }
    }

    /// Guard that runs [`CrashPersistence::shutdown`] when dropped.
    pub fn teardown_guard(&self) -> TeardownGuard {
        TeardownGuard {
            bridge: self.clone(),
        }
    }

    /// Spawns a task that fires debounced writes when they come due. The
    /// task ends once every handle to the bridge is dropped. `None` outside
    /// a tokio runtime.
    pub fn spawn_driver(&self) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let weak = Arc::downgrade(&self.inner);
        let wake = self.inner.wake.clone();

        Some(runtime.spawn(async move {
            loop {
                let next = match weak.upgrade() {
                    Some(inner) => {
                        let deadline = inner.debouncer.lock().deadline();
                        deadline.map(|deadline| deadline - inner.store.now())
                    }
                    None => break,
                };

                match next {
                    Some(remaining) => {
                        let wait = remaining.to_std().unwrap_or(Duration::ZERO);
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {
                                let Some(inner) = weak.upgrade() else { break };
                                let bridge = CrashPersistence { inner };
                                bridge.poll(bridge.inner.store.now());
                            }
                            _ = wake.notified() => {}
                        }
                    }
                    None => wake.notified().await,
                }
            }
            debug!("persistence driver stopped");
        }))
    }
}

impl BridgeInner {
    fn schedule_weak(weak: &Weak<BridgeInner>) {
        if let Some(inner) = weak.upgrade() {
            inner.schedule();
        }
    }

    fn schedule(&self) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        self.debouncer.lock().schedule(self.store.now());
        self.wake.notify_one();
    }

    fn write_and_settle(&self) -> bool {
        let written = match catch_unwind(AssertUnwindSafe(|| self.write_snapshot())) {
            Ok(written) => written,
            Err(_) => {
                warn!("persistence write panicked");
                false
            }
        };
        self.debouncer.lock().finish_flush(self.store.now());
        written
    }

    /// Writes the newest `max_persisted` events. On a quota failure the
    /// newer half is retried once; a second failure skips this cycle.
    fn write_snapshot(&self) -> bool {
        let logs = self.store.logs();
        let keep = logs.len().min(self.config.max_persisted);
        let entries = &logs[logs.len() - keep..];

        match self.write_entries(entries) {
            Ok(()) => true,
            Err(err) if err.is_quota() && entries.len() > 1 => {
                let reduced = &entries[entries.len() / 2..];
                match self.write_entries(reduced) {
                    Ok(()) => {
                        debug!(kept = reduced.len(), dropped = entries.len() - reduced.len(), "persisted reduced snapshot");
                        true
                    }
                    Err(err) => {
                        warn!(error = %err, "snapshot skipped after reduced retry");
                        false
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "snapshot skipped");
                false
            }
        }
    }

    fn write_entries(&self, entries: &[LogEvent]) -> Result<(), StorageError> {
        let payload = to_json_string(entries, false)
            .map_err(|err| StorageError::Corrupted(err.to_string()))?;
        self.storage.set(&self.config.logs_key, &payload)
    }

    fn read_persisted(&self) -> Result<Vec<LogEvent>, StorageError> {
        let Some(raw) = self.storage.get(&self.config.logs_key)? else {
            return Ok(Vec::new());
        };
        parse_array_lenient(&raw, LogEvent::from_untrusted)
            .map_err(|err| StorageError::Corrupted(err.to_string()))
    }
}

/// Flushes and clears the liveness marker on drop.
#[must_use = "dropping the guard immediately shuts persistence down"]
#[derive(Debug)]
pub struct TeardownGuard {
    bridge: CrashPersistence,
}

impl TeardownGuard {
    pub fn bridge(&self) -> &CrashPersistence {
        &self.bridge
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.bridge.shutdown();
    }
}
