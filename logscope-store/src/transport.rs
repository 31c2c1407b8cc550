//! Mirroring a store into other windows over a shared channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use logscope_protocol::event::LogEvent;
use logscope_protocol::transport::{TransportEnvelope, TransportMessage, CHANNEL_NAME};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::store::{EventStore, Subscription};

/// Outbound half of an inter-window channel.
pub trait Transport: Send + Sync {
    fn publish(&self, envelope: &TransportEnvelope) -> Result<(), TransportError>;
}

/// In-process channel carrying JSON-encoded envelopes, the same shape a
/// cross-window broadcast channel would carry.
#[derive(Debug, Clone)]
pub struct LocalBroadcast {
    name: String,
    sender: broadcast::Sender<String>,
}

impl LocalBroadcast {
    pub fn new(capacity: usize) -> Self {
        Self::named(CHANNEL_NAME, capacity)
    }

    pub fn named(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            sender,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

impl Default for LocalBroadcast {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Transport for LocalBroadcast {
    fn publish(&self, envelope: &TransportEnvelope) -> Result<(), TransportError> {
        let raw = envelope.to_json()?;
        if self.sender.send(raw).is_err() {
            // Nobody is listening; that is not a failure.
            debug!(channel = %self.name, "no receivers for envelope");
        }
        Ok(())
    }
}

/// Publishes a store's activity on a [`Transport`] and applies what other
/// windows publish.
///
/// New logs and clears are published as they happen; sync requests are
/// answered with the current snapshot. Envelopes sent by this bridge are
/// ignored when they come back, and changes applied from remote envelopes
/// are not published again.
#[derive(Clone)]
pub struct TransportBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    store: EventStore,
    transport: Arc<dyn Transport>,
    sender_id: String,
    applying_remote: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for TransportBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportBridge")
            .field("sender_id", &self.inner.sender_id)
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl TransportBridge {
    pub fn new(store: EventStore, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                store,
                transport,
                sender_id: Uuid::new_v4().to_string(),
                applying_remote: AtomicBool::new(false),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.inner.sender_id
    }

    pub fn is_attached(&self) -> bool {
        !self.inner.subscriptions.lock().is_empty()
    }

    /// Starts publishing new logs and clears. Idempotent.
    pub fn attach(&self) {
        if self.is_attached() {
            return;
        }
        let store = &self.inner.store;

        let on_log = {
            let weak = Arc::downgrade(&self.inner);
            store.subscribe(move |event: &LogEvent| {
                BridgeInner::publish_local(&weak, || TransportMessage::NewLog {
                    payload: event.clone(),
                })
            })
        };
        let on_clear = {
            let weak = Arc::downgrade(&self.inner);
            store.subscribe_clear(move || {
                BridgeInner::publish_local(&weak, || TransportMessage::ClearLogs)
            })
        };
        self.inner.subscriptions.lock().extend([on_log, on_clear]);
    }

    pub fn detach(&self) {
        let subscriptions: Vec<Subscription> = self.inner.subscriptions.lock().drain(..).collect();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
    }

    /// Asks other windows for their snapshot.
    pub fn request_sync(&self) -> bool {
        self.inner.publish(TransportMessage::SyncRequest)
    }

    /// Applies one inbound envelope. Returns `false` for our own echoes.
    pub fn handle(&self, envelope: TransportEnvelope) -> bool {
        if envelope.is_from(&self.inner.sender_id) {
            return false;
        }
        let store = &self.inner.store;
        match envelope.message {
            TransportMessage::NewLog { payload } => {
                self.inner.apply_remote(|| {
                    store.append_external(payload);
                });
            }
            TransportMessage::ClearLogs => {
                self.inner.apply_remote(|| store.clear());
            }
            TransportMessage::SyncRequest => {
                self.inner.publish(TransportMessage::SyncResponse {
                    payload: store.logs(),
                });
            }
            TransportMessage::SyncResponse { payload } => {
                let imported = store.import_logs(payload);
                debug!(imported, from = %envelope.sender_id, "applied sync response");
            }
        }
        true
    }

    /// [`TransportBridge::handle`] for a JSON-encoded envelope. Malformed
    /// input is dropped.
    pub fn handle_raw(&self, raw: &str) -> bool {
        match TransportEnvelope::from_json(raw) {
            Ok(envelope) => self.handle(envelope),
            Err(err) => {
                debug!(error = %err, "malformed transport envelope dropped");
                false
            }
        }
    }

    /// Spawns a task applying everything `receiver` yields. On lag the task
    /// asks for a full sync. It ends when the channel closes or every
    /// handle to the bridge is dropped. `None` outside a tokio runtime.
    pub fn spawn_listener(
        &self,
        mut receiver: broadcast::Receiver<String>,
    ) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let weak: Weak<BridgeInner> = Arc::downgrade(&self.inner);

        Some(runtime.spawn(async move {
            loop {
                let received = receiver.recv().await;
                let Some(inner) = weak.upgrade() else { break };
                let bridge = TransportBridge { inner };
                match received {
                    Ok(raw) => {
                        bridge.handle_raw(&raw);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "transport listener lagged; requesting sync");
                        bridge.request_sync();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("transport listener stopped");
        }))
    }
}

impl BridgeInner {
    fn publish(&self, message: TransportMessage) -> bool {
        let kind = message.event();
        let envelope = TransportEnvelope::new(self.sender_id.clone(), message);
        match self.transport.publish(&envelope) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, kind, "transport publish failed");
                false
            }
        }
    }

    fn publish_local(weak: &Weak<BridgeInner>, message: impl FnOnce() -> TransportMessage) {
        let Some(inner) = weak.upgrade() else { return };
        if inner.applying_remote.load(Ordering::SeqCst) {
            return;
        }
        inner.publish(message());
    }

    fn apply_remote(&self, apply: impl FnOnce()) {
        self.applying_remote.store(true, Ordering::SeqCst);
        apply();
        self.applying_remote.store(false, Ordering::SeqCst);
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        for subscription in self.subscriptions.get_mut().drain(..) {
            subscription.unsubscribe();
        }
    }
}
