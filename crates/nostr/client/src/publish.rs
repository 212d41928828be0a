//! Publish acknowledgement tracking.

use crate::error::{ClientError, Result};
use crate::listeners::{Callback, ListenerId, Listeners, MessageCallback};
use crate::relay::RelayInner;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

#[derive(Default)]
struct PublishEntry {
    ok: Listeners<Callback>,
    failed: Listeners<MessageCallback>,
    resolved: bool,
}

/// Pending OK callbacks keyed by event id.
///
/// The first OK frame for an id resolves it: the callbacks run once and are
/// dropped, and callbacks added afterwards never run.
#[derive(Default)]
pub(crate) struct PublishTracker {
    entries: Mutex<HashMap<String, PublishEntry>>,
}

impl PublishTracker {
    /// Start a fresh acknowledgement cycle for `event_id`.
    pub(crate) fn begin(&self, event_id: &str) {
        self.entries
            .lock()
            .insert(event_id.to_string(), PublishEntry::default());
    }

    pub(crate) fn add_ok(&self, event_id: &str, callback: Callback) -> ListenerId {
        let listener_id = ListenerId::next();
        let mut entries = self.entries.lock();
        let entry = entries.entry(event_id.to_string()).or_default();
        if !entry.resolved {
            entry.ok.push(listener_id, callback);
        }
        listener_id
    }

    pub(crate) fn add_failed(&self, event_id: &str, callback: MessageCallback) -> ListenerId {
        let listener_id = ListenerId::next();
        let mut entries = self.entries.lock();
        let entry = entries.entry(event_id.to_string()).or_default();
        if !entry.resolved {
            entry.failed.push(listener_id, callback);
        }
        listener_id
    }

    pub(crate) fn remove(&self, event_id: &str, listener_id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(event_id) else {
            return false;
        };
        entry.ok.remove(listener_id) || entry.failed.remove(listener_id)
    }

    /// Apply an OK frame. Returns false when nothing was waiting on it.
    pub(crate) fn resolve(&self, event_id: &str, accepted: bool, reason: &str) -> bool {
        let (ok, failed) = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(event_id) else {
                return false;
            };
            if entry.resolved {
                return false;
            }
            entry.resolved = true;
            (entry.ok.take(), entry.failed.take())
        };

        if accepted {
            for callback in ok {
                callback();
            }
        } else {
            for callback in failed {
                callback(reason);
            }
        }
        true
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Outcome of a publish as reported by the relay's OK frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    pub relay_url: String,
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

/// Handle returned by [`RelayConnection::publish`](crate::RelayConnection::publish)
/// and [`RelayConnection::auth`](crate::RelayConnection::auth).
#[derive(Clone)]
pub struct Pub {
    event_id: String,
    relay: Arc<RelayInner>,
}

impl Pub {
    pub(crate) fn new(event_id: String, relay: Arc<RelayInner>) -> Self {
        Self { event_id, relay }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Runs once if the relay accepts the event.
    pub fn on_ok<F>(&self, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.relay
            .publishes
            .add_ok(&self.event_id, Arc::new(callback))
    }

    /// Runs once with the relay's reason if the event is rejected.
    pub fn on_failed<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.relay
            .publishes
            .add_failed(&self.event_id, Arc::new(callback))
    }

    pub fn off(&self, listener_id: ListenerId) -> bool {
        self.relay.publishes.remove(&self.event_id, listener_id)
    }

    /// Wait for the relay's OK frame.
    ///
    /// A rejection is returned as `Ok` with `accepted: false`; only a missing
    /// answer is an error.
    pub async fn wait(&self, limit: Duration) -> Result<PublishConfirmation> {
        let (sender, receiver) = oneshot::channel::<(bool, String)>();
        let slot = Arc::new(Mutex::new(Some(sender)));

        let ok_slot = Arc::clone(&slot);
        let ok_id = self.on_ok(move || {
            if let Some(sender) = ok_slot.lock().take() {
                let _ = sender.send((true, String::new()));
            }
        });
        let failed_id = self.on_failed(move |reason| {
            if let Some(sender) = slot.lock().take() {
                let _ = sender.send((false, reason.to_string()));
            }
        });

        let outcome = timeout(limit, receiver).await;
        self.off(ok_id);
        self.off(failed_id);

        match outcome {
            Ok(Ok((accepted, message))) => Ok(PublishConfirmation {
                relay_url: self.relay.url().to_string(),
                event_id: self.event_id.clone(),
                accepted,
                message,
            }),
            Ok(Err(_)) => Err(ClientError::Connection(format!(
                "publish tracking for {} was cleared before the relay answered",
                self.event_id
            ))),
            Err(_) => Err(ClientError::Timeout(format!(
                "no OK for {} from {} within {:?}",
                self.event_id,
                self.relay.url(),
                limit
            ))),
        }
    }
}

impl fmt::Debug for Pub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pub")
            .field("event_id", &self.event_id)
            .field("relay", &self.relay.url())
            .finish()
    }
}
