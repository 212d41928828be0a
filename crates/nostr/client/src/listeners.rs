//! Ordered callback registries.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned by every `on_*` registration; pass it to `off` to remove
/// the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Callback without arguments (connect, disconnect, error, eose, ok).
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Callback receiving relay text (notice, auth challenge, failure reason).
pub type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks in registration order.
pub(crate) struct Listeners<T> {
    entries: Vec<(ListenerId, T)>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: Clone> Listeners<T> {
    pub(crate) fn push(&mut self, id: ListenerId, callback: T) {
        self.entries.push((id, callback));
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Copy of the callbacks so they can run without holding a lock.
    pub(crate) fn snapshot(&self) -> Vec<T> {
        self.entries
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect()
    }

    /// Remove and return every callback.
    pub(crate) fn take(&mut self) -> Vec<T> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(_, callback)| callback)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Default)]
struct ConnectionListenerSet {
    connect: Listeners<Callback>,
    disconnect: Listeners<Callback>,
    error: Listeners<Callback>,
    notice: Listeners<MessageCallback>,
    auth: Listeners<MessageCallback>,
}

/// Connection-level listeners. Never cleared by dispatch, only by `close`.
#[derive(Default)]
pub(crate) struct ConnectionListeners {
    inner: Mutex<ConnectionListenerSet>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ConnectionEvent {
    Connect,
    Disconnect,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum RelayText {
    Notice,
    Auth,
}

impl ConnectionListeners {
    pub(crate) fn add(&self, event: ConnectionEvent, callback: Callback) -> ListenerId {
        let id = ListenerId::next();
        let mut set = self.inner.lock();
        match event {
            ConnectionEvent::Connect => set.connect.push(id, callback),
            ConnectionEvent::Disconnect => set.disconnect.push(id, callback),
            ConnectionEvent::Error => set.error.push(id, callback),
        }
        id
    }

    pub(crate) fn add_text(&self, kind: RelayText, callback: MessageCallback) -> ListenerId {
        let id = ListenerId::next();
        let mut set = self.inner.lock();
        match kind {
            RelayText::Notice => set.notice.push(id, callback),
            RelayText::Auth => set.auth.push(id, callback),
        }
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut set = self.inner.lock();
        set.connect.remove(id)
            || set.disconnect.remove(id)
            || set.error.remove(id)
            || set.notice.remove(id)
            || set.auth.remove(id)
    }

    pub(crate) fn fire(&self, event: ConnectionEvent) {
        let callbacks = {
            let set = self.inner.lock();
            match event {
                ConnectionEvent::Connect => set.connect.snapshot(),
                ConnectionEvent::Disconnect => set.disconnect.snapshot(),
                ConnectionEvent::Error => set.error.snapshot(),
            }
        };
        for callback in callbacks {
            callback();
        }
    }

    pub(crate) fn fire_text(&self, kind: RelayText, text: &str) {
        let callbacks = {
            let set = self.inner.lock();
            match kind {
                RelayText::Notice => set.notice.snapshot(),
                RelayText::Auth => set.auth.snapshot(),
            }
        };
        for callback in callbacks {
            callback(text);
        }
    }

    pub(crate) fn clear(&self) {
        *self.inner.lock() = ConnectionListenerSet::default();
    }
}
