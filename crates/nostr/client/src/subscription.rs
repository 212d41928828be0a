//! Subscription bookkeeping and the caller-facing subscription handle.

use crate::error::Result;
use crate::listeners::{Callback, ListenerId, Listeners};
use crate::message::ClientMessage;
use crate::relay::RelayInner;
use nostr::{Event, Filter, match_filters};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Callback type for handling received events.
pub type EventCallback = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

/// Dedup predicate: `(event_id, relay_url) -> already known`.
pub type AlreadyHaveEvent = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Options for [`RelayConnection::sub`](crate::RelayConnection::sub).
///
/// `None` means "not specified": a fresh subscription uses the default and a
/// re-subscription through [`Subscription::sub`] keeps the prior value.
#[derive(Clone, Default)]
pub struct SubscriptionOptions {
    pub id: Option<String>,
    /// Deliver events without checking their signature.
    pub skip_verification: Option<bool>,
    pub already_have_event: Option<AlreadyHaveEvent>,
    /// Drop events that match none of the subscription's filters.
    pub match_filters: Option<bool>,
}

impl SubscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn skip_verification(mut self, skip: bool) -> Self {
        self.skip_verification = Some(skip);
        self
    }

    pub fn already_have_event<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.already_have_event = Some(Arc::new(predicate));
        self
    }

    pub fn match_filters(mut self, enabled: bool) -> Self {
        self.match_filters = Some(enabled);
        self
    }
}

impl fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("id", &self.id)
            .field("skip_verification", &self.skip_verification)
            .field("already_have_event", &self.already_have_event.is_some())
            .field("match_filters", &self.match_filters)
            .finish()
    }
}

/// Effective per-subscription policy after defaults and merging.
#[derive(Clone, Default)]
pub(crate) struct SubscriptionPolicy {
    pub(crate) skip_verification: bool,
    pub(crate) match_filters: bool,
    pub(crate) already_have_event: Option<AlreadyHaveEvent>,
}

impl SubscriptionPolicy {
    fn resolve(options: &SubscriptionOptions, prior: Option<&SubscriptionPolicy>) -> Self {
        let prior = prior.cloned().unwrap_or_default();
        Self {
            skip_verification: options
                .skip_verification
                .unwrap_or(prior.skip_verification),
            match_filters: options.match_filters.unwrap_or(prior.match_filters),
            already_have_event: options
                .already_have_event
                .clone()
                .or(prior.already_have_event),
        }
    }
}

struct OpenSubscription {
    filters: Vec<Filter>,
    policy: SubscriptionPolicy,
}

#[derive(Default)]
struct SubscriptionListeners {
    event: Listeners<EventCallback>,
    eose: Listeners<Callback>,
}

#[derive(Default)]
struct RegistryState {
    open: HashMap<String, OpenSubscription>,
    // Keyed separately from `open` so re-subscribing keeps callbacks.
    listeners: HashMap<String, SubscriptionListeners>,
}

/// Active subscriptions and their callbacks, keyed by subscription id.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub(crate) fn open(&self, id: &str, filters: Vec<Filter>, policy: SubscriptionPolicy) {
        self.state
            .lock()
            .open
            .insert(id.to_string(), OpenSubscription { filters, policy });
    }

    /// Forget the subscription and its callbacks.
    pub(crate) fn remove(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        state.listeners.remove(id);
        state.open.remove(id).is_some()
    }

    pub(crate) fn is_open(&self, id: &str) -> bool {
        self.state.lock().open.contains_key(id)
    }

    pub(crate) fn policy(&self, id: &str) -> Option<SubscriptionPolicy> {
        self.state
            .lock()
            .open
            .get(id)
            .map(|subscription| subscription.policy.clone())
    }

    pub(crate) fn already_have(&self, id: &str) -> Option<AlreadyHaveEvent> {
        self.state
            .lock()
            .open
            .get(id)
            .and_then(|subscription| subscription.policy.already_have_event.clone())
    }

    #[cfg(test)]
    pub(crate) fn filters(&self, id: &str) -> Option<Vec<Filter>> {
        self.state
            .lock()
            .open
            .get(id)
            .map(|subscription| subscription.filters.clone())
    }

    pub(crate) fn matches_filters(&self, id: &str, event: &Event) -> bool {
        self.state
            .lock()
            .open
            .get(id)
            .is_some_and(|subscription| match_filters(&subscription.filters, event))
    }

    pub(crate) fn add_event_listener(&self, id: &str, callback: EventCallback) -> ListenerId {
        let listener_id = ListenerId::next();
        self.state
            .lock()
            .listeners
            .entry(id.to_string())
            .or_default()
            .event
            .push(listener_id, callback);
        listener_id
    }

    pub(crate) fn add_eose_listener(&self, id: &str, callback: Callback) -> ListenerId {
        let listener_id = ListenerId::next();
        self.state
            .lock()
            .listeners
            .entry(id.to_string())
            .or_default()
            .eose
            .push(listener_id, callback);
        listener_id
    }

    pub(crate) fn remove_listener(&self, id: &str, listener_id: ListenerId) -> bool {
        let mut state = self.state.lock();
        let Some(listeners) = state.listeners.get_mut(id) else {
            return false;
        };
        listeners.event.remove(listener_id) || listeners.eose.remove(listener_id)
    }

    /// Event callbacks to run now, or none if the subscription has been closed.
    pub(crate) fn event_callbacks(&self, id: &str) -> Vec<EventCallback> {
        let state = self.state.lock();
        if !state.open.contains_key(id) {
            return Vec::new();
        }
        state
            .listeners
            .get(id)
            .map(|listeners| listeners.event.snapshot())
            .unwrap_or_default()
    }

    /// EOSE callbacks are one-shot: they are removed as they are returned.
    /// A closed subscription yields none.
    pub(crate) fn take_eose_callbacks(&self, id: &str) -> Vec<Callback> {
        let mut state = self.state.lock();
        if !state.open.contains_key(id) {
            return Vec::new();
        }
        state
            .listeners
            .get_mut(id)
            .map(|listeners| listeners.eose.take())
            .unwrap_or_default()
    }

    pub(crate) fn clear(&self) {
        *self.state.lock() = RegistryState::default();
    }
}

fn generate_subscription_id() -> String {
    rand::random::<u64>().to_string()
}

/// Handle to one subscription on a relay connection.
///
/// Cloning the handle does not create a new subscription; all clones refer to
/// the same id.
#[derive(Clone)]
pub struct Subscription {
    id: String,
    filters: Vec<Filter>,
    policy: SubscriptionPolicy,
    relay: Arc<RelayInner>,
}

impl Subscription {
    /// Record the subscription without sending REQ.
    pub(crate) fn register(
        relay: &Arc<RelayInner>,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
        prior: Option<&SubscriptionPolicy>,
    ) -> Self {
        let policy = SubscriptionPolicy::resolve(&options, prior);
        let id = options.id.unwrap_or_else(generate_subscription_id);
        relay.subscriptions.open(&id, filters.clone(), policy.clone());
        Self {
            id,
            filters,
            policy,
            relay: Arc::clone(relay),
        }
    }

    /// Queue the REQ frame for this subscription.
    pub(crate) fn request(&self) {
        self.relay.enqueue(ClientMessage::Req {
            subscription_id: self.id.clone(),
            filters: self.filters.clone(),
        });
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Filters sent with this handle's REQ.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Whether the relay connection still tracks this subscription id.
    pub fn is_active(&self) -> bool {
        self.relay.subscriptions.is_open(&self.id)
    }

    /// Re-subscribe under the same id.
    ///
    /// `filters: None` reuses this handle's filters. Options left as `None`
    /// keep this handle's values. Registered callbacks are untouched.
    pub fn sub(&self, filters: Option<Vec<Filter>>, options: SubscriptionOptions) -> Subscription {
        let filters = filters.unwrap_or_else(|| self.filters.clone());
        let options = SubscriptionOptions {
            id: Some(self.id.clone()),
            ..options
        };
        let next = Self::register(&self.relay, filters, options, Some(&self.policy));
        next.request();
        next
    }

    /// Stop delivery immediately and send CLOSE.
    pub fn unsub(&self) {
        self.relay.unsubscribe(&self.id);
    }

    /// Weak reference for callbacks stored in the relay's own registry.
    pub(crate) fn downgrade(&self) -> WeakSubscription {
        WeakSubscription {
            id: self.id.clone(),
            relay: Arc::downgrade(&self.relay),
        }
    }

    pub fn on_event<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.relay
            .subscriptions
            .add_event_listener(&self.id, Arc::new(callback))
    }

    /// Runs on the next EOSE for this id, then is removed.
    pub fn on_eose<F>(&self, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.relay
            .subscriptions
            .add_eose_listener(&self.id, Arc::new(callback))
    }

    pub fn off(&self, listener_id: ListenerId) -> bool {
        self.relay
            .subscriptions
            .remove_listener(&self.id, listener_id)
    }
}

/// Subscription id plus a weak relay reference; does not keep the relay alive.
pub(crate) struct WeakSubscription {
    id: String,
    relay: Weak<RelayInner>,
}

impl WeakSubscription {
    pub(crate) fn unsub(&self) {
        if let Some(relay) = self.relay.upgrade() {
            relay.unsubscribe(&self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filters", &self.filters)
            .field("skip_verification", &self.policy.skip_verification)
            .finish_non_exhaustive()
    }
}
