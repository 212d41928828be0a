//! One-shot request helpers built on subscriptions.

use crate::relay::RelayConnection;
use crate::subscription::{Subscription, SubscriptionOptions};
use nostr::{Event, Filter};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

/// Options for [`RelayConnection::list`] and [`RelayConnection::get`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub subscription: SubscriptionOptions,
    /// Overrides the configured list/get timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_subscription(mut self, subscription: SubscriptionOptions) -> Self {
        self.subscription = subscription;
        self
    }
}

impl From<SubscriptionOptions> for RequestOptions {
    fn from(subscription: SubscriptionOptions) -> Self {
        Self {
            subscription,
            timeout: None,
        }
    }
}

/// Closes the request's subscription when the request ends, including when
/// the caller drops the future early.
struct RequestGuard(Subscription);

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.0.is_active() {
            self.0.unsub();
        }
    }
}

impl RelayConnection {
    /// Collect stored events until EOSE or the timeout, whichever comes first.
    ///
    /// Events are returned in arrival order. Whatever arrived before the
    /// timeout is returned; the subscription is closed either way.
    pub async fn list(&self, filters: Vec<Filter>, options: RequestOptions) -> Vec<Event> {
        let limit = options
            .timeout
            .unwrap_or_else(|| self.config().list_timeout());
        let subscription =
            Subscription::register(self.inner(), filters, options.subscription, None);

        let events = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let done = Mutex::new(Some(done_tx));

        let sink = Arc::clone(&events);
        subscription.on_event(move |event| {
            sink.lock().push(event.clone());
            Ok(())
        });
        let finished = subscription.downgrade();
        subscription.on_eose(move || {
            finished.unsub();
            if let Some(done) = done.lock().take() {
                let _ = done.send(());
            }
        });
        subscription.request();
        let guard = RequestGuard(subscription);

        // On EOSE the callback has already unsubscribed; `close` may also have
        // cleared the registry, which drops the sender.
        if timeout(limit, done_rx).await.is_err() {
            debug!(
                "list {} on {} timed out after {:?}",
                guard.0.id(),
                self.url(),
                limit
            );
        }
        drop(guard);

        std::mem::take(&mut *events.lock())
    }

    /// First event matching `filter`, or `None` after the timeout.
    pub async fn get(&self, filter: Filter, options: RequestOptions) -> Option<Event> {
        let limit = options
            .timeout
            .unwrap_or_else(|| self.config().get_timeout());
        let subscription =
            Subscription::register(self.inner(), vec![filter], options.subscription, None);

        let (found_tx, found_rx) = oneshot::channel::<Event>();
        let found = Mutex::new(Some(found_tx));

        let finished = subscription.downgrade();
        subscription.on_event(move |event| {
            finished.unsub();
            if let Some(found) = found.lock().take() {
                let _ = found.send(event.clone());
            }
            Ok(())
        });
        subscription.request();
        let guard = RequestGuard(subscription);

        match timeout(limit, found_rx).await {
            Ok(Ok(event)) => Some(event),
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(
                    "get {} on {} timed out after {:?}",
                    guard.0.id(),
                    self.url(),
                    limit
                );
                None
            }
        }
    }
}
