//! Inbound frame dispatch.
//!
//! One dispatcher runs per connection and handles frames strictly in arrival
//! order. A frame that fails to parse is logged and skipped.

use crate::listeners::RelayText;
use crate::message::{RelayMessage, event_id_hint, parse_relay_message, subscription_id_hint};
use crate::relay::RelayInner;
use nostr::{Event, validate_event};
use std::sync::Weak;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub(crate) async fn run(relay: Weak<RelayInner>, mut inbound: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = inbound.recv().await {
        let Some(relay) = relay.upgrade() else {
            break;
        };
        handle_frame(&relay, &text).await;
    }
}

async fn handle_frame(relay: &RelayInner, text: &str) {
    // Cheap duplicate check before paying for a full parse.
    let mut consulted = None;
    if let Some(subscription_id) = subscription_id_hint(text)
        && let Some(already_have) = relay.subscriptions.already_have(subscription_id)
        && let Some(event_id) = event_id_hint(text)
    {
        if already_have(event_id, relay.url()) {
            trace!("skipping known event {} on {}", event_id, relay.url());
            return;
        }
        consulted = Some(event_id.to_string());
    }

    let message = match parse_relay_message(text) {
        Ok(Some(message)) => message,
        Ok(None) => {
            trace!("ignoring unrecognised frame from {}", relay.url());
            return;
        }
        Err(error) => {
            debug!("dropping malformed frame from {}: {}", relay.url(), error);
            return;
        }
    };

    match message {
        RelayMessage::Event(subscription_id, event) => {
            handle_event(relay, &subscription_id, &event, consulted.as_deref()).await;
        }
        RelayMessage::Eose(subscription_id) => {
            for callback in relay.subscriptions.take_eose_callbacks(&subscription_id) {
                callback();
            }
        }
        RelayMessage::Ok(event_id, accepted, reason) => {
            if !relay.publishes.resolve(&event_id, accepted, &reason) {
                trace!("OK for untracked event {} on {}", event_id, relay.url());
            }
        }
        RelayMessage::Notice(notice) => {
            debug!("NOTICE from {}: {}", relay.url(), notice);
            relay.listeners.fire_text(RelayText::Notice, &notice);
        }
        RelayMessage::Auth(challenge) => {
            relay.listeners.fire_text(RelayText::Auth, &challenge);
        }
    }
}

async fn handle_event(
    relay: &RelayInner,
    subscription_id: &str,
    event: &Event,
    consulted: Option<&str>,
) {
    let Some(policy) = relay.subscriptions.policy(subscription_id) else {
        trace!("event for closed subscription {} on {}", subscription_id, relay.url());
        return;
    };

    // The scanned id is only a hint; ask again when it was not the real one.
    if consulted != Some(event.id.as_str())
        && let Some(already_have) = &policy.already_have_event
        && already_have(&event.id, relay.url())
    {
        return;
    }

    if !validate_event(event) {
        debug!("dropping malformed event {} on {}", event.id, relay.url());
        return;
    }

    if !policy.skip_verification && !relay.verifier.verify(event).await {
        debug!("dropping event {} with bad signature on {}", event.id, relay.url());
        return;
    }

    if policy.match_filters && !relay.subscriptions.matches_filters(subscription_id, event) {
        trace!("event {} outside filters of {}", event.id, subscription_id);
        return;
    }

    // Subscription may have been closed while the signature was checked.
    for callback in relay.subscriptions.event_callbacks(subscription_id) {
        if let Err(error) = callback(event) {
            warn!(
                "event callback for {} on {} failed: {}",
                subscription_id,
                relay.url(),
                error
            );
        }
    }
}
