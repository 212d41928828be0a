mod support;

use anyhow::Result;
use nostr::{Event, Filter};
use nostr_client::{ConnectionState, RelayConnection, SubscriptionOptions};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use support::{MockRelay, eventually, fast_config, signed_event};

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&count);
    (count, move || {
        sink.fetch_add(1, Ordering::SeqCst);
    })
}

fn recorded_ids(
    log: &Arc<Mutex<Vec<String>>>,
) -> impl Fn(&Event) -> nostr_client::Result<()> + Send + Sync + 'static {
    let log = Arc::clone(log);
    move |event: &Event| {
        log.lock().push(event.id.clone());
        Ok(())
    }
}

/// Send a NOTICE and wait for it, so every earlier frame has been dispatched.
async fn flush(server: &MockRelay, relay: &RelayConnection) -> bool {
    let (seen, on_notice) = counter();
    let id = relay.on_notice(move |_| on_notice());
    server.send(&json!(["NOTICE", "flush"]));
    let flushed = eventually(|| seen.load(Ordering::SeqCst) > 0).await;
    relay.off(id);
    flushed
}

async fn connected() -> Result<(MockRelay, RelayConnection)> {
    let server = MockRelay::start().await?;
    let relay = RelayConnection::with_config(server.url(), fast_config())?;
    relay.connect().await?;
    Ok((server, relay))
}

#[tokio::test]
async fn event_then_eose_runs_each_callback_once() -> Result<()> {
    let (mut server, relay) = connected().await?;
    let event = signed_event(1, 1_700_000_000, "hello")?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (eose_count, on_eose) = counter();

    let subscription = relay.sub(
        vec![Filter::new().kind(1)],
        SubscriptionOptions::new().with_id("feed"),
    );
    subscription.on_event(recorded_ids(&seen));
    subscription.on_eose(on_eose);

    assert_eq!(server.next_frame().await?, json!(["REQ", "feed", {"kinds": [1]}]));
    server.send(&json!(["EVENT", "feed", event]));
    server.send(&json!(["EOSE", "feed"]));
    server.send(&json!(["EOSE", "feed"]));
    assert!(flush(&server, &relay).await);

    assert_eq!(*seen.lock(), vec![event.id.clone()]);
    assert_eq!(eose_count.load(Ordering::SeqCst), 1);
    assert!(subscription.is_active());
    Ok(())
}

#[tokio::test]
async fn resubscribing_keeps_callbacks_and_sends_new_filters() -> Result<()> {
    let (mut server, relay) = connected().await?;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let first = relay.sub(
        vec![Filter::new().kind(1)],
        SubscriptionOptions::new().with_id("feed"),
    );
    first.on_event(recorded_ids(&seen));
    server.next_tagged("REQ").await?;

    let second = first.sub(Some(vec![Filter::new().kind(7)]), SubscriptionOptions::new());
    assert_eq!(second.id(), "feed");
    assert_eq!(server.next_frame().await?, json!(["REQ", "feed", {"kinds": [7]}]));

    let reaction = signed_event(7, 1_700_000_001, "+")?;
    server.send(&json!(["EVENT", "feed", reaction]));
    assert!(flush(&server, &relay).await);
    assert_eq!(*seen.lock(), vec![reaction.id.clone()]);
    Ok(())
}

#[tokio::test]
async fn unsub_sends_close_and_stops_delivery() -> Result<()> {
    let (mut server, relay) = connected().await?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = relay.sub(vec![], SubscriptionOptions::new().with_id("gone"));
    subscription.on_event(recorded_ids(&seen));
    server.next_tagged("REQ").await?;

    subscription.unsub();
    assert_eq!(server.next_frame().await?, json!(["CLOSE", "gone"]));

    server.send(&json!(["EVENT", "gone", signed_event(1, 5, "late")?]));
    assert!(flush(&server, &relay).await);
    assert!(seen.lock().is_empty());
    assert!(!subscription.is_active());
    Ok(())
}

#[tokio::test]
async fn bad_signatures_are_dropped_unless_verification_is_skipped() -> Result<()> {
    let (mut server, relay) = connected().await?;
    let mut forged = signed_event(1, 1_700_000_000, "original")?;
    forged.sig = signed_event(1, 1_700_000_001, "other")?.sig;

    let checked = Arc::new(Mutex::new(Vec::new()));
    let trusting = Arc::new(Mutex::new(Vec::new()));
    relay
        .sub(vec![], SubscriptionOptions::new().with_id("checked"))
        .on_event(recorded_ids(&checked));
    relay
        .sub(
            vec![],
            SubscriptionOptions::new()
                .with_id("trusting")
                .skip_verification(true),
        )
        .on_event(recorded_ids(&trusting));
    server.next_tagged("REQ").await?;
    server.next_tagged("REQ").await?;

    server.send(&json!(["EVENT", "checked", forged]));
    server.send(&json!(["EVENT", "trusting", forged]));
    assert!(flush(&server, &relay).await);

    assert!(checked.lock().is_empty());
    assert_eq!(*trusting.lock(), vec![forged.id.clone()]);
    Ok(())
}

#[tokio::test]
async fn events_with_wrong_id_are_dropped_even_without_verification() -> Result<()> {
    let (mut server, relay) = connected().await?;
    let mut tampered = signed_event(1, 1_700_000_000, "original")?;
    tampered.content = "edited".to_string();

    let seen = Arc::new(Mutex::new(Vec::new()));
    relay
        .sub(
            vec![],
            SubscriptionOptions::new()
                .with_id("s")
                .skip_verification(true),
        )
        .on_event(recorded_ids(&seen));
    server.next_tagged("REQ").await?;

    server.send(&json!(["EVENT", "s", tampered]));
    assert!(flush(&server, &relay).await);
    assert!(seen.lock().is_empty());
    Ok(())
}

#[tokio::test]
async fn already_have_predicate_skips_known_events() -> Result<()> {
    let (mut server, relay) = connected().await?;
    let known = signed_event(1, 1_700_000_000, "known")?;
    let fresh = signed_event(1, 1_700_000_001, "fresh")?;

    let asked = Arc::new(Mutex::new(Vec::new()));
    let asked_sink = Arc::clone(&asked);
    let known_id = known.id.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    relay
        .sub(
            vec![],
            SubscriptionOptions::new()
                .with_id("dedup")
                .already_have_event(move |id, url| {
                    asked_sink.lock().push(url.to_string());
                    id == known_id
                }),
        )
        .on_event(recorded_ids(&seen));
    server.next_tagged("REQ").await?;

    server.send(&json!(["EVENT", "dedup", known]));
    server.send(&json!(["EVENT", "dedup", fresh]));
    assert!(flush(&server, &relay).await);

    assert_eq!(*seen.lock(), vec![fresh.id.clone()]);
    assert!(asked.lock().iter().all(|url| url == relay.url()));
    assert!(!asked.lock().is_empty());
    Ok(())
}

#[tokio::test]
async fn match_filters_drops_events_outside_the_filters() -> Result<()> {
    let (mut server, relay) = connected().await?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    relay
        .sub(
            vec![Filter::new().kind(1)],
            SubscriptionOptions::new().with_id("strict").match_filters(true),
        )
        .on_event(recorded_ids(&seen));
    server.next_tagged("REQ").await?;

    let note = signed_event(1, 10, "note")?;
    let metadata = signed_event(0, 11, "{}")?;
    server.send(&json!(["EVENT", "strict", metadata]));
    server.send(&json!(["EVENT", "strict", note]));
    assert!(flush(&server, &relay).await);

    assert_eq!(*seen.lock(), vec![note.id.clone()]);
    Ok(())
}

#[tokio::test]
async fn malformed_frames_do_not_stop_dispatch() -> Result<()> {
    let (mut server, relay) = connected().await?;
    let (eose_count, on_eose) = counter();
    relay
        .sub(vec![], SubscriptionOptions::new().with_id("s"))
        .on_eose(on_eose);
    server.next_tagged("REQ").await?;

    server.send_raw(r#"["EVENT","s","#);
    server.send_raw(r#"["EVENT","s",{"id":"nope"}]"#);
    server.send_raw(r#"{"not":"an array"}"#);
    server.send(&json!(["EOSE", "s"]));

    assert!(eventually(|| eose_count.load(Ordering::SeqCst) == 1).await);
    Ok(())
}

#[tokio::test]
async fn callback_errors_do_not_block_other_callbacks() -> Result<()> {
    let (mut server, relay) = connected().await?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = relay.sub(vec![], SubscriptionOptions::new().with_id("s"));
    subscription.on_event(|_event: &Event| {
        Err(nostr_client::ClientError::Callback("rejected".to_string()))
    });
    subscription.on_event(recorded_ids(&seen));
    server.next_tagged("REQ").await?;

    let event = signed_event(1, 1, "x")?;
    server.send(&json!(["EVENT", "s", event]));
    assert!(flush(&server, &relay).await);
    assert_eq!(*seen.lock(), vec![event.id.clone()]);
    Ok(())
}

#[tokio::test]
async fn publish_reports_rejection_once() -> Result<()> {
    let (mut server, relay) = connected().await?;
    let event = signed_event(1, 1_700_000_000, "spam")?;
    let (ok_count, on_ok) = counter();
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let reason_sink = Arc::clone(&reasons);

    let published = relay.publish(&event)?;
    published.on_ok(on_ok);
    published.on_failed(move |reason| reason_sink.lock().push(reason.to_string()));

    let frame = server.next_tagged("EVENT").await?;
    assert_eq!(frame[1]["id"], json!(event.id));

    server.send(&json!(["OK", event.id, false, "blocked: spam"]));
    assert!(flush(&server, &relay).await);
    assert_eq!(*reasons.lock(), vec!["blocked: spam"]);

    // A second OK, and callbacks added after the first, are ignored.
    let (late_count, late) = counter();
    published.on_ok(late);
    server.send(&json!(["OK", event.id, true, ""]));
    assert!(flush(&server, &relay).await);
    assert_eq!(ok_count.load(Ordering::SeqCst), 0);
    assert_eq!(late_count.load(Ordering::SeqCst), 0);
    assert_eq!(reasons.lock().len(), 1);
    Ok(())
}

#[tokio::test]
async fn publish_wait_returns_confirmation() -> Result<()> {
    let (mut server, relay) = connected().await?;
    let event = signed_event(1, 1_700_000_000, "hello")?;
    let published = relay.publish(&event)?;

    let (confirmation, answered) = tokio::join!(published.wait(Duration::from_secs(2)), async {
        server.next_tagged("EVENT").await?;
        server.send(&json!(["OK", event.id, true, ""]));
        anyhow::Ok(())
    });
    answered?;
    let confirmation = confirmation?;

    assert!(confirmation.accepted);
    assert_eq!(confirmation.event_id, event.id);
    assert_eq!(confirmation.relay_url, relay.url());
    Ok(())
}

#[tokio::test]
async fn publish_wait_times_out_without_ok() -> Result<()> {
    let (_server, relay) = connected().await?;
    let published = relay.publish(&signed_event(1, 1, "ignored")?)?;

    let result = published.wait(Duration::from_millis(100)).await;
    assert!(matches!(result, Err(nostr_client::ClientError::Timeout(_))));
    Ok(())
}

#[tokio::test]
async fn auth_sends_auth_frame_and_challenges_reach_listeners() -> Result<()> {
    let (mut server, relay) = connected().await?;
    let challenges = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&challenges);
    relay.on_auth(move |challenge| sink.lock().push(challenge.to_string()));

    server.send(&json!(["AUTH", "challenge-1"]));
    assert!(eventually(|| challenges.lock().len() == 1).await);
    assert_eq!(*challenges.lock(), vec!["challenge-1"]);

    let response = signed_event(22242, 1_700_000_000, "")?;
    let (ok_count, on_ok) = counter();
    relay.auth(&response)?.on_ok(on_ok);
    let frame = server.next_tagged("AUTH").await?;
    assert_eq!(frame[1]["kind"], json!(22242));

    server.send(&json!(["OK", response.id, true, ""]));
    assert!(eventually(|| ok_count.load(Ordering::SeqCst) == 1).await);
    Ok(())
}

#[tokio::test]
async fn frames_queued_before_connect_are_sent_once_open() -> Result<()> {
    let mut server = MockRelay::start().await?;
    let relay = RelayConnection::with_config(server.url(), fast_config())?;

    relay.sub(vec![Filter::new().kind(1)], SubscriptionOptions::new().with_id("early"));
    relay.connect().await?;

    assert_eq!(server.next_frame().await?, json!(["REQ", "early", {"kinds": [1]}]));
    Ok(())
}

#[tokio::test]
async fn frames_are_dropped_when_connection_never_opens() -> Result<()> {
    let mut server = MockRelay::start().await?;
    let relay = RelayConnection::with_config(server.url(), fast_config())?;

    relay.sub(vec![], SubscriptionOptions::new().with_id("stale"));
    tokio::time::sleep(relay.config().send_grace() + Duration::from_millis(200)).await;
    relay.connect().await?;
    relay.sub(vec![], SubscriptionOptions::new().with_id("fresh"));

    assert_eq!(server.next_frame().await?, json!(["REQ", "fresh"]));
    assert!(server.is_quiet_for(Duration::from_millis(200)).await);
    Ok(())
}

#[tokio::test]
async fn concurrent_connects_share_one_socket() -> Result<()> {
    let server = MockRelay::start().await?;
    let relay = RelayConnection::with_config(server.url(), fast_config())?;
    let (connects, on_connect) = counter();
    relay.on_connect(on_connect);

    let (first, second, third) = tokio::join!(relay.connect(), relay.connect(), relay.connect());
    first?;
    second?;
    third?;

    assert_eq!(relay.status(), ConnectionState::Open);
    assert_eq!(relay.ready_state(), 1);
    assert_eq!(server.accepted(), 1);
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    // Already open: no new socket.
    relay.connect().await?;
    assert_eq!(server.accepted(), 1);
    Ok(())
}

#[tokio::test]
async fn connection_listeners_follow_the_socket() -> Result<()> {
    let server = MockRelay::start().await?;
    let relay = RelayConnection::with_config(server.url(), fast_config())?;
    let (connects, on_connect) = counter();
    let (disconnects, on_disconnect) = counter();
    relay.on_connect(on_connect);
    relay.on_disconnect(on_disconnect);

    relay.connect().await?;
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    let (late, on_late_connect) = counter();
    relay.on_connect(on_late_connect);
    assert_eq!(late.load(Ordering::SeqCst), 1);

    server.drop_client();
    assert!(eventually(|| disconnects.load(Ordering::SeqCst) == 1).await);
    assert_eq!(relay.status(), ConnectionState::Closed);

    relay.connect().await?;
    assert_eq!(server.accepted(), 2);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(late.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn close_clears_subscriptions_and_listeners() -> Result<()> {
    let (mut server, relay) = connected().await?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (notices, on_notice) = counter();
    relay.on_notice(move |_| on_notice());
    let subscription = relay.sub(vec![], SubscriptionOptions::new().with_id("s"));
    subscription.on_event(recorded_ids(&seen));
    server.next_tagged("REQ").await?;

    relay.close().await?;
    assert_eq!(relay.status(), ConnectionState::Closed);
    assert!(!subscription.is_active());

    relay.connect().await?;
    assert!(eventually(|| server.accepted() == 2).await);
    server.send(&json!(["EVENT", "s", signed_event(1, 1, "after close")?]));
    assert!(flush(&server, &relay).await);

    assert!(seen.lock().is_empty());
    // Only the flush listener saw the notice.
    assert_eq!(notices.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn eose_after_unsub_skips_late_listeners() -> Result<()> {
    let (mut server, relay) = connected().await?;
    let subscription = relay.sub(vec![], SubscriptionOptions::new().with_id("feed"));
    server.next_tagged("REQ").await?;
    subscription.unsub();

    let (eoses, on_eose) = counter();
    subscription.on_eose(on_eose);
    server.send(&json!(["EOSE", "feed"]));

    assert!(flush(&server, &relay).await);
    assert_eq!(eoses.load(Ordering::SeqCst), 0);
    Ok(())
}
