//! Single relay connection management.

use crate::config::RelayConfig;
use crate::dispatch;
use crate::error::{ClientError, Result};
use crate::listeners::{Callback, ConnectionEvent, ConnectionListeners, ListenerId, RelayText};
use crate::message::ClientMessage;
use crate::publish::{Pub, PublishTracker};
use crate::subscription::{Subscription, SubscriptionOptions, SubscriptionRegistry};
use crate::verify::{EventVerifier, SchnorrVerifier};
use futures_util::future::{BoxFuture, Shared};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use nostr::{Event, Filter};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;
type ConnectAttempt = Shared<BoxFuture<'static, std::result::Result<(), String>>>;
type Outbound = (Instant, ClientMessage);

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection has been attempted yet.
    Unconnected,
    Connecting,
    Open,
    /// The last connection closed or the last attempt failed.
    Closed,
}

impl ConnectionState {
    /// WebSocket-style ready state: 0 connecting, 1 open, 3 closed.
    pub fn ready_state(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Unconnected | Self::Closed => 3,
        }
    }
}

pub(crate) struct RelayInner {
    url: Url,
    config: RelayConfig,
    pub(crate) verifier: Arc<dyn EventVerifier>,
    state: watch::Sender<ConnectionState>,
    // Bumped per opened socket so a stale reader cannot close a newer one.
    generation: AtomicU64,
    connecting: Mutex<Option<ConnectAttempt>>,
    writer: tokio::sync::Mutex<Option<WsWriter>>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) listeners: ConnectionListeners,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) publishes: PublishTracker,
}

impl RelayInner {
    pub(crate) fn url(&self) -> &str {
        self.url.as_str()
    }

    pub(crate) fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Queue a frame behind everything already queued.
    pub(crate) fn enqueue(self: &Arc<Self>, message: ClientMessage) {
        if self.outbound_tx.send((Instant::now(), message)).is_err() {
            debug!("outbound queue for {} is closed", self.url);
            return;
        }
        self.ensure_writer_task();
    }

    /// Forget the subscription and queue its CLOSE.
    pub(crate) fn unsubscribe(self: &Arc<Self>, id: &str) {
        self.subscriptions.remove(id);
        self.enqueue(ClientMessage::Close(id.to_string()));
    }

    fn ensure_writer_task(self: &Arc<Self>) {
        let mut slot = self.outbound_rx.lock();
        if slot.is_none() {
            return;
        }
        // Without a runtime the frames wait until the first call made inside one.
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        if let Some(outbound) = slot.take() {
            runtime.spawn(write_loop(Arc::downgrade(self), outbound));
        }
    }

    /// Wait until the connection is open or the frame's grace period ends.
    async fn wait_until_open(&self, deadline: Instant) -> bool {
        let mut state = self.state.subscribe();
        let opened = timeout_at(deadline, async {
            loop {
                if *state.borrow_and_update() == ConnectionState::Open {
                    return true;
                }
                if state.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        matches!(opened, Ok(true))
    }

    async fn send(&self, queued_at: Instant, message: &ClientMessage) {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(error) => {
                warn!("failed to encode {} for {}: {}", message.label(), self.url, error);
                return;
            }
        };

        if !self.wait_until_open(queued_at + self.config.send_grace()).await {
            debug!("dropping {} for {}: connection not open", message.label(), self.url);
            return;
        }

        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            debug!("dropping {} for {}: no writer", message.label(), self.url);
            return;
        };
        if let Err(error) = sink.send(Message::Text(text)).await {
            warn!("websocket write error on {}: {}", self.url, error);
        }
    }

    async fn open(self: Arc<Self>) -> std::result::Result<(), String> {
        self.state.send_replace(ConnectionState::Connecting);
        debug!("connecting to {}", self.url);

        let connect_timeout = self.config.connect_timeout();
        let stream = match timeout(connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(error)) => Err(error.to_string()),
            Err(_) => Err(format!("connection timeout after {connect_timeout:?}")),
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(message) => {
                warn!("connection to {} failed: {}", self.url, message);
                self.state.send_replace(ConnectionState::Closed);
                *self.connecting.lock() = None;
                self.listeners.fire(ConnectionEvent::Error);
                return Err(message);
            }
        };

        let (writer, reader) = stream.split();
        let generation = {
            let mut slot = self.writer.lock().await;
            *slot = Some(writer);
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch::run(Arc::downgrade(&self), inbound_rx));
        let reader_task = tokio::spawn(read_loop(
            Arc::downgrade(&self),
            reader,
            inbound_tx,
            generation,
        ));
        if let Some(previous) = self.reader_task.lock().replace(reader_task) {
            previous.abort();
        }

        self.state.send_replace(ConnectionState::Open);
        *self.connecting.lock() = None;
        self.ensure_writer_task();
        debug!("connected to {}", self.url);
        self.listeners.fire(ConnectionEvent::Connect);
        Ok(())
    }

    async fn transport_closed(&self, generation: u64) {
        {
            // Checked under the writer lock so a newer socket is never cleared.
            let mut writer = self.writer.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            writer.take();
            self.state.send_replace(ConnectionState::Closed);
        }
        *self.connecting.lock() = None;
        debug!("disconnected from {}", self.url);
        self.listeners.fire(ConnectionEvent::Disconnect);
    }
}

impl Drop for RelayInner {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn write_loop(relay: Weak<RelayInner>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some((queued_at, message)) = outbound.recv().await {
        let Some(relay) = relay.upgrade() else {
            break;
        };
        relay.send(queued_at, &message).await;
    }
}

async fn read_loop(
    relay: Weak<RelayInner>,
    mut reader: WsReader,
    inbound: mpsc::UnboundedSender<String>,
    generation: u64,
) {
    let relay_url = relay
        .upgrade()
        .map(|relay| relay.url().to_string())
        .unwrap_or_default();

    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if inbound.send(text).is_err() {
                    break;
                }
            }
            Ok(Message::Ping(payload)) => {
                debug!("received ping from {} ({} bytes)", relay_url, payload.len());
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {}
            Err(error) => {
                warn!("websocket read error on {}: {}", relay_url, error);
                break;
            }
        }
    }

    drop(inbound);
    if let Some(relay) = relay.upgrade() {
        relay.transport_closed(generation).await;
    }
}

/// Relay connection.
///
/// Cheap to clone; clones share one socket and one set of subscriptions.
#[derive(Clone)]
pub struct RelayConnection {
    inner: Arc<RelayInner>,
}

impl RelayConnection {
    /// Create a new relay connection with default config.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    /// Create a new relay connection with custom config.
    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        Self::with_verifier(url, config, Arc::new(SchnorrVerifier))
    }

    /// Create a relay connection that checks signatures with `verifier`.
    pub fn with_verifier(
        url: &str,
        config: RelayConfig,
        verifier: Arc<dyn EventVerifier>,
    ) -> Result<Self> {
        let parsed_url = Url::parse(url)?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed_url.scheme()
            )));
        }

        let (state, _) = watch::channel(ConnectionState::Unconnected);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(RelayInner {
                url: parsed_url,
                config,
                verifier,
                state,
                generation: AtomicU64::new(0),
                connecting: Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                reader_task: Mutex::new(None),
                listeners: ConnectionListeners::default(),
                subscriptions: SubscriptionRegistry::default(),
                publishes: PublishTracker::default(),
            }),
        })
    }

    /// Relay URL as string.
    pub fn url(&self) -> &str {
        self.inner.url()
    }

    pub fn config(&self) -> &RelayConfig {
        self.inner.config()
    }

    /// Current connection state.
    pub fn status(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn ready_state(&self) -> u8 {
        self.status().ready_state()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionState::Open
    }

    pub(crate) fn inner(&self) -> &Arc<RelayInner> {
        &self.inner
    }

    /// Open the WebSocket if it is not open already.
    ///
    /// Concurrent callers share one attempt and see the same outcome. Once the
    /// attempt settles, a later call starts a new one.
    pub async fn connect(&self) -> Result<()> {
        let attempt = {
            let mut slot = self.inner.connecting.lock();
            // Checked under the slot lock: a finished attempt marks the
            // connection open before it empties the slot.
            if self.is_connected() {
                return Ok(());
            }
            if let Some(attempt) = slot.as_ref() {
                attempt.clone()
            } else {
                let relay = Arc::downgrade(&self.inner);
                let attempt = async move {
                    match relay.upgrade() {
                        Some(relay) => relay.open().await,
                        None => Err("relay connection dropped".to_string()),
                    }
                }
                .boxed()
                .shared();
                *slot = Some(attempt.clone());
                attempt
            }
        };

        attempt.await.map_err(ClientError::Connection)
    }

    /// Drop every subscription, listener and pending publish, then close the
    /// socket if it is open.
    pub async fn close(&self) -> Result<()> {
        self.inner.listeners.clear();
        self.inner.subscriptions.clear();
        self.inner.publishes.clear();

        if !self.is_connected() {
            return Ok(());
        }
        self.inner.state.send_replace(ConnectionState::Closed);
        *self.inner.connecting.lock() = None;

        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            writer
                .send(Message::Close(None))
                .await
                .map_err(|error| ClientError::WebSocket(error.to_string()))?;
        }
        Ok(())
    }

    /// Open a subscription and send its REQ.
    ///
    /// Callbacks registered on the returned handle before the connection opens
    /// still see every event, since REQ is only written once it is open.
    pub fn sub(&self, filters: Vec<Filter>, options: SubscriptionOptions) -> Subscription {
        let subscription = Subscription::register(&self.inner, filters, options, None);
        subscription.request();
        subscription
    }

    /// Send `["EVENT", event]` and track the relay's OK for it.
    pub fn publish(&self, event: &Event) -> Result<Pub> {
        self.track(event, ClientMessage::Event(event.clone()))
    }

    /// Answer an auth challenge with a signed event.
    pub fn auth(&self, event: &Event) -> Result<Pub> {
        self.track(event, ClientMessage::Auth(event.clone()))
    }

    fn track(&self, event: &Event, message: ClientMessage) -> Result<Pub> {
        if event.id.is_empty() {
            return Err(ClientError::InvalidRequest(format!(
                "cannot send {} for an event without an id",
                message.label()
            )));
        }
        self.inner.publishes.begin(&event.id);
        self.inner.enqueue(message);
        Ok(Pub::new(event.id.clone(), Arc::clone(&self.inner)))
    }

    /// Runs on every successful connect; immediately as well if already open.
    pub fn on_connect<F>(&self, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let id = self
            .inner
            .listeners
            .add(ConnectionEvent::Connect, Arc::clone(&callback));
        if self.is_connected() {
            callback();
        }
        id
    }

    pub fn on_disconnect<F>(&self, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .add(ConnectionEvent::Disconnect, Arc::new(callback))
    }

    /// Runs when a connection attempt fails.
    pub fn on_error<F>(&self, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .add(ConnectionEvent::Error, Arc::new(callback))
    }

    pub fn on_notice<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .add_text(RelayText::Notice, Arc::new(callback))
    }

    /// Runs with the challenge string of every AUTH frame.
    pub fn on_auth<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .add_text(RelayText::Auth, Arc::new(callback))
    }

    pub fn off(&self, listener_id: ListenerId) -> bool {
        self.inner.listeners.remove(listener_id)
    }
}

impl fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.url())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
