//! Scripted in-process relay for integration tests.

use anyhow::{Context, Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use nostr::{Event, EventTemplate, finalize_event};
use nostr_client::RelayConfig;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub const SECRET_KEY: [u8; 32] = [0x11; 32];

enum Script {
    Text(String),
    Close,
}

/// Accepts one client at a time. Frames the client sends are queued for
/// [`MockRelay::next_frame`]; frames passed to [`MockRelay::send`] are written
/// to the current (or next) client in order.
pub struct MockRelay {
    url: String,
    received: mpsc::UnboundedReceiver<String>,
    script: mpsc::UnboundedSender<Script>,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("ws://{}", listener.local_addr()?);
        let (received_tx, received) = mpsc::unbounded_channel();
        let (script, script_rx) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn(serve(
            listener,
            received_tx,
            script_rx,
            Arc::clone(&accepted),
        ));

        Ok(Self {
            url,
            received,
            script,
            accepted,
            task,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn send(&self, frame: &Value) {
        self.send_raw(&frame.to_string());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.script.send(Script::Text(text.to_string()));
    }

    /// Close the current client connection from the relay side.
    pub fn drop_client(&self) {
        let _ = self.script.send(Script::Close);
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Next frame sent by the client, parsed as JSON.
    pub async fn next_frame(&mut self) -> Result<Value> {
        let text = timeout(Duration::from_secs(3), self.received.recv())
            .await
            .context("timed out waiting for a client frame")?
            .ok_or_else(|| anyhow!("mock relay stopped"))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Next client frame whose tag is `tag`, skipping others.
    pub async fn next_tagged(&mut self, tag: &str) -> Result<Value> {
        loop {
            let frame = self.next_frame().await?;
            if frame[0] == tag {
                return Ok(frame);
            }
        }
    }

    /// Whether the client stays silent for `wait`.
    pub async fn is_quiet_for(&mut self, wait: Duration) -> bool {
        timeout(wait, self.received.recv()).await.is_err()
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    listener: TcpListener,
    received: mpsc::UnboundedSender<String>,
    mut script: mpsc::UnboundedReceiver<Script>,
    accepted: Arc<AtomicUsize>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        accepted.fetch_add(1, Ordering::SeqCst);
        serve_client(stream, &received, &mut script).await;
    }
}

async fn serve_client(
    stream: TcpStream,
    received: &mpsc::UnboundedSender<String>,
    script: &mut mpsc::UnboundedReceiver<Script>,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    loop {
        tokio::select! {
            inbound = ws.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = received.send(text);
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            },
            outbound = script.recv() => match outbound {
                Some(Script::Text(text)) => {
                    if ws.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Some(Script::Close) => {
                    let _ = ws.close(None).await;
                    return;
                }
                None => return,
            },
        }
    }
}

/// Short timeouts so failure paths finish quickly.
pub fn fast_config() -> RelayConfig {
    RelayConfig::default()
        .with_connect_timeout(Duration::from_secs(2))
        .with_send_grace(Duration::from_millis(500))
        .with_list_timeout(Duration::from_millis(400))
        .with_get_timeout(Duration::from_millis(400))
}

pub fn signed_event(kind: u16, created_at: u64, content: &str) -> Result<Event> {
    Ok(finalize_event(
        &EventTemplate {
            created_at,
            kind,
            tags: vec![],
            content: content.to_string(),
        },
        &SECRET_KEY,
    )?)
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
