//! Realtime transport. The engine consumes a stream of [`GatewayEvent`]s and
//! never touches frames directly.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared::protocol::{
    opcode, ConnectionProperties, GatewayFrame, HelloPayload, IdentifyPayload,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const LARGE_THRESHOLD: u32 = 250;

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// A named dispatch with its JSON payload, delivered in receive order.
    Dispatch { event_type: String, payload: Value },
    /// The session handshake completed. Always follows the `READY` dispatch.
    Ready,
    /// The transport went away. `error` is `None` for a clean close.
    Disconnected { error: Option<String> },
}

pub type GatewayEvents = mpsc::Receiver<GatewayEvent>;

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Opens a session and returns its event stream. The stream ends after a
    /// [`GatewayEvent::Disconnected`].
    async fn connect(&self, url: &str, token: &str) -> Result<GatewayEvents>;
    /// Closes the current session, if any. Safe to call repeatedly.
    async fn disconnect(&self);
}

struct ActiveSocket {
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// [`Gateway`] over a websocket carrying JSON [`GatewayFrame`]s.
#[derive(Default)]
pub struct WebSocketGateway {
    active: Mutex<Option<ActiveSocket>>,
}

impl WebSocketGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

fn encode(frame: &GatewayFrame) -> Result<Message> {
    Ok(Message::Text(
        serde_json::to_string(frame).context("failed to encode gateway frame")?,
    ))
}

#[async_trait]
impl Gateway for WebSocketGateway {
    async fn connect(&self, url: &str, token: &str) -> Result<GatewayEvents> {
        self.disconnect().await;

        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let identify = IdentifyPayload {
            token: token.to_string(),
            properties: ConnectionProperties {
                os: std::env::consts::OS.to_string(),
                browser: env!("CARGO_PKG_NAME").to_string(),
                device: env!("CARGO_PKG_NAME").to_string(),
            },
            large_threshold: LARGE_THRESHOLD,
        };
        let identify = GatewayFrame::new(
            opcode::IDENTIFY,
            serde_json::to_value(identify).context("failed to encode identify payload")?,
        );
        outgoing_tx
            .send(encode(&identify)?)
            .context("gateway writer closed before identify")?;

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                    outgoing = outgoing_rx.recv() => {
                        let Some(outgoing) = outgoing else { break };
                        if let Err(err) = ws_writer.send(outgoing).await {
                            warn!("gateway: websocket send failed: {err}");
                            break;
                        }
                    }
                }
            }
        });

        let reader_cancel = cancel.clone();
        let reader = tokio::spawn(async move {
            let last_seq = Arc::new(AtomicU64::new(0));
            let error = loop {
                let incoming = tokio::select! {
                    _ = reader_cancel.cancelled() => break None,
                    incoming = ws_reader.next() => incoming,
                };
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .filter(|frame| !frame.reason.is_empty())
                            .map(|frame| format!("gateway closed: {}", frame.reason));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => break Some(format!("websocket receive failed: {err}")),
                    None => break Some("websocket stream ended".to_string()),
                };
                let frame = match serde_json::from_str::<GatewayFrame>(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("gateway: invalid frame: {err}");
                        continue;
                    }
                };
                match frame.op {
                    opcode::DISPATCH => {
                        if let Some(seq) = frame.s {
                            last_seq.store(seq, Ordering::Relaxed);
                        }
                        let Some(event_type) = frame.t else {
                            warn!("gateway: dispatch frame without event type");
                            continue;
                        };
                        let is_ready = event_type == "READY";
                        let dispatch = GatewayEvent::Dispatch {
                            event_type,
                            payload: frame.d,
                        };
                        if events_tx.send(dispatch).await.is_err() {
                            break None;
                        }
                        if is_ready && events_tx.send(GatewayEvent::Ready).await.is_err() {
                            break None;
                        }
                    }
                    opcode::HELLO => {
                        let hello = match serde_json::from_value::<HelloPayload>(frame.d) {
                            Ok(hello) => hello,
                            Err(err) => break Some(format!("invalid hello payload: {err}")),
                        };
                        debug!(
                            heartbeat_interval_ms = hello.heartbeat_interval,
                            "gateway: hello"
                        );
                        spawn_heartbeat(
                            Duration::from_millis(hello.heartbeat_interval.max(1)),
                            Arc::clone(&last_seq),
                            outgoing_tx.clone(),
                            reader_cancel.child_token(),
                        );
                    }
                    opcode::HEARTBEAT => {
                        let beat = heartbeat_frame(last_seq.load(Ordering::Relaxed));
                        if let Ok(message) = encode(&beat) {
                            let _ = outgoing_tx.send(message);
                        }
                    }
                    opcode::HEARTBEAT_ACK => trace!("gateway: heartbeat acknowledged"),
                    opcode::RECONNECT => break Some("gateway requested a reconnect".to_string()),
                    opcode::INVALID_SESSION => break Some("gateway session invalidated".to_string()),
                    other => debug!(op = other, "gateway: ignoring frame"),
                }
            };
            reader_cancel.cancel();
            let _ = events_tx.send(GatewayEvent::Disconnected { error }).await;
        });

        *self.active.lock() = Some(ActiveSocket {
            cancel,
            reader,
            writer,
        });
        Ok(events_rx)
    }

    async fn disconnect(&self) {
        let active = self.active.lock().take();
        let Some(active) = active else {
            return;
        };
        active.cancel.cancel();
        let _ = active.writer.await;
        let _ = active.reader.await;
        debug!("gateway: websocket closed");
    }
}

fn heartbeat_frame(seq: u64) -> GatewayFrame {
    let d = if seq == 0 { Value::Null } else { json!(seq) };
    GatewayFrame::new(opcode::HEARTBEAT, d)
}

fn spawn_heartbeat(
    interval: Duration,
    last_seq: Arc<AtomicU64>,
    outgoing: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let beat = heartbeat_frame(last_seq.load(Ordering::Relaxed));
                    let Ok(message) = encode(&beat) else { break };
                    if outgoing.send(message).is_err() {
                        break;
                    }
                    trace!("gateway: heartbeat sent");
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
