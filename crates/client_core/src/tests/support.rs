//! In-process fakes for the gateway and API collaborators.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared::{
    domain::{ChannelId, MessageId, UserId},
    protocol::{MessageModel, UserModel},
};
use tokio::sync::{broadcast, mpsc};

use crate::{
    config::ClientConfig,
    protocol_client::ProtocolClient,
    transport::{Gateway, GatewayEvent, GatewayEvents},
    ClientEvent, RealtimeClient,
};

pub(crate) const LOCAL_USER: UserId = UserId(42);
pub(crate) const GATEWAY_URL: &str = "wss://gateway.test";

pub(crate) fn test_config() -> ClientConfig {
    ClientConfig {
        connect_timeout_ms: 2_000,
        queue_retry_delay_ms: 10,
        auto_reconnect: false,
        reconnect_delay_ms: 10,
        max_reconnect_delay_ms: 40,
        ..ClientConfig::default()
    }
}

/// One available server with a role, a channel and two members, one
/// unavailable server and one private channel.
pub(crate) fn ready_payload() -> Value {
    json!({
        "v": 3,
        "user": { "id": "42", "username": "local", "discriminator": "0001" },
        "session_id": "session-1",
        "guilds": [
            {
                "id": "100",
                "name": "Rustaceans",
                "roles": [{ "id": "110", "name": "@everyone", "permissions": "104324161" }],
                "channels": [{ "id": "120", "name": "general", "type": "text" }],
                "members": [
                    { "user": { "id": "42", "username": "local" }, "roles": ["110"] },
                    { "user": { "id": "43", "username": "ferris" } }
                ],
                "presences": [{ "user": { "id": "43" }, "status": "online" }]
            },
            { "id": "200", "unavailable": true }
        ],
        "private_channels": [
            { "id": "300", "recipient": { "id": "44", "username": "crab" } }
        ]
    })
}

pub(crate) fn drain(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// Waits for the first event matching `matches`, skipping the rest.
pub(crate) async fn next_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    matches: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

pub(crate) struct FakeGateway {
    send_ready: AtomicBool,
    fail_connect: Mutex<Option<String>>,
    sender: Mutex<Option<mpsc::Sender<GatewayEvent>>>,
    pub(crate) calls: Mutex<Vec<&'static str>>,
    pub(crate) connects: AtomicUsize,
    pub(crate) closed_sessions: AtomicUsize,
}

impl FakeGateway {
    pub(crate) fn new() -> Self {
        Self {
            send_ready: AtomicBool::new(true),
            fail_connect: Mutex::new(None),
            sender: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            closed_sessions: AtomicUsize::new(0),
        }
    }

    /// Sessions opened from now on never complete the handshake.
    pub(crate) fn withhold_ready(&self) {
        self.send_ready.store(false, Ordering::SeqCst);
    }

    pub(crate) fn fail_connects(&self, error: &str) {
        *self.fail_connect.lock() = Some(error.to_string());
    }

    pub(crate) fn is_open(&self) -> bool {
        self.sender.lock().is_some()
    }

    pub(crate) async fn push(&self, event: GatewayEvent) {
        let sender = self.sender.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    pub(crate) async fn dispatch(&self, event_type: &str, payload: Value) {
        self.push(GatewayEvent::Dispatch {
            event_type: event_type.to_string(),
            payload,
        })
        .await;
    }

    /// Simulates the server dropping the socket.
    pub(crate) async fn drop_connection(&self, error: &str) {
        self.push(GatewayEvent::Disconnected {
            error: Some(error.to_string()),
        })
        .await;
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn connect(&self, url: &str, _token: &str) -> Result<GatewayEvents> {
        assert_eq!(url, GATEWAY_URL);
        self.calls.lock().push("connect");
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_connect.lock().clone() {
            return Err(anyhow!(err));
        }
        let (tx, rx) = mpsc::channel(64);
        if self.send_ready.load(Ordering::SeqCst) {
            tx.try_send(GatewayEvent::Dispatch {
                event_type: "READY".to_string(),
                payload: ready_payload(),
            })?;
            tx.try_send(GatewayEvent::Ready)?;
        }
        *self.sender.lock() = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&self) {
        self.calls.lock().push("disconnect");
        if self.sender.lock().take().is_some() {
            self.closed_sessions.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub(crate) struct FakeApi {
    gateway_error: Mutex<Option<String>>,
    send_failures: AtomicUsize,
    hang_sends: AtomicBool,
    next_message_id: AtomicU64,
    pub(crate) sent: Mutex<Vec<(ChannelId, String, Option<u64>)>>,
    pub(crate) logouts: AtomicUsize,
    pub(crate) token: Mutex<Option<String>>,
}

impl FakeApi {
    pub(crate) fn new() -> Self {
        Self {
            gateway_error: Mutex::new(None),
            send_failures: AtomicUsize::new(0),
            hang_sends: AtomicBool::new(false),
            next_message_id: AtomicU64::new(9_000),
            sent: Mutex::new(Vec::new()),
            logouts: AtomicUsize::new(0),
            token: Mutex::new(None),
        }
    }

    pub(crate) fn fail_gateway_lookup(&self, error: &str) {
        *self.gateway_error.lock() = Some(error.to_string());
    }

    /// The next `count` sends fail.
    pub(crate) fn fail_sends(&self, count: usize) {
        self.send_failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn hang_sends(&self) {
        self.hang_sends.store(true, Ordering::SeqCst);
    }

    pub(crate) fn sent_contents(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|(_, content, _)| content.clone())
            .collect()
    }
}

#[async_trait]
impl ProtocolClient for FakeApi {
    async fn login(&self, email: &str, _password: &str) -> Result<String> {
        Ok(format!("token-for-{email}"))
    }

    async fn logout(&self) -> Result<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn gateway_url(&self) -> Result<String> {
        if let Some(err) = self.gateway_error.lock().clone() {
            return Err(anyhow!(err));
        }
        Ok(GATEWAY_URL.to_string())
    }

    async fn send_message(
        &self,
        channel_id: ChannelId,
        content: &str,
        nonce: Option<u64>,
    ) -> Result<MessageModel> {
        if self.hang_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let failed = self
            .send_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow!("injected send failure"));
        }
        self.sent
            .lock()
            .push((channel_id, content.to_string(), nonce));
        Ok(MessageModel {
            id: MessageId(self.next_message_id.fetch_add(1, Ordering::SeqCst)),
            channel_id,
            author: UserModel {
                id: LOCAL_USER,
                ..UserModel::default()
            },
            content: content.to_string(),
            nonce: nonce.map(|nonce| json!(nonce.to_string())),
            timestamp: None,
            edited_timestamp: None,
        })
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.lock() = token;
    }
}

pub(crate) fn fake_client(
    config: ClientConfig,
) -> (Arc<RealtimeClient>, Arc<FakeGateway>, Arc<FakeApi>) {
    let gateway = Arc::new(FakeGateway::new());
    let api = Arc::new(FakeApi::new());
    let client = RealtimeClient::new(config, gateway.clone(), api.clone());
    (client, gateway, api)
}
