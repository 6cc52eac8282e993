use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use shared::domain::{ChannelId, GuildId, MessageId, RoleId, UserId};
use tokio::{
    sync::{broadcast, watch},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod cache;
pub mod config;
mod dispatch;
pub mod error;
pub mod message_queue;
pub mod protocol_client;
pub mod transport;
pub mod types;

pub use cache::{CacheChange, CacheNotification, CacheStats, EntityCache, EntityKey, StoreKind};
pub use config::{load_config, ClientConfig};
pub use error::{ClientError, Result};
pub use message_queue::QueuedMessage;
pub use protocol_client::{HttpProtocolClient, ProtocolClient};
pub use transport::{Gateway, GatewayEvent, GatewayEvents, WebSocketGateway};
pub use types::{
    Channel, GlobalUser, Member, MemberKey, Message, MessageState, Presence, Role, Server,
    VoiceState,
};

use message_queue::OutboundQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Domain events, raised in dispatch order after the cache reflects them.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected {
        was_unexpected: bool,
        error: Option<ClientError>,
    },
    ServerAvailable(Server),
    ServerUnavailable(Server),
    JoinedServer(Server),
    LeftServer(Server),
    ServerUpdated(Server),
    ChannelCreated {
        server: Option<Server>,
        channel: Channel,
    },
    ChannelDestroyed {
        server: Option<Server>,
        channel: Channel,
    },
    ChannelUpdated {
        server: Option<Server>,
        channel: Channel,
    },
    RoleCreated {
        server: Server,
        role: Role,
    },
    RoleUpdated {
        server: Option<Server>,
        role: Role,
    },
    RoleDeleted {
        server: Option<Server>,
        role: Role,
    },
    UserBanned {
        user_id: UserId,
        server: Server,
    },
    UserUnbanned {
        user_id: UserId,
        server: Server,
    },
    UserJoined {
        server: Option<Server>,
        user: Member,
    },
    UserLeft {
        server: Option<Server>,
        user: Member,
    },
    UserUpdated {
        server: Option<Server>,
        user: Member,
    },
    UserPresenceUpdated {
        server: Option<Server>,
        user: Member,
    },
    UserVoiceStateUpdated {
        server: Option<Server>,
        user: Member,
    },
    UserIsTypingUpdated {
        server: Option<Server>,
        channel: Channel,
        user: Member,
    },
    MessageReceived {
        server: Option<Server>,
        channel: Option<Channel>,
        message: Message,
    },
    MessageUpdated {
        server: Option<Server>,
        channel: Option<Channel>,
        message: Message,
    },
    MessageDeleted {
        server: Option<Server>,
        channel: Option<Channel>,
        message: Message,
    },
    MessageAcknowledged {
        server: Option<Server>,
        channel: Option<Channel>,
        message: Message,
    },
    MessageSent {
        message: Message,
    },
    ProfileUpdated(GlobalUser),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::ServerAvailable(_) => "server_available",
            Self::ServerUnavailable(_) => "server_unavailable",
            Self::JoinedServer(_) => "joined_server",
            Self::LeftServer(_) => "left_server",
            Self::ServerUpdated(_) => "server_updated",
            Self::ChannelCreated { .. } => "channel_created",
            Self::ChannelDestroyed { .. } => "channel_destroyed",
            Self::ChannelUpdated { .. } => "channel_updated",
            Self::RoleCreated { .. } => "role_created",
            Self::RoleUpdated { .. } => "role_updated",
            Self::RoleDeleted { .. } => "role_deleted",
            Self::UserBanned { .. } => "user_banned",
            Self::UserUnbanned { .. } => "user_unbanned",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::UserUpdated { .. } => "user_updated",
            Self::UserPresenceUpdated { .. } => "user_presence_updated",
            Self::UserVoiceStateUpdated { .. } => "user_voice_state_updated",
            Self::UserIsTypingUpdated { .. } => "user_is_typing_updated",
            Self::MessageReceived { .. } => "message_received",
            Self::MessageUpdated { .. } => "message_updated",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::MessageAcknowledged { .. } => "message_acknowledged",
            Self::MessageSent { .. } => "message_sent",
            Self::ProfileUpdated(_) => "profile_updated",
        }
    }
}

type RunTask = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct SessionState {
    token: Option<String>,
    gateway_url: Option<String>,
    current_user: Option<UserId>,
    cancel: Option<CancellationToken>,
    run_task: Option<RunTask>,
    reconnect_stop: Option<CancellationToken>,
    reconnect_generation: u64,
    disconnect_reason: Option<ClientError>,
    was_disconnect_unexpected: bool,
    last_transport_error: Option<ClientError>,
    reached_connected: bool,
}

pub struct RealtimeClient {
    config: ClientConfig,
    gateway: Arc<dyn Gateway>,
    api: Arc<dyn ProtocolClient>,
    cache: Arc<EntityCache>,
    outbound: OutboundQueue,
    state: AtomicU8,
    session: Mutex<SessionState>,
    connected: watch::Sender<bool>,
    disconnected: watch::Sender<bool>,
    events: broadcast::Sender<ClientEvent>,
}

impl RealtimeClient {
    pub fn new(
        config: ClientConfig,
        gateway: Arc<dyn Gateway>,
        api: Arc<dyn ProtocolClient>,
    ) -> Arc<Self> {
        let cache = Arc::new(EntityCache::new(config.message_cache_size));
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (connected, _) = watch::channel(false);
        let (disconnected, _) = watch::channel(true);
        Arc::new(Self {
            outbound: OutboundQueue::new(Arc::clone(&cache)),
            config,
            gateway,
            api,
            cache,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            session: Mutex::new(SessionState::default()),
            connected,
            disconnected,
            events,
        })
    }

    /// Client wired to the websocket gateway and the HTTP API named in `config`.
    pub fn with_defaults(config: ClientConfig) -> Arc<Self> {
        let api = Arc::new(HttpProtocolClient::new(config.api_url.clone()));
        Self::new(config, Arc::new(WebSocketGateway::new()), api)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_cache(&self) -> broadcast::Receiver<CacheNotification> {
        self.cache.subscribe()
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn token(&self) -> Option<String> {
        self.session.lock().token.clone()
    }

    pub fn gateway_url(&self) -> Option<String> {
        self.session.lock().gateway_url.clone()
    }

    pub fn current_user_id(&self) -> Option<UserId> {
        self.session.lock().current_user
    }

    pub fn current_user(&self) -> Option<GlobalUser> {
        let user_id = self.current_user_id()?;
        self.global_user(user_id)
    }

    pub fn server(&self, id: GuildId) -> Option<Server> {
        self.cache.lock().servers.lookup(id).cloned()
    }

    pub fn servers(&self) -> Vec<Server> {
        self.cache.lock().servers.values().cloned().collect()
    }

    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.cache.lock().channels.lookup(id).cloned()
    }

    pub fn member(&self, user_id: UserId, guild_id: Option<GuildId>) -> Option<Member> {
        self.cache
            .lock()
            .users
            .lookup(MemberKey::new(user_id, guild_id))
            .cloned()
    }

    pub fn global_user(&self, id: UserId) -> Option<GlobalUser> {
        self.cache.lock().global_users.lookup(id).cloned()
    }

    pub fn role(&self, id: RoleId) -> Option<Role> {
        self.cache.lock().roles.lookup(id).cloned()
    }

    pub fn message(&self, id: MessageId) -> Option<Message> {
        self.cache.lock().messages.lookup(id).cloned()
    }

    pub fn pending_message(&self, nonce: u64) -> Option<Message> {
        self.cache.lock().messages.lookup_pending(nonce).cloned()
    }

    pub fn channel_messages(&self, channel_id: ChannelId) -> Vec<Message> {
        self.cache.lock().messages.channel_messages(channel_id)
    }

    pub fn queued_messages(&self) -> usize {
        self.outbound.len()
    }

    pub fn check_ready(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Connecting => Err(ClientError::Connecting),
            ConnectionState::Disconnecting => Err(ClientError::Disconnecting),
            ConnectionState::Disconnected => Err(ClientError::NotConnected),
        }
    }

    /// Exchanges credentials for a token, then connects with it.
    pub async fn login(self: &Arc<Self>, email: &str, password: &str) -> Result<String> {
        let token = self
            .api
            .login(email, password)
            .await
            .map_err(ClientError::request)?;
        info!("login succeeded");
        self.connect(&token).await?;
        Ok(token)
    }

    /// Connects and waits for the session to become ready. An existing
    /// session is torn down first.
    pub async fn connect(self: &Arc<Self>, token: &str) -> Result<()> {
        loop {
            if self.state() != ConnectionState::Disconnected {
                self.disconnect().await?;
            }
            self.stop_reconnect();
            if let Some(cancel) = self.claim_connect(token, ConnectionState::Disconnected, None) {
                return self.begin_connect(token, cancel, false).await;
            }
            debug!("another connect claimed the session, tearing it down");
        }
    }

    /// Requests teardown and waits until the client is `Disconnected`.
    /// Concurrent callers share one teardown.
    pub async fn disconnect(self: &Arc<Self>) -> Result<()> {
        self.stop_reconnect();
        self.signal_disconnect(None, false, true, None).await;
        self.wait_for_disconnect().await;
        Ok(())
    }

    /// Suspends until the client reaches `Disconnected`, including after any
    /// reconnect attempts give up.
    pub async fn wait_for_disconnect(&self) {
        let mut disconnected = self.disconnected.subscribe();
        let _ = disconnected.wait_for(|done| *done).await;
    }

    /// Disconnects, drops unsent messages, logs out and empties the cache.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        self.disconnect().await?;
        let dropped = self.outbound.discard_all();
        if let Err(err) = self.api.logout().await {
            warn!("logout failed: {err:#}");
        }
        self.api.set_token(None);
        self.cache.clear();
        info!(dropped_messages = dropped, "client stopped");
        Ok(())
    }

    /// With the outbound queue enabled the message is cached as pending and
    /// sent by the flush loop, even while disconnected. Otherwise it is sent
    /// directly and requires a ready session.
    pub async fn send_message(&self, channel_id: ChannelId, content: &str) -> Result<Message> {
        if self.config.use_message_queue {
            let author_id = self.current_user_id().unwrap_or_default();
            return Ok(self.outbound.enqueue(channel_id, author_id, content));
        }

        self.check_ready()?;
        let confirmed = self
            .api
            .send_message(channel_id, content, None)
            .await
            .map_err(ClientError::request)?;
        let message = {
            let mut cache = self.cache.lock();
            cache
                .messages
                .upsert(confirmed.id, confirmed.channel_id, confirmed.author.id, |message| {
                    message.update(&confirmed)
                })
                .clone()
        };
        self.emit(ClientEvent::MessageSent {
            message: message.clone(),
        });
        Ok(message)
    }

    fn emit(&self, event: ClientEvent) {
        info!(event = event.name(), "client event");
        let _ = self.events.send(event);
    }

    fn stop_reconnect(&self) {
        let mut session = self.session.lock();
        if let Some(stop) = session.reconnect_stop.take() {
            stop.cancel();
        }
    }

    fn cancellation_error(&self) -> ClientError {
        self.session
            .lock()
            .last_transport_error
            .clone()
            .unwrap_or(ClientError::Cancelled)
    }

    /// Moves `from` to `Connecting` and installs the attempt's cancellation
    /// scope under the same lock, so a teardown that sees `Connecting` always
    /// finds the scope. `None` when another caller owns the transition or
    /// `stop` was cancelled.
    fn claim_connect(
        &self,
        token: &str,
        from: ConnectionState,
        stop: Option<&CancellationToken>,
    ) -> Option<CancellationToken> {
        let mut session = self.session.lock();
        if stop.is_some_and(CancellationToken::is_cancelled) {
            return None;
        }
        self.state
            .compare_exchange(
                from as u8,
                ConnectionState::Connecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok()?;
        let cancel = CancellationToken::new();
        session.token = Some(token.to_string());
        session.cancel = Some(cancel.clone());
        session.disconnect_reason = None;
        session.was_disconnect_unexpected = false;
        session.last_transport_error = None;
        session.reached_connected = false;
        self.connected.send_replace(false);
        self.disconnected.send_replace(false);
        Some(cancel)
    }

    async fn begin_connect(
        self: &Arc<Self>,
        token: &str,
        cancel: CancellationToken,
        reconnecting: bool,
    ) -> Result<()> {
        self.api.set_token(Some(token.to_string()));
        info!(reconnecting, "connecting");

        let result = self.open_session(token, &cancel).await;
        if let Err(err) = &result {
            warn!("connect failed: {err}");
            self.signal_disconnect(Some(err.clone()), reconnecting, true, Some(&cancel)).await;
        }
        result
    }

    async fn open_session(
        self: &Arc<Self>,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let gateway_url = tokio::select! {
            _ = cancel.cancelled() => return Err(self.cancellation_error()),
            url = self.api.gateway_url() => url.map_err(ClientError::request)?,
        };
        debug!(gateway_url = %gateway_url, "gateway endpoint resolved");
        self.session.lock().gateway_url = Some(gateway_url.clone());

        let events = tokio::select! {
            _ = cancel.cancelled() => return Err(self.cancellation_error()),
            events = self.gateway.connect(&gateway_url, token) => {
                events.map_err(ClientError::transport)?
            }
        };

        let started = {
            let mut session = self.session.lock();
            if cancel.is_cancelled() {
                false
            } else {
                let task = tokio::spawn(Arc::clone(self).run_loop(events, cancel.clone()))
                    .map(|_| ())
                    .boxed()
                    .shared();
                session.run_task = Some(task);
                true
            }
        };
        if !started {
            self.gateway.disconnect().await;
            return Err(self.cancellation_error());
        }

        let timeout = self.config.connect_timeout();
        let mut connected = self.connected.subscribe();
        tokio::select! {
            ready = connected.wait_for(|ready| *ready) => {
                ready.map(|_| ()).map_err(|_| ClientError::Cancelled)
            }
            _ = cancel.cancelled() => Err(self.cancellation_error()),
            _ = tokio::time::sleep(timeout) => Err(self
                .session
                .lock()
                .last_transport_error
                .clone()
                .unwrap_or(ClientError::Timeout(timeout))),
        }
    }

    fn end_connect(&self) {
        let promoted = self
            .state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Connected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if promoted {
            {
                let mut session = self.session.lock();
                session.reached_connected = true;
                session.reconnect_stop = None;
            }
            self.connected.send_replace(true);
            info!("connected");
            self.emit(ClientEvent::Connected);
        }
    }

    /// Whether this caller won the right to tear the session down.
    /// `None` when there is nothing to tear down.
    fn claim_teardown(&self) -> Option<bool> {
        for from in [ConnectionState::Connecting, ConnectionState::Connected] {
            match self.state.compare_exchange(
                from as u8,
                ConnectionState::Disconnecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(true),
                Err(current) if current == ConnectionState::Disconnected as u8 => return None,
                Err(_) => {}
            }
        }
        Some(false)
    }

    /// With a `scope`, only acts while that attempt is still live: a
    /// cancelled scope is already being torn down by whoever cancelled it.
    async fn signal_disconnect(
        self: &Arc<Self>,
        error: Option<ClientError>,
        unexpected: bool,
        wait: bool,
        scope: Option<&CancellationToken>,
    ) {
        let (won, run_task) = {
            let mut session = self.session.lock();
            if scope.is_some_and(CancellationToken::is_cancelled) {
                return;
            }
            let Some(won) = self.claim_teardown() else {
                return;
            };
            if won {
                session.was_disconnect_unexpected = unexpected;
                session.disconnect_reason = error;
                if let Some(cancel) = &session.cancel {
                    cancel.cancel();
                }
            }
            (won, session.run_task.clone())
        };

        match run_task {
            Some(task) if wait => task.await,
            Some(_) => {}
            None if won => self.finish_teardown().await,
            None => {}
        }
    }

    fn run_loop(
        self: Arc<Self>,
        events: GatewayEvents,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        async move {
            let mut tasks: JoinSet<Result<()>> = JoinSet::new();
            {
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    cancel.cancelled().await;
                    Ok(())
                });
            }
            {
                let client = Arc::clone(&self);
                let cancel = cancel.clone();
                tasks.spawn(async move { client.pump_events(events, &cancel).await });
            }
            if self.config.use_message_queue {
                let client = Arc::clone(&self);
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    client.flush_outbound(&cancel).await;
                    Ok(())
                });
            }

            match tasks.join_next().await {
                Some(Ok(Err(err))) => {
                    self.signal_disconnect(Some(err), true, false, Some(&cancel)).await
                }
                Some(Err(join_err)) => {
                    error!("session task failed: {join_err}");
                    let err = ClientError::Task(join_err.to_string());
                    self.signal_disconnect(Some(err), true, false, Some(&cancel)).await;
                }
                _ => {}
            }
            self.signal_disconnect(None, true, false, Some(&cancel)).await;
            cancel.cancel();
            while let Some(joined) = tasks.join_next().await {
                if let Err(join_err) = joined {
                    error!("session task failed during teardown: {join_err}");
                }
            }
            self.finish_teardown().await;
        }
        .boxed()
    }

    async fn pump_events(
        &self,
        mut events: GatewayEvents,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => event,
            };
            match event {
                Some(GatewayEvent::Dispatch {
                    event_type,
                    payload,
                }) => self.handle_dispatch(&event_type, payload),
                Some(GatewayEvent::Ready) => self.end_connect(),
                Some(GatewayEvent::Disconnected { error }) => {
                    let err = ClientError::Transport(
                        error.unwrap_or_else(|| "gateway closed the connection".to_string()),
                    );
                    self.session.lock().last_transport_error = Some(err.clone());
                    return Err(err);
                }
                None => {
                    let err = ClientError::Transport("gateway event stream ended".to_string());
                    self.session.lock().last_transport_error = Some(err.clone());
                    return Err(err);
                }
            }
        }
    }

    async fn flush_outbound(&self, cancel: &CancellationToken) {
        let retry_delay = self.config.queue_retry_delay();
        self.outbound
            .run(self.api.as_ref(), cancel, retry_delay, |item, confirmed| {
                // The send response confirms the id even if the echo never arrives.
                let message = {
                    let mut cache = self.cache.lock();
                    match cache.messages.lookup(confirmed.id).cloned() {
                        Some(message) => Some(message),
                        None => cache.messages.remap(item.nonce, confirmed.id).map(|message| {
                            message.update(confirmed);
                            message.state = MessageState::Normal;
                            message.clone()
                        }),
                    }
                };
                if let Some(message) = message {
                    self.emit(ClientEvent::MessageSent { message });
                }
            })
            .await;
    }

    async fn finish_teardown(self: &Arc<Self>) {
        self.gateway.disconnect().await;

        let (unexpected, reason, token, reconnect_active, reached_connected) = {
            let mut session = self.session.lock();
            let unexpected = std::mem::take(&mut session.was_disconnect_unexpected);
            let reason = session.disconnect_reason.take();
            let token = session.token.take();
            let reconnect_active = session
                .reconnect_stop
                .as_ref()
                .is_some_and(|stop| !stop.is_cancelled());
            let reached_connected = session.reached_connected;
            session.gateway_url = None;
            session.current_user = None;
            session.cancel = None;
            session.run_task = None;
            (unexpected, reason, token, reconnect_active, reached_connected)
        };
        self.connected.send_replace(false);
        self.cache.clear_session();

        let reconnecting = unexpected && self.config.auto_reconnect;
        // Registered before the event goes out so a disconnect() reacting to
        // it can stop the loop.
        let reconnect = token
            .filter(|_| reconnecting && reached_connected && !reconnect_active)
            .map(|token| {
                let stop = CancellationToken::new();
                let mut session = self.session.lock();
                session.reconnect_generation += 1;
                session.reconnect_stop = Some(stop.clone());
                (token, stop, session.reconnect_generation)
            });

        match &reason {
            Some(err) => info!(was_unexpected = unexpected, "disconnected: {err}"),
            None => info!(was_unexpected = unexpected, "disconnected"),
        }
        self.emit(ClientEvent::Disconnected {
            was_unexpected: unexpected,
            error: reason,
        });

        if let Some((token, stop, generation)) = reconnect {
            tokio::spawn(Arc::clone(self).reconnect_loop(token, stop, generation));
        } else if !(reconnecting && reconnect_active) {
            self.mark_disconnected();
        }
    }

    fn mark_disconnected(&self) {
        self.state
            .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
        self.disconnected.send_replace(true);
    }

    fn reconnect_loop(
        self: Arc<Self>,
        token: String,
        stop: CancellationToken,
        generation: u64,
    ) -> BoxFuture<'static, ()> {
        async move {
            let max_attempts = self.config.max_reconnect_attempts;
            let max_delay = self.config.max_reconnect_delay();
            let mut delay = self.config.reconnect_delay();
            let mut attempt = 0u32;
            let reconnected = loop {
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = stop.cancelled() => break false,
                    _ = tokio::time::sleep(delay) => {}
                }
                let Some(cancel) =
                    self.claim_connect(&token, ConnectionState::Disconnecting, Some(&stop))
                else {
                    break false;
                };
                info!(attempt, "reconnecting");
                match self.begin_connect(&token, cancel, true).await {
                    Ok(()) => break true,
                    Err(err) => warn!(attempt, "reconnect attempt failed: {err}"),
                }
                if stop.is_cancelled() || (max_attempts > 0 && attempt >= max_attempts) {
                    break false;
                }
                delay = delay.saturating_mul(2).min(max_delay);
            };

            {
                let mut session = self.session.lock();
                if session.reconnect_generation == generation {
                    session.reconnect_stop = None;
                }
            }
            if reconnected {
                info!(attempt, "reconnected");
                return;
            }
            info!(attempt, "giving up on reconnecting");
            let settled = self
                .state
                .compare_exchange(
                    ConnectionState::Disconnecting as u8,
                    ConnectionState::Disconnected as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok();
            if settled {
                self.disconnected.send_replace(true);
            }
        }
        .boxed()
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
