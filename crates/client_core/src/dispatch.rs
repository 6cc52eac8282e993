//! Applies gateway dispatches to the cache and turns them into [`ClientEvent`]s.
//!
//! Each handler mutates the cache under one lock acquisition, snapshots what
//! the event needs and releases the lock before the event goes out.

use chrono::{TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::GuildId,
    protocol::{
        BanEvent, ChannelModel, GuildDeleteEvent, GuildModel, MemberModel, MemberRemoveEvent,
        MembersChunkEvent, MessageAckEvent, MessageDeleteEvent, MessageModel, MessageUpdateEvent,
        PresenceModel, ReadyEvent, RoleDeleteEvent, RoleEvent, TypingStartEvent, UserModel,
        VoiceStateModel,
    },
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    cache::CacheState,
    error::{ClientError, Result},
    types::{Channel, MemberKey, MessageState, Role, Server},
    ClientEvent, RealtimeClient,
};

const IGNORED_EVENTS: &[&str] = &[
    "USER_SETTINGS_UPDATE",
    "GUILD_INTEGRATIONS_UPDATE",
    "VOICE_SERVER_UPDATE",
    "RESUMED",
];

fn decode<T: DeserializeOwned>(event_type: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|err| ClientError::protocol(event_type, err))
}

fn handler_error(event_type: &str, message: impl Into<String>) -> ClientError {
    ClientError::Handler {
        event_type: event_type.to_string(),
        message: message.into(),
    }
}

fn server_of(cache: &CacheState, guild_id: Option<GuildId>) -> Option<Server> {
    guild_id.and_then(|guild_id| cache.servers.lookup(guild_id).cloned())
}

/// Upserts a server and everything embedded in its payload.
fn upsert_guild(cache: &mut CacheState, model: &GuildModel) -> Server {
    let guild_id = model.id;
    cache
        .servers
        .upsert(guild_id, || Server::new(guild_id), |server| {
            server.update(model);
            server.role_ids.extend(model.roles.iter().map(|role| role.id));
            server
                .channel_ids
                .extend(model.channels.iter().map(|channel| channel.id));
        });
    for role in &model.roles {
        cache
            .roles
            .upsert(role.id, || Role::new(role.id, guild_id), |cached| cached.update(role));
    }
    for channel in &model.channels {
        cache.channels.upsert(
            channel.id,
            || Channel::new(channel.id, Some(guild_id), None),
            |cached| cached.update(channel),
        );
    }
    for member in &model.members {
        let key = MemberKey::new(member.user.id, Some(guild_id));
        cache.upsert_member(key, &member.user, |cached| cached.update(member));
    }
    for presence in &model.presences {
        if let Some(global) = cache.global_users.lookup_mut(presence.user.id) {
            global.update_presence(presence);
        }
    }
    server_of(cache, Some(guild_id)).unwrap_or_else(|| Server::new(guild_id))
}

impl RealtimeClient {
    /// Applies one dispatch. Failures are logged and never stop the pump.
    pub(crate) fn handle_dispatch(&self, event_type: &str, payload: Value) {
        match self.apply_dispatch(event_type, payload) {
            Ok(Some(event)) => self.emit(event),
            Ok(None) => {}
            Err(err) => error!(event_type, "dispatch failed: {err}"),
        }
    }

    fn apply_dispatch(&self, event_type: &str, payload: Value) -> Result<Option<ClientEvent>> {
        match event_type {
            "READY" => self.on_ready(decode(event_type, payload)?),

            "GUILD_CREATE" => Ok(self.on_guild_create(decode(event_type, payload)?)),
            "GUILD_UPDATE" => {
                let data: GuildModel = decode(event_type, payload)?;
                let mut cache = self.cache.lock();
                Ok(cache.servers.lookup_mut(data.id).map(|server| {
                    server.update(&data);
                    ClientEvent::ServerUpdated(server.clone())
                }))
            }
            "GUILD_DELETE" => {
                let data: GuildDeleteEvent = decode(event_type, payload)?;
                let keep = self.current_user_id();
                let removed = self.cache.lock().remove_server(data.id, keep);
                Ok(removed.map(|server| {
                    if data.unavailable == Some(true) {
                        ClientEvent::ServerUnavailable(server)
                    } else {
                        ClientEvent::LeftServer(server)
                    }
                }))
            }

            "CHANNEL_CREATE" => self
                .on_channel_create(event_type, decode(event_type, payload)?)
                .map(Some),
            "CHANNEL_UPDATE" => {
                let data: ChannelModel = decode(event_type, payload)?;
                let mut cache = self.cache.lock();
                let Some(channel) = cache.channels.lookup_mut(data.id) else {
                    return Ok(None);
                };
                channel.update(&data);
                let channel = channel.clone();
                let server = cache.channel_server(&channel);
                Ok(Some(ClientEvent::ChannelUpdated { server, channel }))
            }
            "CHANNEL_DELETE" => {
                let data: ChannelModel = decode(event_type, payload)?;
                let mut cache = self.cache.lock();
                let Some(channel) = cache.channels.try_remove(data.id) else {
                    return Ok(None);
                };
                if let Some(guild_id) = channel.guild_id {
                    if let Some(server) = cache.servers.lookup_mut(guild_id) {
                        server.channel_ids.remove(&channel.id);
                    }
                }
                let server = cache.channel_server(&channel);
                Ok(Some(ClientEvent::ChannelDestroyed { server, channel }))
            }

            "GUILD_MEMBER_ADD" => {
                let data: MemberModel = decode(event_type, payload)?;
                let guild_id = data
                    .guild_id
                    .ok_or_else(|| handler_error(event_type, "member payload without guild_id"))?;
                let key = MemberKey::new(data.user.id, Some(guild_id));
                let mut cache = self.cache.lock();
                let user = cache
                    .upsert_member(key, &data.user, |member| {
                        member.update(&data);
                        member.mark_activity(Utc::now());
                    })
                    .clone();
                let server = server_of(&cache, Some(guild_id));
                Ok(Some(ClientEvent::UserJoined { server, user }))
            }
            "GUILD_MEMBER_UPDATE" => {
                let data: MemberModel = decode(event_type, payload)?;
                let guild_id = data
                    .guild_id
                    .ok_or_else(|| handler_error(event_type, "member payload without guild_id"))?;
                let mut cache = self.cache.lock();
                let Some(member) = cache
                    .users
                    .lookup_mut(MemberKey::new(data.user.id, Some(guild_id)))
                else {
                    return Ok(None);
                };
                member.update(&data);
                let user = member.clone();
                if let Some(global) = cache.global_users.lookup_mut(data.user.id) {
                    global.update(&data.user);
                }
                let server = server_of(&cache, Some(guild_id));
                Ok(Some(ClientEvent::UserUpdated { server, user }))
            }
            "GUILD_MEMBER_REMOVE" => {
                let data: MemberRemoveEvent = decode(event_type, payload)?;
                let keep = self.current_user_id();
                let mut cache = self.cache.lock();
                let key = MemberKey::new(data.user.id, Some(data.guild_id));
                let Some(user) = cache.remove_member(key, keep) else {
                    return Ok(None);
                };
                let server = server_of(&cache, Some(data.guild_id));
                Ok(Some(ClientEvent::UserLeft { server, user }))
            }
            "GUILD_MEMBERS_CHUNK" => {
                let data: MembersChunkEvent = decode(event_type, payload)?;
                let mut cache = self.cache.lock();
                for member in &data.members {
                    let key = MemberKey::new(member.user.id, Some(data.guild_id));
                    cache.upsert_member(key, &member.user, |cached| cached.update(member));
                }
                debug!(
                    guild_id = data.guild_id.0,
                    members = data.members.len(),
                    "member chunk applied"
                );
                Ok(None)
            }

            "GUILD_ROLE_CREATE" => {
                let data: RoleEvent = decode(event_type, payload)?;
                let mut cache = self.cache.lock();
                let role = cache
                    .roles
                    .upsert(
                        data.role.id,
                        || Role::new(data.role.id, data.guild_id),
                        |role| role.update(&data.role),
                    )
                    .clone();
                Ok(cache.servers.lookup_mut(data.guild_id).map(|server| {
                    server.role_ids.insert(role.id);
                    ClientEvent::RoleCreated {
                        server: server.clone(),
                        role,
                    }
                }))
            }
            "GUILD_ROLE_UPDATE" => {
                let data: RoleEvent = decode(event_type, payload)?;
                let mut cache = self.cache.lock();
                let Some(role) = cache.roles.lookup_mut(data.role.id) else {
                    return Ok(None);
                };
                role.update(&data.role);
                let role = role.clone();
                let server = server_of(&cache, Some(data.guild_id));
                Ok(Some(ClientEvent::RoleUpdated { server, role }))
            }
            "GUILD_ROLE_DELETE" => {
                let data: RoleDeleteEvent = decode(event_type, payload)?;
                let mut cache = self.cache.lock();
                let Some(role) = cache.roles.try_remove(data.role_id) else {
                    return Ok(None);
                };
                let server = cache.servers.lookup_mut(data.guild_id).map(|server| {
                    server.role_ids.remove(&role.id);
                    server.clone()
                });
                Ok(Some(ClientEvent::RoleDeleted { server, role }))
            }

            "GUILD_BAN_ADD" => {
                let data: BanEvent = decode(event_type, payload)?;
                let user_id = data
                    .target()
                    .ok_or_else(|| handler_error(event_type, "ban payload without user"))?;
                let mut cache = self.cache.lock();
                Ok(cache.servers.lookup_mut(data.guild_id).map(|server| {
                    server.add_ban(user_id);
                    ClientEvent::UserBanned {
                        user_id,
                        server: server.clone(),
                    }
                }))
            }
            "GUILD_BAN_REMOVE" => {
                let data: BanEvent = decode(event_type, payload)?;
                let user_id = data
                    .target()
                    .ok_or_else(|| handler_error(event_type, "ban payload without user"))?;
                let mut cache = self.cache.lock();
                let Some(server) = cache.servers.lookup_mut(data.guild_id) else {
                    return Ok(None);
                };
                if !server.remove_ban(user_id) {
                    return Ok(None);
                }
                Ok(Some(ClientEvent::UserUnbanned {
                    user_id,
                    server: server.clone(),
                }))
            }

            "MESSAGE_CREATE" => Ok(Some(self.on_message_create(decode(event_type, payload)?))),
            "MESSAGE_UPDATE" => {
                let data: MessageUpdateEvent = decode(event_type, payload)?;
                let mut cache = self.cache.lock();
                let Some(message) = cache.messages.lookup_mut(data.id) else {
                    return Ok(None);
                };
                message.apply_edit(&data);
                message.state = MessageState::Normal;
                let message = message.clone();
                let channel = cache.channels.lookup(message.channel_id).cloned();
                let server = channel.as_ref().and_then(|channel| cache.channel_server(channel));
                Ok(Some(ClientEvent::MessageUpdated {
                    server,
                    channel,
                    message,
                }))
            }
            "MESSAGE_DELETE" => {
                let data: MessageDeleteEvent = decode(event_type, payload)?;
                let mut cache = self.cache.lock();
                let Some(message) = cache.messages.try_remove(data.id) else {
                    return Ok(None);
                };
                let channel = cache.channels.lookup(message.channel_id).cloned();
                let server = channel.as_ref().and_then(|channel| cache.channel_server(channel));
                Ok(Some(ClientEvent::MessageDeleted {
                    server,
                    channel,
                    message,
                }))
            }
            "MESSAGE_ACK" => {
                let data: MessageAckEvent = decode(event_type, payload)?;
                let cache = self.cache.lock();
                let Some(message) = cache.messages.lookup(data.message_id).cloned() else {
                    return Ok(None);
                };
                let channel = cache.channels.lookup(data.channel_id).cloned();
                let server = channel.as_ref().and_then(|channel| cache.channel_server(channel));
                Ok(Some(ClientEvent::MessageAcknowledged {
                    server,
                    channel,
                    message,
                }))
            }

            "PRESENCE_UPDATE" => {
                let data: PresenceModel = decode(event_type, payload)?;
                let key = MemberKey::new(data.user.id, data.guild_id);
                let mut cache = self.cache.lock();
                let Some(user) = cache.users.lookup(key).cloned() else {
                    return Ok(None);
                };
                if let Some(global) = cache.global_users.lookup_mut(data.user.id) {
                    global.update(&data.user);
                    global.update_presence(&data);
                }
                let server = server_of(&cache, data.guild_id);
                Ok(Some(ClientEvent::UserPresenceUpdated { server, user }))
            }
            "TYPING_START" => {
                let data: TypingStartEvent = decode(event_type, payload)?;
                let mut cache = self.cache.lock();
                let Some(channel) = cache.channels.lookup(data.channel_id).cloned() else {
                    return Ok(None);
                };
                let at = data
                    .timestamp
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                    .unwrap_or_else(Utc::now);
                let Some(member) = cache
                    .users
                    .lookup_mut(MemberKey::new(data.user_id, channel.guild_id))
                else {
                    return Ok(None);
                };
                member.mark_activity(at);
                let user = member.clone();
                let server = cache.channel_server(&channel);
                Ok(Some(ClientEvent::UserIsTypingUpdated {
                    server,
                    channel,
                    user,
                }))
            }
            "VOICE_STATE_UPDATE" => {
                let data: VoiceStateModel = decode(event_type, payload)?;
                let mut cache = self.cache.lock();
                let Some(member) = cache
                    .users
                    .lookup_mut(MemberKey::new(data.user_id, data.guild_id))
                else {
                    return Ok(None);
                };
                member.update_voice(&data);
                let user = member.clone();
                let server = server_of(&cache, data.guild_id);
                Ok(Some(ClientEvent::UserVoiceStateUpdated { server, user }))
            }
            "USER_UPDATE" => {
                let data: UserModel = decode(event_type, payload)?;
                let mut cache = self.cache.lock();
                let memberships = match cache.global_users.lookup_mut(data.id) {
                    Some(global) => {
                        global.update(&data);
                        global.memberships.clone()
                    }
                    None => return Ok(None),
                };
                // Memberships whose wrapper is gone no longer back this profile.
                let stale: Vec<MemberKey> = memberships
                    .into_iter()
                    .filter(|key| !cache.users.contains(*key))
                    .collect();
                let Some(global) = cache.global_users.lookup_mut(data.id) else {
                    return Ok(None);
                };
                for key in &stale {
                    global.memberships.remove(key);
                }
                Ok(Some(ClientEvent::ProfileUpdated(global.clone())))
            }

            ignored if IGNORED_EVENTS.contains(&ignored) => {
                trace!(event_type, "ignoring dispatch");
                Ok(None)
            }
            unknown => {
                warn!(event_type = unknown, "unknown dispatch event");
                Ok(None)
            }
        }
    }

    fn on_ready(&self, data: ReadyEvent) -> Result<Option<ClientEvent>> {
        let current_user = data.user.id;
        self.session.lock().current_user = Some(current_user);

        let mut cache = self.cache.lock();
        cache.upsert_member(MemberKey::new(current_user, None), &data.user, |_| {});
        let mut servers = 0usize;
        for guild in data.guilds.iter().filter(|guild| guild.unavailable != Some(true)) {
            upsert_guild(&mut cache, guild);
            servers += 1;
        }
        let mut private_channels = 0usize;
        for channel in &data.private_channels {
            let Some(recipient) = &channel.recipient else {
                warn!(channel_id = channel.id.0, "private channel without recipient");
                continue;
            };
            cache.upsert_member(MemberKey::new(recipient.id, None), recipient, |_| {});
            cache.channels.upsert(
                channel.id,
                || Channel::new(channel.id, None, Some(recipient.id)),
                |cached| cached.update(channel),
            );
            private_channels += 1;
        }
        drop(cache);

        info!(
            user_id = current_user.0,
            servers, private_channels, "session ready"
        );
        Ok(None)
    }

    fn on_guild_create(&self, data: GuildModel) -> Option<ClientEvent> {
        let mut cache = self.cache.lock();
        if data.unavailable == Some(true) {
            cache
                .servers
                .upsert(data.id, || Server::new(data.id), |server| server.update(&data));
            debug!(guild_id = data.id.0, "server unavailable");
            return None;
        }
        let was_unavailable = data.unavailable == Some(false)
            || cache
                .servers
                .lookup(data.id)
                .is_some_and(|server| !server.available);
        let server = upsert_guild(&mut cache, &data);
        Some(if was_unavailable {
            ClientEvent::ServerAvailable(server)
        } else {
            ClientEvent::JoinedServer(server)
        })
    }

    fn on_channel_create(&self, event_type: &str, data: ChannelModel) -> Result<ClientEvent> {
        let mut cache = self.cache.lock();
        let channel = match data.guild_id {
            None => {
                let recipient = data
                    .recipient
                    .as_ref()
                    .ok_or_else(|| handler_error(event_type, "private channel without recipient"))?;
                cache.upsert_member(MemberKey::new(recipient.id, None), recipient, |_| {});
                cache
                    .channels
                    .upsert(
                        data.id,
                        || Channel::new(data.id, None, Some(recipient.id)),
                        |channel| channel.update(&data),
                    )
                    .clone()
            }
            Some(guild_id) => {
                cache
                    .servers
                    .get_or_add(guild_id, || Server::new(guild_id))
                    .channel_ids
                    .insert(data.id);
                cache
                    .channels
                    .upsert(
                        data.id,
                        || Channel::new(data.id, Some(guild_id), None),
                        |channel| channel.update(&data),
                    )
                    .clone()
            }
        };
        let server = cache.channel_server(&channel);
        Ok(ClientEvent::ChannelCreated { server, channel })
    }

    fn on_message_create(&self, data: MessageModel) -> ClientEvent {
        let current_user = self.current_user_id();
        let mut cache = self.cache.lock();

        let own_nonce = if self.config.use_message_queue && Some(data.author.id) == current_user {
            data.nonce_value()
                .filter(|nonce| cache.messages.lookup_pending(*nonce).is_some())
        } else {
            None
        };
        let reconciled = own_nonce.and_then(|nonce| {
            cache.outbound.retain(|queued| queued.nonce != nonce);
            cache.messages.remap(nonce, data.id).map(|message| {
                message.update(&data);
                message.state = MessageState::Normal;
                message.clone()
            })
        });
        let message = match reconciled {
            Some(message) => message,
            None => cache
                .messages
                .upsert(data.id, data.channel_id, data.author.id, |message| {
                    message.update(&data);
                    message.state = MessageState::Normal;
                })
                .clone(),
        };

        let channel = cache.channels.lookup(data.channel_id).cloned();
        let scope = channel.as_ref().and_then(|channel| channel.guild_id);
        if let Some(author) = cache
            .users
            .lookup_mut(MemberKey::new(data.author.id, scope))
        {
            author.mark_activity(data.timestamp.unwrap_or_else(Utc::now));
        }
        let server = channel.as_ref().and_then(|channel| cache.channel_server(channel));
        ClientEvent::MessageReceived {
            server,
            channel,
            message,
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
