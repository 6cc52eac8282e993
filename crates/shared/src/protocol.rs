use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::{ChannelId, ChannelKind, GuildId, MessageId, RoleId, UserId, UserStatus};

pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// One gateway frame. `t` and `s` are only present on dispatch frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayFrame {
    pub fn new(op: u8, d: Value) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }

    pub fn dispatch(event_type: impl Into<String>, seq: u64, d: Value) -> Self {
        Self {
            op: opcode::DISPATCH,
            d,
            s: Some(seq),
            t: Some(event_type.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub properties: ConnectionProperties,
    #[serde(default)]
    pub large_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProperties {
    #[serde(rename = "$os")]
    pub os: String,
    #[serde(rename = "$browser")]
    pub browser: String,
    #[serde(rename = "$device")]
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserModel {
    pub id: UserId,
    pub username: Option<String>,
    pub discriminator: Option<String>,
    pub avatar: Option<String>,
    pub bot: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleModel {
    pub id: RoleId,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub permissions: u64,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub hoist: bool,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub managed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelModel {
    pub id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub recipient: Option<UserModel>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub position: i32,
}

impl ChannelModel {
    pub fn is_private(&self) -> bool {
        self.guild_id.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemberModel {
    pub user: UserModel,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Option<Vec<RoleId>>,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mute: Option<bool>,
    #[serde(default)]
    pub deaf: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Game {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceModel {
    pub user: UserModel,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default)]
    pub game: Option<Game>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceStateModel {
    pub user_id: UserId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub deaf: bool,
    #[serde(default)]
    pub suppress: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuildModel {
    pub id: GuildId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub unavailable: Option<bool>,
    #[serde(default)]
    pub owner_id: Option<UserId>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub roles: Vec<RoleModel>,
    #[serde(default)]
    pub channels: Vec<ChannelModel>,
    #[serde(default)]
    pub members: Vec<MemberModel>,
    #[serde(default)]
    pub presences: Vec<PresenceModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyEvent {
    #[serde(default)]
    pub v: u32,
    pub user: UserModel,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub guilds: Vec<GuildModel>,
    #[serde(default)]
    pub private_channels: Vec<ChannelModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildDeleteEvent {
    pub id: GuildId,
    #[serde(default)]
    pub unavailable: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRemoveEvent {
    pub guild_id: GuildId,
    pub user: UserModel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersChunkEvent {
    pub guild_id: GuildId,
    #[serde(default)]
    pub members: Vec<MemberModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleEvent {
    pub guild_id: GuildId,
    pub role: RoleModel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleDeleteEvent {
    pub guild_id: GuildId,
    pub role_id: RoleId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanEvent {
    pub guild_id: GuildId,
    #[serde(default)]
    pub user: Option<UserModel>,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

impl BanEvent {
    pub fn target(&self) -> Option<UserId> {
        self.user.as_ref().map(|user| user.id).or(self.user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageModel {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author: UserModel,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub nonce: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub edited_timestamp: Option<DateTime<Utc>>,
}

impl MessageModel {
    /// Nonces arrive as strings or numbers; anything unparsable counts as absent.
    pub fn nonce_value(&self) -> Option<u64> {
        match self.nonce.as_ref()? {
            Value::String(raw) => raw.parse().ok(),
            Value::Number(raw) => raw.as_u64(),
            _ => None,
        }
        .filter(|nonce| *nonce != 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageUpdateEvent {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub edited_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeleteEvent {
    pub id: MessageId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAckEvent {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingStartEvent {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayUrlResponse {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

fn flexible_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(raw) => raw
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom("expected an unsigned integer")),
        Value::String(raw) => raw.parse().map_err(serde::de::Error::custom),
        Value::Null => Ok(0),
        other => Err(serde::de::Error::custom(format!(
            "expected integer or string, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_nonce_accepts_string_and_number() {
        let mut message: MessageModel = serde_json::from_value(serde_json::json!({
            "id": "10",
            "channel_id": "20",
            "author": { "id": "30" },
            "content": "hi",
            "nonce": "42",
        }))
        .expect("message");
        assert_eq!(message.nonce_value(), Some(42));

        message.nonce = Some(serde_json::json!(43));
        assert_eq!(message.nonce_value(), Some(43));

        message.nonce = Some(serde_json::json!("abc"));
        assert_eq!(message.nonce_value(), None);
    }

    #[test]
    fn role_permissions_accept_strings() {
        let role: RoleModel = serde_json::from_value(serde_json::json!({
            "id": "5",
            "name": "mods",
            "permissions": "2146958591",
        }))
        .expect("role");
        assert_eq!(role.permissions, 2_146_958_591);
    }

    #[test]
    fn ban_target_prefers_user_object() {
        let ban: BanEvent = serde_json::from_value(serde_json::json!({
            "guild_id": "1",
            "user": { "id": "2" },
            "user_id": "3",
        }))
        .expect("ban");
        assert_eq!(ban.target(), Some(UserId(2)));
    }
}
