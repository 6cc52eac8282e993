//! Entity records owned by the cache. Relationships are stored ids, resolved
//! through cache lookups.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelId, ChannelKind, GuildId, MessageId, RoleId, UserId, UserStatus},
    protocol::{
        ChannelModel, GuildModel, MemberModel, MessageModel, MessageUpdateEvent, PresenceModel,
        RoleModel, UserModel, VoiceStateModel,
    },
};

/// Composite key of a membership. `guild_id` is `None` for users only known
/// through private channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberKey {
    pub user_id: UserId,
    pub guild_id: Option<GuildId>,
}

impl MemberKey {
    pub fn new(user_id: UserId, guild_id: Option<GuildId>) -> Self {
        Self { user_id, guild_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub id: GuildId,
    pub name: String,
    pub available: bool,
    pub owner_id: Option<UserId>,
    pub region: Option<String>,
    pub role_ids: BTreeSet<RoleId>,
    pub bans: HashSet<UserId>,
    pub channel_ids: BTreeSet<ChannelId>,
}

impl Server {
    pub fn new(id: GuildId) -> Self {
        Self {
            id,
            name: String::new(),
            available: true,
            owner_id: None,
            region: None,
            role_ids: BTreeSet::new(),
            bans: HashSet::new(),
            channel_ids: BTreeSet::new(),
        }
    }

    pub fn update(&mut self, model: &GuildModel) {
        if let Some(name) = &model.name {
            self.name = name.clone();
        }
        if model.owner_id.is_some() {
            self.owner_id = model.owner_id;
        }
        if model.region.is_some() {
            self.region = model.region.clone();
        }
        self.available = model.unavailable != Some(true);
    }

    pub fn add_ban(&mut self, user_id: UserId) {
        self.bans.insert(user_id);
    }

    /// Returns `true` only when a ban was present and is now gone.
    pub fn remove_ban(&mut self, user_id: UserId) -> bool {
        self.bans.remove(&user_id)
    }

    pub fn is_banned(&self, user_id: UserId) -> bool {
        self.bans.contains(&user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub recipient_id: Option<UserId>,
    pub name: String,
    pub kind: ChannelKind,
    pub topic: Option<String>,
    pub position: i32,
}

impl Channel {
    pub fn new(id: ChannelId, guild_id: Option<GuildId>, recipient_id: Option<UserId>) -> Self {
        Self {
            id,
            guild_id,
            recipient_id,
            name: String::new(),
            kind: ChannelKind::Text,
            topic: None,
            position: 0,
        }
    }

    pub fn is_private(&self) -> bool {
        self.guild_id.is_none()
    }

    pub fn update(&mut self, model: &ChannelModel) {
        if let Some(name) = &model.name {
            self.name = name.clone();
        }
        self.kind = model.kind;
        self.topic = model.topic.clone();
        self.position = model.position;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceState {
    pub channel_id: Option<ChannelId>,
    pub session_id: String,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub mute: bool,
    pub deaf: bool,
    pub suppress: bool,
}

/// A user as seen inside one server (or the private scope).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub key: MemberKey,
    pub nickname: Option<String>,
    pub role_ids: BTreeSet<RoleId>,
    pub joined_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub voice: VoiceState,
}

impl Member {
    pub fn new(key: MemberKey) -> Self {
        Self {
            key,
            nickname: None,
            role_ids: BTreeSet::new(),
            joined_at: None,
            last_activity: None,
            voice: VoiceState::default(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.key.user_id
    }

    pub fn guild_id(&self) -> Option<GuildId> {
        self.key.guild_id
    }

    pub fn update(&mut self, model: &MemberModel) {
        if model.nick.is_some() {
            self.nickname = model.nick.clone();
        }
        if let Some(roles) = &model.roles {
            self.role_ids = roles.iter().copied().collect();
        }
        if model.joined_at.is_some() {
            self.joined_at = model.joined_at;
        }
        if let Some(mute) = model.mute {
            self.voice.mute = mute;
        }
        if let Some(deaf) = model.deaf {
            self.voice.deaf = deaf;
        }
    }

    pub fn update_voice(&mut self, model: &VoiceStateModel) {
        self.voice = VoiceState {
            channel_id: model.channel_id,
            session_id: model.session_id.clone(),
            self_mute: model.self_mute,
            self_deaf: model.self_deaf,
            mute: model.mute,
            deaf: model.deaf,
            suppress: model.suppress,
        };
    }

    pub fn mark_activity(&mut self, at: DateTime<Utc>) {
        if self.last_activity.map_or(true, |last| last < at) {
            self.last_activity = Some(at);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presence {
    pub status: UserStatus,
    pub game: Option<String>,
}

/// Account-wide profile shared by every membership of the same user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalUser {
    pub id: UserId,
    pub username: String,
    pub discriminator: String,
    pub avatar: Option<String>,
    pub bot: bool,
    pub presence: Presence,
    pub memberships: BTreeSet<MemberKey>,
}

impl GlobalUser {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            username: String::new(),
            discriminator: String::new(),
            avatar: None,
            bot: false,
            presence: Presence::default(),
            memberships: BTreeSet::new(),
        }
    }

    pub fn update(&mut self, model: &UserModel) {
        if let Some(username) = &model.username {
            self.username = username.clone();
        }
        if let Some(discriminator) = &model.discriminator {
            self.discriminator = discriminator.clone();
        }
        if model.avatar.is_some() {
            self.avatar = model.avatar.clone();
        }
        if let Some(bot) = model.bot {
            self.bot = bot;
        }
    }

    pub fn update_presence(&mut self, model: &PresenceModel) {
        self.presence = Presence {
            status: model.status,
            game: model.game.as_ref().map(|game| game.name.clone()),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub id: RoleId,
    pub guild_id: GuildId,
    pub name: String,
    pub permissions: u64,
    pub color: u32,
    pub hoist: bool,
    pub position: i32,
    pub managed: bool,
}

impl Role {
    pub fn new(id: RoleId, guild_id: GuildId) -> Self {
        Self {
            id,
            guild_id,
            name: String::new(),
            permissions: 0,
            color: 0,
            hoist: false,
            position: 0,
            managed: false,
        }
    }

    pub fn update(&mut self, model: &RoleModel) {
        self.name = model.name.clone();
        self.permissions = model.permissions;
        self.color = model.color;
        self.hoist = model.hoist;
        self.position = model.position;
        self.managed = model.managed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Composed locally, not yet echoed back by the server.
    Pending,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// `MessageId(0)` until the server confirms the message.
    pub id: MessageId,
    /// 0 when the message did not originate from the outbound queue.
    pub nonce: u64,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub edited_timestamp: Option<DateTime<Utc>>,
    pub state: MessageState,
}

impl Message {
    pub fn confirmed(id: MessageId, channel_id: ChannelId, author_id: UserId) -> Self {
        Self {
            id,
            nonce: 0,
            channel_id,
            author_id,
            content: String::new(),
            timestamp: None,
            edited_timestamp: None,
            state: MessageState::Normal,
        }
    }

    pub fn pending(nonce: u64, channel_id: ChannelId, author_id: UserId, content: String) -> Self {
        Self {
            id: MessageId(0),
            nonce,
            channel_id,
            author_id,
            content,
            timestamp: None,
            edited_timestamp: None,
            state: MessageState::Pending,
        }
    }

    pub fn update(&mut self, model: &MessageModel) {
        self.content = model.content.clone();
        self.author_id = model.author.id;
        if model.timestamp.is_some() {
            self.timestamp = model.timestamp;
        }
        if model.edited_timestamp.is_some() {
            self.edited_timestamp = model.edited_timestamp;
        }
    }

    pub fn apply_edit(&mut self, model: &MessageUpdateEvent) {
        if let Some(content) = &model.content {
            self.content = content.clone();
        }
        if model.edited_timestamp.is_some() {
            self.edited_timestamp = model.edited_timestamp;
        }
    }
}
