//! Entity cache: one arena per entity kind, all behind a single lock.
//!
//! Handlers routinely touch two stores in one step (a role and its server, a
//! membership and its global user), so every store and the outbound queue live
//! in one [`CacheState`] guarded by one mutex. Reads from application code take
//! the same lock.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    hash::Hash,
};

use parking_lot::{Mutex, MutexGuard};
use shared::{
    domain::{ChannelId, GuildId, MessageId, RoleId, UserId},
    protocol::UserModel,
};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    message_queue::QueuedMessage,
    types::{Channel, GlobalUser, Member, MemberKey, Message, Role, Server},
};

const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Servers,
    Channels,
    Users,
    GlobalUsers,
    Roles,
    Messages,
}

/// Printable identity of a cached record, used in notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKey {
    Id(u64),
    Scoped { id: u64, scope: Option<u64> },
    Nonce(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    Created(EntityKey),
    Destroyed(EntityKey),
    Remapped { nonce: u64, id: MessageId },
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNotification {
    pub store: StoreKind,
    pub change: CacheChange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub servers: usize,
    pub channels: usize,
    pub users: usize,
    pub global_users: usize,
    pub roles: usize,
    pub messages: usize,
    pub pending_messages: usize,
    pub queued_outbound: usize,
}

pub trait StoreKey: Copy + Eq + Hash + fmt::Debug {
    fn entity_key(self) -> EntityKey;
}

macro_rules! plain_store_key {
    ($($name:ty),*) => {
        $(impl StoreKey for $name {
            fn entity_key(self) -> EntityKey {
                EntityKey::Id(self.0)
            }
        })*
    };
}

plain_store_key!(GuildId, ChannelId, UserId, RoleId, MessageId);

impl StoreKey for MemberKey {
    fn entity_key(self) -> EntityKey {
        EntityKey::Scoped {
            id: self.user_id.0,
            scope: self.guild_id.map(|id| id.0),
        }
    }
}

#[derive(Clone)]
struct Notifier {
    store: StoreKind,
    tx: broadcast::Sender<CacheNotification>,
}

impl Notifier {
    fn send(&self, change: CacheChange) {
        debug!(store = ?self.store, change = ?change, "cache");
        let _ = self.tx.send(CacheNotification {
            store: self.store,
            change,
        });
    }
}

/// Keyed arena for one entity kind.
pub struct Store<K, V> {
    items: HashMap<K, V>,
    notifier: Notifier,
}

impl<K: StoreKey, V> Store<K, V> {
    fn new(store: StoreKind, tx: broadcast::Sender<CacheNotification>) -> Self {
        Self {
            items: HashMap::new(),
            notifier: Notifier { store, tx },
        }
    }

    /// Returns the existing record or inserts the one built by `create`.
    pub fn get_or_add(&mut self, key: K, create: impl FnOnce() -> V) -> &mut V {
        self.upsert(key, create, |_| {})
    }

    /// Like [`Store::get_or_add`], but applies `update` before the created
    /// notification goes out.
    pub fn upsert(
        &mut self,
        key: K,
        create: impl FnOnce() -> V,
        update: impl FnOnce(&mut V),
    ) -> &mut V {
        let mut created = false;
        let item = self.items.entry(key).or_insert_with(|| {
            created = true;
            create()
        });
        update(item);
        if created {
            self.notifier.send(CacheChange::Created(key.entity_key()));
        }
        item
    }

    pub fn lookup(&self, key: K) -> Option<&V> {
        self.items.get(&key)
    }

    pub fn lookup_mut(&mut self, key: K) -> Option<&mut V> {
        self.items.get_mut(&key)
    }

    pub fn contains(&self, key: K) -> bool {
        self.items.contains_key(&key)
    }

    /// Removes the record; the destroyed notification fires only when something was removed.
    pub fn try_remove(&mut self, key: K) -> Option<V> {
        let removed = self.items.remove(&key)?;
        self.notifier.send(CacheChange::Destroyed(key.entity_key()));
        Some(removed)
    }

    pub fn remove_where(&mut self, mut predicate: impl FnMut(&V) -> bool) -> Vec<V> {
        let keys: Vec<K> = self
            .items
            .iter()
            .filter(|(_, value)| predicate(value))
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| self.try_remove(key))
            .collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.notifier.send(CacheChange::Cleared);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.items.values()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageSlot {
    Confirmed(MessageId),
    Pending(u64),
}

/// Message arena. Confirmed messages are indexed by id, pending placeholders
/// by nonce; each channel keeps insertion order for eviction.
pub struct MessageStore {
    confirmed: HashMap<MessageId, Message>,
    pending: HashMap<u64, Message>,
    by_channel: HashMap<ChannelId, VecDeque<MessageSlot>>,
    capacity: usize,
    notifier: Notifier,
}

impl MessageStore {
    fn new(capacity: usize, tx: broadcast::Sender<CacheNotification>) -> Self {
        Self {
            confirmed: HashMap::new(),
            pending: HashMap::new(),
            by_channel: HashMap::new(),
            capacity,
            notifier: Notifier {
                store: StoreKind::Messages,
                tx,
            },
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get_or_add(
        &mut self,
        id: MessageId,
        channel_id: ChannelId,
        author_id: UserId,
    ) -> &mut Message {
        self.upsert(id, channel_id, author_id, |_| {})
    }

    pub fn upsert(
        &mut self,
        id: MessageId,
        channel_id: ChannelId,
        author_id: UserId,
        update: impl FnOnce(&mut Message),
    ) -> &mut Message {
        if let Some(message) = self.confirmed.get_mut(&id) {
            update(message);
        } else {
            let mut message = Message::confirmed(id, channel_id, author_id);
            update(&mut message);
            self.confirmed.insert(id, message);
            self.push_slot(channel_id, MessageSlot::Confirmed(id));
            self.notifier.send(CacheChange::Created(EntityKey::Id(id.0)));
            // The newest slot is never evicted while the bound is at least one.
            self.evict_overflow(channel_id);
        }
        self.confirmed
            .entry(id)
            .or_insert_with(|| Message::confirmed(id, channel_id, author_id))
    }

    pub fn add_pending(&mut self, message: Message) {
        let nonce = message.nonce;
        let channel_id = message.channel_id;
        if self.pending.insert(nonce, message).is_none() {
            self.push_slot(channel_id, MessageSlot::Pending(nonce));
            self.notifier.send(CacheChange::Created(EntityKey::Nonce(nonce)));
            self.evict_overflow(channel_id);
        }
    }

    pub fn lookup(&self, id: MessageId) -> Option<&Message> {
        self.confirmed.get(&id)
    }

    pub fn lookup_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.confirmed.get_mut(&id)
    }

    pub fn lookup_pending(&self, nonce: u64) -> Option<&Message> {
        self.pending.get(&nonce)
    }

    /// Moves a pending placeholder to its confirmed id, keeping its position
    /// in the channel's eviction order.
    pub fn remap(&mut self, nonce: u64, id: MessageId) -> Option<&mut Message> {
        let mut message = self.pending.remove(&nonce)?;
        if self.confirmed.contains_key(&id) {
            self.try_remove(id);
        }
        message.id = id;
        if let Some(slots) = self.by_channel.get_mut(&message.channel_id) {
            if let Some(slot) = slots
                .iter_mut()
                .find(|slot| **slot == MessageSlot::Pending(nonce))
            {
                *slot = MessageSlot::Confirmed(id);
            }
        }
        self.confirmed.insert(id, message);
        self.notifier.send(CacheChange::Remapped { nonce, id });
        self.confirmed.get_mut(&id)
    }

    pub fn try_remove(&mut self, id: MessageId) -> Option<Message> {
        let removed = self.confirmed.remove(&id)?;
        self.drop_slot(removed.channel_id, MessageSlot::Confirmed(id));
        self.notifier.send(CacheChange::Destroyed(EntityKey::Id(id.0)));
        Some(removed)
    }

    pub fn remove_pending(&mut self, nonce: u64) -> Option<Message> {
        let removed = self.pending.remove(&nonce)?;
        self.drop_slot(removed.channel_id, MessageSlot::Pending(nonce));
        self.notifier.send(CacheChange::Destroyed(EntityKey::Nonce(nonce)));
        Some(removed)
    }

    /// Messages of one channel, oldest first.
    pub fn channel_messages(&self, channel_id: ChannelId) -> Vec<Message> {
        self.by_channel
            .get(&channel_id)
            .map(|slots| {
                slots
                    .iter()
                    .filter_map(|slot| match slot {
                        MessageSlot::Confirmed(id) => self.confirmed.get(id),
                        MessageSlot::Pending(nonce) => self.pending.get(nonce),
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.confirmed.clear();
        self.pending.clear();
        self.by_channel.clear();
        self.notifier.send(CacheChange::Cleared);
    }

    /// Drops confirmed messages but keeps pending placeholders and their
    /// channel order, so queued sends still reconcile later.
    pub fn clear_confirmed(&mut self) {
        self.confirmed.clear();
        self.by_channel.retain(|_, slots| {
            slots.retain(|slot| matches!(slot, MessageSlot::Pending(_)));
            !slots.is_empty()
        });
        self.notifier.send(CacheChange::Cleared);
    }

    pub fn len(&self) -> usize {
        self.confirmed.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn push_slot(&mut self, channel_id: ChannelId, slot: MessageSlot) {
        self.by_channel.entry(channel_id).or_default().push_back(slot);
    }

    fn drop_slot(&mut self, channel_id: ChannelId, slot: MessageSlot) {
        if let Some(slots) = self.by_channel.get_mut(&channel_id) {
            slots.retain(|existing| *existing != slot);
            if slots.is_empty() {
                self.by_channel.remove(&channel_id);
            }
        }
    }

    fn evict_overflow(&mut self, channel_id: ChannelId) {
        if self.capacity == 0 {
            return;
        }
        loop {
            let Some(slots) = self.by_channel.get_mut(&channel_id) else {
                return;
            };
            if slots.len() <= self.capacity {
                return;
            }
            let Some(oldest) = slots.pop_front() else {
                return;
            };
            let key = match oldest {
                MessageSlot::Confirmed(id) => {
                    self.confirmed.remove(&id);
                    EntityKey::Id(id.0)
                }
                MessageSlot::Pending(nonce) => {
                    self.pending.remove(&nonce);
                    EntityKey::Nonce(nonce)
                }
            };
            self.notifier.send(CacheChange::Destroyed(key));
        }
    }
}

/// Every store plus the outbound queue; only reachable through [`EntityCache::lock`].
pub struct CacheState {
    pub servers: Store<GuildId, Server>,
    pub channels: Store<ChannelId, Channel>,
    pub users: Store<MemberKey, Member>,
    pub global_users: Store<UserId, GlobalUser>,
    pub roles: Store<RoleId, Role>,
    pub messages: MessageStore,
    pub outbound: VecDeque<QueuedMessage>,
}

impl CacheState {
    /// Upserts the global profile and the membership wrapping it, linking the two.
    pub fn upsert_member(
        &mut self,
        key: MemberKey,
        user: &UserModel,
        update: impl FnOnce(&mut Member),
    ) -> &mut Member {
        self.global_users
            .upsert(key.user_id, || GlobalUser::new(key.user_id), |global| {
                global.update(user);
                global.memberships.insert(key);
            });
        self.users.upsert(key, || Member::new(key), update)
    }

    /// Removes a membership and unlinks it from its global profile. The global
    /// profile goes too once nothing wraps it, unless it is `keep`.
    pub fn remove_member(&mut self, key: MemberKey, keep: Option<UserId>) -> Option<Member> {
        let removed = self.users.try_remove(key)?;
        let orphaned = match self.global_users.lookup_mut(key.user_id) {
            Some(global) => {
                global.memberships.remove(&key);
                global.memberships.is_empty()
            }
            None => false,
        };
        if orphaned && keep != Some(key.user_id) {
            self.global_users.try_remove(key.user_id);
        }
        Some(removed)
    }

    /// Removes a server along with the channels, roles and memberships scoped to it.
    pub fn remove_server(&mut self, guild_id: GuildId, keep: Option<UserId>) -> Option<Server> {
        let server = self.servers.try_remove(guild_id)?;
        self.channels
            .remove_where(|channel| channel.guild_id == Some(guild_id));
        self.roles.remove_where(|role| role.guild_id == guild_id);
        let members: Vec<MemberKey> = self
            .users
            .values()
            .filter(|member| member.key.guild_id == Some(guild_id))
            .map(|member| member.key)
            .collect();
        for key in members {
            self.remove_member(key, keep);
        }
        Some(server)
    }

    /// Server owning a channel, if the channel is a cached server channel.
    pub fn channel_server(&self, channel: &Channel) -> Option<Server> {
        channel
            .guild_id
            .and_then(|guild_id| self.servers.lookup(guild_id).cloned())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            servers: self.servers.len(),
            channels: self.channels.len(),
            users: self.users.len(),
            global_users: self.global_users.len(),
            roles: self.roles.len(),
            messages: self.messages.len(),
            pending_messages: self.messages.pending_len(),
            queued_outbound: self.outbound.len(),
        }
    }

    pub fn clear(&mut self) {
        self.channels.clear();
        self.users.clear();
        self.messages.clear();
        self.roles.clear();
        self.servers.clear();
        self.global_users.clear();
    }

    /// Forgets everything learned from a gateway session. Pending placeholders
    /// and the outbound queue outlive it.
    pub fn clear_session(&mut self) {
        self.channels.clear();
        self.users.clear();
        self.messages.clear_confirmed();
        self.roles.clear();
        self.servers.clear();
        self.global_users.clear();
    }
}

pub struct EntityCache {
    state: Mutex<CacheState>,
    notifications: broadcast::Sender<CacheNotification>,
}

impl EntityCache {
    /// `message_capacity` bounds messages per channel; 0 keeps every message.
    pub fn new(message_capacity: usize) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let tx = notifications.clone();
        Self {
            state: Mutex::new(CacheState {
                servers: Store::new(StoreKind::Servers, tx.clone()),
                channels: Store::new(StoreKind::Channels, tx.clone()),
                users: Store::new(StoreKind::Users, tx.clone()),
                global_users: Store::new(StoreKind::GlobalUsers, tx.clone()),
                roles: Store::new(StoreKind::Roles, tx.clone()),
                messages: MessageStore::new(message_capacity, tx),
                outbound: VecDeque::new(),
            }),
            notifications,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheNotification> {
        self.notifications.subscribe()
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn clear_session(&self) {
        self.lock().clear_session();
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
