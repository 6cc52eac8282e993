use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use shared::{
    domain::{ChannelId, UserId},
    protocol::MessageModel,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cache::EntityCache,
    protocol_client::ProtocolClient,
    types::Message,
};

static NEXT_NONCE: AtomicU64 = AtomicU64::new(1);

/// Process-unique, never zero.
pub fn next_nonce() -> u64 {
    NEXT_NONCE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub nonce: u64,
    pub channel_id: ChannelId,
    pub content: String,
}

/// Outbound messages waiting for the flush loop. Entries live in
/// [`crate::cache::CacheState::outbound`] so they share the cache lock with
/// their pending placeholders.
pub struct OutboundQueue {
    cache: Arc<EntityCache>,
    wake: Notify,
}

impl OutboundQueue {
    pub fn new(cache: Arc<EntityCache>) -> Self {
        Self {
            cache,
            wake: Notify::new(),
        }
    }

    /// Inserts a pending placeholder and queues it for sending.
    pub fn enqueue(&self, channel_id: ChannelId, author_id: UserId, content: &str) -> Message {
        let nonce = next_nonce();
        let placeholder = Message::pending(nonce, channel_id, author_id, content.to_string());
        {
            let mut cache = self.cache.lock();
            cache.messages.add_pending(placeholder.clone());
            cache.outbound.push_back(QueuedMessage {
                nonce,
                channel_id,
                content: content.to_string(),
            });
        }
        debug!(nonce, channel_id = channel_id.0, "queue: message enqueued");
        self.wake.notify_one();
        placeholder
    }

    pub fn len(&self) -> usize {
        self.cache.lock().outbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every queued entry without sending it. Returns how many were dropped.
    pub fn discard_all(&self) -> usize {
        let mut cache = self.cache.lock();
        let dropped = cache.outbound.len();
        cache.outbound.clear();
        dropped
    }

    fn pop_front(&self) -> Option<QueuedMessage> {
        self.cache.lock().outbound.pop_front()
    }

    fn requeue_front(&self, item: QueuedMessage) {
        self.cache.lock().outbound.push_front(item);
    }

    /// Drains the queue in order, one send at a time, until `cancel` fires.
    /// Failed sends go back to the front and are retried after `retry_delay`.
    pub async fn run(
        &self,
        sender: &dyn ProtocolClient,
        cancel: &CancellationToken,
        retry_delay: Duration,
        on_sent: impl Fn(&QueuedMessage, &MessageModel),
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let item = match self.pop_front() {
                Some(item) => item,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = self.wake.notified() => {}
                    }
                    continue;
                }
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.requeue_front(item);
                    return;
                }
                result = sender.send_message(item.channel_id, &item.content, Some(item.nonce)) => result,
            };

            match result {
                Ok(confirmed) => {
                    debug!(
                        nonce = item.nonce,
                        channel_id = item.channel_id.0,
                        message_id = confirmed.id.0,
                        "queue: message sent"
                    );
                    on_sent(&item, &confirmed);
                }
                Err(err) => {
                    warn!(
                        nonce = item.nonce,
                        channel_id = item.channel_id.0,
                        "queue: send failed, requeueing: {err:#}"
                    );
                    self.requeue_front(item);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/message_queue_tests.rs"]
mod tests;
