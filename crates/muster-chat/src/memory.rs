//! In-process reference collaborators.
//!
//! `MemoryBackend` keeps message and reaction tables behind a mutex and fans
//! row changes out to per-subscriber channels. It enforces the unique
//! (message, actor, emoji) triple the way a real backend's constraint would,
//! and carries fault injection hooks for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use muster_types::{
    ChangeOp, ChannelKey, Identity, Message, MessagePatch, MessageRow, NewMessage, NewReaction,
    ReactionRow, RowChange, Table,
};

use crate::backend::{BackingStore, BlobStore, Subscription, SubscriptionFilter};
use crate::error::BackendError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_value<T: Serialize>(row: &T) -> Result<Value, BackendError> {
    serde_json::to_value(row).map_err(|e| BackendError::Rejected(e.to_string()))
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    messages: Mutex<HashMap<Uuid, MessageRow>>,
    reactions: Mutex<HashMap<Uuid, ReactionRow>>,

    /// Live subscriptions: subscription id -> (filter, sender)
    subscribers: Mutex<HashMap<Uuid, (SubscriptionFilter, mpsc::UnboundedSender<RowChange>)>>,

    /// Last assigned created_at, so inserts are strictly ordered.
    last_created: Mutex<Option<DateTime<Utc>>>,

    fetch_delays: Mutex<HashMap<ChannelKey, Duration>>,
    failing_fetches: AtomicUsize,
    unreachable: AtomicBool,
    calls: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with `Unreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next `count` fetches with `Unreachable`.
    pub fn fail_next_fetches(&self, count: usize) {
        self.inner.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// Hold fetches for `channel` for `delay` before answering.
    pub fn delay_fetches_for(&self, channel: ChannelKey, delay: Duration) {
        lock(&self.inner.fetch_delays).insert(channel, delay);
    }

    /// Drop every subscription, as a lost connection would.
    pub fn disconnect_all(&self) {
        let dropped = {
            let mut subscribers = lock(&self.inner.subscribers);
            let count = subscribers.len();
            subscribers.clear();
            count
        };
        debug!("Disconnected {} subscriptions", dropped);
    }

    /// Total trait calls received.
    pub fn call_count(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Inserts, updates and deletes received, successful or not.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    /// Push a change to matching subscribers without touching the tables.
    pub fn publish_raw(&self, change: RowChange) {
        self.publish(change);
    }

    /// Store a message directly, without notifying subscribers.
    pub fn seed_message(
        &self,
        channel: &ChannelKey,
        author: &Identity,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> Message {
        let message = Message {
            id: Uuid::new_v4(),
            channel: channel.clone(),
            author: author.author(),
            body: Some(body.to_string()),
            attachment: None,
            reply_to: None,
            created_at,
            edited_at: None,
            deleted: false,
        };
        lock(&self.inner.messages).insert(message.id, MessageRow::from(&message));
        message
    }

    /// Reaction rows currently stored for `message_id`.
    pub fn reactions_on(&self, message_id: Uuid) -> Vec<ReactionRow> {
        lock(&self.inner.reactions)
            .values()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect()
    }

    fn enter(&self) -> Result<(), BackendError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::Unreachable("memory backend offline".into()));
        }
        Ok(())
    }

    fn enter_write(&self) -> Result<(), BackendError> {
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        self.enter()
    }

    async fn enter_fetch(&self, channel: Option<&ChannelKey>) -> Result<(), BackendError> {
        self.enter()?;
        let delay = channel.and_then(|c| lock(&self.inner.fetch_delays).get(c).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failed = self
            .inner
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BackendError::Unreachable("injected fetch failure".into()));
        }
        Ok(())
    }

    fn next_created_at(&self) -> DateTime<Utc> {
        let mut last = lock(&self.inner.last_created);
        let mut now = Utc::now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + chrono::Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }

    fn publish(&self, change: RowChange) {
        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.retain(|_, (filter, tx)| {
            if !filter.matches(&change) {
                return true;
            }
            tx.send(change.clone()).is_ok()
        });
    }
}

#[async_trait]
impl BackingStore for MemoryBackend {
    async fn fetch_recent_messages(
        &self,
        channel: &ChannelKey,
        limit: u32,
    ) -> Result<Vec<Value>, BackendError> {
        self.enter_fetch(Some(channel)).await?;

        let mut rows: Vec<MessageRow> = lock(&self.inner.messages)
            .values()
            .filter(|row| row.channel == channel.as_str())
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        rows.truncate(limit as usize);
        rows.iter().map(to_value).collect()
    }

    async fn fetch_reactions(&self, message_ids: &[Uuid]) -> Result<Vec<Value>, BackendError> {
        self.enter_fetch(None).await?;

        let reactions = lock(&self.inner.reactions);
        reactions
            .values()
            .filter(|row| message_ids.contains(&row.message_id))
            .map(to_value)
            .collect()
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Value, BackendError> {
        self.enter_write()?;
        if message.channel.as_str().trim().is_empty() {
            return Err(BackendError::Rejected("channel must not be empty".into()));
        }

        let row = MessageRow {
            id: Uuid::new_v4(),
            channel: message.channel.to_string(),
            author_id: message.author_id,
            author_name: Some(message.author_name),
            author_avatar: message.author_avatar,
            body: message.body,
            attachment_url: message.attachment_url,
            attachment_name: message.attachment_name,
            reply_to: message.reply_to,
            created_at: self.next_created_at(),
            edited_at: None,
            deleted: false,
        };
        let value = to_value(&row)?;
        lock(&self.inner.messages).insert(row.id, row);

        self.publish(RowChange {
            table: Table::Messages,
            op: ChangeOp::Insert,
            row: value.clone(),
        });
        Ok(value)
    }

    async fn update_message(&self, id: Uuid, patch: MessagePatch) -> Result<Value, BackendError> {
        self.enter_write()?;

        let value = {
            let mut messages = lock(&self.inner.messages);
            let row = messages
                .get_mut(&id)
                .ok_or_else(|| BackendError::NotFound(format!("message {id}")))?;
            match patch {
                MessagePatch::Edit { body } => {
                    if row.deleted {
                        return Err(BackendError::Rejected(format!("message {id} is deleted")));
                    }
                    row.body = Some(body);
                    row.edited_at = Some(Utc::now());
                }
                MessagePatch::SoftDelete => {
                    row.deleted = true;
                    row.body = None;
                    row.attachment_url = None;
                    row.attachment_name = None;
                }
            }
            to_value(&*row)?
        };

        self.publish(RowChange {
            table: Table::Messages,
            op: ChangeOp::Update,
            row: value.clone(),
        });
        Ok(value)
    }

    async fn insert_reaction(&self, reaction: NewReaction) -> Result<Value, BackendError> {
        self.enter_write()?;
        if !lock(&self.inner.messages).contains_key(&reaction.message_id) {
            return Err(BackendError::NotFound(format!("message {}", reaction.message_id)));
        }

        let value = {
            let mut reactions = lock(&self.inner.reactions);
            let taken = reactions.values().any(|r| {
                r.id == reaction.id
                    || (r.message_id == reaction.message_id
                        && r.actor_id == reaction.actor_id
                        && r.emoji == reaction.emoji)
            });
            if taken {
                return Err(BackendError::Conflict(format!(
                    "reaction {} on {}",
                    reaction.emoji, reaction.message_id
                )));
            }

            let row = ReactionRow {
                id: reaction.id,
                message_id: reaction.message_id,
                actor_id: reaction.actor_id,
                actor_name: Some(reaction.actor_name),
                emoji: reaction.emoji,
                created_at: self.next_created_at(),
            };
            let value = to_value(&row)?;
            reactions.insert(row.id, row);
            value
        };

        self.publish(RowChange {
            table: Table::Reactions,
            op: ChangeOp::Insert,
            row: value.clone(),
        });
        Ok(value)
    }

    async fn delete_reaction(&self, id: Uuid) -> Result<(), BackendError> {
        self.enter_write()?;

        let row = lock(&self.inner.reactions)
            .remove(&id)
            .ok_or_else(|| BackendError::NotFound(format!("reaction {id}")))?;

        self.publish(RowChange {
            table: Table::Reactions,
            op: ChangeOp::Delete,
            row: to_value(&row)?,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription, BackendError> {
        self.enter()?;

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        debug!("Subscription {} registered for {:?}", id, filter.table);
        lock(&self.inner.subscribers).insert(id, (filter, tx));
        Ok(Subscription::new(rx))
    }
}

/// Blob store keeping attachments in memory.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Bytes>>>,
    puts: Arc<AtomicUsize>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        lock(&self.blobs).get(path).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: Bytes) -> Result<String, BackendError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let mut blobs = lock(&self.blobs);
        if blobs.contains_key(path) {
            return Err(BackendError::Conflict(path.to_string()));
        }
        blobs.insert(path.to_string(), bytes);
        Ok(format!("memory://{path}"))
    }
}
