use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use muster_types::{ChannelEvent, ChannelKey, Message, MessageRow, Reaction, ReactionRow, RowError};

use crate::backend::BackingStore;
use crate::error::{ChatError, ReconciliationAnomaly};

/// Result of applying one change to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated,
    Removed,
    /// Reaction held until its host message arrives.
    Parked,
    Ignored(ReconciliationAnomaly),
}

impl Applied {
    /// Whether the visible feed may have changed.
    pub fn changed_feed(&self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Removed)
    }
}

/// A validated page of recent history for one channel.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub channel: ChannelKey,
    /// Ascending by (created_at, id).
    pub messages: Vec<Message>,
    pub reactions: Vec<Reaction>,
    /// Rows dropped during validation.
    pub malformed: usize,
}

pub fn decode_message(row: Value) -> Result<Message, RowError> {
    let row: MessageRow = serde_json::from_value(row)?;
    row.try_into()
}

pub fn decode_reaction(row: Value) -> Result<Reaction, RowError> {
    let row: ReactionRow = serde_json::from_value(row)?;
    row.try_into()
}

/// Fetch the most recent `limit` messages of `channel` plus their reactions.
/// Malformed rows are dropped and counted, never fatal.
pub async fn fetch_snapshot(
    backend: &dyn BackingStore,
    channel: &ChannelKey,
    limit: u32,
) -> Result<Snapshot, ChatError> {
    let rows = backend
        .fetch_recent_messages(channel, limit)
        .await
        .map_err(ChatError::Fetch)?;

    let mut malformed = 0;
    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        match decode_message(row) {
            Ok(msg) if msg.channel == *channel => messages.push(msg),
            Ok(msg) => {
                warn!("Load for {} returned message {} of channel {}", channel, msg.id, msg.channel);
                malformed += 1;
            }
            Err(e) => {
                warn!("Dropping malformed message row in {}: {}", channel, e);
                malformed += 1;
            }
        }
    }

    messages.sort_by_key(Message::sort_key);
    let limit = limit.max(1) as usize;
    if messages.len() > limit {
        let excess = messages.len() - limit;
        messages.drain(0..excess);
    }

    let message_ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
    let mut reactions = Vec::new();
    if !message_ids.is_empty() {
        let rows = backend
            .fetch_reactions(&message_ids)
            .await
            .map_err(ChatError::Fetch)?;
        for row in rows {
            match decode_reaction(row) {
                Ok(reaction) => reactions.push(reaction),
                Err(e) => {
                    warn!("Dropping malformed reaction row in {}: {}", channel, e);
                    malformed += 1;
                }
            }
        }
    }

    Ok(Snapshot {
        channel: channel.clone(),
        messages,
        reactions,
        malformed,
    })
}

/// Whether `cached` reflects a later state of the same message than
/// `fetched`. Soft delete is terminal.
fn is_further_along(cached: &Message, fetched: &Message) -> bool {
    if cached.deleted != fetched.deleted {
        return cached.deleted;
    }
    cached.edited_at > fetched.edited_at
}

/// Local cache for the active channel: messages in ascending order plus their
/// reactions.
///
/// Every change is checked against the channel the user currently intends to
/// view, never against subscription state, so late events for an abandoned
/// channel cannot leak in.
#[derive(Debug, Clone)]
pub struct MessageStore {
    channel: Option<ChannelKey>,
    messages: Vec<Message>,
    reactions: HashMap<Uuid, Reaction>,
    /// Reactions whose host message is not (yet) cached, with arrival time.
    orphans: HashMap<Uuid, (Reaction, DateTime<Utc>)>,
    max_messages: usize,
}

impl MessageStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            channel: None,
            messages: Vec::new(),
            reactions: HashMap::new(),
            orphans: HashMap::new(),
            max_messages: max_messages.max(1),
        }
    }

    /// The channel currently intended for display.
    pub fn channel(&self) -> Option<&ChannelKey> {
        self.channel.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn contains_message(&self, id: Uuid) -> bool {
        self.message(id).is_some()
    }

    pub fn reaction_count(&self) -> usize {
        self.reactions.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Reactions on `message_id` in observation order (created_at, id).
    pub fn reactions_for(&self, message_id: Uuid) -> Vec<&Reaction> {
        let mut found: Vec<&Reaction> = self
            .reactions
            .values()
            .filter(|r| r.message_id == message_id)
            .collect();
        found.sort_by_key(|r| (r.created_at, r.id));
        found
    }

    pub fn find_reaction(&self, message_id: Uuid, actor_id: Uuid, emoji: &str) -> Option<&Reaction> {
        self.reactions
            .values()
            .find(|r| r.triple() == (message_id, actor_id, emoji))
    }

    /// Forget everything and make `channel` the intended one.
    pub fn switch_channel(&mut self, channel: ChannelKey) {
        debug!("Store switching to channel {}", channel);
        self.channel = Some(channel);
        self.messages.clear();
        self.reactions.clear();
        self.orphans.clear();
    }

    /// Fetch and install a fresh snapshot for `channel`.
    pub async fn load_initial(
        &mut self,
        backend: &dyn BackingStore,
        channel: ChannelKey,
        limit: u32,
    ) -> Result<(), ChatError> {
        if self.channel.as_ref() != Some(&channel) {
            self.switch_channel(channel.clone());
        }
        let snapshot = fetch_snapshot(backend, &channel, limit).await?;
        // Cannot be foreign: `&mut self` pins the intended channel across the await.
        let _ = self.install_snapshot(snapshot);
        Ok(())
    }

    /// Replace the cache with `snapshot` if it belongs to the intended
    /// channel. Cached messages newer than the snapshot's newest entry are
    /// kept, since they arrived by push while the load was in flight. A
    /// cached copy that is further along than the snapshot's (soft-deleted,
    /// or edited later) wins over it.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), ReconciliationAnomaly> {
        if self.channel.as_ref() != Some(&snapshot.channel) {
            return Err(ReconciliationAnomaly::ForeignChannel {
                expected: self.channel.clone(),
                got: snapshot.channel,
            });
        }

        let newest = snapshot.messages.last().map(Message::sort_key);
        let mut old_messages: HashMap<Uuid, Message> = std::mem::take(&mut self.messages)
            .into_iter()
            .map(|m| (m.id, m))
            .collect();
        let mut old_reactions = std::mem::take(&mut self.reactions);

        self.messages = snapshot
            .messages
            .into_iter()
            .map(|fetched| match old_messages.remove(&fetched.id) {
                Some(cached) if is_further_along(&cached, &fetched) => {
                    debug!("Keeping cached {} over older snapshot copy", cached.id);
                    cached
                }
                _ => fetched,
            })
            .collect();
        let mut carried_over: Vec<Message> = old_messages.into_values().collect();
        carried_over.sort_by_key(Message::sort_key);
        for msg in carried_over {
            let is_newer = newest.is_none_or(|newest| msg.sort_key() > newest);
            if is_newer && !self.contains_message(msg.id) {
                let carried: Vec<Uuid> = old_reactions
                    .values()
                    .filter(|r| r.message_id == msg.id)
                    .map(|r| r.id)
                    .collect();
                for id in carried {
                    if let Some(reaction) = old_reactions.remove(&id) {
                        self.reactions.insert(id, reaction);
                    }
                }
                let idx = self.insert_position(&msg);
                self.messages.insert(idx, msg);
            }
        }

        for reaction in snapshot.reactions {
            if self.contains_message(reaction.message_id) {
                self.insert_unique_reaction(reaction);
            }
        }

        let hosted: Vec<Uuid> = self.messages.iter().map(|m| m.id).collect();
        for id in hosted {
            self.adopt_orphans(id);
        }
        self.trim_to_max();
        Ok(())
    }

    pub fn apply_event(&mut self, event: ChannelEvent) -> Applied {
        match event {
            ChannelEvent::MessageInserted(message) => self.apply_message_insert(message),
            ChannelEvent::MessageUpdated(message) => self.apply_message_update(message),
            ChannelEvent::ReactionInserted(reaction) => self.apply_reaction_insert(reaction),
            ChannelEvent::ReactionDeleted { id } => self.apply_reaction_delete(id),
        }
    }

    pub fn apply_message_insert(&mut self, msg: Message) -> Applied {
        if let Some(anomaly) = self.foreign(&msg.channel) {
            return Applied::Ignored(anomaly);
        }
        if self.contains_message(msg.id) {
            return Applied::Ignored(ReconciliationAnomaly::DuplicateId(msg.id));
        }

        let id = msg.id;
        let idx = self.insert_position(&msg);
        self.messages.insert(idx, msg);
        self.adopt_orphans(id);
        self.trim_to_max();
        Applied::Inserted
    }

    /// Replace the cached entry with the same id. Unknown ids are ignored:
    /// an update may overtake its insert or the initial load.
    pub fn apply_message_update(&mut self, msg: Message) -> Applied {
        if let Some(anomaly) = self.foreign(&msg.channel) {
            return Applied::Ignored(anomaly);
        }
        let Some(pos) = self.messages.iter().position(|m| m.id == msg.id) else {
            return Applied::Ignored(ReconciliationAnomaly::UnknownId(msg.id));
        };

        self.messages.remove(pos);
        let idx = self.insert_position(&msg);
        self.messages.insert(idx, msg);
        Applied::Updated
    }

    pub fn apply_reaction_insert(&mut self, reaction: Reaction) -> Applied {
        if self.reactions.contains_key(&reaction.id) || self.orphans.contains_key(&reaction.id) {
            return Applied::Ignored(ReconciliationAnomaly::DuplicateId(reaction.id));
        }
        if !self.contains_message(reaction.message_id) {
            self.orphans.insert(reaction.id, (reaction, Utc::now()));
            return Applied::Parked;
        }

        self.insert_unique_reaction(reaction);
        Applied::Inserted
    }

    pub fn apply_reaction_delete(&mut self, id: Uuid) -> Applied {
        if self.reactions.remove(&id).is_some() {
            return Applied::Removed;
        }
        if self.orphans.remove(&id).is_some() {
            return Applied::Parked;
        }
        Applied::Ignored(ReconciliationAnomaly::UnknownId(id))
    }

    /// Drop parked reactions older than `window`. Returns how many were dropped.
    pub fn prune_orphans(&mut self, now: DateTime<Utc>, window: Duration) -> usize {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let before = self.orphans.len();
        self.orphans
            .retain(|_, (_, parked_at)| now.signed_duration_since(*parked_at) <= window);
        before - self.orphans.len()
    }

    fn foreign(&self, channel: &ChannelKey) -> Option<ReconciliationAnomaly> {
        if self.channel.as_ref() == Some(channel) {
            return None;
        }
        Some(ReconciliationAnomaly::ForeignChannel {
            expected: self.channel.clone(),
            got: channel.clone(),
        })
    }

    fn insert_position(&self, msg: &Message) -> usize {
        let key = msg.sort_key();
        self.messages.partition_point(|m| m.sort_key() < key)
    }

    /// Insert keeping the (message, actor, emoji) triple unique: a row for an
    /// existing triple under a different id replaces the cached one.
    fn insert_unique_reaction(&mut self, reaction: Reaction) {
        let existing = self
            .reactions
            .values()
            .find(|r| r.triple() == reaction.triple() && r.id != reaction.id)
            .map(|r| r.id);
        if let Some(existing) = existing {
            self.reactions.remove(&existing);
        }
        self.reactions.insert(reaction.id, reaction);
    }

    fn adopt_orphans(&mut self, message_id: Uuid) {
        let adopted: Vec<Uuid> = self
            .orphans
            .iter()
            .filter(|(_, (r, _))| r.message_id == message_id)
            .map(|(id, _)| *id)
            .collect();
        for id in adopted {
            if let Some((reaction, _)) = self.orphans.remove(&id) {
                self.insert_unique_reaction(reaction);
            }
        }
    }

    fn trim_to_max(&mut self) {
        if self.messages.len() <= self.max_messages {
            return;
        }
        let excess = self.messages.len() - self.max_messages;
        let dropped: Vec<Uuid> = self.messages.drain(0..excess).map(|m| m.id).collect();
        self.reactions.retain(|_, r| !dropped.contains(&r.message_id));
    }
}
