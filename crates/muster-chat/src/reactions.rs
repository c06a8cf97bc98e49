use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use muster_types::{Reaction, ReactionGroup};

use crate::store::MessageStore;

/// Group reactions by emoji.
///
/// `reactions` must be in observation order; ties in count keep the emoji
/// that was observed first. Count is the number of distinct actors.
pub fn group_reactions<'a>(
    reactions: impl IntoIterator<Item = &'a Reaction>,
    me: Uuid,
) -> Vec<ReactionGroup> {
    let mut groups: Vec<ReactionGroup> = Vec::new();

    for reaction in reactions {
        match groups.iter_mut().find(|g| g.emoji == reaction.emoji) {
            Some(group) => {
                if !group.actor_ids.contains(&reaction.actor_id) {
                    group.actor_ids.push(reaction.actor_id);
                }
            }
            None => groups.push(ReactionGroup {
                emoji: reaction.emoji.clone(),
                count: 0,
                actor_ids: vec![reaction.actor_id],
                mine: false,
            }),
        }
    }

    for group in &mut groups {
        group.count = group.actor_ids.len();
        group.mine = group.actor_ids.contains(&me);
    }

    // Stable sort: equal counts stay in first-observed order.
    groups.sort_by(|a, b| b.count.cmp(&a.count));
    groups
}

/// Reaction groups for one cached message.
pub fn groups_for_message(store: &MessageStore, message_id: Uuid, me: Uuid) -> Vec<ReactionGroup> {
    group_reactions(store.reactions_for(message_id), me)
}

/// One (message, actor, emoji) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToggleKey {
    pub message_id: Uuid,
    pub actor_id: Uuid,
    pub emoji: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleState {
    Absent,
    PendingAdd,
    Present,
    PendingRemove,
}

/// What the caller must do after a toggle request.
///
/// Writes carry the ticket of the pending entry they belong to; the
/// completion must hand it back to [`ToggleTracker::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleAction {
    /// Added locally; write this row to the backing store.
    Insert { reaction: Reaction, ticket: u64 },
    /// Removed locally; delete this id from the backing store.
    Delete { id: Uuid, ticket: u64 },
    /// A write for the triple is in flight; the toggle runs once it settles.
    Queued,
    /// This toggle cancelled a queued one.
    Collapsed,
}

#[derive(Debug, Clone)]
struct PendingToggle {
    ticket: u64,
    state: ToggleState,
    /// Row added (PendingAdd) or removed (PendingRemove), kept for revert.
    reaction: Reaction,
    actor_name: String,
    queued: bool,
}

/// Serializes toggles per triple.
///
/// A toggle is only started from a stable state (`Absent`/`Present`). While a
/// write is pending, further toggles are queued with parity: two queued
/// toggles cancel out.
#[derive(Debug, Default)]
pub struct ToggleTracker {
    pending: HashMap<ToggleKey, PendingToggle>,
    /// Never reset, so a ticket outlives `clear`.
    next_ticket: u64,
}

impl ToggleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, key: &ToggleKey, store: &MessageStore) -> ToggleState {
        if let Some(pending) = self.pending.get(key) {
            return pending.state;
        }
        match store.find_reaction(key.message_id, key.actor_id, &key.emoji) {
            Some(_) => ToggleState::Present,
            None => ToggleState::Absent,
        }
    }

    pub fn is_pending(&self, key: &ToggleKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn request(
        &mut self,
        key: ToggleKey,
        actor_name: &str,
        store: &mut MessageStore,
    ) -> ToggleAction {
        if let Some(pending) = self.pending.get_mut(&key) {
            pending.queued = !pending.queued;
            debug!("Toggle {:?} while {:?}, queued={}", key.emoji, pending.state, pending.queued);
            return if pending.queued {
                ToggleAction::Queued
            } else {
                ToggleAction::Collapsed
            };
        }
        self.start(key, actor_name.to_string(), store)
    }

    /// Ticket of the write currently in flight for `key`.
    pub fn ticket(&self, key: &ToggleKey) -> Option<u64> {
        self.pending.get(key).map(|p| p.ticket)
    }

    /// Settle the in-flight write for `key`.
    ///
    /// A completion whose `ticket` is not the current one belongs to a write
    /// abandoned by `clear` and is ignored. On failure the optimistic change is reverted and any queued toggle is
    /// dropped, since the reverted state already matches what the pair of
    /// toggles intended. On success a queued toggle starts and its action is
    /// returned.
    pub fn complete(
        &mut self,
        key: &ToggleKey,
        ticket: u64,
        succeeded: bool,
        store: &mut MessageStore,
    ) -> Option<ToggleAction> {
        if self.ticket(key) != Some(ticket) {
            debug!("Ignoring stale completion #{} for {:?}", ticket, key.emoji);
            return None;
        }
        let pending = self.pending.remove(key)?;

        if !succeeded {
            match pending.state {
                ToggleState::PendingAdd => {
                    store.apply_reaction_delete(pending.reaction.id);
                }
                ToggleState::PendingRemove => {
                    store.apply_reaction_insert(pending.reaction);
                }
                ToggleState::Absent | ToggleState::Present => {}
            }
            return None;
        }

        if pending.queued {
            return Some(self.start(key.clone(), pending.actor_name, store));
        }
        None
    }

    /// Forget all in-flight toggles, e.g. after a channel switch. Late
    /// completions for them are then ignored.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Re-apply every in-flight optimistic change to `store`, e.g. after a
    /// snapshot replaced the reactions it had touched.
    pub fn reapply(&self, store: &mut MessageStore) {
        for (key, pending) in &self.pending {
            match pending.state {
                ToggleState::PendingAdd => {
                    store.apply_reaction_insert(pending.reaction.clone());
                }
                ToggleState::PendingRemove => {
                    let stale = store
                        .find_reaction(key.message_id, key.actor_id, &key.emoji)
                        .map(|r| r.id);
                    if let Some(id) = stale {
                        store.apply_reaction_delete(id);
                    }
                }
                ToggleState::Absent | ToggleState::Present => {}
            }
        }
    }

    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn start(&mut self, key: ToggleKey, actor_name: String, store: &mut MessageStore) -> ToggleAction {
        let existing = store
            .find_reaction(key.message_id, key.actor_id, &key.emoji)
            .cloned();

        match existing {
            Some(reaction) => {
                store.apply_reaction_delete(reaction.id);
                let id = reaction.id;
                let ticket = self.issue_ticket();
                self.pending.insert(
                    key,
                    PendingToggle {
                        ticket,
                        state: ToggleState::PendingRemove,
                        reaction,
                        actor_name,
                        queued: false,
                    },
                );
                ToggleAction::Delete { id, ticket }
            }
            None => {
                let reaction = Reaction {
                    id: Uuid::new_v4(),
                    message_id: key.message_id,
                    actor_id: key.actor_id,
                    actor_name: actor_name.clone(),
                    emoji: key.emoji.clone(),
                    created_at: Utc::now(),
                };
                store.apply_reaction_insert(reaction.clone());
                let ticket = self.issue_ticket();
                self.pending.insert(
                    key,
                    PendingToggle {
                        ticket,
                        state: ToggleState::PendingAdd,
                        reaction: reaction.clone(),
                        actor_name,
                        queued: false,
                    },
                );
                ToggleAction::Insert { reaction, ticket }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone};
    use muster_types::{Author, ChannelKey, Message};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_000_000 + secs, 0).unwrap()
    }

    fn reaction(actor: u128, emoji: &str, secs: i64) -> Reaction {
        Reaction {
            id: Uuid::new_v4(),
            message_id: Uuid::nil(),
            actor_id: Uuid::from_u128(actor),
            actor_name: format!("actor-{actor}"),
            emoji: emoji.into(),
            created_at: at(secs),
        }
    }

    fn store_with_message() -> (MessageStore, Uuid) {
        let mut store = MessageStore::new(50);
        store.switch_channel(ChannelKey::new("general"));
        let msg = Message {
            id: Uuid::new_v4(),
            channel: ChannelKey::new("general"),
            author: Author {
                actor_id: Uuid::from_u128(9),
                display_name: "Sam".into(),
                avatar: None,
            },
            body: Some("hello".into()),
            attachment: None,
            reply_to: None,
            created_at: at(0),
            edited_at: None,
            deleted: false,
        };
        let id = msg.id;
        store.apply_message_insert(msg);
        (store, id)
    }

    fn key(message_id: Uuid, emoji: &str) -> ToggleKey {
        ToggleKey {
            message_id,
            actor_id: Uuid::from_u128(1),
            emoji: emoji.into(),
        }
    }

    fn settle(
        tracker: &mut ToggleTracker,
        k: &ToggleKey,
        succeeded: bool,
        store: &mut MessageStore,
    ) -> Option<ToggleAction> {
        let ticket = tracker.ticket(k).expect("write in flight");
        tracker.complete(k, ticket, succeeded, store)
    }

    #[test]
    fn counts_distinct_actors_and_flags_mine() {
        let reactions = vec![
            reaction(1, "👍", 0),
            reaction(2, "👍", 1),
            reaction(2, "👍", 2),
            reaction(3, "🎉", 3),
        ];
        let groups = group_reactions(&reactions, Uuid::from_u128(3));

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].emoji, "👍");
        assert_eq!(groups[0].count, 2);
        assert!(!groups[0].mine);
        assert_eq!(groups[1].emoji, "🎉");
        assert_eq!(groups[1].count, 1);
        assert!(groups[1].mine);
    }

    #[test]
    fn ties_keep_first_observed_emoji() {
        let reactions = vec![
            reaction(1, "🔥", 0),
            reaction(2, "👀", 1),
            reaction(3, "👀", 2),
            reaction(4, "🔥", 3),
            reaction(5, "✅", 4),
        ];
        let order: Vec<String> = group_reactions(&reactions, Uuid::nil())
            .into_iter()
            .map(|g| g.emoji)
            .collect();
        assert_eq!(order, vec!["🔥", "👀", "✅"]);
    }

    #[test]
    fn toggle_twice_restores_reaction_set() {
        let (mut store, message_id) = store_with_message();
        let mut tracker = ToggleTracker::new();
        let k = key(message_id, "👍");

        let add = tracker.request(k.clone(), "Kim", &mut store);
        assert!(matches!(add, ToggleAction::Insert { .. }));
        assert_eq!(tracker.state(&k, &store), ToggleState::PendingAdd);
        assert_eq!(store.reactions_for(message_id).len(), 1);
        assert_eq!(settle(&mut tracker, &k, true, &mut store), None);
        assert_eq!(tracker.state(&k, &store), ToggleState::Present);

        let remove = tracker.request(k.clone(), "Kim", &mut store);
        assert!(matches!(remove, ToggleAction::Delete { .. }));
        assert_eq!(tracker.state(&k, &store), ToggleState::PendingRemove);
        settle(&mut tracker, &k, true, &mut store);

        assert_eq!(tracker.state(&k, &store), ToggleState::Absent);
        assert!(store.reactions_for(message_id).is_empty());
    }

    #[test]
    fn rapid_toggles_never_duplicate() {
        let (mut store, message_id) = store_with_message();
        let mut tracker = ToggleTracker::new();
        let k = key(message_id, "👍");

        assert!(matches!(
            tracker.request(k.clone(), "Kim", &mut store),
            ToggleAction::Insert { .. }
        ));
        assert_eq!(tracker.request(k.clone(), "Kim", &mut store), ToggleAction::Queued);
        assert_eq!(store.reactions_for(message_id).len(), 1);

        // The queued removal starts once the add settles.
        let follow_up = settle(&mut tracker, &k, true, &mut store);
        assert!(matches!(follow_up, Some(ToggleAction::Delete { .. })));
        assert!(store.reactions_for(message_id).is_empty());
        settle(&mut tracker, &k, true, &mut store);
        assert_eq!(tracker.state(&k, &store), ToggleState::Absent);
    }

    #[test]
    fn queued_toggles_collapse_pairwise() {
        let (mut store, message_id) = store_with_message();
        let mut tracker = ToggleTracker::new();
        let k = key(message_id, "🎉");

        tracker.request(k.clone(), "Kim", &mut store);
        assert_eq!(tracker.request(k.clone(), "Kim", &mut store), ToggleAction::Queued);
        assert_eq!(tracker.request(k.clone(), "Kim", &mut store), ToggleAction::Collapsed);

        assert_eq!(settle(&mut tracker, &k, true, &mut store), None);
        assert_eq!(tracker.state(&k, &store), ToggleState::Present);
    }

    #[test]
    fn failed_write_reverts_optimistic_change() {
        let (mut store, message_id) = store_with_message();
        let mut tracker = ToggleTracker::new();
        let k = key(message_id, "👍");

        tracker.request(k.clone(), "Kim", &mut store);
        tracker.request(k.clone(), "Kim", &mut store);
        assert_eq!(settle(&mut tracker, &k, false, &mut store), None);

        assert_eq!(tracker.state(&k, &store), ToggleState::Absent);
        assert!(store.reactions_for(message_id).is_empty());
    }

    #[test]
    fn failed_remove_restores_reaction() {
        let (mut store, message_id) = store_with_message();
        let mut tracker = ToggleTracker::new();
        let k = key(message_id, "👍");

        tracker.request(k.clone(), "Kim", &mut store);
        settle(&mut tracker, &k, true, &mut store);
        let before: Vec<Reaction> = store.reactions_for(message_id).into_iter().cloned().collect();

        tracker.request(k.clone(), "Kim", &mut store);
        settle(&mut tracker, &k, false, &mut store);

        let after: Vec<Reaction> = store.reactions_for(message_id).into_iter().cloned().collect();
        assert_eq!(before, after);
        assert_eq!(tracker.state(&k, &store), ToggleState::Present);
    }

    #[test]
    fn completion_after_clear_is_ignored() {
        let (mut store, message_id) = store_with_message();
        let mut tracker = ToggleTracker::new();
        let k = key(message_id, "👍");

        let ToggleAction::Insert { ticket, .. } = tracker.request(k.clone(), "Kim", &mut store) else {
            panic!("expected an insert");
        };
        tracker.clear();
        assert!(!tracker.is_pending(&k));
        assert_eq!(tracker.complete(&k, ticket, false, &mut store), None);
    }

    #[test]
    fn abandoned_write_cannot_settle_a_newer_one() {
        let (mut store, message_id) = store_with_message();
        let mut tracker = ToggleTracker::new();
        let k = key(message_id, "👍");

        let ToggleAction::Insert { ticket: first, .. } = tracker.request(k.clone(), "Kim", &mut store) else {
            panic!("expected an insert");
        };
        let host = store.message(message_id).cloned().unwrap();
        tracker.clear();
        store.switch_channel(ChannelKey::new("training"));
        store.switch_channel(ChannelKey::new("general"));
        store.apply_message_insert(host);

        let ToggleAction::Insert { ticket: second, .. } = tracker.request(k.clone(), "Kim", &mut store) else {
            panic!("expected an insert");
        };
        assert_ne!(first, second);

        // The first write fails late; the second is still in flight.
        assert_eq!(tracker.complete(&k, first, false, &mut store), None);
        assert_eq!(tracker.state(&k, &store), ToggleState::PendingAdd);
        assert_eq!(store.reactions_for(message_id).len(), 1);
        assert_eq!(tracker.request(k.clone(), "Kim", &mut store), ToggleAction::Queued);

        assert!(matches!(
            tracker.complete(&k, second, true, &mut store),
            Some(ToggleAction::Delete { .. })
        ));
    }

    #[test]
    fn reapply_restores_pending_changes() {
        let (mut store, message_id) = store_with_message();
        let mut tracker = ToggleTracker::new();
        let add = key(message_id, "👍");
        let remove = key(message_id, "🎉");

        tracker.request(remove.clone(), "Kim", &mut store);
        settle(&mut tracker, &remove, true, &mut store);
        let present = store.reactions_for(message_id)[0].clone();
        tracker.request(remove.clone(), "Kim", &mut store);
        tracker.request(add.clone(), "Kim", &mut store);

        // A snapshot taken before either write lands.
        store.apply_reaction_insert(present);
        let optimistic = store.find_reaction(message_id, add.actor_id, "👍").unwrap().id;
        store.apply_reaction_delete(optimistic);

        tracker.reapply(&mut store);
        let emojis: Vec<&str> = store
            .reactions_for(message_id)
            .iter()
            .map(|r| r.emoji.as_str())
            .collect();
        assert_eq!(emojis, vec!["👍"]);
    }
}
