use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable key of a catalog channel (e.g. `general`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub key: ChannelKey,
    pub label: String,
    pub description: String,
}

/// Fixed set of channels. End users never create channels.
#[derive(Debug, Clone)]
pub struct ChannelCatalog {
    channels: Vec<Channel>,
}

impl ChannelCatalog {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self { channels }
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn get(&self, key: &ChannelKey) -> Option<&Channel> {
        self.channels.iter().find(|c| &c.key == key)
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.get(key).is_some()
    }
}

impl Default for ChannelCatalog {
    fn default() -> Self {
        let entry = |key: &str, label: &str, description: &str| Channel {
            key: ChannelKey::new(key),
            label: label.to_string(),
            description: description.to_string(),
        };

        Self::new(vec![
            entry("general", "General", "Open discussion for all volunteers"),
            entry("announcements", "Announcements", "Notices from unit coordinators"),
            entry("deployments", "Deployments", "Deployment notices and logistics"),
            entry("training", "Training", "Courses, drills and certifications"),
        ])
    }
}

/// Already-resolved identity of the acting user, supplied by the host
/// application. This crate never authenticates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub actor_id: Uuid,
    pub display_name: String,
    pub avatar: Option<String>,
    /// Permits editing and deleting other actors' messages.
    pub elevated: bool,
}

impl Identity {
    pub fn author(&self) -> Author {
        Author {
            actor_id: self.actor_id,
            display_name: self.display_name.clone(),
            avatar: self.avatar.clone(),
        }
    }

    /// Whether this identity may edit or soft-delete `message`.
    pub fn may_modify(&self, message: &Message) -> bool {
        self.elevated || message.author.actor_id == self.actor_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub actor_id: Uuid,
    pub display_name: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub channel: ChannelKey,
    pub author: Author,
    pub body: Option<String>,
    pub attachment: Option<Attachment>,
    /// May point at a message that was soft-deleted or never loaded.
    pub reply_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
}

impl Message {
    /// Total order within a channel: creation time, ties broken by id.
    pub fn sort_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }

    /// Mark deleted and drop content. Id and creation time are kept.
    pub fn soft_delete(&mut self) {
        self.deleted = true;
        self.body = None;
        self.attachment = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: Uuid,
    pub message_id: Uuid,
    pub actor_id: Uuid,
    pub actor_name: String,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

impl Reaction {
    /// The (message, actor, emoji) triple that must stay unique.
    pub fn triple(&self) -> (Uuid, Uuid, &str) {
        (self.message_id, self.actor_id, self.emoji.as_str())
    }
}

/// Derived per-emoji summary. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub actor_ids: Vec<Uuid>,
    pub mine: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(author: Uuid) -> Message {
        Message {
            id: Uuid::new_v4(),
            channel: ChannelKey::new("general"),
            author: Author {
                actor_id: author,
                display_name: "Sam".into(),
                avatar: None,
            },
            body: Some("hello".into()),
            attachment: Some(Attachment {
                url: "file:///tmp/a.pdf".into(),
                filename: "a.pdf".into(),
            }),
            reply_to: None,
            created_at: Utc::now(),
            edited_at: None,
            deleted: false,
        }
    }

    #[test]
    fn soft_delete_keeps_identity_and_clears_content() {
        let mut msg = message(Uuid::new_v4());
        let (id, created_at) = (msg.id, msg.created_at);
        msg.soft_delete();

        assert!(msg.deleted);
        assert_eq!(msg.body, None);
        assert_eq!(msg.attachment, None);
        assert_eq!(msg.id, id);
        assert_eq!(msg.created_at, created_at);
    }

    #[test]
    fn only_author_or_elevated_may_modify() {
        let author = Uuid::new_v4();
        let msg = message(author);

        let mut other = Identity {
            actor_id: Uuid::new_v4(),
            display_name: "Kim".into(),
            avatar: None,
            elevated: false,
        };
        assert!(!other.may_modify(&msg));

        other.elevated = true;
        assert!(other.may_modify(&msg));

        let owner = Identity {
            actor_id: author,
            display_name: "Sam".into(),
            avatar: None,
            elevated: false,
        };
        assert!(owner.may_modify(&msg));
    }

    #[test]
    fn default_catalog_has_fixed_channels() {
        let catalog = ChannelCatalog::default();
        assert!(catalog.contains(&"general".into()));
        assert!(catalog.contains(&"training".into()));
        assert!(!catalog.contains(&"random".into()));
    }
}
