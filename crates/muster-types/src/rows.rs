//! Row types exchanged with the backing store.
//! Distinct from the domain models: rows are loosely shaped and only become
//! `Message` / `Reaction` after validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::events::{ChangeOp, Table};
use crate::models::{Attachment, Author, ChannelKey, Message, Reaction};

/// Fallback for rows whose author has no resolvable display name.
const UNKNOWN_AUTHOR: &str = "unknown";

#[derive(Debug, Error)]
pub enum RowError {
    #[error("malformed row: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("row field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("attachment must carry both url and filename")]
    IncompleteAttachment,

    #[error("unsupported {op:?} change on {table:?}")]
    UnsupportedChange { table: Table, op: ChangeOp },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: Uuid,
    pub channel: String,
    pub author_id: Uuid,
    pub author_name: Option<String>,
    pub author_avatar: Option<String>,
    pub body: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
    pub reply_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
}

impl TryFrom<MessageRow> for Message {
    type Error = RowError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        if row.channel.trim().is_empty() {
            return Err(RowError::EmptyField("channel"));
        }

        let attachment = match (row.attachment_url, row.attachment_name) {
            (Some(url), Some(filename)) if !url.is_empty() && !filename.is_empty() => {
                Some(Attachment { url, filename })
            }
            (None, None) => None,
            _ => return Err(RowError::IncompleteAttachment),
        };

        let display_name = row
            .author_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());

        let mut message = Message {
            id: row.id,
            channel: ChannelKey::new(row.channel),
            author: Author {
                actor_id: row.author_id,
                display_name,
                avatar: row.author_avatar,
            },
            body: row.body.filter(|body| !body.is_empty()),
            attachment,
            reply_to: row.reply_to,
            created_at: row.created_at,
            edited_at: row.edited_at,
            deleted: false,
        };

        // Backends have been seen to keep content on deleted rows.
        if row.deleted {
            message.soft_delete();
        }

        Ok(message)
    }
}

impl From<&Message> for MessageRow {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id,
            channel: msg.channel.to_string(),
            author_id: msg.author.actor_id,
            author_name: Some(msg.author.display_name.clone()),
            author_avatar: msg.author.avatar.clone(),
            body: msg.body.clone(),
            attachment_url: msg.attachment.as_ref().map(|a| a.url.clone()),
            attachment_name: msg.attachment.as_ref().map(|a| a.filename.clone()),
            reply_to: msg.reply_to,
            created_at: msg.created_at,
            edited_at: msg.edited_at,
            deleted: msg.deleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionRow {
    pub id: Uuid,
    pub message_id: Uuid,
    pub actor_id: Uuid,
    pub actor_name: Option<String>,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ReactionRow> for Reaction {
    type Error = RowError;

    fn try_from(row: ReactionRow) -> Result<Self, Self::Error> {
        let emoji = row.emoji.trim();
        if emoji.is_empty() {
            return Err(RowError::EmptyField("emoji"));
        }

        Ok(Reaction {
            id: row.id,
            message_id: row.message_id,
            actor_id: row.actor_id,
            actor_name: row.actor_name.unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
            emoji: emoji.to_string(),
            created_at: row.created_at,
        })
    }
}

impl From<&Reaction> for ReactionRow {
    fn from(reaction: &Reaction) -> Self {
        Self {
            id: reaction.id,
            message_id: reaction.message_id,
            actor_id: reaction.actor_id,
            actor_name: Some(reaction.actor_name.clone()),
            emoji: reaction.emoji.clone(),
            created_at: reaction.created_at,
        }
    }
}

/// Insert payload for a new message. The backend assigns id and created_at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub channel: ChannelKey,
    pub author_id: Uuid,
    pub author_name: String,
    pub author_avatar: Option<String>,
    pub body: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
    pub reply_to: Option<Uuid>,
}

/// Insert payload for a reaction. The id is chosen by the client so the
/// push echo of its own write is recognised as a duplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReaction {
    pub id: Uuid,
    pub message_id: Uuid,
    pub actor_id: Uuid,
    pub actor_name: String,
    pub emoji: String,
}

impl From<&Reaction> for NewReaction {
    fn from(reaction: &Reaction) -> Self {
        Self {
            id: reaction.id,
            message_id: reaction.message_id,
            actor_id: reaction.actor_id,
            actor_name: reaction.actor_name.clone(),
            emoji: reaction.emoji.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePatch {
    Edit { body: String },
    SoftDelete,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(value: serde_json::Value) -> Result<Message, RowError> {
        let row: MessageRow = serde_json::from_value(value)?;
        row.try_into()
    }

    #[test]
    fn missing_required_fields_fail_fast() {
        let err = parse(json!({ "id": "6f1c1a52-8f43-4b8e-9d43-0d1d4c6a0a01" })).unwrap_err();
        assert!(matches!(err, RowError::Malformed(_)));
    }

    #[test]
    fn attachment_requires_both_parts() {
        let err = parse(json!({
            "id": "6f1c1a52-8f43-4b8e-9d43-0d1d4c6a0a01",
            "channel": "general",
            "author_id": "1b4e28ba-2fa1-41d2-883f-0016d3cca427",
            "attachment_url": "file:///tmp/x.png",
            "created_at": "2026-03-01T12:00:00Z"
        }))
        .unwrap_err();
        assert!(matches!(err, RowError::IncompleteAttachment));
    }

    #[test]
    fn deleted_rows_are_normalised() {
        let msg = parse(json!({
            "id": "6f1c1a52-8f43-4b8e-9d43-0d1d4c6a0a01",
            "channel": "general",
            "author_id": "1b4e28ba-2fa1-41d2-883f-0016d3cca427",
            "body": "still here",
            "attachment_url": "file:///tmp/x.png",
            "attachment_name": "x.png",
            "created_at": "2026-03-01T12:00:00Z",
            "deleted": true
        }))
        .unwrap();

        assert!(msg.deleted);
        assert_eq!(msg.body, None);
        assert_eq!(msg.attachment, None);
        assert_eq!(msg.author.display_name, "unknown");
    }

    #[test]
    fn empty_channel_is_rejected() {
        let err = parse(json!({
            "id": "6f1c1a52-8f43-4b8e-9d43-0d1d4c6a0a01",
            "channel": "  ",
            "author_id": "1b4e28ba-2fa1-41d2-883f-0016d3cca427",
            "created_at": "2026-03-01T12:00:00Z"
        }))
        .unwrap_err();
        assert!(matches!(err, RowError::EmptyField("channel")));
    }

    #[test]
    fn reaction_emoji_must_not_be_blank() {
        let row = ReactionRow {
            id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            actor_id: Uuid::new_v4(),
            actor_name: None,
            emoji: " ".into(),
            created_at: Utc::now(),
        };
        assert!(matches!(
            Reaction::try_from(row),
            Err(RowError::EmptyField("emoji"))
        ));
    }
}
