use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use muster_types::{Message, ReactionGroup};

use crate::reactions::groups_for_message;
use crate::store::MessageStore;

/// Shown in place of deleted content and for dangling replies.
pub const DELETED_LABEL: &str = "message deleted";

const EXCERPT_CHARS: usize = 80;

/// What a reply renders as its quoted context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyPreview {
    Quoted {
        message_id: Uuid,
        author: String,
        excerpt: String,
    },
    /// Target was soft-deleted or is not in the cache.
    Deleted { message_id: Uuid },
}

impl ReplyPreview {
    pub fn label(&self) -> String {
        match self {
            Self::Quoted { author, excerpt, .. } => format!("{author}: {excerpt}"),
            Self::Deleted { .. } => DELETED_LABEL.to_string(),
        }
    }
}

/// One rendered row of the channel feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedItem {
    pub message: Message,
    /// Full header (avatar + name) rather than a continuation line.
    pub show_header: bool,
    pub reply: Option<ReplyPreview>,
    pub reactions: Vec<ReactionGroup>,
}

impl FeedItem {
    pub fn body_text(&self) -> &str {
        if self.message.deleted {
            return DELETED_LABEL;
        }
        self.message.body.as_deref().unwrap_or_default()
    }
}

/// Header decision for each message of an ascending list.
///
/// A message gets a header when it is first, when its author differs from
/// the previous message, or when more than `gap` passed since the previous
/// message of the same author.
pub fn header_flags(messages: &[Message], gap: Duration) -> Vec<bool> {
    let gap = chrono::Duration::from_std(gap).unwrap_or(chrono::Duration::MAX);

    messages
        .iter()
        .enumerate()
        .map(|(i, msg)| {
            let Some(prev) = i.checked_sub(1).map(|p| &messages[p]) else {
                return true;
            };
            prev.author.actor_id != msg.author.actor_id
                || msg.created_at.signed_duration_since(prev.created_at) > gap
        })
        .collect()
}

pub fn resolve_reply(messages: &[Message], target: Uuid) -> ReplyPreview {
    match messages.iter().find(|m| m.id == target) {
        Some(msg) if !msg.deleted => ReplyPreview::Quoted {
            message_id: target,
            author: msg.author.display_name.clone(),
            excerpt: excerpt(msg),
        },
        _ => ReplyPreview::Deleted { message_id: target },
    }
}

/// Recompute the whole feed from the store. Called after every change since
/// one insert can flip the header decision of its neighbours.
pub fn build_feed(store: &MessageStore, me: Uuid, gap: Duration) -> Vec<FeedItem> {
    let messages = store.messages();
    let headers = header_flags(messages, gap);

    messages
        .iter()
        .zip(headers)
        .map(|(msg, show_header)| FeedItem {
            message: msg.clone(),
            show_header,
            reply: msg.reply_to.map(|target| resolve_reply(messages, target)),
            reactions: groups_for_message(store, msg.id, me),
        })
        .collect()
}

fn excerpt(msg: &Message) -> String {
    match (&msg.body, &msg.attachment) {
        (Some(body), _) => {
            let mut text: String = body.chars().take(EXCERPT_CHARS).collect();
            if body.chars().count() > EXCERPT_CHARS {
                text.push('…');
            }
            text
        }
        (None, Some(attachment)) => attachment.filename.clone(),
        (None, None) => String::new(),
    }
}
