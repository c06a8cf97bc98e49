use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChannelKey, Message, Reaction};
use crate::rows::{MessageRow, ReactionRow, RowError};

/// Backing-store table a change originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Messages,
    Reactions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One row change pushed by the backing store's subscription stream.
///
/// `row` is loosely shaped; it is only trusted after `ChannelEvent::try_from`.
/// For deletes the backend sends the old row (at least its `id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: Table,
    pub op: ChangeOp,
    pub row: serde_json::Value,
}

impl RowChange {
    /// Channel the row claims to belong to. Reaction rows carry none.
    pub fn channel(&self) -> Option<ChannelKey> {
        self.row
            .get("channel")
            .and_then(|v| v.as_str())
            .map(ChannelKey::from)
    }
}

/// A validated change, ready to be applied to the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChannelEvent {
    MessageInserted(Message),
    MessageUpdated(Message),
    ReactionInserted(Reaction),
    ReactionDeleted { id: Uuid },
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: Uuid,
}

impl TryFrom<RowChange> for ChannelEvent {
    type Error = RowError;

    fn try_from(change: RowChange) -> Result<Self, Self::Error> {
        match (change.table, change.op) {
            (Table::Messages, ChangeOp::Insert) => {
                let row: MessageRow = serde_json::from_value(change.row)?;
                Ok(Self::MessageInserted(row.try_into()?))
            }
            (Table::Messages, ChangeOp::Update) => {
                let row: MessageRow = serde_json::from_value(change.row)?;
                Ok(Self::MessageUpdated(row.try_into()?))
            }
            // Messages are never physically removed.
            (Table::Messages, ChangeOp::Delete) => Err(RowError::UnsupportedChange {
                table: Table::Messages,
                op: ChangeOp::Delete,
            }),
            (Table::Reactions, ChangeOp::Insert) => {
                let row: ReactionRow = serde_json::from_value(change.row)?;
                Ok(Self::ReactionInserted(row.try_into()?))
            }
            (Table::Reactions, ChangeOp::Delete) => {
                let IdOnly { id } = serde_json::from_value(change.row)?;
                Ok(Self::ReactionDeleted { id })
            }
            // Reactions are never edited.
            (Table::Reactions, ChangeOp::Update) => Err(RowError::UnsupportedChange {
                table: Table::Reactions,
                op: ChangeOp::Update,
            }),
        }
    }
}
