//! Muster shared types.
//!
//! Domain model for the channel feed (messages, reactions, channels,
//! identities), the change-event envelope pushed by the backing store, and
//! the raw row DTOs that are validated at the boundary before entering the
//! local cache.

pub mod events;
pub mod models;
pub mod rows;

pub use events::{ChangeOp, ChannelEvent, RowChange, Table};
pub use models::{
    Attachment, Author, Channel, ChannelCatalog, ChannelKey, Identity, Message, Reaction,
    ReactionGroup,
};
pub use rows::{MessagePatch, MessageRow, NewMessage, NewReaction, ReactionRow, RowError};
