//! Contracts for the external collaborators this core consumes: the backing
//! durable store (reads, writes, change subscriptions) and the blob store.
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use muster_types::{ChangeOp, ChannelKey, MessagePatch, NewMessage, NewReaction, RowChange, Table};

use crate::error::BackendError;

/// Server-side filter for a change subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub table: Table,
    /// Only honoured for tables that carry a channel column.
    pub channel: Option<ChannelKey>,
    pub ops: Vec<ChangeOp>,
}

impl SubscriptionFilter {
    /// Message inserts and updates for one channel.
    pub fn messages(channel: ChannelKey) -> Self {
        Self {
            table: Table::Messages,
            channel: Some(channel),
            ops: vec![ChangeOp::Insert, ChangeOp::Update],
        }
    }

    /// Reaction inserts and deletes. The reactions table has no channel
    /// column, so this stream is filtered client-side.
    pub fn reactions() -> Self {
        Self {
            table: Table::Reactions,
            channel: None,
            ops: vec![ChangeOp::Insert, ChangeOp::Delete],
        }
    }

    pub fn matches(&self, change: &RowChange) -> bool {
        if change.table != self.table || !self.ops.contains(&change.op) {
            return false;
        }
        match (&self.channel, change.channel()) {
            (Some(wanted), Some(got)) => *wanted == got,
            (Some(_), None) => self.table == Table::Reactions,
            (None, _) => true,
        }
    }
}

/// Live stream of row changes. `next()` returning `None` means the
/// connection dropped and the subscriber must reconnect.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<RowChange>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<RowChange>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<RowChange> {
        self.rx.recv().await
    }
}

/// Backing durable store. Rows are returned loosely shaped and validated by
/// the caller.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// The most recent `limit` messages of `channel`, in any order.
    async fn fetch_recent_messages(
        &self,
        channel: &ChannelKey,
        limit: u32,
    ) -> Result<Vec<Value>, BackendError>;

    async fn fetch_reactions(&self, message_ids: &[Uuid]) -> Result<Vec<Value>, BackendError>;

    /// Returns the stored row, including backend-assigned id and created_at.
    async fn insert_message(&self, message: NewMessage) -> Result<Value, BackendError>;

    async fn update_message(&self, id: Uuid, patch: MessagePatch) -> Result<Value, BackendError>;

    async fn insert_reaction(&self, reaction: NewReaction) -> Result<Value, BackendError>;

    async fn delete_reaction(&self, id: Uuid) -> Result<(), BackendError>;

    async fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription, BackendError>;
}

/// Attachment storage. `path` must be collision-free; returns a stable url.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Bytes) -> Result<String, BackendError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn change(table: Table, op: ChangeOp, row: Value) -> RowChange {
        RowChange { table, op, row }
    }

    #[test]
    fn message_filter_checks_channel_and_op() {
        let filter = SubscriptionFilter::messages(ChannelKey::new("general"));

        assert!(filter.matches(&change(
            Table::Messages,
            ChangeOp::Insert,
            json!({ "channel": "general" })
        )));
        assert!(!filter.matches(&change(
            Table::Messages,
            ChangeOp::Insert,
            json!({ "channel": "training" })
        )));
        assert!(!filter.matches(&change(
            Table::Messages,
            ChangeOp::Delete,
            json!({ "channel": "general" })
        )));
        assert!(!filter.matches(&change(
            Table::Reactions,
            ChangeOp::Insert,
            json!({ "channel": "general" })
        )));
    }

    #[test]
    fn reaction_filter_ignores_channel() {
        let filter = SubscriptionFilter::reactions();
        assert!(filter.matches(&change(Table::Reactions, ChangeOp::Delete, json!({ "id": 1 }))));
        assert!(!filter.matches(&change(Table::Reactions, ChangeOp::Update, json!({}))));
    }
}
