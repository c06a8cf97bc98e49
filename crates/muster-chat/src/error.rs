use muster_types::{ChannelKey, RowError};
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by a backing-store or blob-store collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backing store unreachable: {0}")]
    Unreachable(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("unique constraint violated: {0}")]
    Conflict(String),

    #[error("row not found: {0}")]
    NotFound(String),
}

impl BackendError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Rejected drafts and edits. Never reaches the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("a message needs text or an attachment")]
    EmptyDraft,

    #[error("attachment is {size} bytes, the limit is {max}")]
    AttachmentTooLarge { size: usize, max: usize },

    #[error("attachment type '{0}' is not allowed")]
    AttachmentTypeNotAllowed(String),

    #[error("unknown channel '{0}'")]
    UnknownChannel(ChannelKey),

    #[error("an edited message must keep some text")]
    EmptyEdit,

    #[error("message {0} has been deleted")]
    MessageDeleted(Uuid),

    #[error("a reaction needs an emoji")]
    EmptyEmoji,

    #[error("no channel selected")]
    NoActiveChannel,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to load channel: {0}")]
    Fetch(BackendError),

    #[error("network error: {0}")]
    TransientNetwork(BackendError),

    #[error("write rejected: {0}")]
    WriteRejected(BackendError),

    #[error("not permitted to modify message {0}")]
    Forbidden(Uuid),

    #[error("message {0} is not loaded in this channel")]
    UnknownMessage(Uuid),

    #[error("backing store returned an invalid row: {0}")]
    InvalidRow(String),

    #[error("chat session is closed")]
    SessionClosed,
}

impl ChatError {
    /// Classify a failed write. Writes are never retried automatically;
    /// transient failures are surfaced so the user can retry.
    pub fn from_write(err: BackendError) -> Self {
        if err.is_transient() {
            Self::TransientNetwork(err)
        } else {
            Self::WriteRejected(err)
        }
    }

    /// Whether the user should be offered a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::Fetch(_))
    }
}

impl From<RowError> for ChatError {
    fn from(err: RowError) -> Self {
        Self::InvalidRow(err.to_string())
    }
}

/// Events that cannot be applied as-is. Absorbed, logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconciliationAnomaly {
    #[error("event references unknown id {0}")]
    UnknownId(Uuid),

    #[error("duplicate insert for id {0}")]
    DuplicateId(Uuid),

    #[error("event for channel '{got}' while '{expected:?}' is active")]
    ForeignChannel {
        expected: Option<ChannelKey>,
        got: ChannelKey,
    },

    #[error("malformed row: {0}")]
    MalformedRow(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_write_failures() {
        let transient = ChatError::from_write(BackendError::Unreachable("timeout".into()));
        assert!(matches!(transient, ChatError::TransientNetwork(_)));
        assert!(transient.is_retryable());

        let permanent = ChatError::from_write(BackendError::Rejected("bad row".into()));
        assert!(matches!(permanent, ChatError::WriteRejected(_)));
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn validation_errors_are_transparent() {
        let err: ChatError = ValidationError::EmptyDraft.into();
        assert_eq!(err.to_string(), "a message needs text or an attachment");
    }
}
