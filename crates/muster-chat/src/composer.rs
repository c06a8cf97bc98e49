use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use muster_types::{ChannelKey, Identity, Message, NewMessage};

use crate::backend::{BackingStore, BlobStore};
use crate::blob::{blob_path, extension_of};
use crate::config::ChatConfig;
use crate::error::{ChatError, ValidationError};
use crate::store::decode_message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAttachment {
    /// Original filename as chosen by the user.
    pub filename: String,
    pub bytes: Bytes,
}

/// Unsent message state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub text: String,
    pub attachment: Option<PendingAttachment>,
    pub reply_to: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPolicy {
    pub max_bytes: usize,
    pub allowed_extensions: Vec<String>,
}

impl From<&ChatConfig> for AttachmentPolicy {
    fn from(config: &ChatConfig) -> Self {
        Self {
            max_bytes: config.max_attachment_bytes,
            allowed_extensions: config.allowed_extensions.clone(),
        }
    }
}

pub fn validate_draft(draft: &Draft, policy: &AttachmentPolicy) -> Result<(), ValidationError> {
    let Some(attachment) = &draft.attachment else {
        if draft.text.trim().is_empty() {
            return Err(ValidationError::EmptyDraft);
        }
        return Ok(());
    };

    let ext = extension_of(&attachment.filename).unwrap_or_default();
    if !policy.allowed_extensions.iter().any(|allowed| *allowed == ext) {
        return Err(ValidationError::AttachmentTypeNotAllowed(ext));
    }
    if attachment.bytes.len() > policy.max_bytes {
        return Err(ValidationError::AttachmentTooLarge {
            size: attachment.bytes.len(),
            max: policy.max_bytes,
        });
    }
    Ok(())
}

/// Collaborators and identity a submission runs against.
pub struct SubmitContext<'a> {
    pub identity: &'a Identity,
    pub channel: &'a ChannelKey,
    pub backend: &'a dyn BackingStore,
    pub blobs: &'a dyn BlobStore,
    pub policy: &'a AttachmentPolicy,
}

/// Holds the draft and submits it.
///
/// The draft is only cleared once the backing store acknowledged the
/// message; any failure leaves it intact for a retry.
#[derive(Debug, Default)]
pub struct Composer {
    draft: Draft,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draft(&self) -> &Draft {
        &self.draft
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.draft.text = text.into();
    }

    pub fn attach(&mut self, filename: impl Into<String>, bytes: Bytes) {
        self.draft.attachment = Some(PendingAttachment {
            filename: filename.into(),
            bytes,
        });
    }

    pub fn remove_attachment(&mut self) {
        self.draft.attachment = None;
    }

    /// Reply to `message_id`. A target deleted before sending is still
    /// referenced and renders as deleted.
    pub fn reply_to(&mut self, message_id: Uuid) {
        self.draft.reply_to = Some(message_id);
    }

    pub fn cancel_reply(&mut self) {
        self.draft.reply_to = None;
    }

    pub async fn submit(&mut self, ctx: &SubmitContext<'_>) -> Result<Message, ChatError> {
        validate_draft(&self.draft, ctx.policy)?;

        let stored = submit_draft(&self.draft, ctx).await?;
        // Stored from here on; resending would post it twice.
        self.draft = Draft::default();

        let message = decode_message(stored).map_err(|e| {
            warn!("Posted to {} but the stored row is unreadable: {}", ctx.channel, e);
            ChatError::from(e)
        })?;
        info!("Posted message {} to {}", message.id, message.channel);
        Ok(message)
    }
}

async fn submit_draft(draft: &Draft, ctx: &SubmitContext<'_>) -> Result<Value, ChatError> {
    let (attachment_url, attachment_name) = match &draft.attachment {
        Some(attachment) => {
            let path = blob_path(&attachment.filename, Utc::now());
            let url = ctx
                .blobs
                .put(&path, attachment.bytes.clone())
                .await
                .map_err(|e| {
                    warn!("Attachment upload of {} failed: {}", attachment.filename, e);
                    ChatError::from_write(e)
                })?;
            (Some(url), Some(attachment.filename.clone()))
        }
        None => (None, None),
    };

    let text = draft.text.trim();
    let row = NewMessage {
        channel: ctx.channel.clone(),
        author_id: ctx.identity.actor_id,
        author_name: ctx.identity.display_name.clone(),
        author_avatar: ctx.identity.avatar.clone(),
        body: (!text.is_empty()).then(|| text.to_string()),
        attachment_url,
        attachment_name,
        reply_to: draft.reply_to,
    };

    ctx.backend.insert_message(row).await.map_err(|e| {
        warn!("Message insert into {} failed: {}", ctx.channel, e);
        ChatError::from_write(e)
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use muster_types::{MessagePatch, NewReaction};

    use super::*;
    use crate::backend::{Subscription, SubscriptionFilter};
    use crate::error::BackendError;
    use crate::memory::{MemoryBackend, MemoryBlobStore};

    /// Stores inserts but answers with a row that does not decode.
    struct GarbledAck(MemoryBackend);

    #[async_trait]
    impl BackingStore for GarbledAck {
        async fn fetch_recent_messages(
            &self,
            channel: &ChannelKey,
            limit: u32,
        ) -> Result<Vec<Value>, BackendError> {
            self.0.fetch_recent_messages(channel, limit).await
        }

        async fn fetch_reactions(&self, message_ids: &[Uuid]) -> Result<Vec<Value>, BackendError> {
            self.0.fetch_reactions(message_ids).await
        }

        async fn insert_message(&self, message: NewMessage) -> Result<Value, BackendError> {
            self.0.insert_message(message).await?;
            Ok(serde_json::json!({ "id": "garbled" }))
        }

        async fn update_message(&self, id: Uuid, patch: MessagePatch) -> Result<Value, BackendError> {
            self.0.update_message(id, patch).await
        }

        async fn insert_reaction(&self, reaction: NewReaction) -> Result<Value, BackendError> {
            self.0.insert_reaction(reaction).await
        }

        async fn delete_reaction(&self, id: Uuid) -> Result<(), BackendError> {
            self.0.delete_reaction(id).await
        }

        async fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription, BackendError> {
            self.0.subscribe(filter).await
        }
    }

    fn identity() -> Identity {
        Identity {
            actor_id: Uuid::new_v4(),
            display_name: "Sam".into(),
            avatar: None,
            elevated: false,
        }
    }

    fn policy() -> AttachmentPolicy {
        AttachmentPolicy::from(&ChatConfig::default())
    }

    #[test]
    fn empty_draft_is_rejected() {
        let draft = Draft {
            text: "   ".into(),
            ..Draft::default()
        };
        assert_eq!(validate_draft(&draft, &policy()), Err(ValidationError::EmptyDraft));
    }

    #[test]
    fn attachment_alone_is_enough() {
        let draft = Draft {
            attachment: Some(PendingAttachment {
                filename: "orders.pdf".into(),
                bytes: Bytes::from_static(b"%PDF"),
            }),
            ..Draft::default()
        };
        assert_eq!(validate_draft(&draft, &policy()), Ok(()));
    }

    #[test]
    fn disallowed_type_is_rejected() {
        let draft = Draft {
            text: "see attached".into(),
            attachment: Some(PendingAttachment {
                filename: "setup.exe".into(),
                bytes: Bytes::from_static(b"MZ"),
            }),
            reply_to: None,
        };
        assert_eq!(
            validate_draft(&draft, &policy()),
            Err(ValidationError::AttachmentTypeNotAllowed("exe".into()))
        );
    }

    #[tokio::test]
    async fn oversized_attachment_never_reaches_collaborators() {
        let backend = MemoryBackend::new();
        let blobs = MemoryBlobStore::new();
        let identity = identity();
        let channel = ChannelKey::new("general");
        let policy = policy();
        let ctx = SubmitContext {
            identity: &identity,
            channel: &channel,
            backend: &backend,
            blobs: &blobs,
            policy: &policy,
        };

        let mut composer = Composer::new();
        composer.set_text("roster scan");
        composer.attach("roster.png", Bytes::from(vec![0u8; 15 * 1024 * 1024]));

        let err = composer.submit(&ctx).await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::Validation(ValidationError::AttachmentTooLarge { .. })
        ));
        assert_eq!(backend.call_count(), 0);
        assert_eq!(blobs.put_count(), 0);
        assert!(composer.draft().attachment.is_some());
    }

    #[tokio::test]
    async fn uploads_then_posts_and_clears_draft() {
        let backend = MemoryBackend::new();
        let blobs = MemoryBlobStore::new();
        let identity = identity();
        let channel = ChannelKey::new("general");
        let policy = policy();
        let ctx = SubmitContext {
            identity: &identity,
            channel: &channel,
            backend: &backend,
            blobs: &blobs,
            policy: &policy,
        };

        let mut composer = Composer::new();
        let target = Uuid::new_v4();
        composer.set_text("  orders attached  ");
        composer.attach("Orders.pdf", Bytes::from_static(b"%PDF-1.7"));
        composer.reply_to(target);

        let message = composer.submit(&ctx).await.unwrap();
        assert_eq!(message.body.as_deref(), Some("orders attached"));
        assert_eq!(message.reply_to, Some(target));
        let attachment = message.attachment.expect("attachment should be stored");
        assert_eq!(attachment.filename, "Orders.pdf");
        assert!(attachment.url.ends_with(".pdf"));
        assert_eq!(blobs.put_count(), 1);
        assert_eq!(composer.draft(), &Draft::default());
    }

    #[tokio::test]
    async fn failed_write_keeps_draft() {
        let backend = MemoryBackend::new();
        backend.set_unreachable(true);
        let blobs = MemoryBlobStore::new();
        let identity = identity();
        let channel = ChannelKey::new("general");
        let policy = policy();
        let ctx = SubmitContext {
            identity: &identity,
            channel: &channel,
            backend: &backend,
            blobs: &blobs,
            policy: &policy,
        };

        let mut composer = Composer::new();
        composer.set_text("hello?");
        let err = composer.submit(&ctx).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(composer.draft().text, "hello?");
    }

    #[tokio::test]
    async fn unreadable_ack_still_clears_draft() {
        let inner = MemoryBackend::new();
        let backend = GarbledAck(inner.clone());
        let blobs = MemoryBlobStore::new();
        let identity = identity();
        let channel = ChannelKey::new("general");
        let policy = policy();
        let ctx = SubmitContext {
            identity: &identity,
            channel: &channel,
            backend: &backend,
            blobs: &blobs,
            policy: &policy,
        };

        let mut composer = Composer::new();
        composer.set_text("sent once");
        let err = composer.submit(&ctx).await.unwrap_err();

        assert!(matches!(err, ChatError::InvalidRow(_)));
        assert!(!err.is_retryable());
        assert_eq!(composer.draft(), &Draft::default());
        assert_eq!(inner.write_count(), 1);
    }
}
