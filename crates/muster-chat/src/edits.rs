use tracing::info;
use uuid::Uuid;

use muster_types::{Identity, Message, MessagePatch};

use crate::backend::BackingStore;
use crate::error::{ChatError, ValidationError};
use crate::store::decode_message;

/// Check that `identity` may replace the body of `message` with `body`.
pub fn plan_edit(identity: &Identity, message: &Message, body: &str) -> Result<MessagePatch, ChatError> {
    if !identity.may_modify(message) {
        return Err(ChatError::Forbidden(message.id));
    }
    if message.deleted {
        return Err(ValidationError::MessageDeleted(message.id).into());
    }
    let body = body.trim();
    if body.is_empty() && message.attachment.is_none() {
        return Err(ValidationError::EmptyEdit.into());
    }
    Ok(MessagePatch::Edit {
        body: body.to_string(),
    })
}

/// Soft delete. Deleting an already deleted message is allowed and a no-op
/// on the backend side.
pub fn plan_delete(identity: &Identity, message: &Message) -> Result<MessagePatch, ChatError> {
    if !identity.may_modify(message) {
        return Err(ChatError::Forbidden(message.id));
    }
    Ok(MessagePatch::SoftDelete)
}

pub async fn apply_patch(
    backend: &dyn BackingStore,
    id: Uuid,
    patch: MessagePatch,
) -> Result<Message, ChatError> {
    let stored = backend
        .update_message(id, patch)
        .await
        .map_err(ChatError::from_write)?;
    let message = decode_message(stored)?;
    info!("Updated message {} in {}", message.id, message.channel);
    Ok(message)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use muster_types::{Attachment, ChannelKey};

    use super::*;

    fn identity(elevated: bool) -> Identity {
        Identity {
            actor_id: Uuid::from_u128(1),
            display_name: "Sam".into(),
            avatar: None,
            elevated,
        }
    }

    fn message_by(author: u128) -> Message {
        Message {
            id: Uuid::new_v4(),
            channel: ChannelKey::new("general"),
            author: Identity {
                actor_id: Uuid::from_u128(author),
                display_name: "Kim".into(),
                avatar: None,
                elevated: false,
            }
            .author(),
            body: Some("original".into()),
            attachment: None,
            reply_to: None,
            created_at: Utc::now(),
            edited_at: None,
            deleted: false,
        }
    }

    #[test]
    fn authors_may_edit_their_own_messages() {
        let patch = plan_edit(&identity(false), &message_by(1), "  fixed  ").unwrap();
        assert_eq!(patch, MessagePatch::Edit { body: "fixed".into() });
    }

    #[test]
    fn others_need_elevation() {
        let msg = message_by(2);
        assert_eq!(
            plan_edit(&identity(false), &msg, "mine now"),
            Err(ChatError::Forbidden(msg.id))
        );
        assert_eq!(plan_delete(&identity(false), &msg), Err(ChatError::Forbidden(msg.id)));
        assert_eq!(plan_delete(&identity(true), &msg), Ok(MessagePatch::SoftDelete));
    }

    #[test]
    fn deleted_messages_cannot_be_edited() {
        let mut msg = message_by(1);
        msg.soft_delete();
        assert_eq!(
            plan_edit(&identity(false), &msg, "revive"),
            Err(ChatError::Validation(ValidationError::MessageDeleted(msg.id)))
        );
    }

    #[test]
    fn blank_edit_needs_an_attachment() {
        let mut msg = message_by(1);
        assert_eq!(
            plan_edit(&identity(false), &msg, "   "),
            Err(ChatError::Validation(ValidationError::EmptyEdit))
        );

        msg.attachment = Some(Attachment {
            url: "memory://1-abc.pdf".into(),
            filename: "orders.pdf".into(),
        });
        assert!(plan_edit(&identity(false), &msg, "").is_ok());
    }
}
