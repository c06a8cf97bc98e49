use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use muster_types::{ChannelKey, Identity, Message};

use crate::backend::{BackingStore, BlobStore};
use crate::composer::{AttachmentPolicy, Composer, SubmitContext};
use crate::config::ChatConfig;
use crate::edits::{apply_patch, plan_delete, plan_edit};
use crate::error::{ChatError, ValidationError};
use crate::reactions::ToggleState;
use crate::reconciler::{FeedView, Input, Reconciler};

/// One user's view of the chat: the active channel, its live feed and the
/// write operations on it.
///
/// Sessions are independent; several may share one backend. Must be opened
/// inside a tokio runtime.
pub struct ChatSession {
    identity: Identity,
    config: Arc<ChatConfig>,
    backend: Arc<dyn BackingStore>,
    blobs: Arc<dyn BlobStore>,
    policy: AttachmentPolicy,
    /// Channel the user most recently asked for.
    intended: RwLock<Option<ChannelKey>>,
    inputs: mpsc::UnboundedSender<Input>,
    view: watch::Receiver<FeedView>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ChatSession {
    pub fn open(
        identity: Identity,
        config: ChatConfig,
        backend: Arc<dyn BackingStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let config = Arc::new(config);
        let (inputs, rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(FeedView::default());
        let shutdown = CancellationToken::new();

        let reconciler = Reconciler::new(
            identity.clone(),
            config.clone(),
            backend.clone(),
            inputs.clone(),
            view_tx,
            shutdown.clone(),
        );
        let task = tokio::spawn(reconciler.run(rx));
        info!("Chat session opened for {} ({})", identity.display_name, identity.actor_id);

        Self {
            policy: AttachmentPolicy::from(config.as_ref()),
            identity,
            config,
            backend,
            blobs,
            intended: RwLock::new(None),
            inputs,
            view,
            shutdown,
            task: Some(task),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn active_channel(&self) -> Option<ChannelKey> {
        self.intended
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make `channel` the active one. Returns immediately; the feed fills
    /// in as the load completes.
    pub fn switch_channel(&self, channel: ChannelKey) -> Result<(), ChatError> {
        if !self.config.catalog.contains(&channel) {
            return Err(ValidationError::UnknownChannel(channel).into());
        }

        // Held across the send so concurrent switches reach the task in order.
        let mut intended = self.intended.write().unwrap_or_else(PoisonError::into_inner);
        self.inputs
            .send(Input::SwitchChannel(channel.clone()))
            .map_err(|_| ChatError::SessionClosed)?;
        *intended = Some(channel);
        Ok(())
    }

    /// Add or remove the current actor's `emoji` on `message_id`. Returns
    /// the triple's state right after the request.
    pub async fn toggle_reaction(&self, message_id: Uuid, emoji: &str) -> Result<ToggleState, ChatError> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(ValidationError::EmptyEmoji.into());
        }

        let (reply, rx) = oneshot::channel();
        self.inputs
            .send(Input::Toggle {
                message_id,
                emoji: emoji.to_string(),
                reply,
            })
            .map_err(|_| ChatError::SessionClosed)?;
        rx.await.map_err(|_| ChatError::SessionClosed)?
    }

    /// Submit the composer's draft to the active channel. The draft is kept
    /// on any failure.
    pub async fn submit(&self, composer: &mut Composer) -> Result<Message, ChatError> {
        let channel = self
            .active_channel()
            .ok_or(ValidationError::NoActiveChannel)?;

        let ctx = SubmitContext {
            identity: &self.identity,
            channel: &channel,
            backend: self.backend.as_ref(),
            blobs: self.blobs.as_ref(),
            policy: &self.policy,
        };
        let message = composer.submit(&ctx).await?;

        if self.inputs.send(Input::LocalMessage(message.clone())).is_err() {
            warn!("Session closed before message {} could be shown", message.id);
        }
        Ok(message)
    }

    pub async fn edit_message(&self, message_id: Uuid, body: &str) -> Result<Message, ChatError> {
        let current = self.loaded_message(message_id)?;
        let patch = plan_edit(&self.identity, &current, body)?;
        let updated = apply_patch(self.backend.as_ref(), message_id, patch).await?;
        let _ = self.inputs.send(Input::LocalUpdate(updated.clone()));
        Ok(updated)
    }

    pub async fn delete_message(&self, message_id: Uuid) -> Result<Message, ChatError> {
        let current = self.loaded_message(message_id)?;
        let patch = plan_delete(&self.identity, &current)?;
        let updated = apply_patch(self.backend.as_ref(), message_id, patch).await?;
        let _ = self.inputs.send(Input::LocalUpdate(updated.clone()));
        Ok(updated)
    }

    /// Receiver that observes every published feed view.
    pub fn feed(&self) -> watch::Receiver<FeedView> {
        self.view.clone()
    }

    pub fn current_view(&self) -> FeedView {
        self.view.borrow().clone()
    }

    /// Stop the reconciliation task and wait for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.inputs.send(Input::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Chat session task ended abnormally: {}", e);
            }
        }
    }

    fn loaded_message(&self, message_id: Uuid) -> Result<Message, ChatError> {
        self.view
            .borrow()
            .item(message_id)
            .map(|item| item.message.clone())
            .ok_or(ChatError::UnknownMessage(message_id))
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
