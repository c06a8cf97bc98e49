//! Channel-scoped realtime messaging core.
//!
//! A [`ChatSession`] owns the local cache of one active channel, keeps it
//! reconciled with the backing store's change streams, and exposes the
//! write paths (compose, edit, soft delete, reaction toggle). The rendered
//! feed is published as a [`FeedView`] through a `watch` channel.

pub mod backend;
pub mod blob;
pub mod composer;
pub mod config;
pub mod edits;
pub mod error;
pub mod grouping;
pub mod memory;
pub mod reactions;
mod reconciler;
pub mod retry;
pub mod session;
pub mod store;

pub use backend::{BackingStore, BlobStore, Subscription, SubscriptionFilter};
pub use blob::FsBlobStore;
pub use composer::{AttachmentPolicy, Composer, Draft, PendingAttachment};
pub use config::ChatConfig;
pub use error::{BackendError, ChatError, ReconciliationAnomaly, ValidationError};
pub use grouping::{DELETED_LABEL, FeedItem, ReplyPreview};
pub use memory::{MemoryBackend, MemoryBlobStore};
pub use reactions::{ToggleKey, ToggleState};
pub use reconciler::FeedView;
pub use retry::RetryPolicy;
pub use session::ChatSession;
pub use store::{Applied, MessageStore, Snapshot};
