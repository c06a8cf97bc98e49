use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use muster_types::{ChannelEvent, ChannelKey, Identity, Message, NewReaction, RowChange, Table};

use crate::backend::{BackingStore, SubscriptionFilter};
use crate::config::ChatConfig;
use crate::error::{BackendError, ChatError, ReconciliationAnomaly, ValidationError};
use crate::grouping::{FeedItem, build_feed};
use crate::reactions::{ToggleAction, ToggleKey, ToggleState, ToggleTracker};
use crate::retry::RetryPolicy;
use crate::store::{Applied, MessageStore, Snapshot, fetch_snapshot};

/// What the session shows for its active channel.
#[derive(Debug, Clone, Default)]
pub struct FeedView {
    pub channel: Option<ChannelKey>,
    pub items: Vec<FeedItem>,
    /// An initial load (or heal) is still outstanding.
    pub loading: bool,
    /// Both change streams are subscribed.
    pub connected: bool,
    /// Most recent surfaced failure, cleared by the next successful load.
    pub error: Option<ChatError>,
    /// Changes and rows absorbed without effect since the session opened.
    pub anomalies: u64,
    /// Bumped on every publish.
    pub revision: u64,
}

impl FeedView {
    pub fn item(&self, message_id: Uuid) -> Option<&FeedItem> {
        self.items.iter().find(|item| item.message.id == message_id)
    }
}

/// Everything the reconciliation task reacts to.
#[derive(Debug)]
pub(crate) enum Input {
    SwitchChannel(ChannelKey),
    Loaded {
        channel: ChannelKey,
        seq: u64,
        result: Result<Snapshot, ChatError>,
    },
    Change {
        channel: ChannelKey,
        change: RowChange,
    },
    StreamUp {
        channel: ChannelKey,
        table: Table,
        reconnect: bool,
    },
    StreamDown {
        channel: ChannelKey,
        table: Table,
    },
    /// Acknowledged own insert.
    LocalMessage(Message),
    /// Acknowledged own edit or soft delete.
    LocalUpdate(Message),
    Toggle {
        message_id: Uuid,
        emoji: String,
        reply: oneshot::Sender<Result<ToggleState, ChatError>>,
    },
    ToggleSettled {
        channel: ChannelKey,
        key: ToggleKey,
        ticket: u64,
        error: Option<ChatError>,
    },
    Shutdown,
}

/// Owns the store for one session and applies inputs one at a time.
///
/// Backing-store I/O never runs on this loop: loads, subscriptions and
/// reaction writes are spawned and post their results back as inputs.
pub(crate) struct Reconciler {
    identity: Identity,
    config: Arc<ChatConfig>,
    backend: Arc<dyn BackingStore>,
    store: MessageStore,
    toggles: ToggleTracker,
    load_seq: u64,
    loading: bool,
    snapshot_installed: bool,
    /// Events applied while a load is outstanding, re-applied on top of
    /// its snapshot.
    replay: Vec<ChannelEvent>,
    streams_up: HashSet<Table>,
    last_error: Option<ChatError>,
    anomalies: u64,
    revision: u64,
    /// Cancels loads and stream pumps of the active channel.
    channel_token: CancellationToken,
    /// Cancels the outstanding load only.
    load_token: CancellationToken,
    shutdown: CancellationToken,
    inputs: mpsc::UnboundedSender<Input>,
    view: watch::Sender<FeedView>,
}

impl Reconciler {
    pub(crate) fn new(
        identity: Identity,
        config: Arc<ChatConfig>,
        backend: Arc<dyn BackingStore>,
        inputs: mpsc::UnboundedSender<Input>,
        view: watch::Sender<FeedView>,
        shutdown: CancellationToken,
    ) -> Self {
        let channel_token = shutdown.child_token();
        Self {
            store: MessageStore::new(config.max_cached_messages),
            identity,
            config,
            backend,
            toggles: ToggleTracker::new(),
            load_seq: 0,
            loading: false,
            snapshot_installed: false,
            replay: Vec::new(),
            streams_up: HashSet::new(),
            last_error: None,
            anomalies: 0,
            revision: 0,
            load_token: channel_token.child_token(),
            channel_token,
            shutdown,
            inputs,
            view,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>) {
        let shutdown = self.shutdown.clone();
        let period = (self.config.orphan_window / 2).max(Duration::from_secs(1));
        let mut prune = tokio::time::interval(period);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                input = rx.recv() => {
                    let Some(input) = input else { break };
                    if !self.handle(input) {
                        break;
                    }
                }
                _ = prune.tick() => self.prune(Utc::now()),
            }
        }

        self.shutdown.cancel();
        info!("Chat session for {} stopped", self.identity.display_name);
    }

    /// Apply one input. Returns false once the session should stop.
    pub(crate) fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::SwitchChannel(channel) => self.switch_channel(channel),
            Input::Loaded { channel, seq, result } => self.on_loaded(channel, seq, result),
            Input::Change { channel, change } => self.on_change(channel, change),
            Input::StreamUp {
                channel,
                table,
                reconnect,
            } => self.on_stream_up(channel, table, reconnect),
            Input::StreamDown { channel, table } => {
                if self.is_active(&channel) && self.streams_up.remove(&table) {
                    warn!("{:?} stream for {} dropped, reconnecting", table, channel);
                    self.publish();
                }
            }
            Input::LocalMessage(message) => self.apply(ChannelEvent::MessageInserted(message)),
            Input::LocalUpdate(message) => self.apply(ChannelEvent::MessageUpdated(message)),
            Input::Toggle {
                message_id,
                emoji,
                reply,
            } => {
                let result = self.toggle(message_id, emoji);
                let _ = reply.send(result);
            }
            Input::ToggleSettled {
                channel,
                key,
                ticket,
                error,
            } => self.on_toggle_settled(channel, key, ticket, error),
            Input::Shutdown => return false,
        }
        true
    }

    fn is_active(&self, channel: &ChannelKey) -> bool {
        self.store.channel() == Some(channel)
    }

    fn switch_channel(&mut self, channel: ChannelKey) {
        if self.is_active(&channel) {
            debug!("Already on channel {}", channel);
            return;
        }
        info!("Switching to channel {}", channel);

        self.channel_token.cancel();
        self.channel_token = self.shutdown.child_token();
        self.store.switch_channel(channel.clone());
        self.toggles.clear();
        self.replay.clear();
        self.streams_up.clear();
        self.snapshot_installed = false;
        self.last_error = None;

        self.spawn_stream(channel.clone(), SubscriptionFilter::messages(channel.clone()));
        self.spawn_stream(channel.clone(), SubscriptionFilter::reactions());
        self.start_load(channel);
        self.publish();
    }

    fn start_load(&mut self, channel: ChannelKey) {
        self.load_token.cancel();
        self.load_token = self.channel_token.child_token();
        self.load_seq += 1;
        self.loading = true;
        tokio::spawn(run_load(
            self.backend.clone(),
            channel,
            self.config.initial_load_limit,
            self.config.retry,
            self.load_seq,
            self.load_token.clone(),
            self.inputs.clone(),
        ));
    }

    fn spawn_stream(&self, channel: ChannelKey, filter: SubscriptionFilter) {
        tokio::spawn(run_stream(
            self.backend.clone(),
            channel,
            filter,
            self.config.retry,
            self.channel_token.clone(),
            self.inputs.clone(),
        ));
    }

    fn on_loaded(&mut self, channel: ChannelKey, seq: u64, result: Result<Snapshot, ChatError>) {
        if !self.is_active(&channel) || seq != self.load_seq {
            debug!("Discarding stale load #{} for {}", seq, channel);
            return;
        }

        match result {
            Ok(snapshot) => {
                let malformed = snapshot.malformed;
                match self.store.install_snapshot(snapshot) {
                    Ok(()) => {
                        // Whatever happened after the snapshot was read wins.
                        for event in std::mem::take(&mut self.replay) {
                            self.store.apply_event(event);
                        }
                        self.toggles.reapply(&mut self.store);
                        self.anomalies += malformed as u64;
                        info!(
                            "Loaded {} messages for {} ({} malformed rows skipped)",
                            self.store.messages().len(),
                            channel,
                            malformed
                        );
                        self.loading = false;
                        self.snapshot_installed = true;
                        self.last_error = None;
                    }
                    Err(anomaly) => debug!("Snapshot not installed: {}", anomaly),
                }
            }
            Err(e) => {
                warn!("Load for {} failed: {}", channel, e);
                self.last_error = Some(e);
            }
        }
        self.publish();
    }

    fn on_change(&mut self, channel: ChannelKey, change: RowChange) {
        if !self.is_active(&channel) {
            debug!("Dropping change from abandoned channel {}", channel);
            return;
        }

        match ChannelEvent::try_from(change) {
            Ok(event) => self.apply(event),
            Err(e) => {
                warn!("Dropping malformed change in {}: {}", channel, e);
                let anomaly = ReconciliationAnomaly::MalformedRow(e.to_string());
                self.after_apply(Applied::Ignored(anomaly));
            }
        }
    }

    fn apply(&mut self, event: ChannelEvent) {
        if self.loading {
            self.replay.push(event.clone());
        }
        let applied = self.store.apply_event(event);
        self.after_apply(applied);
    }

    fn after_apply(&mut self, applied: Applied) {
        match applied {
            Applied::Ignored(anomaly) => {
                self.anomalies += 1;
                debug!("Change absorbed: {}", anomaly);
            }
            Applied::Parked => debug!("Reaction parked until its message arrives"),
            _ => self.publish(),
        }
    }

    fn on_stream_up(&mut self, channel: ChannelKey, table: Table, reconnect: bool) {
        if !self.is_active(&channel) {
            return;
        }
        self.streams_up.insert(table);

        // Changes committed while the stream was down are lost; reload heals.
        if reconnect || self.snapshot_installed {
            info!("{:?} stream for {} reconnected, reloading", table, channel);
            self.start_load(channel);
        }
        self.publish();
    }

    fn toggle(&mut self, message_id: Uuid, emoji: String) -> Result<ToggleState, ChatError> {
        let Some(channel) = self.store.channel().cloned() else {
            return Err(ValidationError::NoActiveChannel.into());
        };
        if !self.store.contains_message(message_id) {
            return Err(ChatError::UnknownMessage(message_id));
        }

        let key = ToggleKey {
            message_id,
            actor_id: self.identity.actor_id,
            emoji,
        };
        let action = self
            .toggles
            .request(key.clone(), &self.identity.display_name, &mut self.store);
        debug!("Toggle {} on {}: {:?}", key.emoji, message_id, action);
        self.spawn_toggle_write(channel, key.clone(), action);
        self.publish();

        Ok(self.toggles.state(&key, &self.store))
    }

    fn spawn_toggle_write(&self, channel: ChannelKey, key: ToggleKey, action: ToggleAction) {
        let backend = self.backend.clone();
        let inputs = self.inputs.clone();

        tokio::spawn(async move {
            let (result, ticket) = match action {
                ToggleAction::Insert { reaction, ticket } => {
                    let result = backend
                        .insert_reaction(NewReaction::from(&reaction))
                        .await
                        .map(|_| ());
                    (result, ticket)
                }
                ToggleAction::Delete { id, ticket } => match backend.delete_reaction(id).await {
                    // Already gone is what we wanted.
                    Err(BackendError::NotFound(_)) => (Ok(()), ticket),
                    other => (other, ticket),
                },
                ToggleAction::Queued | ToggleAction::Collapsed => return,
            };

            let error = result.err().map(|e| {
                warn!("Reaction write for {} failed: {}", key.message_id, e);
                ChatError::from_write(e)
            });
            let _ = inputs.send(Input::ToggleSettled {
                channel,
                key,
                ticket,
                error,
            });
        });
    }

    fn on_toggle_settled(
        &mut self,
        channel: ChannelKey,
        key: ToggleKey,
        ticket: u64,
        error: Option<ChatError>,
    ) {
        if !self.is_active(&channel) || self.toggles.ticket(&key) != Some(ticket) {
            debug!("Ignoring completion #{} of an abandoned reaction write", ticket);
            return;
        }

        let succeeded = error.is_none();
        if let Some(e) = error {
            self.last_error = Some(e);
        }
        if let Some(next) = self.toggles.complete(&key, ticket, succeeded, &mut self.store) {
            self.spawn_toggle_write(channel, key, next);
        }
        self.publish();
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let dropped = self.store.prune_orphans(now, self.config.orphan_window);
        if dropped > 0 {
            debug!("Dropped {} reactions whose message never arrived", dropped);
        }
    }

    fn publish(&mut self) {
        self.revision += 1;
        let items = build_feed(&self.store, self.identity.actor_id, self.config.header_gap);

        self.view.send_replace(FeedView {
            channel: self.store.channel().cloned(),
            items,
            loading: self.loading,
            connected: self.streams_up.len() == 2,
            error: self.last_error.clone(),
            anomalies: self.anomalies,
            revision: self.revision,
        });
    }
}

/// Fetch a snapshot, retrying transient failures with backoff until it
/// succeeds or the channel is abandoned. Each failure is reported so the
/// view can show it.
async fn run_load(
    backend: Arc<dyn BackingStore>,
    channel: ChannelKey,
    limit: u32,
    retry: RetryPolicy,
    seq: u64,
    token: CancellationToken,
    inputs: mpsc::UnboundedSender<Input>,
) {
    let mut attempt: u32 = 0;
    loop {
        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = fetch_snapshot(backend.as_ref(), &channel, limit) => result,
        };

        let retryable = matches!(&result, Err(e) if e.is_retryable());
        let loaded = Input::Loaded {
            channel: channel.clone(),
            seq,
            result,
        };
        if inputs.send(loaded).is_err() || !retryable {
            return;
        }

        let delay = retry.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        debug!("Retrying load for {} in {:?}", channel, delay);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Keep one change stream subscribed, forwarding its rows and resubscribing
/// with backoff whenever it drops.
async fn run_stream(
    backend: Arc<dyn BackingStore>,
    channel: ChannelKey,
    filter: SubscriptionFilter,
    retry: RetryPolicy,
    token: CancellationToken,
    inputs: mpsc::UnboundedSender<Input>,
) {
    let table = filter.table;
    let mut attempt: u32 = 0;
    let mut interrupted = false;

    loop {
        let subscribed = tokio::select! {
            _ = token.cancelled() => return,
            result = backend.subscribe(filter.clone()) => result,
        };

        match subscribed {
            Ok(mut subscription) => {
                attempt = 0;
                let up = Input::StreamUp {
                    channel: channel.clone(),
                    table,
                    reconnect: interrupted,
                };
                if inputs.send(up).is_err() {
                    return;
                }

                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        change = subscription.next() => {
                            let Some(change) = change else { break };
                            let input = Input::Change {
                                channel: channel.clone(),
                                change,
                            };
                            if inputs.send(input).is_err() {
                                return;
                            }
                        }
                    }
                }

                let down = Input::StreamDown {
                    channel: channel.clone(),
                    table,
                };
                if inputs.send(down).is_err() {
                    return;
                }
            }
            Err(e) => warn!("Subscribing to {:?} for {} failed: {}", table, channel, e),
        }

        interrupted = true;
        let delay = retry.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
