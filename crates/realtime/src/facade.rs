//! Messaging Facade.
//!
//! The in-memory source of truth for the displayed conversation's messages
//! and the signed-in user's conversation list. Store responses and realtime
//! events are merged here by identity, so racing fetches and echoes never
//! produce duplicates or out-of-order entries.
//!
//! `send` never appends locally: the message shows up when its realtime
//! insert arrives, which is the only path that grows the timeline.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use studyhall_chats::{
    ChatError, ChatResult, Conversation, ConversationId, ConversationStore, ConversationSummary, Message,
    MessageId, MessageLimits, MessagePage, NewConversation, OutgoingMessage, Pagination, Participant,
    ReadReceipt, UserId, Validator, DEFAULT_PAGE_SIZE,
};

use crate::events::{ConnectionState, EventStream, RealtimeEvent};
use crate::session::{ChannelGuard, RealtimeSessionManager};
use crate::timeline::MessageTimeline;
use crate::typing::{RemoteTypers, StoreTypingSignaller, TypingCoordinator, DEFAULT_TYPING_IDLE};

/// Tunables for a facade.
#[derive(Debug, Clone)]
pub struct FacadeSettings {
    pub typing_idle: Duration,
    pub page_size: usize,
    pub limits: MessageLimits,
}

impl Default for FacadeSettings {
    fn default() -> Self {
        Self {
            typing_idle: DEFAULT_TYPING_IDLE,
            page_size: DEFAULT_PAGE_SIZE,
            limits: MessageLimits::default(),
        }
    }
}

/// A send that did not go through. `draft` is handed back untouched so the
/// caller can restore it into the composer.
#[derive(Debug, Error)]
#[error("message not sent: {source}")]
pub struct SendError {
    pub draft: OutgoingMessage,
    pub source: ChatError,
}

impl SendError {
    fn new(draft: OutgoingMessage, source: ChatError) -> Self {
        Self { draft, source }
    }
}

#[derive(Debug)]
struct FacadeState {
    conversation_id: Option<ConversationId>,
    /// Bumped on every conversation switch; stale loads and pumps compare against it
    view_generation: u64,
    timeline: MessageTimeline,
    has_more: bool,
    receipts: HashMap<MessageId, HashSet<UserId>>,
    conversations: HashMap<ConversationId, ConversationSummary>,
    remote_typing: RemoteTypers,
    loads_in_flight: usize,
}

impl FacadeState {
    fn new(typing_idle: Duration) -> Self {
        Self {
            conversation_id: None,
            view_generation: 0,
            timeline: MessageTimeline::new(),
            has_more: false,
            receipts: HashMap::new(),
            conversations: HashMap::new(),
            remote_typing: RemoteTypers::new(typing_idle),
            loads_in_flight: 0,
        }
    }

    fn switch_to(&mut self, conversation_id: Option<ConversationId>) -> u64 {
        self.conversation_id = conversation_id;
        self.view_generation += 1;
        self.timeline.clear();
        self.has_more = false;
        self.receipts.clear();
        self.remote_typing.clear();
        self.view_generation
    }

    fn is_current(&self, conversation_id: ConversationId, generation: u64) -> bool {
        self.conversation_id == Some(conversation_id) && self.view_generation == generation
    }

    fn has_read(&self, message_id: &MessageId, user_id: UserId) -> bool {
        self.receipts
            .get(message_id)
            .map_or(false, |readers| readers.contains(&user_id))
    }

    fn is_unread(&self, message: &Message, user_id: UserId) -> bool {
        message.sender_id != user_id && !message.is_deleted && !message.is_system() && !self.has_read(&message.id, user_id)
    }

    fn add_receipts(&mut self, receipts: impl IntoIterator<Item = ReadReceipt>) {
        for receipt in receipts {
            self.receipts.entry(receipt.message_id).or_default().insert(receipt.user_id);
        }
    }

    /// Replace the timeline with the latest page, keeping anything held
    /// locally that is newer than the page (realtime inserts that landed
    /// while the fetch was in flight).
    fn apply_latest_page(&mut self, page: MessagePage) {
        let carried: Vec<Message> = match page.messages.last() {
            Some(tail) => self
                .timeline
                .iter()
                .filter(|message| message.timeline_cmp(tail).is_gt())
                .cloned()
                .collect(),
            None => self.timeline.to_vec(),
        };

        self.has_more = page.has_more;
        self.add_receipts(page.receipts);
        self.timeline.reset(page.messages.into_iter().chain(carried));
    }

    fn apply_incoming(&mut self, user_id: UserId, message: Message) {
        if let Some(summary) = self.conversations.get_mut(&message.conversation_id) {
            let newer = summary
                .conversation
                .last_message_at
                .map_or(true, |at| message.created_at >= at);
            if newer {
                summary.conversation.touch(message.created_at, &message.preview());
            }
        }

        if self.conversation_id != Some(message.conversation_id) {
            return;
        }
        let unread = self.is_unread(&message, user_id);
        let conversation_id = message.conversation_id;
        if self.timeline.upsert(message) && unread {
            if let Some(summary) = self.conversations.get_mut(&conversation_id) {
                summary.unread_count += 1;
            }
        }
    }

    fn apply_update(&mut self, message: Message) {
        if self.conversation_id != Some(message.conversation_id) {
            return;
        }
        let message_id = message.id;
        if !self.timeline.replace(message) {
            debug!(%message_id, "dropping update for message not held locally");
        }
    }

    fn apply_participant(&mut self, participant: Participant) {
        let Some(summary) = self.conversations.get_mut(&participant.conversation_id) else {
            return;
        };
        match summary
            .participants
            .iter_mut()
            .find(|existing| existing.user_id == participant.user_id)
        {
            Some(existing) => *existing = participant,
            None => summary.participants.push(participant),
        }
    }
}

struct ConversationScope {
    conversation_id: ConversationId,
    _channel: ChannelGuard,
    pump: JoinHandle<()>,
    typing: TypingCoordinator,
}

impl Drop for ConversationScope {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

struct UserIndexScope {
    _channel: ChannelGuard,
    pump: JoinHandle<()>,
}

impl Drop for UserIndexScope {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[derive(Default)]
struct Scopes {
    conversation: Option<ConversationScope>,
    user_index: Option<UserIndexScope>,
}

struct FacadeInner {
    // dropped first: scopes release their channels through `sessions`
    scopes: Mutex<Scopes>,
    // held across a whole scope switch so overlapping opens install in call order
    switching: tokio::sync::Mutex<()>,
    user_id: UserId,
    store: Arc<dyn ConversationStore>,
    sessions: RealtimeSessionManager,
    settings: FacadeSettings,
    state: RwLock<FacadeState>,
}

impl FacadeInner {
    fn scopes(&self) -> MutexGuard<'_, Scopes> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-user messaging aggregate. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MessagingFacade {
    inner: Arc<FacadeInner>,
}

impl MessagingFacade {
    pub fn new(
        user_id: UserId,
        store: Arc<dyn ConversationStore>,
        sessions: RealtimeSessionManager,
        settings: FacadeSettings,
    ) -> Self {
        let state = FacadeState::new(settings.typing_idle);
        Self {
            inner: Arc::new(FacadeInner {
                scopes: Mutex::new(Scopes::default()),
                switching: tokio::sync::Mutex::new(()),
                user_id,
                store,
                sessions,
                settings,
                state: RwLock::new(state),
            }),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.inner.user_id
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.sessions.connection_state()
    }

    pub async fn current_conversation(&self) -> Option<ConversationId> {
        self.inner.state.read().await.conversation_id
    }

    // ---- scope management ----

    /// Display a conversation: release the previous one, subscribe to the new
    /// one and load its latest page.
    ///
    /// If the subscribe fails the conversation stays selected without a live
    /// channel; calling this again retries.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> ChatResult<()> {
        Validator::id(conversation_id, "Conversation id")?;
        let generation = {
            let _switching = self.inner.switching.lock().await;
            self.release_conversation().await;

            let generation = self.inner.state.write().await.switch_to(Some(conversation_id));

            let (tx, rx) = mpsc::unbounded_channel();
            let channel = self
                .inner
                .sessions
                .open_conversation_channel(conversation_id, self.inner.user_id, tx)
                .await?;
            let pump = tokio::spawn(pump_events(Arc::downgrade(&self.inner), rx, Some((conversation_id, generation))));
            let signaller = StoreTypingSignaller::new(
                self.inner.user_id,
                self.inner.store.clone(),
                self.inner.sessions.notifier(),
            );
            let typing = TypingCoordinator::new(conversation_id, self.inner.settings.typing_idle, Arc::new(signaller));

            let replaced = self.inner.scopes().conversation.replace(ConversationScope {
                conversation_id,
                _channel: channel,
                pump,
                typing,
            });
            drop(replaced);
            info!(%conversation_id, user_id = %self.inner.user_id, "conversation opened");
            generation
        };

        // outside the switch lock: a slow page must not hold up the next switch
        self.load_latest(conversation_id, generation).await
    }

    /// Tear down the displayed conversation. Sends a best-effort typing stop.
    pub async fn close_conversation(&self) {
        let _switching = self.inner.switching.lock().await;
        self.release_conversation().await;
    }

    async fn release_conversation(&self) {
        let scope = self.inner.scopes().conversation.take();
        if let Some(scope) = scope {
            scope.typing.shutdown().await;
            debug!(conversation_id = %scope.conversation_id, "conversation closed");
        }
        self.inner.state.write().await.switch_to(None);
    }

    /// Subscribe to the user's conversation index and load the list. Every
    /// coarse change signal triggers a full reload.
    pub async fn open_user_index(&self) -> ChatResult<()> {
        {
            let _switching = self.inner.switching.lock().await;
            drop(self.inner.scopes().user_index.take());

            let (tx, rx) = mpsc::unbounded_channel();
            let channel = self.inner.sessions.open_user_index_channel(self.inner.user_id, tx).await?;
            let pump = tokio::spawn(pump_events(Arc::downgrade(&self.inner), rx, None));
            let replaced = self.inner.scopes().user_index.replace(UserIndexScope {
                _channel: channel,
                pump,
            });
            drop(replaced);
        }

        self.load_conversations().await
    }

    pub fn close_user_index(&self) {
        drop(self.inner.scopes().user_index.take());
    }

    /// Release everything this facade holds open.
    pub async fn shutdown(&self) {
        self.close_conversation().await;
        self.close_user_index();
    }

    // ---- loading ----

    /// Fetch the latest page of the open conversation and replace the local
    /// sequence with it. Concurrent calls are fine: whichever completes last
    /// wins, and a page for a conversation that is no longer displayed is
    /// discarded.
    pub async fn load_messages(&self, conversation_id: ConversationId) -> ChatResult<()> {
        let generation = {
            let state = self.inner.state.read().await;
            if state.conversation_id != Some(conversation_id) {
                return Err(ChatError::validation(format!("conversation {} is not open", conversation_id)));
            }
            state.view_generation
        };
        self.load_latest(conversation_id, generation).await
    }

    /// Fetch and apply the latest page for the view `generation` names. A view
    /// that has already moved on is left alone.
    async fn load_latest(&self, conversation_id: ConversationId, generation: u64) -> ChatResult<()> {
        {
            let mut state = self.inner.state.write().await;
            if !state.is_current(conversation_id, generation) {
                debug!(%conversation_id, "skipping load for a superseded view");
                return Ok(());
            }
            state.loads_in_flight += 1;
        }

        let result = self
            .inner
            .store
            .fetch_messages(
                conversation_id,
                self.inner.user_id,
                Pagination::latest(self.inner.settings.page_size),
            )
            .await;

        let mut state = self.inner.state.write().await;
        state.loads_in_flight = state.loads_in_flight.saturating_sub(1);
        let page = result?;
        if !state.is_current(conversation_id, generation) {
            debug!(%conversation_id, "discarding page for a conversation no longer displayed");
            return Ok(());
        }
        debug!(%conversation_id, count = page.messages.len(), has_more = page.has_more, "messages loaded");
        state.apply_latest_page(page);
        Ok(())
    }

    /// Backfill the page before the oldest loaded message. Returns how many
    /// messages were added.
    pub async fn load_older(&self) -> ChatResult<usize> {
        let (conversation_id, generation, before) = {
            let mut state = self.inner.state.write().await;
            let Some(conversation_id) = state.conversation_id else {
                return Err(ChatError::validation("No conversation is open"));
            };
            let Some(before) = state.timeline.oldest().map(|m| m.created_at) else {
                return Ok(0);
            };
            if !state.has_more {
                return Ok(0);
            }
            state.loads_in_flight += 1;
            (conversation_id, state.view_generation, before)
        };

        let result = self
            .inner
            .store
            .fetch_messages(
                conversation_id,
                self.inner.user_id,
                Pagination::before(self.inner.settings.page_size, before),
            )
            .await;

        let mut state = self.inner.state.write().await;
        state.loads_in_flight = state.loads_in_flight.saturating_sub(1);
        let page = result?;
        if !state.is_current(conversation_id, generation) {
            return Ok(0);
        }
        state.has_more = page.has_more;
        state.add_receipts(page.receipts);
        let mut added = 0;
        for message in page.messages {
            if state.timeline.upsert(message) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Fetch the conversation list and replace the local map with it.
    pub async fn load_conversations(&self) -> ChatResult<()> {
        self.inner.state.write().await.loads_in_flight += 1;
        let result = self.inner.store.fetch_conversations(self.inner.user_id).await;

        let mut state = self.inner.state.write().await;
        state.loads_in_flight = state.loads_in_flight.saturating_sub(1);
        let summaries = result?;
        debug!(count = summaries.len(), "conversation list loaded");
        state.conversations = summaries
            .into_iter()
            .map(|summary| (summary.conversation.id, summary))
            .collect();
        Ok(())
    }

    // ---- writes ----

    /// Send a message to the open conversation.
    ///
    /// Blank messages are rejected before any store call. On failure the
    /// draft is returned and local state is untouched; on success the local
    /// typing burst is stopped and the message appears once its realtime
    /// insert arrives.
    pub async fn send(&self, draft: OutgoingMessage) -> Result<Message, SendError> {
        let Some(conversation_id) = self.current_conversation().await else {
            return Err(SendError::new(draft, ChatError::validation("No conversation is open")));
        };
        if let Err(error) = Validator::outgoing_message(&draft, &self.inner.settings.limits) {
            return Err(SendError::new(draft, error));
        }

        match self
            .inner
            .store
            .create_message(conversation_id, self.inner.user_id, &draft)
            .await
        {
            Ok(message) => {
                debug!(%conversation_id, message_id = %message.id, "message sent");
                if let Some(typing) = self.typing_coordinator() {
                    typing.shutdown().await;
                }
                Ok(message)
            }
            Err(error) => {
                warn!(%conversation_id, %error, "send failed");
                Err(SendError::new(draft, error))
            }
        }
    }

    /// Shorthand for sending plain text.
    pub async fn send_text(&self, content: impl Into<String>) -> Result<Message, SendError> {
        self.send(OutgoingMessage::text(content)).await
    }

    /// Acknowledge messages as read. An empty list does nothing. Failures are
    /// logged, never returned: a stale unread count heals on the next sync.
    pub async fn mark_read(&self, message_ids: &[MessageId]) {
        if message_ids.is_empty() {
            return;
        }
        let Some(conversation_id) = self.current_conversation().await else {
            debug!("mark_read with no conversation open");
            return;
        };

        if let Err(error) = self
            .inner
            .store
            .mark_read(conversation_id, self.inner.user_id, message_ids)
            .await
        {
            warn!(%conversation_id, %error, count = message_ids.len(), "mark_read failed");
            return;
        }

        let user_id = self.inner.user_id;
        let mut state = self.inner.state.write().await;
        if state.conversation_id != Some(conversation_id) {
            return;
        }
        let newly_read = message_ids
            .iter()
            .filter(|id| state.timeline.get(id).map_or(false, |m| state.is_unread(m, user_id)))
            .count();
        for id in message_ids {
            state.receipts.entry(*id).or_default().insert(user_id);
        }
        if let Some(summary) = state.conversations.get_mut(&conversation_id) {
            summary.unread_count = summary.unread_count.saturating_sub(newly_read);
        }
    }

    /// Register a keystroke in the open conversation.
    pub async fn start_typing(&self) -> ChatResult<()> {
        match self.typing_coordinator() {
            Some(typing) => typing.keystroke().await,
            None => Err(ChatError::validation("No conversation is open")),
        }
    }

    /// Explicit typing stop, e.g. the input was cleared.
    pub async fn stop_typing(&self) -> ChatResult<()> {
        match self.typing_coordinator() {
            Some(typing) => typing.stop().await,
            None => Ok(()),
        }
    }

    /// Edit one of the user's messages. The local copy changes when the
    /// realtime update arrives.
    pub async fn edit(&self, message_id: MessageId, content: impl Into<String>) -> ChatResult<Message> {
        self.inner
            .store
            .edit_message(message_id, self.inner.user_id, content.into())
            .await
    }

    /// Soft-delete one of the user's messages.
    pub async fn delete(&self, message_id: MessageId) -> ChatResult<Message> {
        self.inner.store.delete_message(message_id, self.inner.user_id).await
    }

    pub async fn react(&self, message_id: MessageId, emoji: &str) -> ChatResult<Message> {
        self.inner
            .store
            .toggle_reaction(message_id, self.inner.user_id, emoji)
            .await
    }

    /// Create (or, for direct conversations, find) a conversation and refresh the list.
    pub async fn create_conversation(&self, request: &NewConversation) -> ChatResult<Conversation> {
        let conversation = self
            .inner
            .store
            .create_conversation(self.inner.user_id, request)
            .await?;
        self.reload_conversations_quietly().await;
        Ok(conversation)
    }

    pub async fn add_participants(
        &self,
        conversation_id: ConversationId,
        user_ids: &[UserId],
    ) -> ChatResult<Vec<Participant>> {
        let added = self
            .inner
            .store
            .add_participants(conversation_id, self.inner.user_id, user_ids)
            .await?;
        self.reload_conversations_quietly().await;
        Ok(added)
    }

    pub async fn remove_participants(
        &self,
        conversation_id: ConversationId,
        user_ids: &[UserId],
    ) -> ChatResult<Vec<Participant>> {
        let removed = self
            .inner
            .store
            .remove_participants(conversation_id, self.inner.user_id, user_ids)
            .await?;
        self.reload_conversations_quietly().await;
        Ok(removed)
    }

    // ---- realtime merge ----

    /// Insert or replace a message by identity, keeping the sequence sorted.
    pub async fn apply_incoming_message(&self, message: Message) {
        let user_id = self.inner.user_id;
        self.inner.state.write().await.apply_incoming(user_id, message);
    }

    /// Replace a held message. Updates for messages not held are dropped.
    pub async fn apply_message_update(&self, message: Message) {
        self.inner.state.write().await.apply_update(message);
    }

    /// Record a receipt. The message sequence is never touched, so a receipt
    /// for a message not loaded yet is simply remembered.
    pub async fn apply_read_receipt(&self, receipt: ReadReceipt) {
        self.inner.state.write().await.add_receipts([receipt]);
    }

    // ---- read views ----

    /// Displayed messages, oldest first.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.state.read().await.timeline.to_vec()
    }

    pub async fn has_more(&self) -> bool {
        self.inner.state.read().await.has_more
    }

    /// Conversation list, most recent activity first.
    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        let state = self.inner.state.read().await;
        let mut summaries: Vec<ConversationSummary> = state.conversations.values().cloned().collect();
        summaries.sort_by(|a, b| {
            b.conversation
                .activity_at()
                .cmp(&a.conversation.activity_at())
                .then_with(|| a.conversation.id.cmp(&b.conversation.id))
        });
        summaries
    }

    /// Other users typing in the open conversation, expired entries excluded.
    pub async fn typing_users(&self) -> Vec<UserId> {
        self.inner.state.read().await.remote_typing.active(Instant::now())
    }

    /// Loaded messages from others without a receipt from this user.
    pub async fn unread_message_ids(&self) -> Vec<MessageId> {
        let state = self.inner.state.read().await;
        state
            .timeline
            .iter()
            .filter(|message| state.is_unread(message, self.inner.user_id))
            .map(|message| message.id)
            .collect()
    }

    /// Users with a receipt for `message_id`.
    pub async fn readers_of(&self, message_id: MessageId) -> HashSet<UserId> {
        self.inner
            .state
            .read()
            .await
            .receipts
            .get(&message_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_loading(&self) -> bool {
        self.inner.state.read().await.loads_in_flight > 0
    }

    fn typing_coordinator(&self) -> Option<TypingCoordinator> {
        self.inner
            .scopes()
            .conversation
            .as_ref()
            .map(|scope| scope.typing.clone())
    }

    async fn reload_conversations_quietly(&self) {
        if let Err(error) = self.load_conversations().await {
            warn!(%error, "conversation list reload failed");
        }
    }

    async fn handle_event(&self, view: Option<(ConversationId, u64)>, event: RealtimeEvent) {
        let kind = event.event_type_name();
        if let Some((conversation_id, generation)) = view {
            let current = self.inner.state.read().await.is_current(conversation_id, generation);
            if !current {
                debug!(%conversation_id, event = kind, "ignoring event for a closed view");
                return;
            }
        }

        match event {
            RealtimeEvent::MessageInserted(message) => self.apply_incoming_message(message).await,
            RealtimeEvent::MessageUpdated { message, change } => {
                debug!(message_id = %message.id, ?change, "message updated");
                self.apply_message_update(message).await
            }
            RealtimeEvent::ReadReceiptAdded(receipt) => self.apply_read_receipt(receipt).await,
            RealtimeEvent::ParticipantChanged(participant) => {
                self.inner.state.write().await.apply_participant(participant)
            }
            RealtimeEvent::TypingChanged(presence) => {
                self.inner
                    .state
                    .write()
                    .await
                    .remote_typing
                    .apply(&presence, Instant::now())
            }
            RealtimeEvent::ConversationListChanged => self.reload_conversations_quietly().await,
            RealtimeEvent::ConnectionChanged(state) => {
                warn!(user_id = %self.inner.user_id, ?state, "realtime connection changed")
            }
        }
    }
}

async fn pump_events(facade: Weak<FacadeInner>, mut events: EventStream, view: Option<(ConversationId, u64)>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = facade.upgrade() else {
            return;
        };
        MessagingFacade { inner }.handle_event(view, event).await;
    }
}
