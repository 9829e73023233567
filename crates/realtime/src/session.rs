//! Realtime Session Manager.
//!
//! Holds at most one live conversation subscription and one user-index
//! subscription. Each opened scope gets a forwarding task that decodes raw
//! change rows into [`RealtimeEvent`]s and pushes them into the consumer's
//! [`EventSink`]. Opening a scope that is already occupied releases the old
//! subscription before the new one is acquired.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use studyhall_chats::{
    ChangeEvent, ChangeType, ChannelName, ChatResult, ConversationId, EventFilter, Message,
    Participant, PresenceEvent, Table, UserId, Validator,
};

use crate::events::{
    decode_message_insert, decode_message_update, decode_participant, decode_read_receipt,
    presence_without, ConnectionState, EventSink, RealtimeEvent, RecentIds,
};
use crate::transport::{ChangeNotifier, ChangeSubscription, ReleaseGuard};

/// Default size of the recent-insert dedupe window.
pub const DEFAULT_DEDUPE_WINDOW: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Conversation,
    UserIndex,
}

/// Identifies one opened subscription. Closing a stale handle is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    scope: Scope,
    channel: ChannelName,
}

impl SubscriptionHandle {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn channel(&self) -> ChannelName {
        self.channel
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.channel, self.id)
    }
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    closing: Arc<AtomicBool>,
    guards: Vec<ReleaseGuard>,
    task: JoinHandle<()>,
}

impl Drop for ActiveSubscription {
    fn drop(&mut self) {
        // mark first so the forwarder does not report the closed queues as a disconnect
        self.closing.store(true, Ordering::SeqCst);
        self.guards.clear();
        self.task.abort();
        info!(handle = %self.handle, "realtime subscription released");
    }
}

#[derive(Default)]
struct Slots {
    conversation: Option<ActiveSubscription>,
    user_index: Option<ActiveSubscription>,
}

impl Slots {
    fn slot(&mut self, scope: Scope) -> &mut Option<ActiveSubscription> {
        match scope {
            Scope::Conversation => &mut self.conversation,
            Scope::UserIndex => &mut self.user_index,
        }
    }
}

struct SessionInner {
    notifier: Arc<dyn ChangeNotifier>,
    dedupe_window: usize,
    connection: watch::Sender<ConnectionState>,
    next_handle: AtomicU64,
    slots: Mutex<Slots>,
}

impl SessionInner {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_slot(&self, scope: Scope) -> Option<ActiveSubscription> {
        self.slots().slot(scope).take()
    }

    fn close(&self, handle: &SubscriptionHandle) -> bool {
        let released = {
            let mut slots = self.slots();
            let slot = slots.slot(handle.scope);
            let current = slot.as_ref().map_or(false, |active| active.handle.id == handle.id);
            if current {
                slot.take()
            } else {
                None
            }
        };
        released.is_some()
    }

    fn report_disconnected(&self, sink: &EventSink, reason: String) {
        let state = ConnectionState::Disconnected { reason };
        self.connection.send_replace(state.clone());
        let _ = sink.send(RealtimeEvent::ConnectionChanged(state));
    }
}

/// Releases its subscription when dropped.
#[must_use = "dropping the guard closes the subscription"]
pub struct ChannelGuard {
    session: Weak<SessionInner>,
    handle: SubscriptionHandle,
}

impl ChannelGuard {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    pub fn close(self) {}
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.close(&self.handle);
        }
    }
}

impl fmt::Debug for ChannelGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGuard").field("handle", &self.handle).finish()
    }
}

/// Owns the live realtime subscriptions for one signed-in user session.
#[derive(Clone)]
pub struct RealtimeSessionManager {
    inner: Arc<SessionInner>,
}

impl RealtimeSessionManager {
    pub fn new(notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self::with_dedupe_window(notifier, DEFAULT_DEDUPE_WINDOW)
    }

    pub fn with_dedupe_window(notifier: Arc<dyn ChangeNotifier>, dedupe_window: usize) -> Self {
        let (connection, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(SessionInner {
                notifier,
                dedupe_window,
                connection,
                next_handle: AtomicU64::new(1),
                slots: Mutex::new(Slots::default()),
            }),
        }
    }

    pub fn notifier(&self) -> Arc<dyn ChangeNotifier> {
        self.inner.notifier.clone()
    }

    /// Watch connectivity transitions.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    pub fn current_connection(&self) -> ConnectionState {
        self.inner.connection.borrow().clone()
    }

    /// Number of occupied scopes (0..=2).
    pub fn active_subscriptions(&self) -> usize {
        let slots = self.inner.slots();
        usize::from(slots.conversation.is_some()) + usize::from(slots.user_index.is_some())
    }

    /// Handle of the subscription currently occupying `scope`.
    pub fn active_handle(&self, scope: Scope) -> Option<SubscriptionHandle> {
        self.inner.slots().slot(scope).as_ref().map(|active| active.handle)
    }

    /// Release a subscription. Safe to call any number of times; returns
    /// whether anything was released.
    pub fn close(&self, handle: &SubscriptionHandle) -> bool {
        self.inner.close(handle)
    }

    /// Subscribe to one conversation: message inserts and updates, read
    /// receipts, participant changes and the typing presence set.
    ///
    /// Any previously open conversation subscription is released first. On a
    /// transport failure nothing stays acquired, the consumer sees
    /// [`ConnectionState::Disconnected`] and the call can simply be retried.
    pub async fn open_conversation_channel(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        sink: EventSink,
    ) -> ChatResult<ChannelGuard> {
        Validator::id(conversation_id, "Conversation id")?;
        drop(self.inner.take_slot(Scope::Conversation));

        let channel = ChannelName::conversation(conversation_id);
        let subscriptions = match self.acquire_conversation(channel, user_id).await {
            Ok(subscriptions) => subscriptions,
            Err(error) => {
                warn!(%channel, %error, "failed to open conversation channel");
                self.inner.report_disconnected(&sink, error.to_string());
                return Err(error);
            }
        };

        let closing = Arc::new(AtomicBool::new(false));
        let (guards, forwarder) = ConversationForwarder::new(
            subscriptions,
            user_id,
            sink,
            self.inner.dedupe_window,
            closing.clone(),
            Arc::downgrade(&self.inner),
        );
        let task = tokio::spawn(forwarder.run());
        Ok(self.install(Scope::Conversation, channel, closing, guards, task))
    }

    /// Subscribe to the user's cross-conversation index. Every relevant change
    /// is reported as a single coarse [`RealtimeEvent::ConversationListChanged`].
    pub async fn open_user_index_channel(&self, user_id: UserId, sink: EventSink) -> ChatResult<ChannelGuard> {
        Validator::id(user_id, "User id")?;
        drop(self.inner.take_slot(Scope::UserIndex));

        let channel = ChannelName::user_conversations(user_id);
        let subscriptions = match self.acquire_user_index(channel).await {
            Ok(subscriptions) => subscriptions,
            Err(error) => {
                warn!(%channel, %error, "failed to open user index channel");
                self.inner.report_disconnected(&sink, error.to_string());
                return Err(error);
            }
        };

        let closing = Arc::new(AtomicBool::new(false));
        let (guards, forwarder) =
            UserIndexForwarder::new(subscriptions, user_id, sink, closing.clone(), Arc::downgrade(&self.inner));
        let task = tokio::spawn(forwarder.run());
        Ok(self.install(Scope::UserIndex, channel, closing, guards, task))
    }

    async fn acquire_conversation(&self, channel: ChannelName, user_id: UserId) -> ChatResult<ConversationSubscriptions> {
        let notifier = &self.inner.notifier;
        // each `?` drops whatever was already acquired, releasing it
        let inserts = notifier
            .subscribe(channel, EventFilter::new(Table::Messages, ChangeType::Insert))
            .await?;
        let updates = notifier
            .subscribe(channel, EventFilter::new(Table::Messages, ChangeType::Update))
            .await?;
        let receipts = notifier
            .subscribe(channel, EventFilter::new(Table::ReadReceipts, ChangeType::Insert))
            .await?;
        let participants = notifier.subscribe(channel, EventFilter::any(Table::Participants)).await?;
        let presence = notifier.join_presence(channel, user_id).await?;

        Ok(ConversationSubscriptions {
            inserts,
            updates,
            receipts,
            participants,
            presence,
        })
    }

    async fn acquire_user_index(&self, channel: ChannelName) -> ChatResult<UserIndexSubscriptions> {
        let notifier = &self.inner.notifier;
        let conversations = notifier.subscribe(channel, EventFilter::any(Table::Conversations)).await?;
        let messages = notifier
            .subscribe(channel, EventFilter::new(Table::Messages, ChangeType::Insert))
            .await?;
        let participants = notifier.subscribe(channel, EventFilter::any(Table::Participants)).await?;

        Ok(UserIndexSubscriptions {
            conversations,
            messages,
            participants,
        })
    }

    fn install(
        &self,
        scope: Scope,
        channel: ChannelName,
        closing: Arc<AtomicBool>,
        guards: Vec<ReleaseGuard>,
        task: JoinHandle<()>,
    ) -> ChannelGuard {
        let handle = SubscriptionHandle {
            id: self.inner.next_handle.fetch_add(1, Ordering::Relaxed),
            scope,
            channel,
        };
        let active = ActiveSubscription {
            handle,
            closing,
            guards,
            task,
        };

        // a concurrent open for the same scope may have landed meanwhile
        let replaced = self.inner.slots().slot(scope).replace(active);
        drop(replaced);

        self.inner.connection.send_replace(ConnectionState::Connected);
        info!(%handle, "realtime subscription opened");
        ChannelGuard {
            session: Arc::downgrade(&self.inner),
            handle,
        }
    }
}

struct ConversationSubscriptions {
    inserts: ChangeSubscription,
    updates: ChangeSubscription,
    receipts: ChangeSubscription,
    participants: ChangeSubscription,
    presence: crate::transport::PresenceSubscription,
}

struct UserIndexSubscriptions {
    conversations: ChangeSubscription,
    messages: ChangeSubscription,
    participants: ChangeSubscription,
}

type ChangeQueue = mpsc::UnboundedReceiver<ChangeEvent>;

enum Incoming {
    Insert(ChangeEvent),
    Update(ChangeEvent),
    Receipt(ChangeEvent),
    Participant(ChangeEvent),
    Presence(PresenceEvent),
}

/// What arrived on the user index. Conversation rows carry nothing worth
/// reading: any of them means reload.
enum IndexChange {
    Conversation,
    Message(ChangeEvent),
    Participant(ChangeEvent),
}

fn forward(sink: &EventSink, decoded: ChatResult<RealtimeEvent>, channel: &ChannelName) -> bool {
    match decoded {
        Ok(event) => {
            debug!(%channel, event = event.event_type_name(), "forwarding realtime event");
            sink.send(event).is_ok()
        }
        Err(error) => {
            warn!(%channel, %error, "dropping undecodable change event");
            true
        }
    }
}

fn finish(closing: &AtomicBool, session: &Weak<SessionInner>, sink: &EventSink, channel: ChannelName) {
    if closing.load(Ordering::SeqCst) {
        return;
    }
    warn!(%channel, "realtime channel closed by transport");
    let reason = format!("channel {} closed by transport", channel);
    match session.upgrade() {
        Some(session) => session.report_disconnected(sink, reason),
        None => {
            let _ = sink.send(RealtimeEvent::ConnectionChanged(ConnectionState::Disconnected { reason }));
        }
    }
}

struct ConversationForwarder {
    channel: ChannelName,
    user_id: UserId,
    inserts: ChangeQueue,
    updates: ChangeQueue,
    receipts: ChangeQueue,
    participants: ChangeQueue,
    presence: mpsc::UnboundedReceiver<PresenceEvent>,
    recent: RecentIds,
    sink: EventSink,
    closing: Arc<AtomicBool>,
    session: Weak<SessionInner>,
}

impl ConversationForwarder {
    fn new(
        subscriptions: ConversationSubscriptions,
        user_id: UserId,
        sink: EventSink,
        dedupe_window: usize,
        closing: Arc<AtomicBool>,
        session: Weak<SessionInner>,
    ) -> (Vec<ReleaseGuard>, Self) {
        let channel = subscriptions.inserts.channel();
        let (inserts, inserts_guard) = subscriptions.inserts.into_parts();
        let (updates, updates_guard) = subscriptions.updates.into_parts();
        let (receipts, receipts_guard) = subscriptions.receipts.into_parts();
        let (participants, participants_guard) = subscriptions.participants.into_parts();
        let (presence, presence_guard) = subscriptions.presence.into_parts();

        let guards = vec![inserts_guard, updates_guard, receipts_guard, participants_guard, presence_guard];
        let forwarder = Self {
            channel,
            user_id,
            inserts,
            updates,
            receipts,
            participants,
            presence,
            recent: RecentIds::new(dedupe_window),
            sink,
            closing,
            session,
        };
        (guards, forwarder)
    }

    async fn run(mut self) {
        loop {
            let incoming = tokio::select! {
                change = self.inserts.recv() => change.map(Incoming::Insert),
                change = self.updates.recv() => change.map(Incoming::Update),
                change = self.receipts.recv() => change.map(Incoming::Receipt),
                change = self.participants.recv() => change.map(Incoming::Participant),
                event = self.presence.recv() => event.map(Incoming::Presence),
            };
            let Some(incoming) = incoming else {
                break;
            };

            let delivered = match incoming {
                Incoming::Insert(change) => self.on_insert(&change),
                Incoming::Update(change) => forward(&self.sink, decode_message_update(&change), &self.channel),
                Incoming::Receipt(change) => forward(&self.sink, decode_read_receipt(&change), &self.channel),
                Incoming::Participant(change) => forward(&self.sink, decode_participant(&change), &self.channel),
                Incoming::Presence(event) => match presence_without(self.user_id, event) {
                    Some(event) => forward(&self.sink, Ok(RealtimeEvent::TypingChanged(event)), &self.channel),
                    None => true,
                },
            };
            if !delivered {
                debug!(channel = %self.channel, "event consumer went away");
                return;
            }
        }

        finish(&self.closing, &self.session, &self.sink, self.channel);
    }

    fn on_insert(&mut self, change: &ChangeEvent) -> bool {
        match decode_message_insert(change) {
            Ok(RealtimeEvent::MessageInserted(message)) if !self.recent.insert(message.id) => {
                debug!(channel = %self.channel, message_id = %message.id, "duplicate insert suppressed");
                true
            }
            decoded => forward(&self.sink, decoded, &self.channel),
        }
    }
}

struct UserIndexForwarder {
    channel: ChannelName,
    user_id: UserId,
    conversations: ChangeQueue,
    messages: ChangeQueue,
    participants: ChangeQueue,
    sink: EventSink,
    closing: Arc<AtomicBool>,
    session: Weak<SessionInner>,
}

impl UserIndexForwarder {
    fn new(
        subscriptions: UserIndexSubscriptions,
        user_id: UserId,
        sink: EventSink,
        closing: Arc<AtomicBool>,
        session: Weak<SessionInner>,
    ) -> (Vec<ReleaseGuard>, Self) {
        let channel = subscriptions.conversations.channel();
        let (conversations, conversations_guard) = subscriptions.conversations.into_parts();
        let (messages, messages_guard) = subscriptions.messages.into_parts();
        let (participants, participants_guard) = subscriptions.participants.into_parts();

        let forwarder = Self {
            channel,
            user_id,
            conversations,
            messages,
            participants,
            sink,
            closing,
            session,
        };
        (vec![conversations_guard, messages_guard, participants_guard], forwarder)
    }

    async fn run(mut self) {
        loop {
            let incoming = tokio::select! {
                change = self.conversations.recv() => change.map(|_| IndexChange::Conversation),
                change = self.messages.recv() => change.map(IndexChange::Message),
                change = self.participants.recv() => change.map(IndexChange::Participant),
            };
            let relevant = match incoming {
                Some(IndexChange::Conversation) => true,
                Some(IndexChange::Message(change)) => self.is_from_others(&change),
                Some(IndexChange::Participant(change)) => self.concerns_user(&change),
                None => break,
            };
            if !relevant {
                continue;
            }

            // one reload covers everything already queued
            self.drain();
            debug!(channel = %self.channel, "conversation list changed");
            if self.sink.send(RealtimeEvent::ConversationListChanged).is_err() {
                return;
            }
        }

        finish(&self.closing, &self.session, &self.sink, self.channel);
    }

    fn is_from_others(&self, change: &ChangeEvent) -> bool {
        match change.decode_row::<Message>() {
            Ok(message) => message.sender_id != self.user_id,
            Err(error) => {
                warn!(channel = %self.channel, %error, "undecodable message row on user index");
                true
            }
        }
    }

    fn concerns_user(&self, change: &ChangeEvent) -> bool {
        match change.decode_row::<Participant>() {
            Ok(participant) => participant.user_id == self.user_id,
            Err(error) => {
                warn!(channel = %self.channel, %error, "undecodable participant row on user index");
                true
            }
        }
    }

    fn drain(&mut self) {
        while self.conversations.try_recv().is_ok() {}
        while self.messages.try_recv().is_ok() {}
        while self.participants.try_recv().is_ok() {}
    }
}
