//! In-memory conversation store.
//!
//! Backs tests and local development. Every committed write is followed by
//! the change events a database trigger would emit, published on the
//! conversation channel and on each participant's conversation-index channel.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::ConversationStore;
use crate::entities::{
    Conversation, ConversationKind, Message, Participant, ParticipantRole, ParticipantStatus,
    ReadReceipt, SystemEvent,
};
use crate::types::{
    ChangeEvent, ChangePublisher, ChannelName, ChatError, ChatResult, ConversationId,
    ConversationSummary, MessageId, MessagePage, NewConversation, OutgoingMessage, Pagination,
    Table, UserId,
};
use crate::utils::{MessageLimits, Validator};

#[derive(Default)]
struct StoreState {
    conversations: HashMap<ConversationId, Conversation>,
    participants: HashMap<ConversationId, Vec<Participant>>,
    /// Kept sorted by (created_at, id)
    messages: HashMap<ConversationId, Vec<Message>>,
    message_index: HashMap<MessageId, ConversationId>,
    receipts: HashMap<MessageId, Vec<ReadReceipt>>,
    typing: HashMap<ConversationId, HashSet<UserId>>,
}

impl StoreState {
    fn active_participant(&self, conversation_id: ConversationId, user_id: UserId) -> ChatResult<&Participant> {
        if !self.conversations.contains_key(&conversation_id) {
            return Err(ChatError::conversation_not_found(conversation_id));
        }
        self.participants
            .get(&conversation_id)
            .and_then(|rows| rows.iter().find(|p| p.user_id == user_id && p.is_active()))
            .ok_or_else(|| ChatError::permission_denied("Not a participant of this conversation"))
    }

    fn active_user_ids(&self, conversation_id: ConversationId) -> Vec<UserId> {
        self.participants
            .get(&conversation_id)
            .map(|rows| rows.iter().filter(|p| p.is_active()).map(|p| p.user_id).collect())
            .unwrap_or_default()
    }

    fn message_mut(&mut self, message_id: MessageId) -> ChatResult<&mut Message> {
        let conversation_id = *self
            .message_index
            .get(&message_id)
            .ok_or_else(|| ChatError::message_not_found(message_id))?;
        self.messages
            .get_mut(&conversation_id)
            .and_then(|messages| messages.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| ChatError::message_not_found(message_id))
    }

    fn insert_message(&mut self, message: Message) {
        self.message_index.insert(message.id, message.conversation_id);
        if let Some(conversation) = self.conversations.get_mut(&message.conversation_id) {
            conversation.touch(message.created_at, &message.preview());
        }
        let messages = self.messages.entry(message.conversation_id).or_default();
        let at = messages.partition_point(|m| m.timeline_cmp(&message).is_lt());
        messages.insert(at, message);
    }

    fn has_receipt(&self, message_id: MessageId, user_id: UserId) -> bool {
        self.receipts
            .get(&message_id)
            .map_or(false, |receipts| receipts.iter().any(|r| r.user_id == user_id))
    }

    fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> usize {
        self.messages
            .get(&conversation_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| m.sender_id != user_id && !m.is_deleted && !m.is_system())
                    .filter(|m| !self.has_receipt(m.id, user_id))
                    .count()
            })
            .unwrap_or(0)
    }

    fn find_direct(&self, a: UserId, b: UserId) -> Option<&Conversation> {
        let wanted: BTreeSet<UserId> = [a, b].into_iter().collect();
        self.conversations.values().find(|conversation| {
            conversation.is_direct()
                && self
                    .active_user_ids(conversation.id)
                    .into_iter()
                    .collect::<BTreeSet<_>>()
                    == wanted
        })
    }
}

struct NullPublisher;

impl ChangePublisher for NullPublisher {
    fn publish(&self, _channel: &ChannelName, _event: ChangeEvent) {}
}

/// In-memory [`ConversationStore`] that publishes row changes.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    publisher: Arc<dyn ChangePublisher>,
    limits: MessageLimits,
    reject_writes: AtomicBool,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl MemoryStore {
    pub fn new(publisher: Arc<dyn ChangePublisher>) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            publisher,
            limits: MessageLimits::default(),
            reject_writes: AtomicBool::new(false),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// A store whose change events go nowhere.
    pub fn detached() -> Self {
        Self::new(Arc::new(NullPublisher))
    }

    pub fn with_limits(mut self, limits: MessageLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Make every write fail with [`ChatError::WriteRejected`] until switched back.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// How many times an operation has been invoked.
    pub fn calls(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    /// Users currently flagged as typing through the fallback path.
    pub async fn typing_users(&self, conversation_id: ConversationId) -> HashSet<UserId> {
        self.state
            .read()
            .await
            .typing
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, operation: &'static str) {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(operation)
            .or_insert(0) += 1;
    }

    fn check_writable(&self, operation: &'static str) -> ChatResult<()> {
        self.record(operation);
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(ChatError::write_rejected(format!("{} rejected by store", operation)));
        }
        Ok(())
    }

    fn emit(&self, channel: ChannelName, event: ChatResult<ChangeEvent>) {
        match event {
            Ok(event) => {
                debug!(%channel, table = ?event.table, kind = ?event.event_type, "publishing change");
                self.publisher.publish(&channel, event);
            }
            Err(error) => warn!(%channel, %error, "failed to encode change event"),
        }
    }

    fn emit_message_insert(&self, message: &Message, conversation: Option<&Conversation>, audience: &[UserId]) {
        self.emit(
            ChannelName::conversation(message.conversation_id),
            ChangeEvent::insert(Table::Messages, message),
        );
        for user_id in audience {
            let channel = ChannelName::user_conversations(*user_id);
            self.emit(channel, ChangeEvent::insert(Table::Messages, message));
            if let Some(conversation) = conversation {
                self.emit(channel, ChangeEvent::update(Table::Conversations, conversation, None));
            }
        }
    }

    fn emit_message_update(&self, message: &Message, previous: &Message) {
        self.emit(
            ChannelName::conversation(message.conversation_id),
            ChangeEvent::update(Table::Messages, message, Some(previous)),
        );
    }

    fn emit_participant_changes(&self, changed: &[Participant], audience: &[UserId]) {
        for participant in changed {
            for user_id in audience {
                self.emit(
                    ChannelName::user_conversations(*user_id),
                    ChangeEvent::update(Table::Participants, participant, None),
                );
            }
            self.emit(
                ChannelName::conversation(participant.conversation_id),
                ChangeEvent::update(Table::Participants, participant, None),
            );
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        page: Pagination,
    ) -> ChatResult<MessagePage> {
        self.record("fetch_messages");
        let state = self.state.read().await;
        state.active_participant(conversation_id, user_id)?;

        let all = state
            .messages
            .get(&conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let end = match page.before {
            Some(before) => all.partition_point(|m| m.created_at < before),
            None => all.len(),
        };
        let start = end.saturating_sub(page.limit);
        let messages = all[start..end].to_vec();
        let receipts = messages
            .iter()
            .flat_map(|m| state.receipts.get(&m.id).cloned().unwrap_or_default())
            .collect();

        Ok(MessagePage {
            messages,
            receipts,
            has_more: start > 0,
        })
    }

    async fn create_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        message: &OutgoingMessage,
    ) -> ChatResult<Message> {
        self.check_writable("create_message")?;
        Validator::outgoing_message(message, &self.limits)?;

        let (created, conversation, audience) = {
            let mut state = self.state.write().await;
            state.active_participant(conversation_id, sender_id)?;
            if let Some(reply_to) = message.reply_to {
                if state.message_index.get(&reply_to) != Some(&conversation_id) {
                    return Err(ChatError::message_not_found(reply_to));
                }
            }

            let created = Message::from_outgoing(conversation_id, sender_id, message);
            state.insert_message(created.clone());
            (
                created,
                state.conversations.get(&conversation_id).cloned(),
                state.active_user_ids(conversation_id),
            )
        };

        self.emit_message_insert(&created, conversation.as_ref(), &audience);
        Ok(created)
    }

    async fn edit_message(&self, message_id: MessageId, editor_id: UserId, content: String) -> ChatResult<Message> {
        self.check_writable("edit_message")?;
        if content.trim().is_empty() {
            return Err(ChatError::validation("Edited content cannot be empty"));
        }

        let (previous, edited) = {
            let mut state = self.state.write().await;
            let message = state.message_mut(message_id)?;
            if message.sender_id != editor_id {
                return Err(ChatError::permission_denied("Only the sender can edit a message"));
            }
            if message.is_deleted {
                return Err(ChatError::validation("Deleted messages cannot be edited"));
            }
            let previous = message.clone();
            message.apply_edit(content);
            (previous, message.clone())
        };

        self.emit_message_update(&edited, &previous);
        Ok(edited)
    }

    async fn delete_message(&self, message_id: MessageId, user_id: UserId) -> ChatResult<Message> {
        self.check_writable("delete_message")?;

        let (previous, deleted) = {
            let mut state = self.state.write().await;
            let message = state.message_mut(message_id)?;
            if message.sender_id != user_id {
                return Err(ChatError::permission_denied("Only the sender can delete a message"));
            }
            let previous = message.clone();
            if !message.is_deleted {
                message.soft_delete(user_id);
            }
            (previous, message.clone())
        };

        self.emit_message_update(&deleted, &previous);
        Ok(deleted)
    }

    async fn toggle_reaction(&self, message_id: MessageId, user_id: UserId, emoji: &str) -> ChatResult<Message> {
        self.check_writable("toggle_reaction")?;
        if emoji.trim().is_empty() {
            return Err(ChatError::validation("Reaction cannot be empty"));
        }

        let (previous, reacted) = {
            let mut state = self.state.write().await;
            let conversation_id = *state
                .message_index
                .get(&message_id)
                .ok_or_else(|| ChatError::message_not_found(message_id))?;
            state.active_participant(conversation_id, user_id)?;
            let message = state.message_mut(message_id)?;
            let previous = message.clone();
            message.toggle_reaction(emoji, user_id);
            (previous, message.clone())
        };

        self.emit_message_update(&reacted, &previous);
        Ok(reacted)
    }

    async fn fetch_conversations(&self, user_id: UserId) -> ChatResult<Vec<ConversationSummary>> {
        self.record("fetch_conversations");
        let state = self.state.read().await;

        let mut summaries: Vec<ConversationSummary> = state
            .participants
            .iter()
            .filter(|(_, rows)| rows.iter().any(|p| p.user_id == user_id && p.is_active()))
            .filter_map(|(conversation_id, rows)| {
                let conversation = state.conversations.get(conversation_id)?.clone();
                Some(ConversationSummary {
                    unread_count: state.unread_count(*conversation_id, user_id),
                    participants: rows.clone(),
                    conversation,
                })
            })
            .collect();

        summaries.sort_by(|a, b| b.conversation.activity_at().cmp(&a.conversation.activity_at()));
        Ok(summaries)
    }

    async fn create_conversation(&self, creator: UserId, request: &NewConversation) -> ChatResult<Conversation> {
        self.check_writable("create_conversation")?;
        Validator::new_conversation(creator, request)?;

        let (conversation, participants) = {
            let mut state = self.state.write().await;

            if request.kind == ConversationKind::Direct {
                let other = request
                    .participant_ids
                    .iter()
                    .copied()
                    .find(|id| *id != creator)
                    .ok_or_else(|| ChatError::validation("Direct conversation needs another participant"))?;
                if let Some(existing) = state.find_direct(creator, other) {
                    debug!(conversation_id = %existing.id, "reusing existing direct conversation");
                    return Ok(existing.clone());
                }
            }

            let conversation = Conversation::new(request.kind, creator, request.name.clone());
            let mut members: Vec<UserId> = vec![creator];
            for id in &request.participant_ids {
                if !members.contains(id) {
                    members.push(*id);
                }
            }
            let participants: Vec<Participant> = members
                .iter()
                .map(|user_id| {
                    let role = if *user_id == creator {
                        ParticipantRole::Owner
                    } else {
                        ParticipantRole::Member
                    };
                    Participant::new(conversation.id, *user_id, role)
                })
                .collect();

            state.conversations.insert(conversation.id, conversation.clone());
            state.participants.insert(conversation.id, participants.clone());
            (conversation, participants)
        };

        for participant in &participants {
            self.emit(
                ChannelName::user_conversations(participant.user_id),
                ChangeEvent::insert(Table::Conversations, &conversation),
            );
        }
        Ok(conversation)
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        message_ids: &[MessageId],
    ) -> ChatResult<()> {
        self.check_writable("mark_read")?;

        let (receipts, cursor) = {
            let mut state = self.state.write().await;
            state.active_participant(conversation_id, user_id)?;

            let mut receipts = Vec::new();
            let mut newest: Option<(MessageId, chrono::DateTime<chrono::Utc>)> = None;
            for message_id in message_ids {
                if state.message_index.get(message_id) != Some(&conversation_id) {
                    continue;
                }
                let Some(message) = state
                    .messages
                    .get(&conversation_id)
                    .and_then(|messages| messages.iter().find(|m| m.id == *message_id))
                else {
                    continue;
                };
                let created_at = message.created_at;
                if message.sender_id == user_id || state.has_receipt(*message_id, user_id) {
                    continue;
                }
                let receipt = ReadReceipt::new(*message_id, user_id);
                state.receipts.entry(*message_id).or_default().push(receipt.clone());
                receipts.push(receipt);
                if newest.map_or(true, |(_, at)| created_at > at) {
                    newest = Some((*message_id, created_at));
                }
            }

            let cursor = newest.and_then(|(message_id, _)| {
                let participant = state
                    .participants
                    .get_mut(&conversation_id)?
                    .iter_mut()
                    .find(|p| p.user_id == user_id && p.is_active())?;
                participant.advance_read_cursor(message_id, chrono::Utc::now());
                Some(participant.clone())
            });
            (receipts, cursor)
        };

        for receipt in &receipts {
            self.emit(
                ChannelName::conversation(conversation_id),
                ChangeEvent::insert(Table::ReadReceipts, receipt),
            );
        }
        if let Some(participant) = cursor {
            self.emit(
                ChannelName::user_conversations(user_id),
                ChangeEvent::update(Table::Participants, &participant, None),
            );
        }
        Ok(())
    }

    async fn add_participants(
        &self,
        conversation_id: ConversationId,
        actor: UserId,
        user_ids: &[UserId],
    ) -> ChatResult<Vec<Participant>> {
        self.check_writable("add_participants")?;
        for id in user_ids {
            Validator::id(*id, "Participant id")?;
        }

        let (changed, notice, conversation, audience) = {
            let mut state = self.state.write().await;
            let acting = state.active_participant(conversation_id, actor)?;
            if !acting.can_manage_participants() {
                return Err(ChatError::permission_denied("Only owners and admins can add participants"));
            }
            if state
                .conversations
                .get(&conversation_id)
                .map_or(false, Conversation::is_direct)
            {
                return Err(ChatError::validation("Direct conversations cannot gain participants"));
            }

            let rows = state.participants.entry(conversation_id).or_default();
            let mut changed = Vec::new();
            for user_id in user_ids {
                match rows.iter_mut().find(|p| p.user_id == *user_id) {
                    Some(existing) if existing.is_active() => {}
                    Some(existing) => {
                        existing.status = ParticipantStatus::Active;
                        existing.role = ParticipantRole::Member;
                        existing.joined_at = chrono::Utc::now();
                        changed.push(existing.clone());
                    }
                    None => {
                        let participant = Participant::new(conversation_id, *user_id, ParticipantRole::Member);
                        rows.push(participant.clone());
                        changed.push(participant);
                    }
                }
            }
            if changed.is_empty() {
                return Ok(changed);
            }

            let notice = Message::system(
                conversation_id,
                actor,
                SystemEvent::ParticipantsAdded {
                    user_ids: changed.iter().map(|p| p.user_id).collect(),
                    by: actor,
                },
            );
            state.insert_message(notice.clone());
            (
                changed,
                notice,
                state.conversations.get(&conversation_id).cloned(),
                state.active_user_ids(conversation_id),
            )
        };

        self.emit_participant_changes(&changed, &audience);
        self.emit_message_insert(&notice, conversation.as_ref(), &audience);
        Ok(changed)
    }

    async fn remove_participants(
        &self,
        conversation_id: ConversationId,
        actor: UserId,
        user_ids: &[UserId],
    ) -> ChatResult<Vec<Participant>> {
        self.check_writable("remove_participants")?;

        let (changed, notice, conversation, audience) = {
            let mut state = self.state.write().await;
            let acting = state.active_participant(conversation_id, actor)?.clone();
            let leaving_only = user_ids.iter().all(|id| *id == actor);
            if !leaving_only && !acting.can_manage_participants() {
                return Err(ChatError::permission_denied("Only owners and admins can remove participants"));
            }

            // everyone who should hear about it, including the departing users
            let audience = state.active_user_ids(conversation_id);
            let rows = state.participants.entry(conversation_id).or_default();
            if rows
                .iter()
                .any(|p| p.is_active() && p.is_owner() && user_ids.contains(&p.user_id))
            {
                return Err(ChatError::permission_denied("The owner cannot be removed"));
            }

            let mut changed = Vec::new();
            for participant in rows.iter_mut() {
                if participant.is_active() && user_ids.contains(&participant.user_id) {
                    participant.status = if participant.user_id == actor {
                        ParticipantStatus::Left
                    } else {
                        ParticipantStatus::Removed
                    };
                    changed.push(participant.clone());
                }
            }
            if changed.is_empty() {
                return Ok(changed);
            }

            let event = if leaving_only {
                SystemEvent::ParticipantLeft { user_id: actor }
            } else {
                SystemEvent::ParticipantsRemoved {
                    user_ids: changed.iter().map(|p| p.user_id).collect(),
                    by: actor,
                }
            };
            let notice = Message::system(conversation_id, actor, event);
            state.insert_message(notice.clone());
            (
                changed,
                notice,
                state.conversations.get(&conversation_id).cloned(),
                audience,
            )
        };

        self.emit_participant_changes(&changed, &audience);
        self.emit_message_insert(&notice, conversation.as_ref(), &audience);
        Ok(changed)
    }

    async fn start_typing(&self, conversation_id: ConversationId, user_id: UserId) -> ChatResult<()> {
        self.check_writable("start_typing")?;
        let mut state = self.state.write().await;
        state.active_participant(conversation_id, user_id)?;
        state.typing.entry(conversation_id).or_default().insert(user_id);
        Ok(())
    }

    async fn stop_typing(&self, conversation_id: ConversationId, user_id: UserId) -> ChatResult<()> {
        self.check_writable("stop_typing")?;
        let mut state = self.state.write().await;
        if let Some(typing) = state.typing.get_mut(&conversation_id) {
            typing.remove(&user_id);
        }
        Ok(())
    }
}
