//! Data access layer for the conversation domain.
//!
//! [`ConversationStore`] is the port the realtime core talks to. It is plain
//! request/response CRUD; realtime delivery of the resulting row changes is
//! the job of whatever [`ChangePublisher`](crate::types::ChangePublisher) the
//! store implementation is wired to.

pub mod memory_store;

pub use memory_store::MemoryStore;

use async_trait::async_trait;

use crate::entities::{Conversation, Message, Participant};
use crate::types::{
    ChatResult, ConversationId, ConversationSummary, MessageId, MessagePage, NewConversation,
    OutgoingMessage, Pagination, UserId,
};

/// Durable conversation storage contract.
///
/// Authorization (sender-only edits, participant-only reactions, owner
/// protection) is enforced here, never by consumers of change events.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Fetch one page of messages, oldest first.
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        page: Pagination,
    ) -> ChatResult<MessagePage>;

    async fn create_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        message: &OutgoingMessage,
    ) -> ChatResult<Message>;

    async fn edit_message(&self, message_id: MessageId, editor_id: UserId, content: String) -> ChatResult<Message>;

    /// Soft-delete; the row keeps its slot as a tombstone.
    async fn delete_message(&self, message_id: MessageId, user_id: UserId) -> ChatResult<Message>;

    async fn toggle_reaction(&self, message_id: MessageId, user_id: UserId, emoji: &str) -> ChatResult<Message>;

    /// Conversations the user actively participates in, with participants and unread counts.
    async fn fetch_conversations(&self, user_id: UserId) -> ChatResult<Vec<ConversationSummary>>;

    /// Create a conversation; an existing direct conversation between the same
    /// two users is returned instead of creating a duplicate.
    async fn create_conversation(&self, creator: UserId, request: &NewConversation) -> ChatResult<Conversation>;

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        message_ids: &[MessageId],
    ) -> ChatResult<()>;

    /// Add participants and record a system message.
    async fn add_participants(
        &self,
        conversation_id: ConversationId,
        actor: UserId,
        user_ids: &[UserId],
    ) -> ChatResult<Vec<Participant>>;

    /// Remove participants (or leave, when `actor` removes themself) and record a system message.
    async fn remove_participants(
        &self,
        conversation_id: ConversationId,
        actor: UserId,
        user_ids: &[UserId],
    ) -> ChatResult<Vec<Participant>>;

    async fn start_typing(&self, conversation_id: ConversationId, user_id: UserId) -> ChatResult<()>;

    async fn stop_typing(&self, conversation_id: ConversationId, user_id: UserId) -> ChatResult<()>;
}
