//! # Studyhall Chats Crate
//!
//! Domain model and storage port for Studyhall conversations. The realtime
//! core (`studyhall-realtime`) consumes this crate; it never talks to storage
//! any other way.
//!
//! ## Architecture
//!
//! - **Entities**: Conversation, Participant, Message, Attachment, ReadReceipt
//! - **Repositories**: the [`ConversationStore`] port and the in-memory [`MemoryStore`]
//! - **Types**: identifiers, errors, requests/responses, change-event vocabulary
//! - **Utils**: validation
//!
//! ## Usage
//!
//! ```rust
//! use studyhall_chats::{ConversationStore, MemoryStore, NewConversation, OutgoingMessage};
//!
//! # tokio_test_block(async {
//! let store = MemoryStore::detached();
//! let (alice, bob) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
//! let conversation = store.create_conversation(alice, &NewConversation::direct(bob)).await?;
//! store.create_message(conversation.id, alice, &OutgoingMessage::text("hi")).await?;
//! # Ok::<(), studyhall_chats::ChatError>(())
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

pub mod entities;
pub mod repositories;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use entities::{
    Attachment, AttachmentKind, Conversation, ConversationKind, Message, MessageKind, Participant,
    ParticipantRole, ParticipantStatus, Reactions, ReadReceipt, SystemEvent,
};
pub use repositories::{ConversationStore, MemoryStore};
pub use types::{
    ChangeEvent, ChangePublisher, ChangeType, ChannelName, ChatError, ChatResult, ConversationId,
    ConversationSummary, EventFilter, MessageId, MessagePage, NewConversation, OutgoingMessage,
    Pagination, PresenceEvent, PresenceMeta, Table, UserId, DEFAULT_PAGE_SIZE,
};
pub use utils::{MessageLimits, Validator};
