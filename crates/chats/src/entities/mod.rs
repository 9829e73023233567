//! Domain entities for conversations.
//!
//! These are the row shapes the conversation store persists and the realtime
//! core reconciles against. Only the fields needed for client-side
//! reconciliation are modelled.

pub mod attachment;
pub mod conversation;
pub mod message;
pub mod participant;
pub mod receipt;

pub use attachment::{Attachment, AttachmentKind};
pub use conversation::{Conversation, ConversationKind};
pub use message::{Message, MessageKind, Reactions, SystemEvent};
pub use participant::{Participant, ParticipantRole, ParticipantStatus};
pub use receipt::ReadReceipt;
