//! Shared types and interfaces for the conversation domain.
//!
//! This module contains identifiers, the error type, request/response shapes
//! for the conversation store, and the change-notification vocabulary shared
//! by the store (producer) and the realtime core (consumer).

pub mod errors;
pub mod events;
pub mod requests;
pub mod responses;

pub use errors::{ChatError, ChatResult};
pub use events::*;
pub use requests::*;
pub use responses::*;

// Common type aliases
pub type ConversationId = uuid::Uuid;
pub type MessageId = uuid::Uuid;
pub type UserId = uuid::Uuid;
