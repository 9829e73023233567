//! Validation utilities.

use uuid::Uuid;

use crate::entities::{Attachment, ConversationKind};
use crate::types::{ChatError, NewConversation, OutgoingMessage, UserId};

/// Size limits applied to outgoing messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLimits {
    pub max_content_length: usize,
    pub max_attachments: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_content_length: 10_000,
            max_attachments: 10,
        }
    }
}

/// Validation utilities
pub struct Validator;

impl Validator {
    /// Reject nil identifiers, which stand in for "empty".
    pub fn id(id: Uuid, what: &str) -> Result<(), ChatError> {
        if id.is_nil() {
            return Err(ChatError::validation(format!("{} cannot be empty", what)));
        }
        Ok(())
    }

    /// Validate a message before any store call is made.
    pub fn outgoing_message(message: &OutgoingMessage, limits: &MessageLimits) -> Result<(), ChatError> {
        if message.is_blank() {
            return Err(ChatError::validation("Message needs content or an attachment"));
        }

        if message.kind.requires_content() && message.content.trim().is_empty() {
            return Err(ChatError::validation(format!(
                "Message content cannot be empty for {} messages",
                message.kind.name()
            )));
        }

        if message.content.chars().count() > limits.max_content_length {
            return Err(ChatError::validation(format!(
                "Message content too long (max {} characters)",
                limits.max_content_length
            )));
        }

        if message.attachments.len() > limits.max_attachments {
            return Err(ChatError::validation(format!(
                "Too many attachments (max {})",
                limits.max_attachments
            )));
        }

        for attachment in &message.attachments {
            Self::attachment(attachment)?;
        }

        Ok(())
    }

    /// Validate attachment fields
    pub fn attachment(attachment: &Attachment) -> Result<(), ChatError> {
        if attachment.url.trim().is_empty() {
            return Err(ChatError::validation("Attachment URL cannot be empty"));
        }

        if attachment.name.trim().is_empty() {
            return Err(ChatError::validation("Attachment name cannot be empty"));
        }

        let invalid_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
        if let Some(bad) = attachment.name.chars().find(|c| invalid_chars.contains(c)) {
            return Err(ChatError::validation(format!(
                "Attachment name contains invalid character: {}",
                bad
            )));
        }

        if attachment.size_bytes == 0 {
            return Err(ChatError::validation("Attachment size must be positive"));
        }

        Ok(())
    }

    /// Validate a create-conversation request from `creator`.
    pub fn new_conversation(creator: UserId, request: &NewConversation) -> Result<(), ChatError> {
        Self::id(creator, "Creator id")?;
        for id in &request.participant_ids {
            Self::id(*id, "Participant id")?;
        }

        match request.kind {
            ConversationKind::Direct => {
                let others: Vec<_> = request
                    .participant_ids
                    .iter()
                    .filter(|id| **id != creator)
                    .collect();
                if others.len() != 1 {
                    return Err(ChatError::validation(
                        "Direct conversations need exactly one other participant",
                    ));
                }
            }
            ConversationKind::Group | ConversationKind::Pod { .. } => {
                let name = request.name.as_deref().unwrap_or_default();
                if name.trim().is_empty() {
                    return Err(ChatError::validation("Conversation name cannot be empty"));
                }
                if name.len() > 255 {
                    return Err(ChatError::validation(
                        "Conversation name too long (max 255 characters)",
                    ));
                }
            }
        }

        Ok(())
    }
}
