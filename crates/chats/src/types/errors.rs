//! Error types for the conversation domain.

use thiserror::Error;

/// Result type alias for conversation operations
pub type ChatResult<T> = Result<T, ChatError>;

/// Main error type for the conversation domain
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Conversation not found: {id}")]
    ConversationNotFound { id: String },

    #[error("Message not found: {id}")]
    MessageNotFound { id: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Transport unavailable: {message}")]
    Transport { message: String },

    #[error("Store rejected write: {message}")]
    WriteRejected { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ChatError {
    /// Create a not found error for conversations
    pub fn conversation_not_found(id: impl ToString) -> Self {
        Self::ConversationNotFound { id: id.to_string() }
    }

    /// Create a not found error for messages
    pub fn message_not_found(id: impl ToString) -> Self {
        Self::MessageNotFound { id: id.to_string() }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Create a permission denied error
    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied { reason: reason.into() }
    }

    /// Create a transport error (subscribe/connect failed)
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Create a rejected-write error
    pub fn write_rejected(message: impl Into<String>) -> Self {
        Self::WriteRejected { message: message.into() }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether the failure came from the change-notification transport.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<chrono::ParseError> for ChatError {
    fn from(err: chrono::ParseError) -> Self {
        Self::Validation {
            message: format!("Date parsing error: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_build_matching_variants() {
        assert!(matches!(
            ChatError::validation("empty"),
            ChatError::Validation { .. }
        ));
        assert!(ChatError::transport("down").is_transport());
        assert!(!ChatError::write_rejected("no").is_transport());
        assert_eq!(
            ChatError::message_not_found("m1").to_string(),
            "Message not found: m1"
        );
    }
}
