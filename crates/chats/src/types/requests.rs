//! Request shapes accepted by the conversation store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{MessageId, UserId};
use crate::entities::{Attachment, ConversationKind, MessageKind};

/// Default number of messages per page
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// A message the local user wants to send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Draft text; may be empty for attachment-only messages
    pub content: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

impl OutgoingMessage {
    pub fn new(content: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            content: content.into(),
            kind,
            attachments: Vec::new(),
            reply_to: None,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(content, MessageKind::Text)
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn replying_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    /// True when there is neither text nor an attachment to send.
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty() && self.attachments.is_empty()
    }
}

/// Request to create a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConversation {
    pub kind: ConversationKind,
    /// Participants other than the creator
    pub participant_ids: Vec<UserId>,
    #[serde(default)]
    pub name: Option<String>,
}

impl NewConversation {
    pub fn direct(with: UserId) -> Self {
        Self {
            kind: ConversationKind::Direct,
            participant_ids: vec![with],
            name: None,
        }
    }

    pub fn group(name: impl Into<String>, participant_ids: Vec<UserId>) -> Self {
        Self {
            kind: ConversationKind::Group,
            participant_ids,
            name: Some(name.into()),
        }
    }

    pub fn pod(pod_id: Uuid, name: impl Into<String>, participant_ids: Vec<UserId>) -> Self {
        Self {
            kind: ConversationKind::Pod { pod_id },
            participant_ids,
            name: Some(name.into()),
        }
    }
}

/// Cursor pagination over `created_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: usize,
    /// Only messages created strictly before this instant
    #[serde(default)]
    pub before: Option<DateTime<Utc>>,
}

impl Pagination {
    pub fn latest(limit: usize) -> Self {
        Self { limit, before: None }
    }

    pub fn before(limit: usize, before: DateTime<Utc>) -> Self {
        Self {
            limit,
            before: Some(before),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::latest(DEFAULT_PAGE_SIZE)
    }
}
