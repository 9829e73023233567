use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ConversationId, UserId};

/// Maximum characters kept in `last_message_preview`
pub const PREVIEW_LENGTH: usize = 100;

/// A conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Direct, group or pod-linked
    pub kind: ConversationKind,
    /// Display name (unused for direct conversations)
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub created_by: UserId,
    #[serde(default)]
    pub is_archived: bool,
    /// Denormalized for list rendering
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Conversation kind enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
    /// Linked to a study pod
    Pod { pod_id: Uuid },
}

impl Conversation {
    /// Create a new conversation instance
    pub fn new(kind: ConversationKind, created_by: UserId, name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            name,
            description: None,
            created_by,
            is_archived: false,
            last_message_at: None,
            last_message_preview: None,
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.kind, ConversationKind::Direct)
    }

    /// Timestamp the conversation list is sorted by.
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }

    /// Record a new last message for list rendering.
    pub fn touch(&mut self, at: DateTime<Utc>, preview: &str) {
        self.last_message_at = Some(at);
        self.last_message_preview = Some(preview.chars().take(PREVIEW_LENGTH).collect());
        self.updated_at = Utc::now();
    }
}
