//! Change-notification vocabulary.
//!
//! The store emits a [`ChangeEvent`] on a [`ChannelName`] whenever a row is
//! inserted, updated or deleted. The realtime core subscribes to channels with
//! an [`EventFilter`] and decodes rows into typed entities. Presence (typing)
//! travels on the same channel names but is never persisted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{ChatResult, ConversationId, UserId};

/// Scope of a change-notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum ChannelName {
    /// `conversation:{id}`
    Conversation(ConversationId),
    /// `user:{id}:conversations`
    UserConversations(UserId),
}

impl ChannelName {
    pub fn conversation(id: ConversationId) -> Self {
        Self::Conversation(id)
    }

    pub fn user_conversations(id: UserId) -> Self {
        Self::UserConversations(id)
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelName::Conversation(id) => write!(f, "conversation:{}", id),
            ChannelName::UserConversations(id) => write!(f, "user:{}:conversations", id),
        }
    }
}

/// Store tables that produce change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Conversations,
    Participants,
    Messages,
    ReadReceipts,
}

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// A single row-level change as delivered by the notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: ChangeType,
    pub table: Table,
    /// New row image (old image for deletes)
    pub row: serde_json::Value,
    /// Previous row image, when the transport provides it
    #[serde(default)]
    pub old_row: Option<serde_json::Value>,
}

impl ChangeEvent {
    /// Build an insert event from a serializable row.
    pub fn insert<T: Serialize>(table: Table, row: &T) -> ChatResult<Self> {
        Ok(Self {
            event_type: ChangeType::Insert,
            table,
            row: serde_json::to_value(row)?,
            old_row: None,
        })
    }

    /// Build an update event carrying both row images.
    pub fn update<T: Serialize>(table: Table, row: &T, old_row: Option<&T>) -> ChatResult<Self> {
        Ok(Self {
            event_type: ChangeType::Update,
            table,
            row: serde_json::to_value(row)?,
            old_row: old_row.map(serde_json::to_value).transpose()?,
        })
    }

    /// Decode the new row image.
    pub fn decode_row<T: DeserializeOwned>(&self) -> ChatResult<T> {
        Ok(serde_json::from_value(self.row.clone())?)
    }

    /// Decode the previous row image, if one was sent.
    pub fn decode_old_row<T: DeserializeOwned>(&self) -> ChatResult<Option<T>> {
        match &self.old_row {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

/// Filter applied by a subscription: one table, optionally one mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventFilter {
    pub table: Table,
    pub event_type: Option<ChangeType>,
}

impl EventFilter {
    pub fn new(table: Table, event_type: ChangeType) -> Self {
        Self {
            table,
            event_type: Some(event_type),
        }
    }

    /// Match every mutation on a table.
    pub fn any(table: Table) -> Self {
        Self {
            table,
            event_type: None,
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.table == event.table
            && self.event_type.map_or(true, |kind| kind == event.event_type)
    }
}

/// Presence state a client tracks on a conversation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub user_id: UserId,
    pub typing: bool,
    pub updated_at: DateTime<Utc>,
}

impl PresenceMeta {
    pub fn typing(user_id: UserId) -> Self {
        Self {
            user_id,
            typing: true,
            updated_at: Utc::now(),
        }
    }

    pub fn idle(user_id: UserId) -> Self {
        Self {
            user_id,
            typing: false,
            updated_at: Utc::now(),
        }
    }
}

/// Presence transport events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceEvent {
    /// Full server-side state; replaces whatever the client holds
    Sync { present: Vec<PresenceMeta> },
    Join { meta: PresenceMeta },
    Leave { user_id: UserId },
}

/// Sink the store publishes row changes into.
pub trait ChangePublisher: Send + Sync {
    fn publish(&self, channel: &ChannelName, event: ChangeEvent);
}
