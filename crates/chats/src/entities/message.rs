use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::attachment::Attachment;
use crate::types::{ConversationId, MessageId, OutgoingMessage, UserId};

/// Emoji symbol -> users who reacted with it
pub type Reactions = BTreeMap<String, BTreeSet<UserId>>;

/// A message within a conversation.
///
/// `created_at` never changes after creation and, with `id` as the
/// tie-breaker, defines the total order within a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// `None` only when attachments carry the payload
    #[serde(default)]
    pub content: Option<String>,
    /// Message type plus its typed metadata
    pub kind: MessageKind,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub deleted_by: Option<UserId>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reactions: Reactions,
    pub created_at: DateTime<Utc>,
}

/// Message type, discriminated by `type`, with per-type metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "metadata", rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
    CodeSnippet {
        language: String,
    },
    ProblemLink {
        problem_id: String,
        #[serde(default)]
        title: Option<String>,
    },
    System {
        event: SystemEvent,
    },
}

/// Events recorded as system messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SystemEvent {
    ConversationCreated,
    ConversationRenamed { name: String },
    ParticipantsAdded { user_ids: Vec<UserId>, by: UserId },
    ParticipantsRemoved { user_ids: Vec<UserId>, by: UserId },
    ParticipantLeft { user_id: UserId },
}

impl MessageKind {
    /// Kinds whose payload lives in `content`.
    pub fn requires_content(&self) -> bool {
        matches!(self, MessageKind::Text | MessageKind::CodeSnippet { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::CodeSnippet { .. } => "code_snippet",
            MessageKind::ProblemLink { .. } => "problem_link",
            MessageKind::System { .. } => "system",
        }
    }
}

impl Message {
    /// Materialize an outgoing message as the store would persist it.
    pub fn from_outgoing(conversation_id: ConversationId, sender_id: UserId, outgoing: &OutgoingMessage) -> Self {
        let content = Some(outgoing.content.clone()).filter(|c| !c.trim().is_empty());
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            content,
            kind: outgoing.kind.clone(),
            attachments: outgoing.attachments.clone(),
            reply_to: outgoing.reply_to,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_by: None,
            deleted_at: None,
            reactions: Reactions::new(),
            created_at: Utc::now(),
        }
    }

    /// Create a system message describing a membership change
    pub fn system(conversation_id: ConversationId, actor: UserId, event: SystemEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: actor,
            content: None,
            kind: MessageKind::System { event },
            attachments: Vec::new(),
            reply_to: None,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_by: None,
            deleted_at: None,
            reactions: Reactions::new(),
            created_at: Utc::now(),
        }
    }

    /// Order by `created_at`, ties broken by identity.
    pub fn timeline_cmp(&self, other: &Message) -> Ordering {
        (self.created_at, self.id).cmp(&(other.created_at, other.id))
    }

    pub fn is_system(&self) -> bool {
        matches!(self.kind, MessageKind::System { .. })
    }

    /// Soft-deleted messages keep their slot but render without content.
    pub fn is_tombstone(&self) -> bool {
        self.is_deleted
    }

    /// Content to render; `None` for tombstones.
    pub fn visible_content(&self) -> Option<&str> {
        if self.is_deleted {
            None
        } else {
            self.content.as_deref()
        }
    }

    /// Short text for the conversation list.
    pub fn preview(&self) -> String {
        if self.is_deleted {
            return "Message deleted".to_string();
        }
        if let Some(content) = self.visible_content().filter(|c| !c.trim().is_empty()) {
            return content.to_string();
        }
        match &self.kind {
            MessageKind::Image => "Sent an image".to_string(),
            MessageKind::File => "Sent a file".to_string(),
            MessageKind::ProblemLink { title, problem_id } => {
                format!("Shared a problem: {}", title.as_deref().unwrap_or(problem_id))
            }
            MessageKind::System { .. } => "Conversation updated".to_string(),
            MessageKind::Text | MessageKind::CodeSnippet { .. } => String::new(),
        }
    }

    /// Replace content as an edit; `created_at` is left untouched.
    pub fn apply_edit(&mut self, content: String) {
        self.content = Some(content);
        self.is_edited = true;
        self.edited_at = Some(Utc::now());
    }

    pub fn soft_delete(&mut self, by: UserId) {
        self.is_deleted = true;
        self.deleted_by = Some(by);
        self.deleted_at = Some(Utc::now());
    }

    /// Toggle a reaction; returns true when the reaction is now present.
    pub fn toggle_reaction(&mut self, emoji: &str, user_id: UserId) -> bool {
        let reactors = self.reactions.entry(emoji.to_string()).or_default();
        let added = if reactors.remove(&user_id) {
            false
        } else {
            reactors.insert(user_id);
            true
        };
        if reactors.is_empty() {
            self.reactions.remove(emoji);
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(content: &str) -> Message {
        Message::from_outgoing(Uuid::new_v4(), Uuid::new_v4(), &OutgoingMessage::text(content))
    }

    #[test]
    fn kind_serializes_with_type_and_metadata() {
        let kind = MessageKind::CodeSnippet {
            language: "rust".to_string(),
        };
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value["type"], "code_snippet");
        assert_eq!(value["metadata"]["language"], "rust");

        let plain: MessageKind = serde_json::from_value(serde_json::json!({"type": "text"})).unwrap();
        assert_eq!(plain, MessageKind::Text);
    }

    #[test]
    fn edit_keeps_created_at() {
        let mut message = text("first");
        let created_at = message.created_at;

        message.apply_edit("second".to_string());

        assert_eq!(message.content.as_deref(), Some("second"));
        assert!(message.is_edited);
        assert_eq!(message.created_at, created_at);
    }

    #[test]
    fn tombstone_hides_content() {
        let mut message = text("secret");
        let by = message.sender_id;
        message.soft_delete(by);

        assert!(message.is_tombstone());
        assert_eq!(message.visible_content(), None);
        assert_eq!(message.preview(), "Message deleted");
    }

    #[test]
    fn reactions_toggle() {
        let mut message = text("hi");
        let user = Uuid::new_v4();

        assert!(message.toggle_reaction("👍", user));
        assert_eq!(message.reactions["👍"].len(), 1);
        assert!(!message.toggle_reaction("👍", user));
        assert!(message.reactions.is_empty());
    }

    #[test]
    fn timeline_ties_break_on_id() {
        let mut a = text("a");
        let mut b = text("b");
        b.created_at = a.created_at;
        a.id = Uuid::from_u128(1);
        b.id = Uuid::from_u128(2);
        assert_eq!(a.timeline_cmp(&b), Ordering::Less);
    }

    #[test]
    fn empty_text_is_stored_as_none() {
        let message = Message::from_outgoing(
            Uuid::new_v4(),
            Uuid::new_v4(),
            &OutgoingMessage::new("  ", MessageKind::Image),
        );
        assert_eq!(message.content, None);
        assert_eq!(message.preview(), "Sent an image");
    }
}
