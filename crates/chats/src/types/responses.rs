//! Response shapes returned by the conversation store.

use serde::{Deserialize, Serialize};

use super::UserId;
use crate::entities::{Conversation, Message, Participant, ReadReceipt};

/// A conversation as listed for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub participants: Vec<Participant>,
    /// Messages from others without a receipt for the listing user
    pub unread_count: usize,
}

impl ConversationSummary {
    /// Active participants other than `user_id`
    pub fn others(&self, user_id: UserId) -> impl Iterator<Item = &Participant> {
        self.participants
            .iter()
            .filter(move |p| p.is_active() && p.user_id != user_id)
    }
}

/// One page of a conversation's messages, oldest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Receipts for the messages on this page
    pub receipts: Vec<ReadReceipt>,
    /// Whether older messages exist before this page
    pub has_more: bool,
}
