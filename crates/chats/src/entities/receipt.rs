use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MessageId, UserId};

/// Append-only record that a user has seen a message.
///
/// The existence of a receipt for a (message, user) pair is the only source
/// of truth for "has this user seen this message".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

impl ReadReceipt {
    pub fn new(message_id: MessageId, user_id: UserId) -> Self {
        Self {
            message_id,
            user_id,
            read_at: Utc::now(),
        }
    }
}
