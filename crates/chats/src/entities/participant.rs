use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, MessageId, UserId};

/// A user's membership in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub role: ParticipantRole,
    pub status: ParticipantStatus,
    pub joined_at: DateTime<Utc>,
    /// Read cursor used for unread counts
    #[serde(default)]
    pub last_read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_read_message_id: Option<MessageId>,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_pinned: bool,
}

/// Participant role enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Owner,
    Admin,
    Member,
}

/// Participant status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Active,
    Left,
    Removed,
}

impl Participant {
    /// Create a new active participant
    pub fn new(conversation_id: ConversationId, user_id: UserId, role: ParticipantRole) -> Self {
        Self {
            conversation_id,
            user_id,
            role,
            status: ParticipantStatus::Active,
            joined_at: Utc::now(),
            last_read_at: None,
            last_read_message_id: None,
            is_muted: false,
            is_pinned: false,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, ParticipantStatus::Active)
    }

    pub fn is_owner(&self) -> bool {
        matches!(self.role, ParticipantRole::Owner)
    }

    /// Check if the participant can add or remove others
    pub fn can_manage_participants(&self) -> bool {
        self.is_active() && matches!(self.role, ParticipantRole::Owner | ParticipantRole::Admin)
    }

    /// Advance the read cursor; never moves it backwards.
    pub fn advance_read_cursor(&mut self, message_id: MessageId, at: DateTime<Utc>) {
        if self.last_read_at.map_or(true, |current| at >= current) {
            self.last_read_at = Some(at);
            self.last_read_message_id = Some(message_id);
        }
    }
}

impl ParticipantRole {
    /// Get the permission level for this role (higher number = more permissions)
    pub fn permission_level(&self) -> u8 {
        match self {
            ParticipantRole::Owner => 3,
            ParticipantRole::Admin => 2,
            ParticipantRole::Member => 1,
        }
    }

    /// Whether `actor` may move a participant from `from` to `to`.
    ///
    /// Roles only move downward unless an owner or admin acts on someone
    /// else; nobody promotes themselves and only an owner grants ownership.
    pub fn can_change(actor: ParticipantRole, acting_on_self: bool, from: ParticipantRole, to: ParticipantRole) -> bool {
        if from == to {
            return true;
        }

        let promotion = to.permission_level() > from.permission_level();
        if acting_on_self {
            return !promotion;
        }

        match actor {
            ParticipantRole::Owner => true,
            ParticipantRole::Admin => {
                from.permission_level() < actor.permission_level()
                    && to.permission_level() <= actor.permission_level()
            }
            ParticipantRole::Member => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use ParticipantRole::*;

    #[test]
    fn role_transitions() {
        // self-demotion is fine, self-promotion never is
        assert!(ParticipantRole::can_change(Admin, true, Admin, Member));
        assert!(!ParticipantRole::can_change(Member, true, Member, Admin));

        // admin may promote a member to admin, but not to owner
        assert!(ParticipantRole::can_change(Admin, false, Member, Admin));
        assert!(!ParticipantRole::can_change(Admin, false, Member, Owner));
        assert!(!ParticipantRole::can_change(Admin, false, Owner, Member));

        assert!(ParticipantRole::can_change(Owner, false, Member, Owner));
        assert!(!ParticipantRole::can_change(Member, false, Member, Admin));
    }

    #[test]
    fn read_cursor_is_monotonic() {
        let mut participant = Participant::new(Uuid::new_v4(), Uuid::new_v4(), Member);
        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(10);
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        participant.advance_read_cursor(first, later);
        participant.advance_read_cursor(second, earlier);

        assert_eq!(participant.last_read_message_id, Some(first));
        assert_eq!(participant.last_read_at, Some(later));
    }

    #[test]
    fn only_active_admins_manage() {
        let mut participant = Participant::new(Uuid::new_v4(), Uuid::new_v4(), Admin);
        assert!(participant.can_manage_participants());
        participant.status = ParticipantStatus::Left;
        assert!(!participant.can_manage_participants());
    }
}
