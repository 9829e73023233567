//! Typed realtime events.
//!
//! Raw [`ChangeEvent`]s are decoded here into [`RealtimeEvent`]s, the single
//! sum type every consumer pattern-matches on.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use studyhall_chats::{
    ChangeEvent, ChatResult, Message, MessageId, Participant, PresenceEvent, ReadReceipt, UserId,
};

/// Where decoded events are delivered. One queue per subscription.
pub type EventSink = mpsc::UnboundedSender<RealtimeEvent>;

/// Receiving side of an [`EventSink`].
pub type EventStream = mpsc::UnboundedReceiver<RealtimeEvent>;

/// Connectivity as seen by the session manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Nothing opened yet
    Idle,
    Connected,
    /// Subscribe failed or the transport dropped the channel
    Disconnected { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// What a message update changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageChange {
    Edited,
    SoftDeleted,
    ReactionsChanged,
    Other,
}

impl MessageChange {
    /// Classify an update by comparing the row images.
    ///
    /// Without an old image only the sticky flags can be inspected.
    pub fn classify(old: Option<&Message>, new: &Message) -> Self {
        match old {
            Some(old) => {
                if new.is_deleted && !old.is_deleted {
                    MessageChange::SoftDeleted
                } else if new.content != old.content
                    || new.kind != old.kind
                    || new.edited_at != old.edited_at
                {
                    MessageChange::Edited
                } else if new.reactions != old.reactions {
                    MessageChange::ReactionsChanged
                } else {
                    MessageChange::Other
                }
            }
            None if new.is_deleted => MessageChange::SoftDeleted,
            None if new.is_edited => MessageChange::Edited,
            None => MessageChange::Other,
        }
    }
}

/// Events delivered to a subscription's consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    MessageInserted(Message),
    MessageUpdated { message: Message, change: MessageChange },
    ReadReceiptAdded(ReadReceipt),
    ParticipantChanged(Participant),
    /// Presence update for the conversation, local user already removed
    TypingChanged(PresenceEvent),
    /// Coarse signal from the user index: refetch the conversation list
    ConversationListChanged,
    ConnectionChanged(ConnectionState),
}

impl RealtimeEvent {
    /// Get event type name for logging
    pub fn event_type_name(&self) -> &'static str {
        match self {
            RealtimeEvent::MessageInserted(_) => "message_inserted",
            RealtimeEvent::MessageUpdated { .. } => "message_updated",
            RealtimeEvent::ReadReceiptAdded(_) => "read_receipt_added",
            RealtimeEvent::ParticipantChanged(_) => "participant_changed",
            RealtimeEvent::TypingChanged(_) => "typing_changed",
            RealtimeEvent::ConversationListChanged => "conversation_list_changed",
            RealtimeEvent::ConnectionChanged(_) => "connection_changed",
        }
    }
}

pub(crate) fn decode_message_insert(change: &ChangeEvent) -> ChatResult<RealtimeEvent> {
    Ok(RealtimeEvent::MessageInserted(change.decode_row()?))
}

pub(crate) fn decode_message_update(change: &ChangeEvent) -> ChatResult<RealtimeEvent> {
    let message: Message = change.decode_row()?;
    let old: Option<Message> = change.decode_old_row()?;
    let change = MessageChange::classify(old.as_ref(), &message);
    Ok(RealtimeEvent::MessageUpdated { message, change })
}

pub(crate) fn decode_read_receipt(change: &ChangeEvent) -> ChatResult<RealtimeEvent> {
    Ok(RealtimeEvent::ReadReceiptAdded(change.decode_row()?))
}

pub(crate) fn decode_participant(change: &ChangeEvent) -> ChatResult<RealtimeEvent> {
    Ok(RealtimeEvent::ParticipantChanged(change.decode_row()?))
}

/// Strip the local user out of a presence event. `None` when nothing remains
/// worth delivering.
pub(crate) fn presence_without(local_user: UserId, event: PresenceEvent) -> Option<PresenceEvent> {
    match event {
        PresenceEvent::Sync { mut present } => {
            present.retain(|meta| meta.user_id != local_user);
            Some(PresenceEvent::Sync { present })
        }
        PresenceEvent::Join { meta } if meta.user_id == local_user => None,
        PresenceEvent::Leave { user_id } if user_id == local_user => None,
        other => Some(other),
    }
}

/// Bounded memory of recently delivered message ids.
pub(crate) struct RecentIds {
    capacity: usize,
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl RecentIds {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns false if `id` was already seen.
    pub(crate) fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}
