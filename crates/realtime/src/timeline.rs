//! Ordered, identity-deduplicated message list.

use std::collections::HashSet;

use studyhall_chats::{Message, MessageId};

/// Messages sorted by `(created_at, id)` ascending, at most one per id.
#[derive(Debug, Default, Clone)]
pub struct MessageTimeline {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message, or replace the stored one with the same id.
    ///
    /// Returns `true` when the message was new.
    pub fn upsert(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            self.replace_existing(message);
            return false;
        }

        self.ids.insert(message.id);
        // realtime inserts almost always land at the tail
        let at_tail = self
            .messages
            .last()
            .map_or(true, |last| last.timeline_cmp(&message).is_lt());
        if at_tail {
            self.messages.push(message);
        } else {
            let at = self
                .messages
                .partition_point(|existing| existing.timeline_cmp(&message).is_lt());
            self.messages.insert(at, message);
        }
        true
    }

    /// Replace a message already in the timeline. Unknown ids are ignored and
    /// `false` is returned.
    pub fn replace(&mut self, message: Message) -> bool {
        if !self.ids.contains(&message.id) {
            return false;
        }
        self.replace_existing(message);
        true
    }

    // created_at is immutable, but a replacement can still carry a different
    // one if the store is misbehaving; re-seat it to keep the order.
    fn replace_existing(&mut self, message: Message) {
        let Some(position) = self.messages.iter().rposition(|m| m.id == message.id) else {
            return;
        };
        if self.messages[position].created_at == message.created_at {
            self.messages[position] = message;
        } else {
            self.messages.remove(position);
            let at = self
                .messages
                .partition_point(|existing| existing.timeline_cmp(&message).is_lt());
            self.messages.insert(at, message);
        }
    }

    /// Replace the whole timeline. Duplicate ids keep the last occurrence.
    pub fn reset(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.clear();
        self.ids.clear();
        for message in messages {
            self.upsert(message);
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        if !self.ids.contains(id) {
            return None;
        }
        self.messages.iter().rev().find(|m| m.id == *id)
    }

    pub fn oldest(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn newest(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use studyhall_chats::OutgoingMessage;
    use uuid::Uuid;

    fn at(offset_secs: i64, content: &str) -> Message {
        let mut message = Message::from_outgoing(Uuid::nil(), Uuid::new_v4(), &OutgoingMessage::text(content));
        message.created_at = Utc::now() + Duration::seconds(offset_secs);
        message
    }

    fn contents(timeline: &MessageTimeline) -> Vec<String> {
        timeline
            .iter()
            .map(|m| m.content.clone().unwrap_or_default())
            .collect()
    }

    #[test]
    fn out_of_order_arrivals_are_sorted() {
        let t3 = at(2, "t3");
        let t1 = at(0, "t1");
        let t2 = at(1, "t2");

        let mut timeline = MessageTimeline::new();
        timeline.upsert(t3);
        timeline.upsert(t1);
        timeline.upsert(t2);

        assert_eq!(contents(&timeline), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn same_identity_is_replaced_in_place() {
        let original = at(0, "first");
        let mut timeline = MessageTimeline::new();
        assert!(timeline.upsert(original.clone()));
        timeline.upsert(at(5, "later"));

        let mut again = original.clone();
        again.content = Some("second".into());
        assert!(!timeline.upsert(again));

        assert_eq!(timeline.len(), 2);
        assert_eq!(contents(&timeline), vec!["second", "later"]);
    }

    #[test]
    fn equal_timestamps_break_ties_by_id() {
        let a = at(0, "a");
        let mut b = a.clone();
        b.id = Uuid::new_v4();
        let (low, high) = if a.id < b.id { (a, b) } else { (b, a) };

        let mut timeline = MessageTimeline::new();
        timeline.upsert(high.clone());
        timeline.upsert(low.clone());

        let ids: Vec<_> = timeline.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![low.id, high.id]);
    }

    #[test]
    fn replace_ignores_unknown_messages() {
        let mut timeline = MessageTimeline::new();
        timeline.upsert(at(0, "kept"));

        assert!(!timeline.replace(at(1, "stranger")));
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn reset_deduplicates() {
        let message = at(0, "one");
        let mut timeline = MessageTimeline::new();
        timeline.upsert(at(-10, "stale"));

        timeline.reset(vec![message.clone(), message.clone()]);
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.oldest().map(|m| m.id), Some(message.id));
    }
}
