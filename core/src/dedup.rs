/// Per-conversation message log with identity-based merge
///
/// Both transports can deliver the same logical message. Confirmed messages
/// are keyed by backend id; id-less pending entries are replaced by their
/// confirmed copy instead of being duplicated.
use crate::types::{Message, MessageId};
use std::collections::HashSet;

#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch, returning only the messages that were not already known
    pub fn merge(&mut self, batch: Vec<Message>) -> Vec<Message> {
        let mut added = Vec::new();
        for msg in batch {
            match msg.id {
                Some(id) => {
                    if !self.ids.insert(id) {
                        continue;
                    }
                    if let Some(slot) = self.pending_slot(&msg) {
                        self.messages[slot] = msg.clone();
                    } else {
                        self.messages.push(msg.clone());
                    }
                    added.push(msg);
                }
                None => {
                    if self.is_known_unconfirmed(&msg) {
                        continue;
                    }
                    self.messages.push(msg.clone());
                    added.push(msg);
                }
            }
        }
        added
    }

    /// Flip the read flag; returns false when the id is unknown
    pub fn mark_read(&mut self, id: MessageId) -> bool {
        match self.messages.iter_mut().find(|m| m.id == Some(id)) {
            Some(msg) => {
                msg.read = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_read(&mut self) {
        for msg in &mut self.messages {
            msg.read = true;
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn pending_slot(&self, confirmed: &Message) -> Option<usize> {
        self.messages.iter().position(|m| {
            m.id.is_none()
                && m.sender_id == confirmed.sender_id
                && m.content == confirmed.content
        })
    }

    /// Fallback timestamps are re-stamped on every decode, so they can't identify a message
    fn is_known_unconfirmed(&self, msg: &Message) -> bool {
        self.messages.iter().any(|m| {
            m.id.is_none()
                && m.sender_id == msg.sender_id
                && m.content == msg.content
                && (m.timestamp == msg.timestamp || (!m.timestamp.parsed && !msg.timestamp.parsed))
        })
    }
}
