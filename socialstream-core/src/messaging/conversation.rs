//! One conversation with one correspondent

use std::collections::HashMap;

use super::protocol::{DirectMessage, Reaction};

/// Messages exchanged with one partner, ascending by timestamp.
///
/// Confirmed reactions live on the messages themselves. A local toggle that
/// the server has not echoed yet is kept as a pending overlay so both phases
/// stay visible.
#[derive(Debug, Clone)]
pub struct Conversation {
    partner_id: i64,
    messages: Vec<DirectMessage>,
    unread: u32,
    pending_reactions: HashMap<i64, Option<Reaction>>,
    next_page: u32,
    exhausted: bool,
}

impl Conversation {
    pub fn new(partner_id: i64) -> Self {
        Self {
            partner_id,
            messages: Vec::new(),
            unread: 0,
            pending_reactions: HashMap::new(),
            next_page: 0,
            exhausted: false,
        }
    }

    pub fn partner_id(&self) -> i64 {
        self.partner_id
    }

    pub fn messages(&self) -> &[DirectMessage] {
        &self.messages
    }

    pub fn get(&self, message_id: i64) -> Option<&DirectMessage> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Insert unless a message with the same id is already present.
    ///
    /// Equal timestamps keep arrival order.
    pub fn insert(&mut self, message: DirectMessage) -> bool {
        if self.get(message.id).is_some() {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(at, message);
        true
    }

    /// Overwrite a known message with a fresher copy. The server's copy
    /// supersedes any pending reaction on it.
    pub fn update(&mut self, message: DirectMessage) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => {
                self.pending_reactions.remove(&message.id);
                let moved = existing.timestamp != message.timestamp;
                *existing = message;
                if moved {
                    self.messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
                }
                true
            }
            None => false,
        }
    }

    /// Merge a fetched page: new ids are inserted, known ids refreshed.
    /// Returns how many messages were new.
    pub fn merge(&mut self, messages: Vec<DirectMessage>) -> usize {
        let mut added = 0;
        for message in messages {
            if self.get(message.id).is_some() {
                self.update(message);
            } else if self.insert(message) {
                added += 1;
            }
        }
        added
    }

    /// Record which page comes next when scrolling back. Refetching a
    /// newer page does not rewind the cursor.
    pub fn page_loaded(&mut self, number: u32, last: bool) {
        if number + 1 >= self.next_page {
            self.next_page = number + 1;
            self.exhausted = last;
        }
    }

    pub fn next_page(&self) -> u32 {
        self.next_page
    }

    /// Whether older history is known to be fully loaded
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Reaction the UI should show: pending toggle first, then confirmed
    pub fn effective_reaction(&self, message_id: i64) -> Option<Reaction> {
        match self.pending_reactions.get(&message_id) {
            Some(pending) => *pending,
            None => self.get(message_id).and_then(|m| m.reaction),
        }
    }

    pub fn set_pending_reaction(&mut self, message_id: i64, reaction: Option<Reaction>) {
        self.pending_reactions.insert(message_id, reaction);
    }

    pub fn clear_pending_reaction(&mut self, message_id: i64) -> bool {
        self.pending_reactions.remove(&message_id).is_some()
    }

    pub fn has_pending_reaction(&self, message_id: i64) -> bool {
        self.pending_reactions.contains_key(&message_id)
    }

    /// Drop every pending overlay. Returns how many there were.
    pub fn clear_pending_reactions(&mut self) -> usize {
        let cleared = self.pending_reactions.len();
        self.pending_reactions.clear();
        cleared
    }

    pub fn unread(&self) -> u32 {
        self.unread
    }

    pub(crate) fn bump_unread(&mut self) {
        self.unread += 1;
    }

    /// Returns whether anything was unread
    pub fn mark_read(&mut self) -> bool {
        std::mem::take(&mut self.unread) > 0
    }
}
