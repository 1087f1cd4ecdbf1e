//! Messaging Engine
//!
//! Synchronous conversation state for one user. Outbound messages are never
//! inserted optimistically: they are tracked as [`OutgoingMessage`]s until
//! the server's own copy arrives, so the list only ever holds authoritative
//! ids.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::conversation::Conversation;
use super::protocol::{DirectMessage, Reaction, ReactionPayload, SendPayload, TypingFrame, TypingPayload};
use super::typing::{TypingIndicator, TypingTracker};
use super::MessagingError;
use crate::api::Page;

/// Delivery phase of a message we sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    /// Handed to the live channel, waiting for the server's copy
    Sending,
    /// Both live and REST paths failed; re-sent when the channel reconnects
    Parked,
}

/// A message sent but not yet confirmed
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub local_id: u64,
    pub recipient_id: i64,
    pub content: String,
    pub state: OutgoingState,
}

impl OutgoingMessage {
    pub fn payload(&self) -> SendPayload {
        SendPayload {
            recipient_id: self.recipient_id,
            content: self.content.clone(),
        }
    }
}

/// What the UI renders for one conversation
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationView {
    pub partner_id: i64,
    /// Confirmed messages, effective reactions applied
    pub messages: Vec<DirectMessage>,
    pub outgoing: Vec<OutgoingMessage>,
    pub unread: u32,
    pub typing: Option<TypingIndicator>,
    /// Messages whose reaction toggle the server has not confirmed yet
    pub reacting: Vec<i64>,
    /// Older history is fully loaded
    pub history_exhausted: bool,
}

pub struct MessagingEngine {
    user_id: i64,
    conversations: HashMap<i64, Conversation>,
    outgoing: BTreeMap<u64, OutgoingMessage>,
    next_local_id: u64,
    typing: TypingTracker,
}

impl MessagingEngine {
    pub fn new(user_id: i64, typing_ttl: Duration) -> Self {
        Self {
            user_id,
            conversations: HashMap::new(),
            outgoing: BTreeMap::new(),
            next_local_id: 1,
            typing: TypingTracker::new(typing_ttl),
        }
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn conversation(&self, partner_id: i64) -> Option<&Conversation> {
        self.conversations.get(&partner_id)
    }

    fn conversation_mut(&mut self, partner_id: i64) -> &mut Conversation {
        self.conversations
            .entry(partner_id)
            .or_insert_with(|| Conversation::new(partner_id))
    }

    /// Start sending. The caller picks the path and reports back.
    pub fn send_message(&mut self, recipient_id: i64, body: &str) -> Result<OutgoingMessage, MessagingError> {
        let content = body.trim();
        if content.is_empty() {
            return Err(MessagingError::EmptyMessage);
        }

        let local_id = self.next_local_id;
        self.next_local_id += 1;

        let outgoing = OutgoingMessage {
            local_id,
            recipient_id,
            content: content.to_string(),
            state: OutgoingState::Sending,
        };
        self.outgoing.insert(local_id, outgoing.clone());
        debug!("Sending message {} to {}", local_id, recipient_id);
        Ok(outgoing)
    }

    /// Server echo on the `sent` queue. Settles the oldest matching outgoing
    /// message and inserts the authoritative copy. Returns the partner.
    pub fn confirm_sent(&mut self, message: DirectMessage) -> i64 {
        let partner = message.partner_of(self.user_id);
        let settled = self
            .outgoing
            .values()
            .find(|o| {
                o.state == OutgoingState::Sending
                    && o.recipient_id == message.recipient_id
                    && o.content == message.message
            })
            .map(|o| o.local_id);
        if let Some(local_id) = settled {
            self.outgoing.remove(&local_id);
        }

        self.conversation_mut(partner).insert(message);
        partner
    }

    /// A message on the inbound queue. Returns the partner if it was new.
    pub fn receive_message(&mut self, message: DirectMessage) -> Option<i64> {
        let partner = message.partner_of(self.user_id);
        let from_partner = message.sender_id != self.user_id;

        let conversation = self.conversation_mut(partner);
        if !conversation.insert(message) {
            debug!("Duplicate message in conversation with {}", partner);
            return None;
        }
        if from_partner {
            conversation.bump_unread();
            // A delivered message ends their typing burst
            self.typing.stop(partner);
        }
        Some(partner)
    }

    /// The REST path delivered an outgoing message
    pub fn fallback_delivered(&mut self, local_id: u64, message: DirectMessage) -> i64 {
        self.outgoing.remove(&local_id);
        let partner = message.partner_of(self.user_id);
        self.conversation_mut(partner).insert(message);
        partner
    }

    /// Both paths failed; keep it for the next connection
    pub fn park_offline(&mut self, local_id: u64) -> bool {
        match self.outgoing.get_mut(&local_id) {
            Some(outgoing) => {
                info!("Parking message {} until reconnect", local_id);
                outgoing.state = OutgoingState::Parked;
                true
            }
            None => false,
        }
    }

    /// Forget an outgoing message that will never be delivered
    pub fn discard(&mut self, local_id: u64) -> Option<OutgoingMessage> {
        self.outgoing.remove(&local_id)
    }

    /// Parked messages, oldest first, moved back to `Sending`
    pub fn take_parked(&mut self) -> Vec<OutgoingMessage> {
        let mut parked = Vec::new();
        for outgoing in self.outgoing.values_mut() {
            if outgoing.state == OutgoingState::Parked {
                outgoing.state = OutgoingState::Sending;
                parked.push(outgoing.clone());
            }
        }
        parked
    }

    pub fn outgoing(&self, recipient_id: i64) -> Vec<OutgoingMessage> {
        self.outgoing
            .values()
            .filter(|o| o.recipient_id == recipient_id)
            .cloned()
            .collect()
    }

    /// Merge a fetched conversation page. Returns how many messages were new.
    pub fn merge_page(&mut self, partner_id: i64, page: Page<DirectMessage>) -> usize {
        let conversation = self.conversation_mut(partner_id);
        let added = conversation.merge(page.content);
        conversation.page_loaded(page.number, page.last);
        debug!("Merged page {} for {} ({} new)", page.number, partner_id, added);
        added
    }

    /// Optimistically toggle a reaction. Choosing the reaction a message
    /// already shows clears it locally; the request still carries it.
    pub fn toggle_reaction(&mut self, message_id: i64, reaction: Reaction) -> Result<ReactionPayload, MessagingError> {
        let user_id = self.user_id;
        let conversation = self
            .conversations
            .values_mut()
            .find(|c| c.get(message_id).is_some())
            .ok_or(MessagingError::UnknownMessage(message_id))?;

        let next = if conversation.effective_reaction(message_id) == Some(reaction) {
            None
        } else {
            Some(reaction)
        };
        conversation.set_pending_reaction(message_id, next);

        let recipient_id = conversation
            .get(message_id)
            .map(|m| m.partner_of(user_id))
            .unwrap_or_else(|| conversation.partner_id());

        Ok(ReactionPayload {
            message_id,
            reaction,
            recipient_id,
        })
    }

    /// Authoritative reaction echo. Returns the partner if the message is known.
    pub fn reaction_confirmed(&mut self, message: DirectMessage) -> Option<i64> {
        let partner = message.partner_of(self.user_id);
        let id = message.id;
        let conversation = self.conversations.get_mut(&partner)?;
        conversation.clear_pending_reaction(id);
        if conversation.update(message) {
            Some(partner)
        } else {
            warn!("Reaction for unknown message {}", id);
            None
        }
    }

    /// REST reaction finished (or failed). Drops the overlay and applies
    /// the server's copy if there is one.
    pub fn reaction_fallback_done(&mut self, message_id: i64, message: Option<DirectMessage>) -> Option<i64> {
        let partner = self
            .conversations
            .values()
            .find(|c| c.get(message_id).is_some())
            .map(|c| c.partner_id())?;

        let conversation = self.conversation_mut(partner);
        conversation.clear_pending_reaction(message_id);
        if let Some(message) = message {
            conversation.update(message);
        }
        Some(partner)
    }

    /// The server refused a live request on the errors queue. Error frames
    /// carry no message id, so every pending overlay is dropped. Returns the
    /// partners whose conversations should be refetched.
    pub fn reactions_rejected(&mut self) -> Vec<i64> {
        let mut partners: Vec<i64> = self
            .conversations
            .values_mut()
            .filter_map(|c| (c.clear_pending_reactions() > 0).then_some(c.partner_id()))
            .collect();
        partners.sort_unstable();
        partners
    }

    /// Outbound typing signal
    pub fn set_typing(&self, recipient_id: i64, is_typing: bool) -> TypingPayload {
        TypingPayload {
            recipient_id,
            is_typing,
        }
    }

    /// Inbound typing signal. Returns whether the indicator changed.
    pub fn typing_signal(&mut self, frame: &TypingFrame, now: Instant) -> bool {
        if frame.sender_id == self.user_id {
            return false;
        }
        self.typing
            .signal(frame.sender_id, frame.sender_name.as_deref(), frame.typing, now)
    }

    /// Expire stale indicators. Returns the partners whose indicator cleared.
    pub fn expire_typing(&mut self, now: Instant) -> Vec<i64> {
        self.typing.expire(now)
    }

    pub fn is_typing(&self, partner_id: i64, now: Instant) -> bool {
        self.typing.is_typing(partner_id, now)
    }

    pub fn next_typing_expiry(&self) -> Option<Instant> {
        self.typing.next_expiry()
    }

    pub fn clear_typing(&mut self) {
        self.typing.clear();
    }

    pub fn mark_read(&mut self, partner_id: i64) -> bool {
        self.conversations
            .get_mut(&partner_id)
            .is_some_and(|c| c.mark_read())
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.values().map(|c| c.unread()).sum()
    }

    pub fn view(&self, partner_id: i64) -> ConversationView {
        let mut view = ConversationView {
            partner_id,
            messages: Vec::new(),
            outgoing: self.outgoing(partner_id),
            unread: 0,
            typing: self.typing.get(partner_id).cloned(),
            reacting: Vec::new(),
            history_exhausted: false,
        };

        if let Some(conversation) = self.conversations.get(&partner_id) {
            for m in conversation.messages() {
                if conversation.has_pending_reaction(m.id) {
                    view.reacting.push(m.id);
                }
                view.messages.push(DirectMessage {
                    reaction: conversation.effective_reaction(m.id),
                    ..m.clone()
                });
            }
            view.unread = conversation.unread();
            view.history_exhausted = conversation.is_exhausted();
        }

        view
    }
}
