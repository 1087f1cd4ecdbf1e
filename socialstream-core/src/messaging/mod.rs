//! Direct messaging
//!
//! Same split as room sync: a synchronous [`MessagingEngine`] owned by one
//! driver task that talks to the transport and the REST fallback.

mod conversation;
mod driver;
mod engine;
mod protocol;
mod typing;

use thiserror::Error;

pub use conversation::Conversation;
pub use driver::{MessagingClient, MessagingEvent, MessagingHandle, SendOutcome};
pub use engine::{ConversationView, MessagingEngine, OutgoingMessage, OutgoingState};
pub use protocol::{
    DirectMessage, ErrorFrame, Reaction, ReactionPayload, SendPayload, TypingFrame, TypingPayload, UserQueues,
    REACTION_DESTINATION, SEND_DESTINATION, TYPING_DESTINATION,
};
pub use typing::{TypingIndicator, TypingTracker};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MessagingError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Unknown message: {0}")]
    UnknownMessage(i64),

    #[error("Session is no longer valid")]
    SessionInvalid,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Messaging task closed")]
    Closed,
}

impl From<crate::api::ApiError> for MessagingError {
    fn from(e: crate::api::ApiError) -> Self {
        if e.is_session_invalid() {
            MessagingError::SessionInvalid
        } else {
            MessagingError::Backend(e.to_string())
        }
    }
}
