//! Room playback synchronization

mod catchup;
mod driver;
mod engine;
mod protocol;
mod queue;
mod state;

use thiserror::Error;

pub use catchup::{CatchUpDecision, CatchUpNegotiator, CatchUpOutcome, EntrySnapshot, SyncPrompt};
pub use driver::{PlaybackView, RoomClient, RoomEvent, RoomHandle};
pub use engine::{RoomEffect, RoomSyncEngine};
pub use protocol::{room_topic, RoomAction, RoomCommand, RoomFrame};
pub use queue::{QueueEntry, RoomQueue};
pub use state::{Member, Membership, PlaybackState, RoomPlayback};

/// Room-level failures surfaced to callers
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("Only the host can do that")]
    NotHost,

    #[error("Not in a room")]
    NotInRoom,

    #[error("Unknown queue entry: {0}")]
    UnknownQueueEntry(i64),

    #[error("Session is no longer valid")]
    SessionInvalid,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Room task closed")]
    Closed,
}

impl From<crate::api::ApiError> for SyncError {
    fn from(e: crate::api::ApiError) -> Self {
        if e.is_session_invalid() {
            SyncError::SessionInvalid
        } else {
            SyncError::Backend(e.to_string())
        }
    }
}
