//! Playback Adapter and concrete players

mod adapter;
mod vlc;

pub use adapter::{ControlMode, LocalEvent, MediaType, PlaybackAdapter, Player, PlayerEvent};
pub use vlc::{StatusTracker, VlcClient, VlcCommand, VlcError, VlcPlayer, VlcStatus};

#[cfg(test)]
pub(crate) use adapter::test_support;
