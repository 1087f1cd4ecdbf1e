//! SocialStream - Core Library
//!
//! Client core for the SocialStream apps: synchronized playback in watch
//! rooms (with a vote-ordered queue and late-join catch-up) and one-to-one
//! direct messaging, both over a STOMP channel with a REST fallback.

pub mod api;
pub mod config;
pub mod ffi;
pub mod messaging;
pub mod playback;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use config::ClientConfig;
pub use messaging::{MessagingClient, MessagingHandle};
pub use sync::{RoomClient, RoomHandle};
pub use transport::{Transport, TransportSession};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
