//! SocialStream REST API
//!
//! Client for the backend collaborator: room state, queue, members, video
//! metadata and the messaging fallback path.

mod backend;
mod client;
mod types;

pub use backend::{MessagingApi, RoomApi};
pub use client::{ApiClient, ApiError};
pub use types::*;
