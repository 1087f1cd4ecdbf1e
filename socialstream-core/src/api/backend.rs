//! Backend seams consumed by the drivers
//!
//! The drivers are generic over these traits so tests can stand in a fake
//! backend; `ApiClient` is the production implementation.

use std::future::Future;

use super::client::ApiError;
use super::types::{MemberResponse, Page, QueueItem, RoomStateResponse, Video};
use crate::messaging::{DirectMessage, Reaction};

/// Room endpoints used by the room driver
pub trait RoomApi: Send + Sync + 'static {
    fn room_state(&self, room_id: i64) -> impl Future<Output = Result<RoomStateResponse, ApiError>> + Send;

    fn queue(&self, room_id: i64) -> impl Future<Output = Result<Vec<QueueItem>, ApiError>> + Send;

    fn add_to_queue(&self, room_id: i64, video_id: i64) -> impl Future<Output = Result<QueueItem, ApiError>> + Send;

    /// Host/admin only; the backend rejects anyone else
    fn remove_from_queue(&self, room_id: i64, entry_id: i64) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn toggle_vote(&self, room_id: i64, entry_id: i64) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn members(&self, room_id: i64) -> impl Future<Output = Result<Vec<MemberResponse>, ApiError>> + Send;

    fn video(&self, video_id: i64) -> impl Future<Output = Result<Video, ApiError>> + Send;
}

/// Messaging fallback endpoints used by the messaging driver
pub trait MessagingApi: Send + Sync + 'static {
    fn send_message(&self, recipient_id: i64, content: &str) -> impl Future<Output = Result<DirectMessage, ApiError>> + Send;

    /// Newest-first page of a conversation
    fn conversation(
        &self,
        friend_id: i64,
        page: u32,
        size: u32,
    ) -> impl Future<Output = Result<Page<DirectMessage>, ApiError>> + Send;

    fn add_reaction(&self, message_id: i64, reaction: Reaction) -> impl Future<Output = Result<DirectMessage, ApiError>> + Send;
}
