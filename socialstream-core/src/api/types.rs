//! Types for SocialStream REST responses

use serde::{Deserialize, Serialize};

/// Video metadata (only the fields playback needs)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: i64,

    #[serde(default)]
    pub title: String,

    /// Playable source. Older rows use the lowercase key.
    #[serde(default, alias = "mediaurl")]
    pub media_url: Option<String>,

    #[serde(default, alias = "thumbnailurl")]
    pub thumbnail_url: Option<String>,
}

impl Video {
    /// Get the playable source URL, if any
    pub fn source_url(&self) -> Option<&str> {
        self.media_url.as_deref().filter(|u| !u.is_empty())
    }
}

/// A user reference embedded in other payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub id: i64,
    #[serde(default)]
    pub username: String,
}

/// Role a user holds inside a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Host,
    Admin,
    Member,
}

impl Role {
    /// Hosts and admins are the room's source of truth for playback
    pub fn controls_playback(self) -> bool {
        matches!(self, Role::Host | Role::Admin)
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Member
    }
}

/// Queue item as stored by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: i64,
    pub video: Video,

    /// Insertion position assigned by the backend
    #[serde(default)]
    pub position: Option<i64>,

    #[serde(default)]
    pub added_by: Option<UserRef>,

    #[serde(default, alias = "voteCount")]
    pub total_votes: u32,

    /// Only present on payloads computed for the requesting user
    #[serde(default)]
    pub has_voted: Option<bool>,
}

/// Response for the room state endpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStateResponse {
    #[serde(default)]
    pub room_id: Option<i64>,

    #[serde(default)]
    pub current_video_id: Option<i64>,

    #[serde(default, alias = "positionSeconds")]
    pub playback_position: Option<f64>,

    #[serde(default)]
    pub is_playing: Option<bool>,

    #[serde(default)]
    pub last_sync_timestamp: Option<String>,

    #[serde(default)]
    pub queue: Vec<QueueItem>,
}

/// Room membership row
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberResponse {
    pub user: UserRef,
    #[serde(default)]
    pub role: Role,
}

/// Spring-style page wrapper
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    /// Zero-based page number
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub last: bool,
}

/// Request body for the REST send-message endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub recipient_id: i64,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_state_parses_backend_shape() {
        let json = r#"{
            "roomId": 3,
            "currentVideoId": 7,
            "playbackPosition": 42.5,
            "isPlaying": true,
            "lastSyncTimestamp": "2024-05-01T10:00:00",
            "queue": [
                {"id": 11, "video": {"id": 7, "title": "Intro", "mediaUrl": "https://cdn/x.m3u8"},
                 "position": 1, "addedBy": {"id": 2, "username": "ana"}, "totalVotes": 3}
            ]
        }"#;

        let state: RoomStateResponse = serde_json::from_str(json).unwrap();
        assert_eq!(state.current_video_id, Some(7));
        assert_eq!(state.playback_position, Some(42.5));
        assert_eq!(state.is_playing, Some(true));
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue[0].total_votes, 3);
        assert_eq!(state.queue[0].video.source_url(), Some("https://cdn/x.m3u8"));
        assert_eq!(state.queue[0].has_voted, None);
    }

    #[test]
    fn test_empty_room_state() {
        let state: RoomStateResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(state.current_video_id, None);
        assert!(state.queue.is_empty());
    }

    #[test]
    fn test_legacy_media_url_key() {
        let video: Video = serde_json::from_str(r#"{"id": 1, "mediaurl": "a.mp4"}"#).unwrap();
        assert_eq!(video.source_url(), Some("a.mp4"));

        let video: Video = serde_json::from_str(r#"{"id": 1, "mediaUrl": ""}"#).unwrap();
        assert_eq!(video.source_url(), None);
    }

    #[test]
    fn test_member_role() {
        let member: MemberResponse =
            serde_json::from_str(r#"{"user": {"id": 5, "username": "bo"}, "role": "ADMIN"}"#).unwrap();
        assert_eq!(member.role, Role::Admin);
        assert!(member.role.controls_playback());
        assert!(!Role::Member.controls_playback());
    }
}
