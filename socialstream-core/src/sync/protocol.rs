//! Room channel wire format

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::QueueItem;

/// Action carried by a room broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomAction {
    Play,
    Pause,
    Seek,
    ChangeVideo,
    Sync,
    QueueUpdated,
    VoteUpdated,
    MemberJoined,
    MemberLeft,
    /// Anything newer than this client understands
    #[serde(other)]
    Unknown,
}

/// Inbound frame on `/topic/room/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomFrame {
    pub action: RoomAction,

    /// Stamped by the server from the publishing session
    #[serde(default)]
    pub sender_id: Option<i64>,

    #[serde(default)]
    pub position: Option<f64>,

    #[serde(default)]
    pub video_id: Option<i64>,

    /// Full queue, when the server chooses to embed it
    #[serde(default)]
    pub queue: Option<Vec<QueueItem>>,

    #[serde(default)]
    pub user_id: Option<i64>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub timestamp: Option<String>,
}

impl RoomFrame {
    pub fn new(action: RoomAction) -> Self {
        Self {
            action,
            sender_id: None,
            position: None,
            video_id: None,
            queue: None,
            user_id: None,
            username: None,
            timestamp: None,
        }
    }

    pub fn from_sender(mut self, sender_id: i64) -> Self {
        self.sender_id = Some(sender_id);
        self
    }

    pub fn at(mut self, position: f64) -> Self {
        self.position = Some(position);
        self
    }

    pub fn for_video(mut self, video_id: i64) -> Self {
        self.video_id = Some(video_id);
        self
    }

    pub fn member(mut self, user_id: i64, username: &str) -> Self {
        self.user_id = Some(user_id);
        self.username = Some(username.to_string());
        self
    }
}

/// Outbound one-way command to `/app/room/{id}/...`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoomCommand {
    Join { user_id: i64 },
    Leave { user_id: i64 },
    Play { position: f64 },
    Pause { position: f64 },
    Seek { position: f64 },
    ChangeVideo { video_id: i64 },
    Sync { position: f64 },
}

impl RoomCommand {
    fn endpoint(&self) -> &'static str {
        match self {
            RoomCommand::Join { .. } => "join",
            RoomCommand::Leave { .. } => "leave",
            RoomCommand::Play { .. } => "play",
            RoomCommand::Pause { .. } => "pause",
            RoomCommand::Seek { .. } => "seek",
            RoomCommand::ChangeVideo { .. } => "changeVideo",
            RoomCommand::Sync { .. } => "sync",
        }
    }

    pub fn destination(&self, room_id: i64) -> String {
        format!("/app/room/{}/{}", room_id, self.endpoint())
    }

    pub fn payload(&self) -> Value {
        match *self {
            RoomCommand::Join { user_id } | RoomCommand::Leave { user_id } => json!({ "userId": user_id }),
            RoomCommand::Play { position }
            | RoomCommand::Pause { position }
            | RoomCommand::Seek { position }
            | RoomCommand::Sync { position } => json!({ "position": position }),
            RoomCommand::ChangeVideo { video_id } => json!({ "videoId": video_id }),
        }
    }

    /// Playback commands are host-only and never retried
    pub fn is_playback_control(&self) -> bool {
        !matches!(self, RoomCommand::Join { .. } | RoomCommand::Leave { .. })
    }
}

/// Broadcast topic for a room
pub fn room_topic(room_id: i64) -> String {
    format!("/topic/room/{}", room_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_frame() {
        let json = r#"{"action":"PLAY","position":42.0,"videoId":7,"senderId":1,"timestamp":"2024-05-01T10:00:00.123"}"#;
        let frame: RoomFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.action, RoomAction::Play);
        assert_eq!(frame.position, Some(42.0));
        assert_eq!(frame.video_id, Some(7));
        assert_eq!(frame.sender_id, Some(1));
    }

    #[test]
    fn test_member_and_queue_frames() {
        let frame: RoomFrame =
            serde_json::from_str(r#"{"action":"MEMBER_JOINED","userId":4,"username":"cy"}"#).unwrap();
        assert_eq!(frame.action, RoomAction::MemberJoined);
        assert_eq!(frame.user_id, Some(4));

        let frame: RoomFrame = serde_json::from_str(r#"{"action":"QUEUE_UPDATED"}"#).unwrap();
        assert_eq!(frame.queue, None);
    }

    #[test]
    fn test_unknown_action() {
        let frame: RoomFrame = serde_json::from_str(r#"{"action":"CONFETTI"}"#).unwrap();
        assert_eq!(frame.action, RoomAction::Unknown);
    }

    #[test]
    fn test_command_destinations() {
        let cmd = RoomCommand::ChangeVideo { video_id: 9 };
        assert_eq!(cmd.destination(3), "/app/room/3/changeVideo");
        assert_eq!(cmd.payload(), json!({"videoId": 9}));
        assert!(cmd.is_playback_control());

        let cmd = RoomCommand::Leave { user_id: 2 };
        assert_eq!(cmd.destination(3), "/app/room/3/leave");
        assert_eq!(cmd.payload(), json!({"userId": 2}));
        assert!(!cmd.is_playback_control());

        assert_eq!(room_topic(3), "/topic/room/3");
    }
}
