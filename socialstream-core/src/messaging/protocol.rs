//! Messaging channel wire format

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Live send
pub const SEND_DESTINATION: &str = "/app/dm/send";
/// Typing signal
pub const TYPING_DESTINATION: &str = "/app/dm/typing";
/// Reaction request
pub const REACTION_DESTINATION: &str = "/app/dm/reaction";

/// Reaction a recipient can put on a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reaction {
    Like,
    Love,
    Haha,
    Wow,
    Sad,
}

impl Reaction {
    pub fn as_str(self) -> &'static str {
        match self {
            Reaction::Like => "LIKE",
            Reaction::Love => "LOVE",
            Reaction::Haha => "HAHA",
            Reaction::Wow => "WOW",
            Reaction::Sad => "SAD",
        }
    }
}

/// A persisted direct message, as the backend sends it everywhere
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub id: i64,
    pub sender_id: i64,

    #[serde(default)]
    pub sender_name: Option<String>,

    pub recipient_id: i64,

    #[serde(default)]
    pub recipient_name: Option<String>,

    /// Body text
    #[serde(alias = "content")]
    pub message: String,

    pub timestamp: NaiveDateTime,

    #[serde(default)]
    pub reaction: Option<Reaction>,
}

impl DirectMessage {
    /// The other party, seen from `user_id`
    pub fn partner_of(&self, user_id: i64) -> i64 {
        if self.sender_id == user_id {
            self.recipient_id
        } else {
            self.sender_id
        }
    }
}

/// Inbound typing signal on `/queue/{user}/typing`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingFrame {
    pub sender_id: i64,

    #[serde(default)]
    pub sender_name: Option<String>,

    #[serde(alias = "isTyping")]
    pub typing: bool,
}

/// Inbound failure report on `/queue/{user}/errors`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
}

/// Body for [`SEND_DESTINATION`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPayload {
    pub recipient_id: i64,
    pub content: String,
}

/// Body for [`TYPING_DESTINATION`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub recipient_id: i64,
    pub is_typing: bool,
}

/// Body for [`REACTION_DESTINATION`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionPayload {
    pub message_id: i64,
    pub reaction: Reaction,
    pub recipient_id: i64,
}

/// Per-user inbound queues
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserQueues {
    pub messages: String,
    pub sent: String,
    pub typing: String,
    pub reaction: String,
    pub errors: String,
}

impl UserQueues {
    pub fn for_user(user_id: i64) -> Self {
        let queue = |kind: &str| format!("/queue/{}/{}", user_id, kind);
        Self {
            messages: queue("messages"),
            sent: queue("sent"),
            typing: queue("typing"),
            reaction: queue("reaction"),
            errors: queue("errors"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_shape() {
        let json = r#"{
            "id": 5, "senderId": 1, "senderName": "ana", "recipientId": 2, "recipientName": "bo",
            "message": "hi", "timestamp": "2024-05-01T10:00:00.123", "reaction": "HAHA"
        }"#;
        let msg: DirectMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.message, "hi");
        assert_eq!(msg.reaction, Some(Reaction::Haha));
        assert_eq!(msg.partner_of(1), 2);
        assert_eq!(msg.partner_of(2), 1);

        let msg: DirectMessage = serde_json::from_str(
            r#"{"id": 6, "senderId": 1, "recipientId": 2, "content": "yo", "timestamp": "2024-05-01T10:00:00"}"#,
        )
        .unwrap();
        assert_eq!(msg.message, "yo");
        assert_eq!(msg.reaction, None);
    }

    #[test]
    fn test_typing_frame_aliases() {
        let frame: TypingFrame = serde_json::from_str(r#"{"senderId": 3, "senderName": "cy", "typing": true}"#).unwrap();
        assert!(frame.typing);
        let frame: TypingFrame = serde_json::from_str(r#"{"senderId": 3, "isTyping": false}"#).unwrap();
        assert!(!frame.typing);
    }

    #[test]
    fn test_outbound_payloads() {
        let payload = ReactionPayload {
            message_id: 9,
            reaction: Reaction::Love,
            recipient_id: 2,
        };
        assert_eq!(
            serde_json::to_value(payload).unwrap(),
            serde_json::json!({"messageId": 9, "reaction": "LOVE", "recipientId": 2})
        );

        let payload = TypingPayload {
            recipient_id: 2,
            is_typing: true,
        };
        assert_eq!(
            serde_json::to_value(payload).unwrap(),
            serde_json::json!({"recipientId": 2, "isTyping": true})
        );

        let queues = UserQueues::for_user(4);
        assert_eq!(queues.sent, "/queue/4/sent");
        assert_eq!(queues.errors, "/queue/4/errors");
    }
}
