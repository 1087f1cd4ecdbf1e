//! FFI types exposed via uniffi

use std::time::Instant;

use crate::api::{ApiError, Role, Video};
use crate::messaging::{
    ConversationView, DirectMessage, MessagingError, OutgoingMessage, OutgoingState, Reaction, SendOutcome,
};
use crate::playback::{LocalEvent, MediaType, Player, PlayerEvent};
use crate::sync::{CatchUpDecision, Member, PlaybackView, QueueEntry, SyncError, SyncPrompt};

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Session is no longer valid")]
    SessionInvalid,

    #[error("Not in a room")]
    NotInRoom,

    #[error("Already in a room")]
    AlreadyInRoom,

    #[error("Not the host")]
    NotHost,

    #[error("Messaging is not open")]
    MessagingClosed,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error: {0}")]
    ApiError(String),
}

impl From<ApiError> for CoreError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Unauthorized => CoreError::SessionInvalid,
            ApiError::Http(e) => CoreError::NetworkError(e.to_string()),
            e => CoreError::ApiError(e.to_string()),
        }
    }
}

impl From<SyncError> for CoreError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::NotHost => CoreError::NotHost,
            SyncError::NotInRoom | SyncError::Closed => CoreError::NotInRoom,
            SyncError::SessionInvalid => CoreError::SessionInvalid,
            SyncError::UnknownQueueEntry(id) => CoreError::InvalidInput(format!("Unknown queue entry {}", id)),
            SyncError::Backend(msg) => CoreError::ApiError(msg),
        }
    }
}

impl From<MessagingError> for CoreError {
    fn from(e: MessagingError) -> Self {
        match e {
            MessagingError::EmptyMessage => CoreError::InvalidInput("Message is empty".to_string()),
            MessagingError::UnknownMessage(id) => CoreError::InvalidInput(format!("Unknown message {}", id)),
            MessagingError::SessionInvalid => CoreError::SessionInvalid,
            MessagingError::Backend(msg) => CoreError::ApiError(msg),
            MessagingError::Closed => CoreError::MessagingClosed,
        }
    }
}

/// Video information exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct VideoInfo {
    pub id: i64,
    pub title: String,
    pub media_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl From<&Video> for VideoInfo {
    fn from(v: &Video) -> Self {
        Self {
            id: v.id,
            title: v.title.clone(),
            media_url: v.source_url().map(str::to_string),
            thumbnail_url: v.thumbnail_url.clone(),
        }
    }
}

/// Room playback exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct PlaybackSnapshot {
    pub video: Option<VideoInfo>,
    pub position_secs: f64,
    pub is_playing: bool,
}

impl From<&PlaybackView> for PlaybackSnapshot {
    fn from(p: &PlaybackView) -> Self {
        Self {
            video: p.video.as_ref().map(VideoInfo::from),
            position_secs: p.position,
            is_playing: p.is_playing,
        }
    }
}

/// Queue entry exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct QueueEntryInfo {
    pub id: i64,
    pub video: VideoInfo,
    pub added_by: Option<String>,
    pub vote_count: u32,
    pub viewer_has_voted: bool,
}

impl From<&QueueEntry> for QueueEntryInfo {
    fn from(e: &QueueEntry) -> Self {
        Self {
            id: e.id,
            video: VideoInfo::from(&e.video),
            added_by: e.added_by.as_ref().map(|u| u.username.clone()),
            vote_count: e.vote_count,
            viewer_has_voted: e.viewer_has_voted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum MemberRole {
    Host,
    Admin,
    Member,
}

impl From<Role> for MemberRole {
    fn from(r: Role) -> Self {
        match r {
            Role::Host => MemberRole::Host,
            Role::Admin => MemberRole::Admin,
            Role::Member => MemberRole::Member,
        }
    }
}

/// Room member exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct RoomMember {
    pub user_id: i64,
    pub username: String,
    pub role: MemberRole,
    pub online: bool,
}

impl From<&Member> for RoomMember {
    fn from(m: &Member) -> Self {
        Self {
            user_id: m.user_id,
            username: m.username.clone(),
            role: MemberRole::from(m.role),
            online: m.online,
        }
    }
}

/// Late-join choice shown to a viewer
#[derive(Debug, Clone, uniffi::Record)]
pub struct SyncPromptInfo {
    pub video_id: Option<i64>,
    pub position_secs: f64,
    pub is_playing: bool,
    /// Seconds until the prompt resolves to joining on its own
    pub timeout_secs: f64,
}

impl From<&SyncPrompt> for SyncPromptInfo {
    fn from(p: &SyncPrompt) -> Self {
        Self {
            video_id: p.video_id,
            position_secs: p.position,
            is_playing: p.is_playing,
            timeout_secs: p.remaining(Instant::now()).as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum CatchUpChoice {
    JoinPlayback,
    BrowseIndependently,
}

impl From<CatchUpChoice> for CatchUpDecision {
    fn from(c: CatchUpChoice) -> Self {
        match c {
            CatchUpChoice::JoinPlayback => CatchUpDecision::JoinPlayback,
            CatchUpChoice::BrowseIndependently => CatchUpDecision::BrowseIndependently,
        }
    }
}

/// Playback request from the local user
#[derive(Debug, Clone, Copy, PartialEq, uniffi::Enum)]
pub enum PlaybackControl {
    Play,
    Pause,
    Seek { position_secs: f64 },
}

impl From<PlaybackControl> for LocalEvent {
    fn from(c: PlaybackControl) -> Self {
        // Play/pause positions are read back from the player's own event
        match c {
            PlaybackControl::Play => LocalEvent::Play(0.0),
            PlaybackControl::Pause => LocalEvent::Pause(0.0),
            PlaybackControl::Seek { position_secs } => LocalEvent::Seek(position_secs),
        }
    }
}

/// Native player event pushed back by the UI
#[derive(Debug, Clone, Copy, PartialEq, uniffi::Enum)]
pub enum NativePlayerEvent {
    Play { position_secs: f64 },
    Pause { position_secs: f64 },
    Seeked { position_secs: f64 },
    TimeUpdate { position_secs: f64 },
}

impl From<NativePlayerEvent> for PlayerEvent {
    fn from(e: NativePlayerEvent) -> Self {
        match e {
            NativePlayerEvent::Play { position_secs } => PlayerEvent::Play { position: position_secs },
            NativePlayerEvent::Pause { position_secs } => PlayerEvent::Pause { position: position_secs },
            NativePlayerEvent::Seeked { position_secs } => PlayerEvent::Seeked { position: position_secs },
            NativePlayerEvent::TimeUpdate { position_secs } => PlayerEvent::TimeUpdate { position: position_secs },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum MediaKind {
    Hls,
    Mp4,
    Webm,
}

impl From<MediaType> for MediaKind {
    fn from(m: MediaType) -> Self {
        match m {
            MediaType::Hls => MediaKind::Hls,
            MediaType::Mp4 => MediaKind::Mp4,
            MediaType::Webm => MediaKind::Webm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum ReactionKind {
    Like,
    Love,
    Haha,
    Wow,
    Sad,
}

impl From<ReactionKind> for Reaction {
    fn from(r: ReactionKind) -> Self {
        match r {
            ReactionKind::Like => Reaction::Like,
            ReactionKind::Love => Reaction::Love,
            ReactionKind::Haha => Reaction::Haha,
            ReactionKind::Wow => Reaction::Wow,
            ReactionKind::Sad => Reaction::Sad,
        }
    }
}

impl From<Reaction> for ReactionKind {
    fn from(r: Reaction) -> Self {
        match r {
            Reaction::Like => ReactionKind::Like,
            Reaction::Love => ReactionKind::Love,
            Reaction::Haha => ReactionKind::Haha,
            Reaction::Wow => ReactionKind::Wow,
            Reaction::Sad => ReactionKind::Sad,
        }
    }
}

/// Confirmed direct message exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct MessageInfo {
    pub id: i64,
    pub sender_id: i64,
    pub sender_name: Option<String>,
    pub recipient_id: i64,
    pub body: String,
    /// Milliseconds since the UNIX epoch, reading the backend's local time as UTC
    pub timestamp_ms: i64,
    pub reaction: Option<ReactionKind>,
}

impl From<&DirectMessage> for MessageInfo {
    fn from(m: &DirectMessage) -> Self {
        Self {
            id: m.id,
            sender_id: m.sender_id,
            sender_name: m.sender_name.clone(),
            recipient_id: m.recipient_id,
            body: m.message.clone(),
            timestamp_ms: m.timestamp.and_utc().timestamp_millis(),
            reaction: m.reaction.map(ReactionKind::from),
        }
    }
}

/// Unconfirmed outgoing message exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct PendingMessageInfo {
    pub local_id: u64,
    pub recipient_id: i64,
    pub body: String,
    /// Waiting for the channel to come back
    pub parked: bool,
}

impl From<&OutgoingMessage> for PendingMessageInfo {
    fn from(o: &OutgoingMessage) -> Self {
        Self {
            local_id: o.local_id,
            recipient_id: o.recipient_id,
            body: o.content.clone(),
            parked: o.state == OutgoingState::Parked,
        }
    }
}

/// Conversation exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct ConversationInfo {
    pub partner_id: i64,
    pub messages: Vec<MessageInfo>,
    pub pending: Vec<PendingMessageInfo>,
    pub unread: u32,
    pub typing_name: Option<String>,
    /// Message ids whose reaction is still unconfirmed
    pub reacting: Vec<i64>,
    pub history_complete: bool,
}

impl From<&ConversationView> for ConversationInfo {
    fn from(c: &ConversationView) -> Self {
        Self {
            partner_id: c.partner_id,
            messages: c.messages.iter().map(MessageInfo::from).collect(),
            pending: c.outgoing.iter().map(PendingMessageInfo::from).collect(),
            unread: c.unread,
            typing_name: c.typing.as_ref().map(|t| t.display_name.clone()),
            reacting: c.reacting.clone(),
            history_complete: c.history_exhausted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum SendStatus {
    Sent,
    Queued,
    Delivered,
    Parked,
}

impl From<SendOutcome> for SendStatus {
    fn from(o: SendOutcome) -> Self {
        match o {
            SendOutcome::Sent => SendStatus::Sent,
            SendOutcome::Queued => SendStatus::Queued,
            SendOutcome::Delivered => SendStatus::Delivered,
            SendOutcome::Parked => SendStatus::Parked,
        }
    }
}

/// Callback interface for session events
#[uniffi::export(callback_interface)]
pub trait SessionCallback: Send + Sync {
    fn on_room_connection_changed(&self, connected: bool);
    fn on_playback_changed(&self, playback: PlaybackSnapshot);
    fn on_queue_changed(&self, queue: Vec<QueueEntryInfo>);
    fn on_members_changed(&self, members: Vec<RoomMember>);
    fn on_sync_prompt(&self, prompt: SyncPromptInfo);
    /// `joined` is false when the viewer chose to browse
    fn on_sync_prompt_closed(&self, joined: bool);
    fn on_room_left(&self);
    fn on_messaging_connection_changed(&self, connected: bool);
    fn on_conversation_changed(&self, conversation: ConversationInfo);
    fn on_message_received(&self, message: MessageInfo);
    fn on_unread_changed(&self, total: u32);
    fn on_typing_changed(&self, user_id: i64, display_name: String, is_typing: bool);
    fn on_session_invalid(&self);
    fn on_error(&self, message: String);
}

/// A player owned by the native UI. Only the core calls these.
#[uniffi::export(callback_interface)]
pub trait NativePlayer: Send + Sync {
    fn load_source(&self, url: String, media: MediaKind);
    fn play(&self);
    fn pause(&self);
    fn seek(&self, position_secs: f64);
    fn position(&self) -> f64;
}

/// Puts a native player behind the core's `Player` seam
pub(crate) struct NativePlayerBridge(pub(crate) Box<dyn NativePlayer>);

impl Player for NativePlayerBridge {
    fn load_source(&mut self, url: &str, media_type: MediaType) {
        self.0.load_source(url.to_string(), MediaKind::from(media_type));
    }

    fn play(&mut self) {
        self.0.play();
    }

    fn pause(&mut self) {
        self.0.pause();
    }

    fn seek(&mut self, position: f64) {
        self.0.seek(position);
    }

    fn position(&self) -> f64 {
        self.0.position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(CoreError::from(SyncError::NotHost), CoreError::NotHost));
        assert!(matches!(CoreError::from(SyncError::Closed), CoreError::NotInRoom));
        assert!(matches!(CoreError::from(ApiError::Unauthorized), CoreError::SessionInvalid));
        assert!(matches!(
            CoreError::from(MessagingError::EmptyMessage),
            CoreError::InvalidInput(_)
        ));
    }

    #[test]
    fn test_playback_control_mapping() {
        assert_eq!(
            LocalEvent::from(PlaybackControl::Seek { position_secs: 12.5 }),
            LocalEvent::Seek(12.5)
        );
        assert_eq!(
            PlayerEvent::from(NativePlayerEvent::Seeked { position_secs: 3.0 }),
            PlayerEvent::Seeked { position: 3.0 }
        );
    }
}
