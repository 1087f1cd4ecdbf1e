//! Session implementation for FFI

use std::sync::{Arc, Once};

use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::config::ClientConfig;
use crate::messaging::{MessagingClient, MessagingEvent, MessagingHandle};
use crate::playback::{PlayerEvent, VlcClient, VlcPlayer};
use crate::sync::{CatchUpOutcome, RoomClient, RoomEvent, RoomHandle};
use crate::transport::{TransportHandle, TransportSession};

use super::types::*;

static TRACING_INIT: Once = Once::new();

type CallbackSlot = Arc<RwLock<Option<Arc<dyn SessionCallback>>>>;

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        for directive in [
            "socialstream_core=debug",
            "hyper=off",
            "hyper_util=off",
            "reqwest=off",
            "tungstenite=off",
            "tokio_tungstenite=off",
        ] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }

        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

#[derive(Clone)]
struct Credentials {
    user_id: i64,
    token: String,
}

struct ActiveRoom {
    handle: RoomHandle,
    /// Present when the player lives in the native UI
    player_tx: Option<mpsc::UnboundedSender<PlayerEvent>>,
}

/// Main session interface
#[derive(uniffi::Object)]
pub struct Session {
    runtime: Runtime,
    config: ClientConfig,
    credentials: RwLock<Option<Credentials>>,
    callback: CallbackSlot,
    room: Arc<RwLock<Option<ActiveRoom>>>,
    messaging: RwLock<Option<MessagingHandle>>,
}

#[uniffi::export]
impl Session {
    /// Create a session against a backend, e.g. `https://stream.example.com`
    #[uniffi::constructor]
    pub fn new(api_base_url: String) -> Result<Self, CoreError> {
        init_tracing();
        info!("Initializing socialstream-core session for {}", api_base_url);

        let runtime = Runtime::new().map_err(|e| CoreError::NetworkError(e.to_string()))?;

        Ok(Self {
            runtime,
            config: ClientConfig::for_base_url(&api_base_url),
            credentials: RwLock::new(None),
            callback: Arc::new(RwLock::new(None)),
            room: Arc::new(RwLock::new(None)),
            messaging: RwLock::new(None),
        })
    }

    /// Set the logged-in user and bearer token
    pub fn set_credentials(&self, user_id: i64, token: String) {
        debug!("Credentials set for user {}", user_id);
        *self.credentials.write() = Some(Credentials { user_id, token });
    }

    /// Set the event callback
    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        *self.callback.write() = Some(Arc::from(callback));
    }

    /// Open the messaging channel. A no-op if it is already open.
    pub fn open_messaging(&self) -> Result<(), CoreError> {
        let mut slot = self.messaging.write();
        if slot.as_ref().is_some_and(|h| !h.is_closed()) {
            return Ok(());
        }

        let credentials = self.credentials()?;
        let api = Arc::new(ApiClient::new(&self.config)?.with_token(credentials.token.clone()));

        let _guard = self.runtime.enter();
        let transport = TransportSession::connect(&self.config, &self.config.ws_endpoint, Some(credentials.token));
        let (handle, events) = MessagingClient::new(self.config.clone(), transport, api, credentials.user_id).spawn();

        self.runtime
            .spawn(forward_messaging_events(Arc::clone(&self.callback), events));

        info!("Messaging opened for user {}", credentials.user_id);
        *slot = Some(handle);
        Ok(())
    }

    /// Close the messaging channel
    pub fn close_messaging(&self) {
        let handle = self.messaging.write().take();
        if let Some(handle) = handle {
            self.runtime.block_on(handle.shutdown());
            info!("Messaging closed");
        }
    }

    pub fn send_message(&self, recipient_id: i64, body: String) -> Result<SendStatus, CoreError> {
        let handle = self.messaging_handle()?;
        let outcome = self
            .runtime
            .block_on(handle.send_message(recipient_id, &body))?;
        Ok(SendStatus::from(outcome))
    }

    pub fn toggle_reaction(&self, message_id: i64, reaction: ReactionKind) -> Result<(), CoreError> {
        let handle = self.messaging_handle()?;
        self.runtime
            .block_on(handle.toggle_reaction(message_id, reaction.into()))?;
        Ok(())
    }

    pub fn set_typing(&self, recipient_id: i64, is_typing: bool) -> Result<(), CoreError> {
        self.messaging_handle()?.set_typing(recipient_id, is_typing)?;
        Ok(())
    }

    pub fn mark_read(&self, partner_id: i64) -> Result<(), CoreError> {
        self.messaging_handle()?.mark_read(partner_id)?;
        Ok(())
    }

    /// Load the next older page of a conversation. Returns how many messages were new.
    pub fn load_conversation(&self, partner_id: i64) -> Result<u32, CoreError> {
        let handle = self.messaging_handle()?;
        let added = self.runtime.block_on(handle.load_conversation(partner_id))?;
        Ok(u32::try_from(added).unwrap_or(u32::MAX))
    }

    /// Enter a room with a player owned by the native UI. Its events must be
    /// pushed back through [`Session::player_event`].
    pub fn enter_room(&self, room_id: i64, player: Box<dyn NativePlayer>) -> Result<(), CoreError> {
        let (player_tx, player_rx) = mpsc::unbounded_channel();
        self.start_room(room_id, Some(player_tx), |client| {
            client.spawn(NativePlayerBridge(player), player_rx)
        })
    }

    /// Enter a room driving a local VLC through its web interface
    pub fn enter_room_with_vlc(&self, room_id: i64, vlc_password: String, vlc_port: Option<u16>) -> Result<(), CoreError> {
        let vlc = match vlc_port {
            Some(port) => VlcClient::with_port(port, vlc_password),
            None => VlcClient::new(vlc_password),
        }
        .map_err(|e| CoreError::NetworkError(e.to_string()))?;
        self.start_room(room_id, None, |client| {
            let (player, events) = VlcPlayer::spawn(vlc);
            client.spawn(player, events)
        })
    }

    /// Leave the current room, announcing it best effort
    pub fn leave_room(&self) -> Result<(), CoreError> {
        let room = self.room.write().take().ok_or(CoreError::NotInRoom)?;
        self.runtime.block_on(room.handle.leave())?;
        info!("Left room {}", room.handle.room_id());
        Ok(())
    }

    pub fn is_in_room(&self) -> bool {
        self.room
            .read()
            .as_ref()
            .is_some_and(|r| !r.handle.is_closed())
    }

    /// Forward a native player event
    pub fn player_event(&self, event: NativePlayerEvent) -> Result<(), CoreError> {
        let room = self.room.read();
        let tx = room
            .as_ref()
            .and_then(|r| r.player_tx.as_ref())
            .ok_or(CoreError::NotInRoom)?;
        tx.send(PlayerEvent::from(event))
            .map_err(|_| CoreError::NotInRoom)
    }

    /// Ask the room's player to play, pause or seek for the local user
    pub fn control_playback(&self, control: PlaybackControl) -> Result<(), CoreError> {
        self.room_handle()?.control(control.into())?;
        Ok(())
    }

    /// Host only
    pub fn change_video(&self, video_id: i64) -> Result<(), CoreError> {
        let handle = self.room_handle()?;
        self.runtime.block_on(handle.change_video(video_id))?;
        Ok(())
    }

    pub fn resolve_sync_prompt(&self, choice: CatchUpChoice) -> Result<(), CoreError> {
        self.room_handle()?.resolve_prompt(choice.into())?;
        Ok(())
    }

    pub fn add_to_queue(&self, video_id: i64) -> Result<(), CoreError> {
        let handle = self.room_handle()?;
        self.runtime.block_on(handle.add_to_queue(video_id))?;
        Ok(())
    }

    /// Host only
    pub fn remove_from_queue(&self, entry_id: i64) -> Result<(), CoreError> {
        let handle = self.room_handle()?;
        self.runtime.block_on(handle.remove_from_queue(entry_id))?;
        Ok(())
    }

    pub fn toggle_vote(&self, entry_id: i64) -> Result<(), CoreError> {
        let handle = self.room_handle()?;
        self.runtime.block_on(handle.toggle_vote(entry_id))?;
        Ok(())
    }
}

impl Session {
    fn credentials(&self) -> Result<Credentials, CoreError> {
        self.credentials.read().clone().ok_or(CoreError::NotLoggedIn)
    }

    fn messaging_handle(&self) -> Result<MessagingHandle, CoreError> {
        self.messaging.read().clone().ok_or(CoreError::MessagingClosed)
    }

    fn room_handle(&self) -> Result<RoomHandle, CoreError> {
        self.room
            .read()
            .as_ref()
            .map(|r| r.handle.clone())
            .ok_or(CoreError::NotInRoom)
    }

    /// Common room entry: REST client, room channel, driver, event forwarder
    fn start_room(
        &self,
        room_id: i64,
        player_tx: Option<mpsc::UnboundedSender<PlayerEvent>>,
        spawn: impl FnOnce(RoomClient<TransportHandle, ApiClient>) -> (RoomHandle, mpsc::UnboundedReceiver<RoomEvent>),
    ) -> Result<(), CoreError> {
        let mut slot = self.room.write();
        if slot.as_ref().is_some_and(|r| !r.handle.is_closed()) {
            return Err(CoreError::AlreadyInRoom);
        }

        let credentials = self.credentials()?;
        let api = Arc::new(ApiClient::new(&self.config)?.with_token(credentials.token.clone()));

        let _guard = self.runtime.enter();
        let transport = TransportSession::connect(&self.config, &self.config.ws_endpoint, Some(credentials.token));
        let client = RoomClient::new(self.config.clone(), transport, api, room_id, credentials.user_id);
        let (handle, events) = spawn(client);

        self.runtime.spawn(forward_room_events(
            Arc::clone(&self.callback),
            Arc::clone(&self.room),
            room_id,
            events,
        ));

        info!("Entered room {}", room_id);
        *slot = Some(ActiveRoom { handle, player_tx });
        Ok(())
    }
}

fn current_callback(callback: &CallbackSlot) -> Option<Arc<dyn SessionCallback>> {
    callback.read().clone()
}

/// Relay room events to the UI until the room task stops
async fn forward_room_events(
    callback: CallbackSlot,
    room: Arc<RwLock<Option<ActiveRoom>>>,
    room_id: i64,
    mut events: mpsc::UnboundedReceiver<RoomEvent>,
) {
    while let Some(event) = events.recv().await {
        let left = matches!(event, RoomEvent::Left);

        if let Some(cb) = current_callback(&callback) {
            match event {
                RoomEvent::Connection(connected) => cb.on_room_connection_changed(connected),
                RoomEvent::Playback(view) => cb.on_playback_changed(PlaybackSnapshot::from(&view)),
                RoomEvent::Queue(entries) => cb.on_queue_changed(entries.iter().map(QueueEntryInfo::from).collect()),
                RoomEvent::Members(members) => cb.on_members_changed(members.iter().map(RoomMember::from).collect()),
                RoomEvent::Prompt(prompt) => cb.on_sync_prompt(SyncPromptInfo::from(&prompt)),
                RoomEvent::PromptClosed(outcome) => {
                    cb.on_sync_prompt_closed(matches!(outcome, CatchUpOutcome::Join { .. }))
                }
                RoomEvent::SessionInvalid => cb.on_session_invalid(),
                RoomEvent::Error(message) => cb.on_error(message),
                RoomEvent::Left => cb.on_room_left(),
            }
        }

        if left {
            let mut slot = room.write();
            if slot.as_ref().is_some_and(|r| r.handle.room_id() == room_id) {
                *slot = None;
            }
            break;
        }
    }
    debug!("Room {} event forwarder stopped", room_id);
}

/// Relay messaging events to the UI until the messaging task stops
async fn forward_messaging_events(callback: CallbackSlot, mut events: mpsc::UnboundedReceiver<MessagingEvent>) {
    while let Some(event) = events.recv().await {
        let Some(cb) = current_callback(&callback) else {
            continue;
        };
        match event {
            MessagingEvent::Connection(connected) => cb.on_messaging_connection_changed(connected),
            MessagingEvent::Conversation(view) => cb.on_conversation_changed(ConversationInfo::from(&view)),
            MessagingEvent::MessageReceived(message) => cb.on_message_received(MessageInfo::from(&message)),
            MessagingEvent::Unread(total) => cb.on_unread_changed(total),
            MessagingEvent::Typing {
                user_id,
                display_name,
                is_typing,
            } => cb.on_typing_changed(user_id, display_name, is_typing),
            MessagingEvent::Error(message) => cb.on_error(message),
            MessagingEvent::SessionInvalid => cb.on_session_invalid(),
            MessagingEvent::Closed => {
                warn!("Messaging channel closed");
                break;
            }
        }
    }
    debug!("Messaging event forwarder stopped");
}
