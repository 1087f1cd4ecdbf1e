//! Room Driver
//!
//! Runs one [`RoomSyncEngine`] inside a background task. The task owns the
//! engine and the player, so every transition for a room happens on one
//! task in arrival order. UI code talks to it through a cloneable
//! [`RoomHandle`] and listens on the returned [`RoomEvent`] receiver.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::catchup::{CatchUpDecision, CatchUpOutcome, SyncPrompt};
use super::engine::{RoomEffect, RoomSyncEngine};
use super::protocol::{room_topic, RoomCommand, RoomFrame};
use super::queue::QueueEntry;
use super::state::{Member, RoomPlayback};
use super::SyncError;
use crate::api::{ApiError, RoomApi, RoomStateResponse, Video};
use crate::config::ClientConfig;
use crate::playback::{LocalEvent, Player, PlayerEvent};
use crate::transport::Transport;

/// Snapshot of room playback for the UI
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackView {
    pub video: Option<Video>,
    pub position: f64,
    pub is_playing: bool,
}

impl PlaybackView {
    pub fn of(playback: &RoomPlayback, now: Instant) -> Self {
        Self {
            video: playback.video().cloned(),
            position: playback.position_at(now),
            is_playing: playback.is_playing(),
        }
    }
}

/// Events emitted by a room task
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Room channel connected or dropped
    Connection(bool),
    Playback(PlaybackView),
    Queue(Vec<QueueEntry>),
    Members(Vec<Member>),
    /// A late-join choice is waiting for the viewer
    Prompt(SyncPrompt),
    PromptClosed(CatchUpOutcome),
    /// The backend rejected our credentials
    SessionInvalid,
    Error(String),
    /// The task has left the room and stopped
    Left,
}

/// Requests sent to a room task
enum RoomRequest {
    ChangeVideo {
        video_id: i64,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    AddToQueue {
        video_id: i64,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    RemoveFromQueue {
        entry_id: i64,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    ToggleVote {
        entry_id: i64,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    ResolvePrompt(CatchUpDecision),
    Control(LocalEvent),
    Leave {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running room task
#[derive(Clone)]
pub struct RoomHandle {
    room_id: i64,
    command_tx: mpsc::UnboundedSender<RoomRequest>,
}

impl RoomHandle {
    pub fn room_id(&self) -> i64 {
        self.room_id
    }

    /// Whether the room task has stopped
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), SyncError>>) -> RoomRequest,
    ) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx.send(make(reply)).map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Host only: switch the room to another video
    pub async fn change_video(&self, video_id: i64) -> Result<(), SyncError> {
        self.request(|reply| RoomRequest::ChangeVideo { video_id, reply }).await
    }

    pub async fn add_to_queue(&self, video_id: i64) -> Result<(), SyncError> {
        self.request(|reply| RoomRequest::AddToQueue { video_id, reply }).await
    }

    /// Host only
    pub async fn remove_from_queue(&self, entry_id: i64) -> Result<(), SyncError> {
        self.request(|reply| RoomRequest::RemoveFromQueue { entry_id, reply }).await
    }

    pub async fn toggle_vote(&self, entry_id: i64) -> Result<(), SyncError> {
        self.request(|reply| RoomRequest::ToggleVote { entry_id, reply }).await
    }

    pub fn resolve_prompt(&self, decision: CatchUpDecision) -> Result<(), SyncError> {
        self.command_tx
            .send(RoomRequest::ResolvePrompt(decision))
            .map_err(|_| SyncError::Closed)
    }

    /// Ask the player to play/pause/seek on the local user's behalf
    pub fn control(&self, control: LocalEvent) -> Result<(), SyncError> {
        self.command_tx
            .send(RoomRequest::Control(control))
            .map_err(|_| SyncError::Closed)
    }

    /// Announce leaving (best effort), tear the channel down and stop the task
    pub async fn leave(&self) -> Result<(), SyncError> {
        let (done, rx) = oneshot::channel();
        self.command_tx
            .send(RoomRequest::Leave { done })
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)
    }
}

/// Builds and starts a room task
pub struct RoomClient<T, A> {
    config: ClientConfig,
    transport: T,
    api: Arc<A>,
    room_id: i64,
    user_id: i64,
}

impl<T: Transport, A: RoomApi> RoomClient<T, A> {
    pub fn new(config: ClientConfig, transport: T, api: Arc<A>, room_id: i64, user_id: i64) -> Self {
        Self {
            config,
            transport,
            api,
            room_id,
            user_id,
        }
    }

    /// Start the room task. Must be called inside a tokio runtime.
    pub fn spawn<P: Player>(
        self,
        player: P,
        player_events: mpsc::UnboundedReceiver<PlayerEvent>,
    ) -> (RoomHandle, mpsc::UnboundedReceiver<RoomEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let handle = RoomHandle {
            room_id: self.room_id,
            command_tx,
        };

        tokio::spawn(self.run(player, player_events, command_rx, event_tx));

        (handle, event_rx)
    }

    async fn run<P: Player>(
        self,
        player: P,
        mut player_events: mpsc::UnboundedReceiver<PlayerEvent>,
        mut command_rx: mpsc::UnboundedReceiver<RoomRequest>,
        event_tx: mpsc::UnboundedSender<RoomEvent>,
    ) {
        let RoomClient {
            config,
            transport,
            api,
            room_id,
            user_id,
        } = self;

        info!("Entering room {} as user {}", room_id, user_id);
        let mut frames = transport.subscribe::<RoomFrame>(&room_topic(room_id));
        let mut status = transport.status();

        let engine = RoomSyncEngine::new(
            room_id,
            user_id,
            player,
            config.ignore_window,
            config.catch_up_timeout,
            config.drift_threshold_secs,
        );
        let mut task = RoomTask {
            room_id,
            user_id,
            transport,
            api,
            engine,
            event_tx,
        };

        task.enter().await;

        let connected = task.transport.is_connected();
        if connected {
            task.announce();
        }
        task.emit(RoomEvent::Connection(connected));

        let mut sync_tick = interval_at(
            tokio::time::Instant::now() + config.sync_interval,
            config.sync_interval,
        );
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = task
                .engine
                .prompt()
                .map(|p| tokio::time::Instant::from_std(p.deadline));

            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(RoomRequest::Leave { done }) => {
                            task.leave().await;
                            let _ = done.send(());
                            break;
                        }
                        Some(cmd) => task.handle_request(cmd).await,
                        None => {
                            debug!("All handles for room {} dropped", room_id);
                            task.leave().await;
                            break;
                        }
                    }
                }
                frame = frames.recv() => {
                    match frame {
                        Some(frame) => {
                            let effects = task.engine.handle_frame(frame, now());
                            task.process(effects).await;
                        }
                        None => {
                            warn!("Room {} channel closed", room_id);
                            task.emit(RoomEvent::Left);
                            break;
                        }
                    }
                }
                Some(event) = player_events.recv() => {
                    let effects = task.engine.on_player_event(event, now());
                    task.process(effects).await;
                }
                _ = sync_tick.tick() => {
                    let effects = task.engine.sync_tick(now());
                    task.process(effects).await;
                }
                _ = sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)), if deadline.is_some() => {
                    let effects = task.engine.poll_prompt(now());
                    task.process(effects).await;
                }
                Ok(()) = status.changed() => {
                    let connected = *status.borrow_and_update();
                    info!("Room {} channel {}", room_id, if connected { "connected" } else { "disconnected" });
                    if connected {
                        task.announce();
                    }
                    task.emit(RoomEvent::Connection(connected));
                }
            }
        }

        drop(frames);
        info!("Room {} task stopped", room_id);
    }
}

/// Wall clock the engine sees. Goes through tokio so paused-time tests work.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

struct RoomTask<T, A, P> {
    room_id: i64,
    user_id: i64,
    transport: T,
    api: Arc<A>,
    engine: RoomSyncEngine<P>,
    event_tx: mpsc::UnboundedSender<RoomEvent>,
}

impl<T: Transport, A: RoomApi, P: Player> RoomTask<T, A, P> {
    fn emit(&self, event: RoomEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Log a REST failure, flag dead sessions, and convert for the caller
    fn api_failed(&self, what: &str, e: ApiError) -> SyncError {
        warn!("Failed to {} for room {}: {}", what, self.room_id, e);
        if e.is_session_invalid() {
            self.emit(RoomEvent::SessionInvalid);
        }
        SyncError::from(e)
    }

    /// Fetch the entry snapshot. Every step degrades instead of blocking entry.
    async fn enter(&mut self) {
        let state = match self.api.room_state(self.room_id).await {
            Ok(state) => state,
            Err(e) => {
                self.api_failed("fetch room state", e);
                let queue = match self.api.queue(self.room_id).await {
                    Ok(queue) => queue,
                    Err(e) => {
                        self.api_failed("fetch queue", e);
                        Vec::new()
                    }
                };
                RoomStateResponse {
                    queue,
                    ..Default::default()
                }
            }
        };

        let video = match state.current_video_id {
            Some(video_id) => match self.api.video(video_id).await {
                Ok(video) => Some(video),
                Err(e) => {
                    self.api_failed("fetch current video", e);
                    None
                }
            },
            None => None,
        };

        let roster = match self.api.members(self.room_id).await {
            Ok(roster) => roster,
            Err(e) => {
                self.api_failed("fetch members", e);
                Vec::new()
            }
        };

        let effects = self.engine.initialize(state, video, roster, now());
        self.process(effects).await;
    }

    /// Tell the room we are here. Sent on every (re)connect.
    fn announce(&self) {
        self.publish(RoomCommand::Join { user_id: self.user_id });
    }

    fn publish(&self, command: RoomCommand) {
        if command.is_playback_control() && !self.transport.is_connected() {
            error!("Dropping {:?} for room {}: not connected", command, self.room_id);
            return;
        }
        self.transport
            .publish(&command.destination(self.room_id), &command.payload());
    }

    /// Run effects to completion; REST results can produce more effects
    async fn process(&mut self, effects: Vec<RoomEffect>) {
        let mut work: VecDeque<RoomEffect> = effects.into();

        while let Some(effect) = work.pop_front() {
            match effect {
                RoomEffect::Publish(command) => self.publish(command),
                RoomEffect::FetchVideo(video_id) => match self.api.video(video_id).await {
                    Ok(video) => work.extend(self.engine.apply_video(video, now())),
                    Err(e) => {
                        let e = self.api_failed("fetch video", e);
                        self.emit(RoomEvent::Error(e.to_string()));
                    }
                },
                RoomEffect::RefetchQueue => match self.api.queue(self.room_id).await {
                    Ok(items) => work.extend(self.engine.replace_queue(items)),
                    Err(e) => {
                        self.api_failed("refetch queue", e);
                    }
                },
                RoomEffect::RefetchMembers => match self.api.members(self.room_id).await {
                    Ok(roster) => work.extend(self.engine.apply_roster(roster)),
                    Err(e) => {
                        self.api_failed("refetch members", e);
                    }
                },
                RoomEffect::PlaybackChanged => {
                    self.emit(RoomEvent::Playback(PlaybackView::of(self.engine.playback(), now())));
                }
                RoomEffect::QueueChanged => {
                    self.emit(RoomEvent::Queue(self.engine.queue().entries().to_vec()));
                }
                RoomEffect::MembersChanged => {
                    let members = self.engine.members().list().into_iter().cloned().collect();
                    self.emit(RoomEvent::Members(members));
                }
                RoomEffect::PromptOpened(prompt) => self.emit(RoomEvent::Prompt(prompt)),
                RoomEffect::PromptClosed(outcome) => self.emit(RoomEvent::PromptClosed(outcome)),
            }
        }
    }

    async fn handle_request(&mut self, request: RoomRequest) {
        match request {
            RoomRequest::ChangeVideo { video_id, reply } => {
                let result = self.change_video(video_id).await;
                let _ = reply.send(result);
            }
            RoomRequest::AddToQueue { video_id, reply } => {
                let result = match self.api.add_to_queue(self.room_id, video_id).await {
                    Ok(item) => {
                        let effects = self.engine.add_queue_entry(item);
                        self.process(effects).await;
                        Ok(())
                    }
                    Err(e) => Err(self.api_failed("add to queue", e)),
                };
                let _ = reply.send(result);
            }
            RoomRequest::RemoveFromQueue { entry_id, reply } => {
                let result = self.remove_from_queue(entry_id).await;
                let _ = reply.send(result);
            }
            RoomRequest::ToggleVote { entry_id, reply } => {
                let result = self.toggle_vote(entry_id).await;
                let _ = reply.send(result);
            }
            RoomRequest::ResolvePrompt(decision) => {
                let effects = self.engine.resolve_prompt(decision, now());
                self.process(effects).await;
            }
            RoomRequest::Control(control) => self.engine.user_control(control, now()),
            RoomRequest::Leave { done } => {
                // Handled by the run loop
                let _ = done.send(());
            }
        }
    }

    async fn change_video(&mut self, video_id: i64) -> Result<(), SyncError> {
        if !self.engine.is_host() {
            return Err(SyncError::NotHost);
        }
        let video = self
            .api
            .video(video_id)
            .await
            .map_err(|e| self.api_failed("fetch video", e))?;
        let effects = self.engine.change_video(video, now())?;
        self.process(effects).await;
        Ok(())
    }

    async fn remove_from_queue(&mut self, entry_id: i64) -> Result<(), SyncError> {
        if !self.engine.is_host() {
            return Err(SyncError::NotHost);
        }
        self.api
            .remove_from_queue(self.room_id, entry_id)
            .await
            .map_err(|e| self.api_failed("remove queue entry", e))?;

        let effects = match self.engine.remove_queue_entry(entry_id) {
            Ok(effects) => effects,
            Err(_) => vec![RoomEffect::RefetchQueue],
        };
        self.process(effects).await;
        Ok(())
    }

    /// Optimistic toggle, then the REST vote, then a refetch to reconcile
    async fn toggle_vote(&mut self, entry_id: i64) -> Result<(), SyncError> {
        let effects = self.engine.toggle_vote(entry_id)?;
        self.process(effects).await;

        let result = self
            .api
            .toggle_vote(self.room_id, entry_id)
            .await
            .map_err(|e| self.api_failed("toggle vote", e));

        self.process(vec![RoomEffect::RefetchQueue]).await;
        result
    }

    async fn leave(&mut self) {
        info!("Leaving room {}", self.room_id);
        let farewell = RoomCommand::Leave { user_id: self.user_id };
        self.transport
            .disconnect(Some((farewell.destination(self.room_id), farewell.payload())))
            .await;
        self.emit(RoomEvent::Left);
    }
}
