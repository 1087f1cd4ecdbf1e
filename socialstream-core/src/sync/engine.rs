//! Room Sync Engine
//!
//! Synchronous state machine for one room. Time is passed in, I/O is
//! returned as [`RoomEffect`]s for the driver to carry out, and the one
//! player the room owns is only ever touched through the adapter.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::catchup::{CatchUpDecision, CatchUpNegotiator, CatchUpOutcome, EntrySnapshot, SyncPrompt};
use super::protocol::{RoomAction, RoomCommand, RoomFrame};
use super::queue::RoomQueue;
use super::state::{Membership, RoomPlayback};
use super::SyncError;
use crate::api::{MemberResponse, QueueItem, Role, RoomStateResponse, Video};
use crate::playback::{ControlMode, LocalEvent, PlaybackAdapter, Player, PlayerEvent};

/// Work the driver must do on the engine's behalf
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEffect {
    /// Send a command on the room channel
    Publish(RoomCommand),
    /// Fetch video metadata and hand it to [`RoomSyncEngine::apply_video`]
    FetchVideo(i64),
    /// Fetch the queue and hand it to [`RoomSyncEngine::replace_queue`]
    RefetchQueue,
    /// Fetch the roster and hand it to [`RoomSyncEngine::apply_roster`]
    RefetchMembers,
    PlaybackChanged,
    QueueChanged,
    MembersChanged,
    PromptOpened(SyncPrompt),
    PromptClosed(CatchUpOutcome),
}

/// Playback to apply once a video's metadata arrives
#[derive(Debug, Clone, Copy)]
struct PendingVideo {
    video_id: i64,
    then: Option<(f64, bool)>,
}

pub struct RoomSyncEngine<P> {
    room_id: i64,
    local_user_id: i64,
    role: Role,
    adapter: PlaybackAdapter<P>,
    playback: RoomPlayback,
    queue: RoomQueue,
    members: Membership,
    catch_up: CatchUpNegotiator,
    drift_threshold: f64,
    pending_video: Option<PendingVideo>,
}

impl<P: Player> RoomSyncEngine<P> {
    pub fn new(
        room_id: i64,
        local_user_id: i64,
        player: P,
        ignore_window: Duration,
        catch_up_timeout: Duration,
        drift_threshold: f64,
    ) -> Self {
        Self {
            room_id,
            local_user_id,
            role: Role::Member,
            adapter: PlaybackAdapter::new(player, ignore_window),
            playback: RoomPlayback::default(),
            queue: RoomQueue::default(),
            members: Membership::default(),
            catch_up: CatchUpNegotiator::new(catch_up_timeout),
            drift_threshold,
            pending_video: None,
        }
    }

    pub fn room_id(&self) -> i64 {
        self.room_id
    }

    pub fn local_user_id(&self) -> i64 {
        self.local_user_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether this client is a source of truth for playback
    pub fn is_host(&self) -> bool {
        self.role.controls_playback()
    }

    pub fn playback(&self) -> &RoomPlayback {
        &self.playback
    }

    pub fn queue(&self) -> &RoomQueue {
        &self.queue
    }

    pub fn members(&self) -> &Membership {
        &self.members
    }

    pub fn prompt(&self) -> Option<&SyncPrompt> {
        self.catch_up.prompt()
    }

    pub fn adapter(&self) -> &PlaybackAdapter<P> {
        &self.adapter
    }

    /// Seed the room from the entry fetch.
    ///
    /// `video` is the metadata for `state.current_video_id`, if it could be
    /// fetched; without it the room starts with no video.
    pub fn initialize(
        &mut self,
        state: RoomStateResponse,
        video: Option<Video>,
        roster: Vec<MemberResponse>,
        now: Instant,
    ) -> Vec<RoomEffect> {
        let mut effects = self.apply_roster(roster);
        self.members.joined(self.local_user_id, None);

        self.queue.replace(state.queue);
        effects.push(RoomEffect::QueueChanged);

        let position = state.playback_position.unwrap_or(0.0).max(0.0);
        let is_playing = state.is_playing.unwrap_or(false);

        let Some(video) = video else {
            if let Some(id) = state.current_video_id {
                warn!("No metadata for current video {}, starting empty", id);
            }
            self.playback.clear(now);
            effects.push(RoomEffect::PlaybackChanged);
            return effects;
        };

        info!(
            "Entering room {} as {:?}: video {} at {:.1}s ({})",
            self.room_id,
            self.role,
            video.id,
            position,
            if is_playing { "playing" } else { "paused" }
        );
        self.load_video(&video, now);
        self.playback.load(video.clone(), now);

        let snapshot = EntrySnapshot {
            video_id: Some(video.id),
            position,
            is_playing,
        };

        let is_host = self.is_host();
        if let Some(prompt) = self.catch_up.evaluate(is_host, snapshot, now) {
            // Room view follows the host; the player waits for the viewer
            effects.push(RoomEffect::PromptOpened(prompt.clone()));
            self.playback.play(position, now);
        } else if is_playing && !is_host {
            self.adapter.seek(position, ControlMode::Programmatic, now);
            self.adapter.play(ControlMode::Programmatic, now);
            self.playback.play(position, now);
        } else {
            if position > 0.0 {
                self.adapter.seek(position, ControlMode::Programmatic, now);
            }
            self.playback.pause(position, now);
        }

        effects.push(RoomEffect::PlaybackChanged);
        effects
    }

    /// Apply a roster fetch and pick up our own role from it
    pub fn apply_roster(&mut self, roster: Vec<MemberResponse>) -> Vec<RoomEffect> {
        self.members.apply_roster(roster);
        let role = self.members.role_of(self.local_user_id).unwrap_or_default();
        let mut effects = self.set_role(role);
        effects.push(RoomEffect::MembersChanged);
        effects
    }

    pub fn set_role(&mut self, role: Role) -> Vec<RoomEffect> {
        if role == self.role {
            return Vec::new();
        }
        info!("Role in room {} is now {:?}", self.room_id, role);
        self.role = role;

        // A host has nothing to catch up to
        if self.is_host() && self.catch_up.prompt().is_some() {
            self.catch_up.cancel();
            return vec![RoomEffect::PromptClosed(CatchUpOutcome::Browse)];
        }
        Vec::new()
    }

    /// A native player event. Hosts broadcast user intent; viewers only observe.
    pub fn on_player_event(&mut self, event: PlayerEvent, now: Instant) -> Vec<RoomEffect> {
        let Some(local) = self.adapter.observe(event, now) else {
            return Vec::new();
        };

        if !self.is_host() {
            debug!("Viewer {:?} stays local", local);
            return Vec::new();
        }

        let (applied, command) = match local {
            LocalEvent::Play(position) => (self.playback.play(position, now), RoomCommand::Play { position }),
            LocalEvent::Pause(position) => (self.playback.pause(position, now), RoomCommand::Pause { position }),
            LocalEvent::Seek(position) => (self.playback.seek(position, now), RoomCommand::Seek { position }),
        };

        if !applied {
            debug!("Ignoring {:?} with no video loaded", local);
            return Vec::new();
        }

        vec![RoomEffect::Publish(command), RoomEffect::PlaybackChanged]
    }

    /// A control the local user asked for through the engine rather than
    /// the player's own UI. The player's resulting event decides whether it
    /// is broadcast.
    pub fn user_control(&mut self, control: LocalEvent, now: Instant) {
        match control {
            LocalEvent::Play(_) => self.adapter.play(ControlMode::UserInitiated, now),
            LocalEvent::Pause(_) => self.adapter.pause(ControlMode::UserInitiated, now),
            LocalEvent::Seek(position) => self.adapter.seek(position, ControlMode::UserInitiated, now),
        }
    }

    /// Host switches the room to another video
    pub fn change_video(&mut self, video: Video, now: Instant) -> Result<Vec<RoomEffect>, SyncError> {
        if !self.is_host() {
            return Err(SyncError::NotHost);
        }

        info!("Changing room {} to video {}", self.room_id, video.id);
        self.pending_video = None;
        self.load_video(&video, now);
        let video_id = video.id;
        self.playback.load(video, now);

        Ok(vec![
            RoomEffect::Publish(RoomCommand::ChangeVideo { video_id }),
            RoomEffect::PlaybackChanged,
        ])
    }

    /// Periodic host heartbeat
    pub fn sync_tick(&mut self, now: Instant) -> Vec<RoomEffect> {
        if !self.is_host() || self.playback.video().is_none() {
            return Vec::new();
        }

        let position = self.adapter.position();
        self.playback.seek(position, now);
        debug!("SYNC at {:.1}s", position);
        vec![RoomEffect::Publish(RoomCommand::Sync { position })]
    }

    /// Auto-resolve an expired catch-up prompt
    pub fn poll_prompt(&mut self, now: Instant) -> Vec<RoomEffect> {
        match self.catch_up.poll(now) {
            Some(outcome) => self.apply_catch_up(outcome, now),
            None => Vec::new(),
        }
    }

    /// Viewer answered the catch-up prompt
    pub fn resolve_prompt(&mut self, decision: CatchUpDecision, now: Instant) -> Vec<RoomEffect> {
        match self.catch_up.resolve(decision) {
            Some(outcome) => self.apply_catch_up(outcome, now),
            None => Vec::new(),
        }
    }

    /// Carry out a catch-up outcome on the local player
    pub fn apply_catch_up(&mut self, outcome: CatchUpOutcome, now: Instant) -> Vec<RoomEffect> {
        match outcome {
            CatchUpOutcome::Join { position, is_playing } => {
                self.adapter.seek(position, ControlMode::Programmatic, now);
                if is_playing {
                    self.adapter.play(ControlMode::Programmatic, now);
                } else {
                    self.adapter.pause(ControlMode::Programmatic, now);
                }
                vec![RoomEffect::PromptClosed(outcome), RoomEffect::PlaybackChanged]
            }
            CatchUpOutcome::Browse => vec![RoomEffect::PromptClosed(outcome)],
        }
    }

    /// An inbound room broadcast
    pub fn handle_frame(&mut self, frame: RoomFrame, now: Instant) -> Vec<RoomEffect> {
        if frame.sender_id == Some(self.local_user_id) {
            debug!("Ignoring own {:?}", frame.action);
            return Vec::new();
        }

        match frame.action {
            RoomAction::Play => self.remote_play_pause(&frame, true, now),
            RoomAction::Pause => self.remote_play_pause(&frame, false, now),
            RoomAction::Seek => self.remote_seek(&frame, now),
            RoomAction::Sync => self.remote_sync(&frame, now),
            RoomAction::ChangeVideo => {
                let Some(video_id) = frame.video_id else {
                    warn!("CHANGE_VIDEO without videoId");
                    return Vec::new();
                };
                info!("Host changed video to {}", video_id);
                self.pending_video = Some(PendingVideo { video_id, then: None });
                vec![RoomEffect::FetchVideo(video_id)]
            }
            RoomAction::QueueUpdated | RoomAction::VoteUpdated => match frame.queue {
                Some(items) => self.replace_queue(items),
                None => vec![RoomEffect::RefetchQueue],
            },
            RoomAction::MemberJoined => {
                let Some(user_id) = frame.user_id else {
                    return Vec::new();
                };
                let known = self.members.get(user_id).is_some();
                self.members.joined(user_id, frame.username.as_deref());
                debug!("Member {} joined", user_id);

                let mut effects = vec![RoomEffect::MembersChanged];
                if !known {
                    effects.push(RoomEffect::RefetchMembers);
                }
                effects
            }
            RoomAction::MemberLeft => {
                let Some(user_id) = frame.user_id else {
                    return Vec::new();
                };
                if let Some(member) = self.members.left(user_id) {
                    if member.role.controls_playback() {
                        warn!("Host {} left room {}, keeping local playback", user_id, self.room_id);
                    } else {
                        debug!("Member {} left", user_id);
                    }
                }
                vec![RoomEffect::MembersChanged]
            }
            RoomAction::Unknown => {
                debug!("Ignoring unknown room action");
                Vec::new()
            }
        }
    }

    /// Metadata arrived for a video a broadcast referred to
    pub fn apply_video(&mut self, video: Video, now: Instant) -> Vec<RoomEffect> {
        let pending = match self.pending_video {
            Some(p) if p.video_id == video.id => p,
            _ => {
                debug!("Dropping stale metadata for video {}", video.id);
                return Vec::new();
            }
        };
        self.pending_video = None;

        let mut effects = Vec::new();
        if self.catch_up.prompt().is_some() {
            self.catch_up.cancel();
            effects.push(RoomEffect::PromptClosed(CatchUpOutcome::Browse));
        }

        self.load_video(&video, now);
        self.playback.load(video, now);

        if let Some((position, playing)) = pending.then {
            self.adapter.seek(position, ControlMode::Programmatic, now);
            if playing {
                self.adapter.play(ControlMode::Programmatic, now);
                self.playback.play(position, now);
            } else {
                self.playback.pause(position, now);
            }
        }

        effects.push(RoomEffect::PlaybackChanged);
        effects
    }

    pub fn replace_queue(&mut self, items: Vec<QueueItem>) -> Vec<RoomEffect> {
        self.queue.replace(items);
        vec![RoomEffect::QueueChanged]
    }

    /// A queue entry the local user added
    pub fn add_queue_entry(&mut self, item: QueueItem) -> Vec<RoomEffect> {
        self.queue.add(item);
        vec![RoomEffect::QueueChanged]
    }

    /// Optimistic vote toggle; reconcile with a queue refetch afterwards
    pub fn toggle_vote(&mut self, entry_id: i64) -> Result<Vec<RoomEffect>, SyncError> {
        let voted = self.queue.toggle_vote(entry_id)?;
        debug!("Vote on {} is now {}", entry_id, voted);
        Ok(vec![RoomEffect::QueueChanged])
    }

    /// Host removes an entry
    pub fn remove_queue_entry(&mut self, entry_id: i64) -> Result<Vec<RoomEffect>, SyncError> {
        if !self.is_host() {
            return Err(SyncError::NotHost);
        }
        self.queue
            .remove(entry_id)
            .ok_or(SyncError::UnknownQueueEntry(entry_id))?;
        Ok(vec![RoomEffect::QueueChanged])
    }

    fn load_video(&mut self, video: &Video, now: Instant) {
        match video.source_url() {
            Some(url) => {
                self.adapter.load_source(url, ControlMode::Programmatic, now);
            }
            None => warn!("Video {} has no playable source", video.id),
        }
    }

    /// PLAY/PAUSE from the host: seek, then play or pause
    fn remote_play_pause(&mut self, frame: &RoomFrame, playing: bool, now: Instant) -> Vec<RoomEffect> {
        let position = frame
            .position
            .unwrap_or_else(|| self.playback.position_at(now));

        if let Some(video_id) = frame.video_id {
            if self.playback.video_id() != Some(video_id) {
                debug!("{:?} for video {} we do not have, fetching", frame.action, video_id);
                self.pending_video = Some(PendingVideo {
                    video_id,
                    then: Some((position, playing)),
                });
                return vec![RoomEffect::FetchVideo(video_id)];
            }
        }

        let applied = if playing {
            self.playback.play(position, now)
        } else {
            self.playback.pause(position, now)
        };
        if !applied {
            debug!("Ignoring {:?} with no video loaded", frame.action);
            return Vec::new();
        }

        if self.catch_up.prompt().is_none() {
            self.adapter.seek(position, ControlMode::Programmatic, now);
            if playing {
                self.adapter.play(ControlMode::Programmatic, now);
            } else {
                self.adapter.pause(ControlMode::Programmatic, now);
            }
        }

        vec![RoomEffect::PlaybackChanged]
    }

    fn remote_seek(&mut self, frame: &RoomFrame, now: Instant) -> Vec<RoomEffect> {
        let Some(position) = frame.position else {
            warn!("SEEK without position");
            return Vec::new();
        };
        if frame.video_id.is_some() && frame.video_id != self.playback.video_id() {
            debug!("SEEK for another video, ignoring");
            return Vec::new();
        }
        if !self.playback.seek(position, now) {
            return Vec::new();
        }
        if self.catch_up.prompt().is_none() {
            self.adapter.seek(position, ControlMode::Programmatic, now);
        }
        vec![RoomEffect::PlaybackChanged]
    }

    /// Snap only when drift exceeds the threshold
    fn remote_sync(&mut self, frame: &RoomFrame, now: Instant) -> Vec<RoomEffect> {
        let Some(remote) = frame.position else {
            warn!("SYNC without position");
            return Vec::new();
        };
        if frame.video_id.is_some() && frame.video_id != self.playback.video_id() {
            debug!("SYNC for another video, ignoring");
            return Vec::new();
        }
        if !self.playback.seek(remote, now) {
            return Vec::new();
        }

        if self.catch_up.prompt().is_some() {
            return Vec::new();
        }

        let local = self.adapter.position();
        let drift = (local - remote).abs();
        if drift > self.drift_threshold {
            info!("Drift {:.2}s (local {:.1}, host {:.1}), snapping", drift, local, remote);
            self.adapter.seek(remote, ControlMode::Programmatic, now);
            vec![RoomEffect::PlaybackChanged]
        } else {
            debug!("Drift {:.2}s within tolerance", drift);
            Vec::new()
        }
    }
}
