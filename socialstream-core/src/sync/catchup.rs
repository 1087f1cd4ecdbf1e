//! Late-Join Catch-Up Negotiator
//!
//! A viewer entering a room that is already playing gets a choice: snap to
//! the host or watch independently. The snapshot is frozen when the prompt
//! opens, and an unanswered prompt resolves to joining once it times out.

use std::time::{Duration, Instant};

use tracing::info;

/// The viewer's answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpDecision {
    JoinPlayback,
    BrowseIndependently,
}

/// What the engine should do once the prompt closes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CatchUpOutcome {
    /// Snap to the host's state at prompt time
    Join { position: f64, is_playing: bool },
    /// Leave the local player alone
    Browse,
}

/// An open prompt
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPrompt {
    pub video_id: Option<i64>,
    pub position: f64,
    pub is_playing: bool,
    pub opened_at: Instant,
    pub deadline: Instant,
}

impl SyncPrompt {
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }
}

/// Room state as fetched on entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntrySnapshot {
    pub video_id: Option<i64>,
    pub position: f64,
    pub is_playing: bool,
}

#[derive(Debug)]
pub struct CatchUpNegotiator {
    timeout: Duration,
    prompt: Option<SyncPrompt>,
}

impl CatchUpNegotiator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, prompt: None }
    }

    /// Open a prompt if a non-host is joining mid-playback
    pub fn evaluate(&mut self, is_host: bool, snapshot: EntrySnapshot, now: Instant) -> Option<&SyncPrompt> {
        if is_host || !snapshot.is_playing || snapshot.position <= 0.0 {
            return None;
        }

        info!(
            "Room already playing at {:.1}s, asking viewer to catch up",
            snapshot.position
        );
        self.prompt = Some(SyncPrompt {
            video_id: snapshot.video_id,
            position: snapshot.position,
            is_playing: snapshot.is_playing,
            opened_at: now,
            deadline: now + self.timeout,
        });
        self.prompt.as_ref()
    }

    /// Close the prompt with the viewer's answer
    pub fn resolve(&mut self, decision: CatchUpDecision) -> Option<CatchUpOutcome> {
        let prompt = self.prompt.take()?;
        info!("Catch-up prompt resolved: {:?}", decision);
        Some(match decision {
            CatchUpDecision::JoinPlayback => CatchUpOutcome::Join {
                position: prompt.position,
                is_playing: prompt.is_playing,
            },
            CatchUpDecision::BrowseIndependently => CatchUpOutcome::Browse,
        })
    }

    /// Auto-resolve to joining once the deadline passes
    pub fn poll(&mut self, now: Instant) -> Option<CatchUpOutcome> {
        let expired = self.prompt.as_ref().is_some_and(|p| now >= p.deadline);
        if expired {
            info!("Catch-up prompt timed out");
            self.resolve(CatchUpDecision::JoinPlayback)
        } else {
            None
        }
    }

    pub fn prompt(&self) -> Option<&SyncPrompt> {
        self.prompt.as_ref()
    }

    /// Drop an open prompt without resolving it
    pub fn cancel(&mut self) {
        self.prompt = None;
    }
}
