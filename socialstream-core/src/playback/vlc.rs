//! VLC web-interface player
//!
//! Drives a local VLC through `/requests/status.json`. Commands run in order
//! on a worker task, which also polls status and turns the differences
//! between samples into normalized [`PlayerEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::adapter::{MediaType, Player, PlayerEvent};

/// Default VLC web interface port
pub const DEFAULT_PORT: u16 = 8080;

/// Short timeouts since VLC is local
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Status poll cadence
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Position jump beyond elapsed wall time that counts as a seek
const SEEK_JUMP_SECS: f64 = 1.5;

#[derive(Debug, Error)]
pub enum VlcError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid VLC password")]
    Unauthorized,

    #[error("VLC error: {0}")]
    Api(String),
}

/// Subset of VLC's status.json
#[derive(Debug, Clone, Deserialize)]
pub struct VlcStatus {
    #[serde(default)]
    pub state: String,
    /// Whole seconds
    #[serde(default)]
    pub time: f64,
    /// Fraction of `length`
    #[serde(default)]
    pub position: f64,
    #[serde(default)]
    pub length: f64,
}

impl VlcStatus {
    pub fn is_playing(&self) -> bool {
        self.state == "playing"
    }

    /// Playhead in seconds, sub-second when the length is known
    pub fn seconds(&self) -> f64 {
        if self.length > 0.0 && self.position > 0.0 {
            self.position * self.length
        } else {
            self.time
        }
    }
}

/// Commands queued for the worker
#[derive(Debug, Clone, PartialEq)]
pub enum VlcCommand {
    Load(String),
    Play,
    Pause,
    Seek(f64),
}

/// Client for VLC's HTTP interface
#[derive(Debug, Clone)]
pub struct VlcClient {
    http: Client,
    base_url: String,
    password: String,
}

impl VlcClient {
    pub fn new(password: impl Into<String>) -> Result<Self, VlcError> {
        Self::with_port(DEFAULT_PORT, password)
    }

    pub fn with_port(port: u16, password: impl Into<String>) -> Result<Self, VlcError> {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(2)
            .build()?;

        Ok(Self {
            http,
            // 127.0.0.1 avoids IPv6 resolution of localhost
            base_url: format!("http://127.0.0.1:{}", port),
            password: password.into(),
        })
    }

    /// Fetch status, optionally running a command first
    async fn request(&self, query: &[(&str, String)]) -> Result<VlcStatus, VlcError> {
        let url = format!("{}/requests/status.json", self.base_url);
        let resp = self
            .http
            .get(&url)
            .basic_auth("", Some(&self.password))
            .query(query)
            .send()
            .await?;

        match resp.status().as_u16() {
            200 => Ok(resp.json().await?),
            401 | 403 => Err(VlcError::Unauthorized),
            code => Err(VlcError::Api(format!("Unexpected response (HTTP {})", code))),
        }
    }

    pub async fn status(&self) -> Result<VlcStatus, VlcError> {
        self.request(&[]).await
    }

    #[instrument(skip(self))]
    pub async fn execute(&self, command: &VlcCommand) -> Result<VlcStatus, VlcError> {
        match command {
            VlcCommand::Load(url) => {
                // in_play starts playback; force a pause so loads land paused at 0
                self.request(&[("command", "in_play".to_string()), ("input", url.clone())])
                    .await?;
                self.request(&[("command", "pl_forcepause".to_string())]).await
            }
            VlcCommand::Play => self.request(&[("command", "pl_forceresume".to_string())]).await,
            VlcCommand::Pause => self.request(&[("command", "pl_forcepause".to_string())]).await,
            VlcCommand::Seek(position) => {
                let length = self.status().await?.length;
                self.request(&[("command", "seek".to_string()), ("val", seek_value(*position, length))])
                    .await
            }
        }
    }
}

/// `val` for VLC's seek command. Plain seconds are whole seconds only, so
/// when the media length is known the target goes out as a percentage.
fn seek_value(position: f64, length: f64) -> String {
    let position = position.max(0.0);
    if length > 0.0 {
        format!("{:.4}%", (position / length * 100.0).min(100.0))
    } else {
        format!("{}", position.round() as u64)
    }
}

/// Turns successive status samples into player events
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: Option<(bool, f64, Instant)>,
}

impl StatusTracker {
    pub fn update(&mut self, playing: bool, position: f64, now: Instant) -> Vec<PlayerEvent> {
        let mut events = Vec::new();

        if let Some((was_playing, last_position, at)) = self.last {
            let expected = if was_playing {
                last_position + now.duration_since(at).as_secs_f64()
            } else {
                last_position
            };

            if (position - expected).abs() > SEEK_JUMP_SECS {
                events.push(PlayerEvent::Seeked { position });
            }

            match (was_playing, playing) {
                (false, true) => events.push(PlayerEvent::Play { position }),
                (true, false) => events.push(PlayerEvent::Pause { position }),
                _ => {}
            }

            if position != last_position {
                events.push(PlayerEvent::TimeUpdate { position });
            }
        } else if playing {
            events.push(PlayerEvent::Play { position });
        }

        self.last = Some((playing, position, now));
        events
    }
}

/// A [`Player`] backed by VLC
pub struct VlcPlayer {
    command_tx: mpsc::UnboundedSender<VlcCommand>,
    position: Arc<Mutex<f64>>,
}

impl VlcPlayer {
    /// Start the worker. Events stop when the player is dropped.
    pub fn spawn(client: VlcClient) -> (Self, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let position = Arc::new(Mutex::new(0.0));

        tokio::spawn(run_worker(client, command_rx, event_tx, position.clone()));

        (Self { command_tx, position }, event_rx)
    }

    fn send(&self, command: VlcCommand) {
        if self.command_tx.send(command).is_err() {
            warn!("VLC worker is gone");
        }
    }
}

impl Player for VlcPlayer {
    fn load_source(&mut self, url: &str, _media_type: MediaType) {
        *self.position.lock() = 0.0;
        self.send(VlcCommand::Load(url.to_string()));
    }

    fn play(&mut self) {
        self.send(VlcCommand::Play);
    }

    fn pause(&mut self) {
        self.send(VlcCommand::Pause);
    }

    fn seek(&mut self, position: f64) {
        *self.position.lock() = position;
        self.send(VlcCommand::Seek(position));
    }

    fn position(&self) -> f64 {
        *self.position.lock()
    }
}

async fn run_worker(
    client: VlcClient,
    mut command_rx: mpsc::UnboundedReceiver<VlcCommand>,
    event_tx: mpsc::UnboundedSender<PlayerEvent>,
    position: Arc<Mutex<f64>>,
) {
    info!("VLC worker started");
    let mut tracker = StatusTracker::default();
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else { break };
                if let Err(e) = client.execute(&cmd).await {
                    warn!("VLC command {:?} failed: {}", cmd, e);
                }
            }
            _ = poll.tick() => {
                match client.status().await {
                    Ok(status) => {
                        let seconds = status.seconds();
                        *position.lock() = seconds;
                        for event in tracker.update(status.is_playing(), seconds, Instant::now()) {
                            if event_tx.send(event).is_err() {
                                debug!("No one listening for VLC events");
                            }
                        }
                    }
                    Err(e) => debug!("VLC status poll failed: {}", e),
                }
            }
        }
    }

    info!("VLC worker ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        let json = r#"{"state":"playing","time":41,"position":0.35,"length":120,"volume":256}"#;
        let status: VlcStatus = serde_json::from_str(json).unwrap();
        assert!(status.is_playing());
        assert!((status.seconds() - 42.0).abs() < 1e-9);

        let status: VlcStatus = serde_json::from_str(r#"{"state":"stopped","time":0}"#).unwrap();
        assert!(!status.is_playing());
        assert_eq!(status.seconds(), 0.0);
    }

    #[test]
    fn test_seek_value_keeps_subsecond_precision() {
        assert_eq!(seek_value(42.4, 100.0), "42.4000%");
        assert_eq!(seek_value(30.0, 120.0), "25.0000%");
        assert_eq!(seek_value(500.0, 120.0), "100.0000%");
        // Unknown length falls back to whole seconds
        assert_eq!(seek_value(42.4, 0.0), "42");
        assert_eq!(seek_value(-3.0, 0.0), "0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_play_pause_and_seek() {
        let mut tracker = StatusTracker::default();
        let t0 = Instant::now();

        assert!(tracker.update(false, 0.0, t0).is_empty());

        let t1 = t0 + Duration::from_millis(500);
        assert_eq!(tracker.update(true, 0.0, t1), vec![PlayerEvent::Play { position: 0.0 }]);

        // Normal progress is only a time update
        let t2 = t1 + Duration::from_millis(500);
        assert_eq!(tracker.update(true, 0.5, t2), vec![PlayerEvent::TimeUpdate { position: 0.5 }]);

        // A jump well past the elapsed time is a seek
        let t3 = t2 + Duration::from_millis(500);
        assert_eq!(
            tracker.update(true, 30.0, t3),
            vec![PlayerEvent::Seeked { position: 30.0 }, PlayerEvent::TimeUpdate { position: 30.0 }]
        );

        let t4 = t3 + Duration::from_millis(500);
        assert_eq!(
            tracker.update(false, 30.5, t4),
            vec![PlayerEvent::Pause { position: 30.5 }, PlayerEvent::TimeUpdate { position: 30.5 }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_first_sample_playing() {
        let mut tracker = StatusTracker::default();
        assert_eq!(
            tracker.update(true, 12.0, Instant::now()),
            vec![PlayerEvent::Play { position: 12.0 }]
        );
    }
}
