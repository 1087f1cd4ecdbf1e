//! Playback Adapter
//!
//! Sits between the room engine and exactly one concrete player. Every
//! mutating call names its [`ControlMode`]: programmatic calls (snaps,
//! drift correction, source loads) open an ignore window during which the
//! player's native events only update bookkeeping and are never reported as
//! user intent.

use std::time::{Duration, Instant};

use tracing::debug;

/// Who is driving a player call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    /// The local user asked for it; the player's resulting event is intent
    UserInitiated,
    /// The engine is mirroring remote state; the resulting event is an echo
    Programmatic,
}

/// Container type handed to the player alongside a source URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Hls,
    Mp4,
    Webm,
}

impl MediaType {
    /// Detect from the URL path; anything unrecognised plays as MP4
    pub fn from_url(url: &str) -> Self {
        let path = url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .to_ascii_lowercase();

        if path.contains(".m3u8") {
            MediaType::Hls
        } else if path.ends_with(".webm") {
            MediaType::Webm
        } else {
            MediaType::Mp4
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            MediaType::Hls => "application/x-mpegURL",
            MediaType::Mp4 => "video/mp4",
            MediaType::Webm => "video/webm",
        }
    }
}

/// A concrete media player
pub trait Player: Send + 'static {
    fn load_source(&mut self, url: &str, media_type: MediaType);
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, position: f64);
    /// Best known playhead, in seconds
    fn position(&self) -> f64;
}

impl<P: Player + ?Sized> Player for Box<P> {
    fn load_source(&mut self, url: &str, media_type: MediaType) {
        (**self).load_source(url, media_type)
    }

    fn play(&mut self) {
        (**self).play()
    }

    fn pause(&mut self) {
        (**self).pause()
    }

    fn seek(&mut self, position: f64) {
        (**self).seek(position)
    }

    fn position(&self) -> f64 {
        (**self).position()
    }
}

/// Native event reported by a concrete player
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerEvent {
    Play { position: f64 },
    Pause { position: f64 },
    Seeked { position: f64 },
    TimeUpdate { position: f64 },
}

impl PlayerEvent {
    pub fn position(&self) -> f64 {
        match *self {
            PlayerEvent::Play { position }
            | PlayerEvent::Pause { position }
            | PlayerEvent::Seeked { position }
            | PlayerEvent::TimeUpdate { position } => position,
        }
    }
}

/// A local user action worth broadcasting
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalEvent {
    Play(f64),
    Pause(f64),
    Seek(f64),
}

/// Owns one player and filters its events
pub struct PlaybackAdapter<P> {
    player: P,
    ignore_window: Duration,
    suppress_until: Option<Instant>,
    source: Option<String>,
    last_position: f64,
}

impl<P: Player> PlaybackAdapter<P> {
    pub fn new(player: P, ignore_window: Duration) -> Self {
        Self {
            player,
            ignore_window,
            suppress_until: None,
            source: None,
            last_position: 0.0,
        }
    }

    fn begin(&mut self, mode: ControlMode, now: Instant) {
        if mode == ControlMode::Programmatic {
            let until = now + self.ignore_window;
            self.suppress_until = Some(match self.suppress_until {
                Some(existing) if existing > until => existing,
                _ => until,
            });
        }
    }

    /// Load a new source; the player is left paused at 0
    pub fn load_source(&mut self, url: &str, mode: ControlMode, now: Instant) -> MediaType {
        self.begin(mode, now);
        let media_type = MediaType::from_url(url);
        debug!("Loading source {} as {}", url, media_type.mime());
        self.player.load_source(url, media_type);
        self.source = Some(url.to_string());
        self.last_position = 0.0;
        media_type
    }

    pub fn play(&mut self, mode: ControlMode, now: Instant) {
        self.begin(mode, now);
        self.player.play();
    }

    pub fn pause(&mut self, mode: ControlMode, now: Instant) {
        self.begin(mode, now);
        self.player.pause();
    }

    pub fn seek(&mut self, position: f64, mode: ControlMode, now: Instant) {
        self.begin(mode, now);
        self.player.seek(position);
        self.last_position = position;
    }

    /// Feed a native player event.
    ///
    /// Position bookkeeping always happens; user intent is only returned
    /// outside the ignore window.
    pub fn observe(&mut self, event: PlayerEvent, now: Instant) -> Option<LocalEvent> {
        self.last_position = event.position();

        if self.is_suppressing(now) {
            debug!("Suppressed echo {:?}", event);
            return None;
        }

        match event {
            PlayerEvent::Play { position } => Some(LocalEvent::Play(position)),
            PlayerEvent::Pause { position } => Some(LocalEvent::Pause(position)),
            PlayerEvent::Seeked { position } => Some(LocalEvent::Seek(position)),
            PlayerEvent::TimeUpdate { .. } => None,
        }
    }

    /// Whether native events are currently treated as echoes
    pub fn is_suppressing(&self, now: Instant) -> bool {
        self.suppress_until.is_some_and(|until| now < until)
    }

    /// Current playhead as reported by the player
    pub fn position(&self) -> f64 {
        self.player.position()
    }

    /// Last position seen through events or seeks
    pub fn last_observed_position(&self) -> f64 {
        self.last_position
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn player(&self) -> &P {
        &self.player
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{MediaType, Player};

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Load(String, MediaType),
        Play,
        Pause,
        Seek(f64),
    }

    /// Player that records every call and reports a settable position
    #[derive(Clone, Default)]
    pub struct RecordingPlayer {
        pub calls: Arc<Mutex<Vec<Call>>>,
        pub position: Arc<Mutex<f64>>,
    }

    impl RecordingPlayer {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        pub fn clear(&self) {
            self.calls.lock().clear();
        }

        pub fn set_position(&self, position: f64) {
            *self.position.lock() = position;
        }
    }

    impl Player for RecordingPlayer {
        fn load_source(&mut self, url: &str, media_type: MediaType) {
            self.calls.lock().push(Call::Load(url.to_string(), media_type));
            *self.position.lock() = 0.0;
        }

        fn play(&mut self) {
            self.calls.lock().push(Call::Play);
        }

        fn pause(&mut self) {
            self.calls.lock().push(Call::Pause);
        }

        fn seek(&mut self, position: f64) {
            self.calls.lock().push(Call::Seek(position));
            *self.position.lock() = position;
        }

        fn position(&self) -> f64 {
            *self.position.lock()
        }
    }
}
