//! Client configuration
//!
//! One `ClientConfig` is shared by the transport sessions, the REST client
//! and both engines. Every timing constant the sync protocol depends on
//! lives here so tests can shrink them.

use std::time::Duration;

/// Default backend base URL
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";

/// Delay between reconnect attempts (fixed, no exponential growth)
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// STOMP heart-beat interval, both directions
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// How often the host broadcasts its position for drift correction
const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Drift (seconds) a viewer tolerates before snapping to the host
const DEFAULT_DRIFT_THRESHOLD_SECS: f64 = 2.0;

/// Window after a programmatic player call during which native events are
/// treated as echoes of that call
const DEFAULT_IGNORE_WINDOW: Duration = Duration::from_millis(750);

/// Late-join prompt auto-resolves to "join playback" after this long
const DEFAULT_CATCH_UP_TIMEOUT: Duration = Duration::from_secs(30);

/// Typing indicators expire this long after the last signal
const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(5);

/// Messages per conversation page
const DEFAULT_PAGE_SIZE: u32 = 20;

/// Configuration for a SocialStream client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// REST base URL, e.g. `http://localhost:8080`
    pub api_base_url: String,
    /// WebSocket endpoint carrying STOMP frames
    pub ws_endpoint: String,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    pub sync_interval: Duration,
    pub drift_threshold_secs: f64,
    pub ignore_window: Duration,
    pub catch_up_timeout: Duration,
    pub typing_ttl: Duration,
    pub page_size: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::for_base_url(DEFAULT_API_BASE_URL)
    }
}

impl ClientConfig {
    /// Build a config for a backend, deriving the WebSocket endpoint from
    /// the REST base URL (`http` -> `ws`, `https` -> `wss`).
    pub fn for_base_url(base_url: &str) -> Self {
        let api_base_url = base_url.trim_end_matches('/').to_string();
        let ws_endpoint = derive_ws_endpoint(&api_base_url);

        Self {
            api_base_url,
            ws_endpoint,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            drift_threshold_secs: DEFAULT_DRIFT_THRESHOLD_SECS,
            ignore_window: DEFAULT_IGNORE_WINDOW,
            catch_up_timeout: DEFAULT_CATCH_UP_TIMEOUT,
            typing_ttl: DEFAULT_TYPING_TTL,
            page_size: DEFAULT_PAGE_SIZE,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Override the WebSocket endpoint
    pub fn with_ws_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.ws_endpoint = endpoint.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_drift_threshold(mut self, secs: f64) -> Self {
        self.drift_threshold_secs = secs;
        self
    }

    pub fn with_ignore_window(mut self, window: Duration) -> Self {
        self.ignore_window = window;
        self
    }

    pub fn with_catch_up_timeout(mut self, timeout: Duration) -> Self {
        self.catch_up_timeout = timeout;
        self
    }

    pub fn with_typing_ttl(mut self, ttl: Duration) -> Self {
        self.typing_ttl = ttl;
        self
    }

    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }
}

/// The backend exposes STOMP behind a SockJS endpoint at `/ws`; its raw
/// WebSocket leg lives at `/ws/websocket`.
fn derive_ws_endpoint(api_base_url: &str) -> String {
    let rest = if let Some(rest) = api_base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = api_base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", api_base_url)
    };
    format!("{}/ws/websocket", rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.api_base_url, "http://localhost:8080");
        assert_eq!(config.ws_endpoint, "ws://localhost:8080/ws/websocket");
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.sync_interval, Duration::from_secs(30));
        assert_eq!(config.drift_threshold_secs, 2.0);
        assert_eq!(config.catch_up_timeout, Duration::from_secs(30));
        assert_eq!(config.typing_ttl, Duration::from_secs(5));
    }

    #[test]
    fn test_ws_endpoint_derivation() {
        let config = ClientConfig::for_base_url("https://stream.example.com/");
        assert_eq!(config.api_base_url, "https://stream.example.com");
        assert_eq!(config.ws_endpoint, "wss://stream.example.com/ws/websocket");

        let config = ClientConfig::for_base_url("10.0.0.2:8080");
        assert_eq!(config.ws_endpoint, "ws://10.0.0.2:8080/ws/websocket");
    }
}
