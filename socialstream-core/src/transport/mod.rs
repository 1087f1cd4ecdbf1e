//! Transport Session
//!
//! One multiplexed duplex channel per logical purpose (room, messaging).
//! Callers never await the connection: they watch [`Transport::status`],
//! publish without checking (frames published offline are queued), and read
//! typed [`Subscription`]s that unsubscribe when dropped.

mod memory;
mod pending;
mod session;
pub mod stomp;

use std::future::Future;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, warn};

pub use memory::MemoryTransport;
pub use pending::{PendingFrame, PendingQueue};
pub use session::{TransportHandle, TransportSession};

/// Transport failures. These never reach callers; the session task logs
/// them and falls back into its reconnect loop.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connect timed out")]
    Timeout,

    #[error("Handshake rejected: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] stomp::FrameError),

    #[error("Connection closed")]
    Closed,
}

/// A duplex pub/sub channel
pub trait Transport: Clone + Send + Sync + 'static {
    /// Whether frames published now go straight to the wire
    fn is_connected(&self) -> bool;

    /// Connection status updates
    fn status(&self) -> watch::Receiver<bool>;

    /// Publish a pre-serialized JSON body.
    ///
    /// Returns `true` if sent, `false` if queued for the next connection.
    fn publish_json(&self, destination: &str, body: String) -> bool;

    /// Register a raw subscription; payloads arrive as JSON text
    fn subscribe_raw(&self, destination: &str) -> RawSubscription;

    /// Notify peers (best effort) and tear the channel down
    fn disconnect(&self, farewell: Option<(String, serde_json::Value)>) -> impl Future<Output = ()> + Send;

    /// Serialize and publish a payload
    fn publish<P: Serialize + ?Sized>(&self, destination: &str, payload: &P) -> bool {
        match serde_json::to_string(payload) {
            Ok(body) => self.publish_json(destination, body),
            Err(e) => {
                error!("Failed to serialize payload for {}: {}", destination, e);
                false
            }
        }
    }

    /// Register a typed subscription
    fn subscribe<T: DeserializeOwned>(&self, destination: &str) -> Subscription<T> {
        Subscription::new(self.subscribe_raw(destination))
    }
}

/// Calls its closure once, on drop
pub(crate) struct DropGuard(Option<Box<dyn FnOnce() + Send>>);

impl DropGuard {
    pub(crate) fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// Untyped subscription handle
pub struct RawSubscription {
    destination: String,
    rx: mpsc::UnboundedReceiver<String>,
    _guard: DropGuard,
}

impl RawSubscription {
    pub(crate) fn new(destination: &str, rx: mpsc::UnboundedReceiver<String>, guard: DropGuard) -> Self {
        Self {
            destination: destination.to_string(),
            rx,
            _guard: guard,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Next raw payload, or `None` once the transport is gone
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Typed subscription handle. Dropping it unsubscribes.
pub struct Subscription<T> {
    raw: RawSubscription,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Subscription<T> {
    pub fn new(raw: RawSubscription) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn destination(&self) -> &str {
        self.raw.destination()
    }

    /// Next decoded payload. Malformed payloads are logged and skipped.
    ///
    /// Cancel safe: the only suspension point is the channel receive.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let body = self.raw.recv().await?;
            match serde_json::from_str::<T>(&body) {
                Ok(value) => return Some(value),
                Err(e) => {
                    warn!("Dropping malformed payload on {}: {}", self.raw.destination, e);
                }
            }
        }
    }
}
