//! In-process transport
//!
//! Behaves like a session whose "server" is the test: frames published while
//! connected land in [`MemoryTransport::published`], frames published offline
//! are queued and flushed FIFO by [`MemoryTransport::set_connected`], and
//! [`MemoryTransport::deliver`] pushes inbound payloads to subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::pending::PendingQueue;
use super::{DropGuard, RawSubscription, Transport};

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct Inner {
    published: Vec<(String, serde_json::Value)>,
    pending: PendingQueue,
    subscribers: HashMap<String, Vec<Subscriber>>,
    next_id: u64,
    farewells: Vec<(String, serde_json::Value)>,
    closed: bool,
}

/// Transport backed by in-process channels
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<Inner>>,
    connected: Arc<watch::Sender<bool>>,
}

impl MemoryTransport {
    /// Create a transport in the given connection state
    pub fn new(connected: bool) -> Self {
        let (tx, _) = watch::channel(connected);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            connected: Arc::new(tx),
        }
    }

    /// Flip the connection state. Going online flushes queued frames, oldest first.
    pub fn set_connected(&self, connected: bool) {
        let mut inner = self.inner.lock();
        if connected {
            for frame in inner.pending.drain() {
                let value = serde_json::from_str(&frame.body).unwrap_or(serde_json::Value::Null);
                inner.published.push((frame.destination, value));
            }
        }
        self.connected.send_replace(connected);
    }

    /// Push an inbound payload to every subscriber of `destination`.
    ///
    /// Returns how many subscribers received it.
    pub fn deliver<P: Serialize>(&self, destination: &str, payload: &P) -> usize {
        match serde_json::to_string(payload) {
            Ok(body) => self.deliver_raw(destination, &body),
            Err(_) => 0,
        }
    }

    /// Push raw text, e.g. a malformed payload
    pub fn deliver_raw(&self, destination: &str, body: &str) -> usize {
        let inner = self.inner.lock();
        let Some(subscribers) = inner.subscribers.get(destination) else {
            debug!("No subscribers on {}", destination);
            return 0;
        };
        subscribers
            .iter()
            .filter(|s| s.tx.send(body.to_string()).is_ok())
            .count()
    }

    /// Every frame that reached the wire, in order
    pub fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.inner.lock().published.clone()
    }

    /// Frames sent to one destination
    pub fn published_to(&self, destination: &str) -> Vec<serde_json::Value> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Forget what has been published so far
    pub fn clear_published(&self) {
        self.inner.lock().published.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Live subscriptions on a destination
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(destination)
            .map_or(0, |s| s.len())
    }

    /// Farewell frames handed to `disconnect`
    pub fn farewells(&self) -> Vec<(String, serde_json::Value)> {
        self.inner.lock().farewells.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Transport for MemoryTransport {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn status(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn publish_json(&self, destination: &str, body: String) -> bool {
        let mut inner = self.inner.lock();
        if !self.is_connected() {
            inner.pending.push(destination, body);
            return false;
        }
        let value = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
        inner.published.push((destination.to_string(), value));
        true
    }

    fn subscribe_raw(&self, destination: &str) -> RawSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner
                .subscribers
                .entry(destination.to_string())
                .or_default()
                .push(Subscriber { id, tx });
            id
        };

        let inner = self.inner.clone();
        let key = destination.to_string();
        let guard = DropGuard::new(move || {
            let mut inner = inner.lock();
            if let Some(list) = inner.subscribers.get_mut(&key) {
                list.retain(|s| s.id != id);
                if list.is_empty() {
                    inner.subscribers.remove(&key);
                }
            }
        });

        RawSubscription::new(destination, rx, guard)
    }

    async fn disconnect(&self, farewell: Option<(String, serde_json::Value)>) {
        let mut inner = self.inner.lock();
        if let Some(farewell) = farewell {
            if self.is_connected() {
                inner.farewells.push(farewell.clone());
                inner.published.push(farewell);
            }
        }
        inner.subscribers.clear();
        inner.closed = true;
        drop(inner);
        self.connected.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Subscription;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn test_offline_publish_is_flushed_in_order() {
        let transport = MemoryTransport::new(false);
        assert!(!transport.publish("/app/a", &json!({"n": 1})));
        assert!(!transport.publish("/app/b", &json!({"n": 2})));
        assert!(transport.published().is_empty());
        assert_eq!(transport.pending_len(), 2);

        transport.set_connected(true);
        let published = transport.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "/app/a");
        assert_eq!(published[1].1, json!({"n": 2}));
        assert_eq!(transport.pending_len(), 0);

        assert!(transport.publish("/app/c", &json!({})));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let transport = MemoryTransport::new(true);
        let mut sub: Subscription<Ping> = transport.subscribe("/topic/x");

        transport.deliver_raw("/topic/x", "{not json");
        transport.deliver_raw("/topic/x", r#"{"n": "wrong type"}"#);
        transport.deliver("/topic/x", &json!({"n": 3}));

        assert_eq!(sub.recv().await, Some(Ping { n: 3 }));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let transport = MemoryTransport::new(true);
        let sub: Subscription<Ping> = transport.subscribe("/topic/x");
        assert_eq!(transport.subscriber_count("/topic/x"), 1);

        drop(sub);
        assert_eq!(transport.subscriber_count("/topic/x"), 0);
        assert_eq!(transport.deliver("/topic/x", &json!({"n": 1})), 0);
    }

    #[tokio::test]
    async fn test_disconnect_releases_even_offline() {
        let transport = MemoryTransport::new(false);
        let mut sub: Subscription<Ping> = transport.subscribe("/topic/x");

        transport
            .disconnect(Some(("/app/room/1/leave".to_string(), json!({"userId": 1}))))
            .await;

        assert!(transport.is_closed());
        assert!(transport.farewells().is_empty());
        assert_eq!(sub.recv().await, None);
    }
}
