//! STOMP-over-WebSocket session
//!
//! A background task owns the socket. It connects, replays every live
//! subscription, flushes the pending queue and then multiplexes inbound
//! frames, outbound commands and heart-beats. Any failure drops back into a
//! fixed-delay reconnect loop; callers only ever see the status flip.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::pending::{PendingFrame, PendingQueue};
use super::stomp::{Command, Frame, Heartbeat, HEARTBEAT};
use super::{DropGuard, RawSubscription, Transport, TransportError};
use crate::config::ClientConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Inbound silence tolerated before the link is declared dead, in heart-beat intervals
const MISSED_HEARTBEATS: u32 = 3;

struct SubscriptionEntry {
    destination: String,
    tx: mpsc::UnboundedSender<String>,
}

/// State shared between handles and the session task
struct Shared {
    connected: watch::Sender<bool>,
    pending: Mutex<PendingQueue>,
    subscriptions: Mutex<HashMap<u64, SubscriptionEntry>>,
    next_subscription_id: AtomicU64,
}

impl Shared {
    fn set_connected(&self, connected: bool) {
        self.connected.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }
}

enum SessionCommand {
    Send(PendingFrame),
    Subscribe { id: u64 },
    Unsubscribe { id: u64 },
    Disconnect {
        farewell: Option<(String, String)>,
        done: oneshot::Sender<()>,
    },
}

/// How the connected loop ended
enum LoopExit {
    Shutdown(Option<oneshot::Sender<()>>),
    Reconnect,
}

/// Handle to a running session
#[derive(Clone)]
pub struct TransportHandle {
    shared: Arc<Shared>,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
}

impl TransportHandle {
    /// Number of frames waiting for the next connection
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

impl Transport for TransportHandle {
    fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    fn status(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    fn publish_json(&self, destination: &str, body: String) -> bool {
        // Holding the queue lock orders this against the task's flush
        let mut pending = self.shared.pending.lock();

        if !self.is_connected() {
            pending.push(destination, body);
            return false;
        }

        let frame = PendingFrame {
            id: rand::random(),
            destination: destination.to_string(),
            body,
        };
        match self.command_tx.send(SessionCommand::Send(frame)) {
            Ok(()) => true,
            Err(mpsc::error::SendError(cmd)) => {
                if let SessionCommand::Send(frame) = cmd {
                    pending.push_frame(frame);
                }
                false
            }
        }
    }

    fn subscribe_raw(&self, destination: &str) -> RawSubscription {
        let id = self.shared.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.shared.subscriptions.lock().insert(
            id,
            SubscriptionEntry {
                destination: destination.to_string(),
                tx,
            },
        );
        let _ = self.command_tx.send(SessionCommand::Subscribe { id });
        debug!("Subscribed to {} (sub-{})", destination, id);

        let shared = self.shared.clone();
        let command_tx = self.command_tx.clone();
        let guard = DropGuard::new(move || {
            shared.subscriptions.lock().remove(&id);
            let _ = command_tx.send(SessionCommand::Unsubscribe { id });
        });

        RawSubscription::new(destination, rx, guard)
    }

    async fn disconnect(&self, farewell: Option<(String, serde_json::Value)>) {
        let farewell = farewell.and_then(|(destination, payload)| {
            serde_json::to_string(&payload)
                .ok()
                .map(|body| (destination, body))
        });

        let (done_tx, done_rx) = oneshot::channel();
        let cmd = SessionCommand::Disconnect {
            farewell,
            done: done_tx,
        };
        if self.command_tx.send(cmd).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Connection parameters for one session
pub struct TransportSession {
    endpoint: String,
    token: Option<String>,
    reconnect_delay: Duration,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
}

impl TransportSession {
    /// Start a session and return its handle.
    ///
    /// Never fails: connection problems surface as `is_connected() == false`
    /// while the task keeps retrying every `reconnect_delay`.
    pub fn connect(config: &ClientConfig, endpoint: &str, token: Option<String>) -> TransportHandle {
        let (connected, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            connected,
            pending: Mutex::new(PendingQueue::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(0),
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let session = TransportSession {
            endpoint: endpoint.to_string(),
            token,
            reconnect_delay: config.reconnect_delay,
            heartbeat_interval: config.heartbeat_interval,
            connect_timeout: config.connect_timeout,
        };

        tokio::spawn(session.run(shared.clone(), command_rx));

        TransportHandle { shared, command_tx }
    }

    async fn run(self, shared: Arc<Shared>, mut command_rx: mpsc::UnboundedReceiver<SessionCommand>) {
        info!("Transport session starting for {}", self.endpoint);

        let done = loop {
            match self.handshake().await {
                Ok((ws, heartbeat)) => {
                    info!("Connected to {} ({:?})", self.endpoint, heartbeat);
                    match self.serve(ws, heartbeat, &shared, &mut command_rx).await {
                        Ok(LoopExit::Shutdown(done)) => break done,
                        Ok(LoopExit::Reconnect) => {}
                        Err(e) => warn!("Connection to {} lost: {}", self.endpoint, e),
                    }
                }
                Err(e) => warn!("Connect to {} failed: {}", self.endpoint, e),
            }

            shared.set_connected(false);
            info!("Reconnecting in {:?}", self.reconnect_delay);

            if let LoopExit::Shutdown(done) = self.wait_reconnect(&shared, &mut command_rx).await {
                break done;
            }
        };

        shared.set_connected(false);
        // Dropping the senders ends every subscription stream
        shared.subscriptions.lock().clear();
        info!("Transport session for {} stopped", self.endpoint);

        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    /// Open the socket and complete the STOMP CONNECT exchange
    async fn handshake(&self) -> Result<(WsStream, Heartbeat), TransportError> {
        timeout(self.connect_timeout, self.open())
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn open(&self) -> Result<(WsStream, Heartbeat), TransportError> {
        let (mut ws, _response) = connect_async(self.endpoint.as_str()).await?;

        let offer_ms = self.heartbeat_interval.as_millis() as u64;
        let connect = Frame::connect(host_of(&self.endpoint), self.token.as_deref(), offer_ms);
        ws.send(Message::Text(connect.encode())).await?;

        loop {
            let frame = next_frame(&mut ws).await?;
            match frame.command {
                Command::Connected => return Ok((ws, Heartbeat::negotiate(offer_ms, &frame))),
                Command::Error => {
                    let reason = frame.get("message").unwrap_or(frame.body.as_str()).to_string();
                    return Err(TransportError::Rejected(reason));
                }
                other => debug!("Ignoring {} before CONNECTED", other),
            }
        }
    }

    /// Run one connected period
    async fn serve(
        &self,
        ws: WsStream,
        heartbeat: Heartbeat,
        shared: &Shared,
        command_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<LoopExit, TransportError> {
        let (mut sink, mut source) = ws.split();

        // Replay live subscriptions
        let mut active = HashSet::new();
        let subscriptions: Vec<(u64, String)> = shared
            .subscriptions
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.destination.clone()))
            .collect();
        for (id, destination) in subscriptions {
            send_frame(&mut sink, &Frame::subscribe(id, &destination)).await?;
            active.insert(id);
        }

        // Flip the status under the queue lock so no publish slips between
        let flushed = {
            let mut pending = shared.pending.lock();
            shared.set_connected(true);
            pending.drain()
        };
        if !flushed.is_empty() {
            info!("Flushing {} pending frames", flushed.len());
        }
        for (i, frame) in flushed.iter().enumerate() {
            if let Err(e) = send_frame(&mut sink, &Frame::send(&frame.destination, frame.body.clone())).await {
                shared.pending.lock().requeue_front(flushed[i..].to_vec());
                return Err(e);
            }
        }

        // A direction either side switched off is neither sent nor watched
        let mut send_beat = heartbeat.outgoing.map(ticker);
        let mut check_silence = heartbeat.incoming.map(ticker);
        let silence_limit = heartbeat.incoming.map(|period| period * MISSED_HEARTBEATS);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                msg = source.next() => {
                    last_inbound = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => dispatch(&text, shared)?,
                        Some(Ok(Message::Binary(bytes))) => dispatch(&String::from_utf8_lossy(&bytes), shared)?,
                        Some(Ok(Message::Ping(payload))) => sink.send(Message::Pong(payload)).await?,
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Send(frame)) => {
                            let stomp = Frame::send(&frame.destination, frame.body.clone());
                            if let Err(e) = send_frame(&mut sink, &stomp).await {
                                shared.pending.lock().push_frame(frame);
                                return Err(e);
                            }
                        }
                        Some(SessionCommand::Subscribe { id }) => {
                            if active.contains(&id) {
                                continue;
                            }
                            let destination = shared.subscriptions.lock().get(&id).map(|e| e.destination.clone());
                            if let Some(destination) = destination {
                                send_frame(&mut sink, &Frame::subscribe(id, &destination)).await?;
                                active.insert(id);
                            }
                        }
                        Some(SessionCommand::Unsubscribe { id }) => {
                            if active.remove(&id) {
                                send_frame(&mut sink, &Frame::unsubscribe(id)).await?;
                            }
                        }
                        Some(SessionCommand::Disconnect { farewell, done }) => {
                            if let Some((destination, body)) = farewell {
                                if let Err(e) = send_frame(&mut sink, &Frame::send(&destination, body)).await {
                                    debug!("Farewell to {} not delivered: {}", destination, e);
                                }
                            }
                            close(&mut sink).await;
                            return Ok(LoopExit::Shutdown(Some(done)));
                        }
                        None => {
                            close(&mut sink).await;
                            return Ok(LoopExit::Shutdown(None));
                        }
                    }
                }
                _ = tick(&mut send_beat) => {
                    sink.send(Message::Text(HEARTBEAT.to_string())).await?;
                }
                _ = tick(&mut check_silence) => {
                    if silence_limit.is_some_and(|limit| last_inbound.elapsed() > limit) {
                        warn!("No inbound traffic for {:?}", last_inbound.elapsed());
                        return Ok(LoopExit::Reconnect);
                    }
                }
            }
        }
    }

    /// Sit out the reconnect delay while still accepting commands
    async fn wait_reconnect(
        &self,
        shared: &Shared,
        command_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> LoopExit {
        let sleep = tokio::time::sleep(self.reconnect_delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return LoopExit::Reconnect,
                cmd = command_rx.recv() => match cmd {
                    Some(SessionCommand::Send(frame)) => shared.pending.lock().push_frame(frame),
                    // Subscriptions are replayed on the next connect
                    Some(SessionCommand::Subscribe { .. }) | Some(SessionCommand::Unsubscribe { .. }) => {}
                    Some(SessionCommand::Disconnect { farewell, done }) => {
                        if let Some((destination, _)) = farewell {
                            debug!("Offline, dropping farewell to {}", destination);
                        }
                        return LoopExit::Shutdown(Some(done));
                    }
                    None => return LoopExit::Shutdown(None),
                }
            }
        }
    }
}

/// Route one inbound text message to its subscription
fn dispatch(text: &str, shared: &Shared) -> Result<(), TransportError> {
    let frame = match Frame::decode(text) {
        Ok(Some(frame)) => frame,
        Ok(None) => return Ok(()),
        Err(e) => {
            warn!("Dropping malformed frame: {}", e);
            return Ok(());
        }
    };

    match frame.command {
        Command::Message => {
            let Some(id) = frame.subscription_id() else {
                warn!("MESSAGE without a known subscription header");
                return Ok(());
            };
            let subscriptions = shared.subscriptions.lock();
            match subscriptions.get(&id) {
                Some(entry) => {
                    let _ = entry.tx.send(frame.body);
                }
                None => debug!("MESSAGE for released sub-{}", id),
            }
            Ok(())
        }
        Command::Error => {
            let reason = frame.get("message").unwrap_or(frame.body.as_str()).to_string();
            Err(TransportError::Rejected(reason))
        }
        other => {
            debug!("Ignoring {} frame", other);
            Ok(())
        }
    }
}

async fn next_frame(ws: &mut WsStream) -> Result<Frame, TransportError> {
    loop {
        let text = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(Message::Ping(payload))) => {
                ws.send(Message::Pong(payload)).await?;
                continue;
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
            Some(Err(e)) => return Err(e.into()),
        };

        if let Some(frame) = Frame::decode(&text)? {
            return Ok(frame);
        }
    }
}

/// Interval whose first tick is one period away
fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Tick an optional interval; a disabled one never fires
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), TransportError> {
    sink.send(Message::Text(frame.encode())).await?;
    Ok(())
}

async fn close(sink: &mut WsSink) {
    let _ = send_frame(sink, &Frame::disconnect()).await;
    let _ = sink.close().await;
}

/// Host part of a ws:// or wss:// endpoint, for the CONNECT `host` header
fn host_of(endpoint: &str) -> &str {
    let rest = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    rest.split(['/', ':']).next().unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("ws://localhost:8080/ws/websocket"), "localhost");
        assert_eq!(host_of("wss://stream.example.com/ws/websocket"), "stream.example.com");
        assert_eq!(host_of("10.0.0.2"), "10.0.0.2");
    }

    #[tokio::test]
    async fn test_publish_while_offline_is_queued() {
        // Nothing listens on this port; the session stays in its retry loop
        let config = ClientConfig::for_base_url("http://127.0.0.1:9").with_reconnect_delay(Duration::from_secs(60));
        let handle = TransportSession::connect(&config, "ws://127.0.0.1:9/ws/websocket", None);

        assert!(!handle.is_connected());
        assert!(!handle.publish("/app/dm/send", &serde_json::json!({"recipientId": 2, "content": "hi"})));
        assert_eq!(handle.pending_len(), 1);

        handle.disconnect(None).await;
    }

    #[tokio::test]
    async fn test_connect_subscribe_and_flush() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            let connect = next_text_frame(&mut ws).await;
            assert_eq!(connect.command, Command::Connect);
            assert_eq!(connect.get("Authorization"), Some("Bearer tok"));
            ws.send(Message::Text(Frame::new(Command::Connected).header("version", "1.2").encode()))
                .await
                .unwrap();

            let subscribe = next_text_frame(&mut ws).await;
            assert_eq!(subscribe.command, Command::Subscribe);
            assert_eq!(subscribe.get("destination"), Some("/topic/room/1"));
            let sub_id = subscribe.get("id").unwrap().to_string();

            let flushed = next_text_frame(&mut ws).await;
            assert_eq!(flushed.command, Command::Send);
            assert_eq!(flushed.get("destination"), Some("/app/room/1/join"));

            let message = Frame::new(Command::Message)
                .header("destination", "/topic/room/1")
                .header("subscription", sub_id)
                .with_body(r#"{"n":1}"#);
            ws.send(Message::Text(message.encode())).await.unwrap();

            // Hold the socket open until the client says goodbye
            loop {
                let frame = next_text_frame(&mut ws).await;
                if frame.command == Command::Disconnect {
                    break;
                }
            }
        });

        let config = ClientConfig::for_base_url(&format!("http://{}", addr));
        let handle = TransportSession::connect(&config, &config.ws_endpoint, Some("tok".to_string()));
        let mut sub = handle.subscribe::<serde_json::Value>("/topic/room/1");
        handle.publish("/app/room/1/join", &serde_json::json!({"userId": 5}));

        let value = sub.recv().await.unwrap();
        assert_eq!(value["n"], 1);
        assert!(handle.is_connected());

        handle.disconnect(None).await;
        assert!(!handle.is_connected());
        assert!(sub.recv().await.is_none());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_quiet_server_without_heartbeats_stays_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicU64::new(0));
        let beats = Arc::new(AtomicU64::new(0));

        let server = {
            let accepted = accepted.clone();
            let beats = beats.clone();
            tokio::spawn(async move {
                loop {
                    let (tcp, _) = listener.accept().await.unwrap();
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let beats = beats.clone();
                    tokio::spawn(async move {
                        let mut ws = accept_async(tcp).await.unwrap();
                        next_text_frame(&mut ws).await;
                        let connected = Frame::new(Command::Connected)
                            .header("version", "1.2")
                            .header("heart-beat", "0,0");
                        ws.send(Message::Text(connected.encode())).await.unwrap();

                        // Never send anything again
                        while let Some(Ok(msg)) = ws.next().await {
                            if matches!(msg, Message::Text(ref text) if text == HEARTBEAT) {
                                beats.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    });
                }
            })
        };

        let config = ClientConfig::for_base_url(&format!("http://{}", addr))
            .with_heartbeat_interval(Duration::from_millis(100))
            .with_reconnect_delay(Duration::from_millis(50));
        let handle = TransportSession::connect(&config, &config.ws_endpoint, None);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(handle.is_connected());
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(beats.load(Ordering::SeqCst), 0);

        handle.disconnect(None).await;
        server.abort();
    }

    async fn next_text_frame(ws: &mut WebSocketStream<TcpStream>) -> Frame {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(frame) = Frame::decode(&text).unwrap() {
                        return frame;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {:?}", other),
            }
        }
    }
}
