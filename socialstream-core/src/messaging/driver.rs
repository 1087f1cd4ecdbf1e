//! Messaging Driver
//!
//! Owns a [`MessagingEngine`] and the user's five inbound queues. Sends go
//! out on the live channel when it is up, through the REST fallback when it
//! is not, and are parked for the next connection when both fail.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep_until;
use tracing::{debug, error, info, warn};

use super::engine::{ConversationView, MessagingEngine};
use super::protocol::{
    DirectMessage, ErrorFrame, Reaction, TypingFrame, UserQueues, REACTION_DESTINATION, SEND_DESTINATION,
    TYPING_DESTINATION,
};
use super::MessagingError;
use crate::api::{ApiError, MessagingApi};
use crate::config::ClientConfig;
use crate::transport::Transport;

/// How a send left this client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the live channel; the `sent` echo will confirm it
    Sent,
    /// Queued inside the transport, flushed when the channel returns
    Queued,
    /// Delivered through the REST fallback
    Delivered,
    /// Both paths failed; re-sent on reconnect
    Parked,
}

/// Events emitted by the messaging task
#[derive(Debug, Clone)]
pub enum MessagingEvent {
    Connection(bool),
    /// A conversation changed; carries the full view
    Conversation(ConversationView),
    /// A new message from someone else, for notifications
    MessageReceived(DirectMessage),
    /// Total unread across all conversations
    Unread(u32),
    Typing {
        user_id: i64,
        display_name: String,
        is_typing: bool,
    },
    /// Server-side failure report
    Error(String),
    SessionInvalid,
    Closed,
}

enum MessagingRequest {
    Send {
        recipient_id: i64,
        body: String,
        reply: oneshot::Sender<Result<SendOutcome, MessagingError>>,
    },
    React {
        message_id: i64,
        reaction: Reaction,
        reply: oneshot::Sender<Result<(), MessagingError>>,
    },
    Typing {
        recipient_id: i64,
        is_typing: bool,
    },
    MarkRead {
        partner_id: i64,
    },
    Load {
        partner_id: i64,
        reply: oneshot::Sender<Result<usize, MessagingError>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the running messaging task
#[derive(Clone)]
pub struct MessagingHandle {
    command_tx: mpsc::UnboundedSender<MessagingRequest>,
}

impl MessagingHandle {
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    pub async fn send_message(&self, recipient_id: i64, body: &str) -> Result<SendOutcome, MessagingError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(MessagingRequest::Send {
                recipient_id,
                body: body.to_string(),
                reply,
            })
            .map_err(|_| MessagingError::Closed)?;
        rx.await.map_err(|_| MessagingError::Closed)?
    }

    pub async fn toggle_reaction(&self, message_id: i64, reaction: Reaction) -> Result<(), MessagingError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(MessagingRequest::React {
                message_id,
                reaction,
                reply,
            })
            .map_err(|_| MessagingError::Closed)?;
        rx.await.map_err(|_| MessagingError::Closed)?
    }

    /// Fire and forget
    pub fn set_typing(&self, recipient_id: i64, is_typing: bool) -> Result<(), MessagingError> {
        self.command_tx
            .send(MessagingRequest::Typing {
                recipient_id,
                is_typing,
            })
            .map_err(|_| MessagingError::Closed)
    }

    pub fn mark_read(&self, partner_id: i64) -> Result<(), MessagingError> {
        self.command_tx
            .send(MessagingRequest::MarkRead { partner_id })
            .map_err(|_| MessagingError::Closed)
    }

    /// Load the next older page. Returns how many messages were new.
    pub async fn load_conversation(&self, partner_id: i64) -> Result<usize, MessagingError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(MessagingRequest::Load { partner_id, reply })
            .map_err(|_| MessagingError::Closed)?;
        rx.await.map_err(|_| MessagingError::Closed)?
    }

    /// Tear the channel down and stop the task
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.command_tx.send(MessagingRequest::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Builds and starts the messaging task
pub struct MessagingClient<T, A> {
    config: ClientConfig,
    transport: T,
    api: Arc<A>,
    user_id: i64,
}

impl<T: Transport, A: MessagingApi> MessagingClient<T, A> {
    pub fn new(config: ClientConfig, transport: T, api: Arc<A>, user_id: i64) -> Self {
        Self {
            config,
            transport,
            api,
            user_id,
        }
    }

    /// Start the messaging task. Must be called inside a tokio runtime.
    pub fn spawn(self) -> (MessagingHandle, mpsc::UnboundedReceiver<MessagingEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(self.run(command_rx, event_tx));

        (MessagingHandle { command_tx }, event_rx)
    }

    async fn run(
        self,
        mut command_rx: mpsc::UnboundedReceiver<MessagingRequest>,
        event_tx: mpsc::UnboundedSender<MessagingEvent>,
    ) {
        let MessagingClient {
            config,
            transport,
            api,
            user_id,
        } = self;

        let queues = UserQueues::for_user(user_id);
        let mut messages = transport.subscribe::<DirectMessage>(&queues.messages);
        let mut sent = transport.subscribe::<DirectMessage>(&queues.sent);
        let mut typing = transport.subscribe::<TypingFrame>(&queues.typing);
        let mut reactions = transport.subscribe::<DirectMessage>(&queues.reaction);
        let mut errors = transport.subscribe::<ErrorFrame>(&queues.errors);
        let mut status = transport.status();

        let mut task = MessagingTask {
            transport,
            api,
            page_size: config.page_size,
            engine: MessagingEngine::new(user_id, config.typing_ttl),
            event_tx,
        };

        info!("Messaging started for user {}", user_id);
        task.emit(MessagingEvent::Connection(task.transport.is_connected()));

        loop {
            let expiry = task
                .engine
                .next_typing_expiry()
                .map(tokio::time::Instant::from_std);

            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(MessagingRequest::Shutdown { done }) => {
                            task.shutdown().await;
                            let _ = done.send(());
                            break;
                        }
                        Some(cmd) => task.handle_request(cmd).await,
                        None => {
                            debug!("All messaging handles dropped");
                            task.shutdown().await;
                            break;
                        }
                    }
                }
                Some(message) = messages.recv() => task.on_message(message),
                Some(message) = sent.recv() => task.on_sent(message),
                Some(frame) = typing.recv() => task.on_typing(frame),
                Some(message) = reactions.recv() => task.on_reaction(message),
                Some(frame) = errors.recv() => task.on_server_error(frame).await,
                _ = sleep_until(expiry.unwrap_or_else(tokio::time::Instant::now)), if expiry.is_some() => {
                    for user_id in task.engine.expire_typing(now()) {
                        task.emit_typing_cleared(user_id);
                    }
                }
                Ok(()) = status.changed() => {
                    let connected = *status.borrow_and_update();
                    task.on_connection(connected);
                }
            }
        }

        info!("Messaging task stopped");
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

struct MessagingTask<T, A> {
    transport: T,
    api: Arc<A>,
    page_size: u32,
    engine: MessagingEngine,
    event_tx: mpsc::UnboundedSender<MessagingEvent>,
}

impl<T: Transport, A: MessagingApi> MessagingTask<T, A> {
    fn emit(&self, event: MessagingEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_view(&self, partner_id: i64) {
        self.emit(MessagingEvent::Conversation(self.engine.view(partner_id)));
    }

    fn emit_unread(&self) {
        self.emit(MessagingEvent::Unread(self.engine.total_unread()));
    }

    fn emit_typing_cleared(&self, user_id: i64) {
        self.emit(MessagingEvent::Typing {
            user_id,
            display_name: String::new(),
            is_typing: false,
        });
    }

    fn api_failed(&self, what: &str, e: ApiError) -> MessagingError {
        warn!("Failed to {}: {}", what, e);
        if e.is_session_invalid() {
            self.emit(MessagingEvent::SessionInvalid);
        }
        MessagingError::from(e)
    }

    fn on_message(&mut self, message: DirectMessage) {
        let from_partner = message.sender_id != self.engine.user_id();
        if let Some(partner) = self.engine.receive_message(message.clone()) {
            debug!("Message {} from {}", message.id, message.sender_id);
            self.emit_view(partner);
            if from_partner {
                self.emit(MessagingEvent::MessageReceived(message));
                self.emit_unread();
            }
        }
    }

    fn on_sent(&mut self, message: DirectMessage) {
        debug!("Send confirmed as message {}", message.id);
        let partner = self.engine.confirm_sent(message);
        self.emit_view(partner);
    }

    fn on_typing(&mut self, frame: TypingFrame) {
        if self.engine.typing_signal(&frame, now()) {
            self.emit(MessagingEvent::Typing {
                user_id: frame.sender_id,
                display_name: frame.sender_name.unwrap_or_default(),
                is_typing: frame.typing,
            });
        }
    }

    fn on_reaction(&mut self, message: DirectMessage) {
        if let Some(partner) = self.engine.reaction_confirmed(message) {
            self.emit_view(partner);
        }
    }

    /// A live request was refused. Reactions still waiting for an echo
    /// will never get one, so reload what the server actually holds.
    async fn on_server_error(&mut self, frame: ErrorFrame) {
        warn!("Messaging error from server: {}", frame.error);
        self.emit(MessagingEvent::Error(frame.error));

        for partner in self.engine.reactions_rejected() {
            debug!("Reconciling reactions with {}", partner);
            if let Err(e) = self.load_page(partner, 0).await {
                debug!("Refetch after rejected reaction failed: {}", e);
                self.emit_view(partner);
            }
        }
    }

    fn on_connection(&mut self, connected: bool) {
        info!("Messaging channel {}", if connected { "connected" } else { "disconnected" });
        self.emit(MessagingEvent::Connection(connected));

        if !connected {
            self.engine.clear_typing();
            return;
        }

        let parked = self.engine.take_parked();
        if parked.is_empty() {
            return;
        }
        info!("Re-sending {} parked messages", parked.len());
        let mut touched = BTreeSet::new();
        for outgoing in parked {
            self.transport.publish(SEND_DESTINATION, &outgoing.payload());
            touched.insert(outgoing.recipient_id);
        }
        for partner in touched {
            self.emit_view(partner);
        }
    }

    async fn handle_request(&mut self, request: MessagingRequest) {
        match request {
            MessagingRequest::Send {
                recipient_id,
                body,
                reply,
            } => {
                let result = self.send(recipient_id, &body).await;
                let _ = reply.send(result);
            }
            MessagingRequest::React {
                message_id,
                reaction,
                reply,
            } => {
                let result = self.react(message_id, reaction).await;
                let _ = reply.send(result);
            }
            MessagingRequest::Typing {
                recipient_id,
                is_typing,
            } => {
                if self.transport.is_connected() {
                    let payload = self.engine.set_typing(recipient_id, is_typing);
                    self.transport.publish(TYPING_DESTINATION, &payload);
                } else {
                    debug!("Dropping typing signal while offline");
                }
            }
            MessagingRequest::MarkRead { partner_id } => {
                if self.engine.mark_read(partner_id) {
                    self.emit_view(partner_id);
                    self.emit_unread();
                }
            }
            MessagingRequest::Load { partner_id, reply } => {
                let page = self
                    .engine
                    .conversation(partner_id)
                    .map(|c| c.next_page())
                    .unwrap_or(0);
                let result = self.load_page(partner_id, page).await;
                let _ = reply.send(result);
            }
            MessagingRequest::Shutdown { done } => {
                // Handled by the run loop
                let _ = done.send(());
            }
        }
    }

    /// Live channel first, then REST, then park
    async fn send(&mut self, recipient_id: i64, body: &str) -> Result<SendOutcome, MessagingError> {
        let outgoing = self.engine.send_message(recipient_id, body)?;

        if self.transport.is_connected() {
            let outcome = if self.transport.publish(SEND_DESTINATION, &outgoing.payload()) {
                SendOutcome::Sent
            } else {
                SendOutcome::Queued
            };
            self.emit_view(recipient_id);
            return Ok(outcome);
        }

        warn!("Messaging channel down, sending to {} over REST", recipient_id);
        match self.api.send_message(recipient_id, &outgoing.content).await {
            Ok(message) => {
                self.engine.fallback_delivered(outgoing.local_id, message);
                if let Err(e) = self.load_page(recipient_id, 0).await {
                    debug!("Refetch after fallback send failed: {}", e);
                }
                self.emit_view(recipient_id);
                Ok(SendOutcome::Delivered)
            }
            Err(e) if e.is_session_invalid() => {
                self.engine.discard(outgoing.local_id);
                self.emit_view(recipient_id);
                Err(self.api_failed("send message", e))
            }
            Err(e) => {
                error!("Fallback send failed, parking message: {}", e);
                self.engine.park_offline(outgoing.local_id);
                self.emit_view(recipient_id);
                Ok(SendOutcome::Parked)
            }
        }
    }

    /// Optimistic toggle, live channel, REST reconcile on failure
    async fn react(&mut self, message_id: i64, reaction: Reaction) -> Result<(), MessagingError> {
        let request = self.engine.toggle_reaction(message_id, reaction)?;
        let partner = request.recipient_id;
        self.emit_view(partner);

        if self.transport.is_connected() && self.transport.publish(REACTION_DESTINATION, &request) {
            return Ok(());
        }

        warn!("Reaction on {} falling back to REST", message_id);
        let result = match self.api.add_reaction(message_id, reaction).await {
            Ok(message) => {
                self.engine.reaction_fallback_done(message_id, Some(message));
                if let Err(e) = self.load_page(partner, 0).await {
                    debug!("Refetch after fallback reaction failed: {}", e);
                }
                Ok(())
            }
            Err(e) => {
                self.engine.reaction_fallback_done(message_id, None);
                Err(self.api_failed("add reaction", e))
            }
        };
        self.emit_view(partner);
        result
    }

    async fn load_page(&mut self, partner_id: i64, page: u32) -> Result<usize, MessagingError> {
        let fetched = self
            .api
            .conversation(partner_id, page, self.page_size)
            .await
            .map_err(|e| self.api_failed("load conversation", e))?;
        let added = self.engine.merge_page(partner_id, fetched);
        self.emit_view(partner_id);
        Ok(added)
    }

    async fn shutdown(&mut self) {
        info!("Closing messaging channel");
        self.transport.disconnect(None).await;
        self.engine.clear_typing();
        self.emit(MessagingEvent::Closed);
    }
}
