//! One authenticated socket connection.
//!
//! A reader loop handles inbound frames, liveness ticks and tenant presence
//! updates; a spawned writer task owns the sink and drains the outbound queue.

use super::protocol::{
    ClientEvent, ConnectionAck, ServerEvent, UserTyping, CLOSE_GOING_AWAY, CLOSE_INVALID_CREDENTIAL,
    CLOSE_NO_CREDENTIAL, CLOSE_STORE_UNAVAILABLE,
};
use crate::config::AppState;
use crate::error::{AuthFailure, ChatError};
use crate::models::{Identity, Participant};
use crate::presence::{ConnectionHandle, PresenceKey};
use crate::store::TenantStore;
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long the writer gets to flush after the reader stops
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Instruction for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
enum Outgoing {
    Event(ServerEvent),
    Ping,
    Close(u16, String),
}

fn close_message(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Drive one connection from upgrade to teardown
pub async fn run_connection(socket: WebSocket, state: AppState, credential: Option<String>) {
    let (mut sink, mut stream) = socket.split();

    let credential = match credential {
        Some(token) => Some(token),
        None => await_credential(&mut stream, state.config.auth_timeout).await,
    };

    let identity = match state.auth.authenticate(credential.as_deref()) {
        Ok(identity) => identity,
        Err(err) => {
            let (code, reason) = match err {
                ChatError::Unauthenticated(AuthFailure::Missing) => {
                    (CLOSE_NO_CREDENTIAL, "no credential")
                }
                _ => (CLOSE_INVALID_CREDENTIAL, "invalid credential"),
            };
            debug!("[Gateway] Refusing connection: {}", err);
            let _ = sink.send(close_message(code, reason.to_string())).await;
            return;
        }
    };

    let store = match state.bounded(state.tenants.resolve(&identity.tenant)).await {
        Ok(store) => store,
        Err(err) => {
            warn!(
                "[Gateway] Store for {} unavailable, closing {}: {}",
                identity.tenant, identity.id, err
            );
            let _ = sink
                .send(close_message(CLOSE_STORE_UNAVAILABLE, "store unavailable".to_string()))
                .await;
            return;
        }
    };

    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, writer_rx));

    let mut session = Session::new(state, identity, store, writer_tx);
    session.activate().await;
    session.run(&mut stream).await;
    session.close();
    drop(session);

    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        debug!("[Gateway] Writer did not drain in time");
    }
}

/// Wait for an `authenticate` frame; `None` on timeout or disconnect
async fn await_credential(
    stream: &mut SplitStream<WebSocket>,
    timeout: Duration,
) -> Option<String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let frame = match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(_) => return None,
            Err(_) => {
                debug!("[Gateway] No credential within {:?}", timeout);
                return None;
            }
        };

        match frame {
            Message::Text(text) => match ClientEvent::parse(text.as_str()) {
                Ok(ClientEvent::Authenticate(payload)) => return Some(payload.token),
                Ok(_) => debug!("[Gateway] Ignoring event before authentication"),
                Err(e) => debug!("[Gateway] Unreadable frame before authentication: {}", e),
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(outgoing) = rx.recv().await {
        let frame = match outgoing {
            Outgoing::Event(event) => match event.to_frame() {
                Ok(text) => Message::Text(text.into()),
                Err(e) => {
                    warn!("[Gateway] Failed to encode event: {}", e);
                    continue;
                }
            },
            Outgoing::Ping => Message::Ping(Bytes::new()),
            Outgoing::Close(code, reason) => {
                let _ = sink.send(close_message(code, reason)).await;
                break;
            }
        };

        if sink.send(frame).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Per-connection state.
///
/// Deliveries from other sessions land on `live_rx` and are only forwarded to
/// the writer once the ack and catch-up have been queued, so replayed history
/// always precedes live traffic.
struct Session {
    state: AppState,
    identity: Identity,
    store: Arc<TenantStore>,
    connection_id: Uuid,
    writer: mpsc::UnboundedSender<Outgoing>,
    live_tx: mpsc::UnboundedSender<ServerEvent>,
    live_rx: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    presence_rx: Option<broadcast::Receiver<ServerEvent>>,
    /// Ids sent during catch-up that may also arrive live
    replayed: HashSet<String>,
    missed: u32,
}

impl Session {
    fn new(
        state: AppState,
        identity: Identity,
        store: Arc<TenantStore>,
        writer: mpsc::UnboundedSender<Outgoing>,
    ) -> Self {
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        Self {
            state,
            identity,
            store,
            connection_id: Uuid::new_v4(),
            writer,
            live_tx,
            live_rx: Some(live_rx),
            presence_rx: None,
            replayed: HashSet::new(),
            missed: 0,
        }
    }

    fn key(&self) -> PresenceKey {
        PresenceKey::new(&self.identity.tenant, &self.identity.id)
    }

    fn participant(&self) -> Participant {
        self.identity.participant()
    }

    /// Straight to the writer, ahead of anything still held on the live queue
    fn write(&self, outgoing: Outgoing) {
        if self.writer.send(outgoing).is_err() {
            debug!("[Gateway] Writer gone for {}", self.connection_id);
        }
    }

    /// Behind any deliveries already queued for this connection
    fn push(&self, event: ServerEvent) {
        // live_rx is owned by this session, so the send cannot fail while it runs
        let _ = self.live_tx.send(event);
    }

    /// Forward one live event, skipping messages already replayed by catch-up
    fn forward(&mut self, event: ServerEvent) {
        if let ServerEvent::ReceiveMessage(message) = &event {
            if self.replayed.remove(&message.id) {
                return;
            }
        }
        self.write(Outgoing::Event(event));
    }

    /// Register presence, acknowledge, announce, then replay unread messages.
    ///
    /// Registration comes first so nothing appended during catch-up is missed;
    /// those deliveries wait on the live queue until `run` starts draining it.
    async fn activate(&mut self) {
        let handle = ConnectionHandle::new(self.connection_id, self.live_tx.clone());
        self.state.presence.set(self.key(), handle);
        self.presence_rx = Some(self.state.presence.subscribe(&self.identity.tenant));

        info!(
            "[Gateway] {} connected to {} ({})",
            self.participant(),
            self.identity.tenant,
            self.connection_id
        );

        self.write(Outgoing::Event(ServerEvent::Connection(ConnectionAck {
            status: "connected".to_string(),
            identity_id: self.identity.id.clone(),
            role: self.identity.role,
        })));

        self.state.presence.broadcast(
            &self.identity.tenant,
            ServerEvent::presence(&self.identity.id, true),
        );

        let since = Utc::now() - self.state.config.catchup_window;
        let receiver = self.participant();
        match self
            .state
            .bounded(
                self.state
                    .messages
                    .unseen_since(&self.store, &receiver, since),
            )
            .await
        {
            Ok(unseen) => {
                if !unseen.is_empty() {
                    debug!(
                        "[Gateway] Replaying {} unread messages to {}",
                        unseen.len(),
                        receiver
                    );
                }
                for message in unseen {
                    self.replayed.insert(message.id.clone());
                    self.write(Outgoing::Event(ServerEvent::ReceiveMessage(message)));
                }
            }
            Err(e) => warn!("[Gateway] Catch-up failed for {}: {}", receiver, e),
        }
    }

    async fn run(&mut self, stream: &mut SplitStream<WebSocket>) {
        let mut ticker = tokio::time::interval(self.state.config.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let (Some(mut presence_rx), Some(mut live_rx)) =
            (self.presence_rx.take(), self.live_rx.take())
        else {
            return;
        };

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()).await,
                    Some(Ok(Message::Pong(_))) => self.missed = 0,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("[Gateway] Read error on {}: {}", self.connection_id, e);
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if self.missed >= self.state.config.max_missed_pings {
                        info!(
                            "[Gateway] {} missed {} pings, dropping",
                            self.participant(),
                            self.missed
                        );
                        self.write(Outgoing::Close(CLOSE_GOING_AWAY, "ping timeout".to_string()));
                        break;
                    }
                    self.missed += 1;
                    self.write(Outgoing::Ping);
                },
                delivery = live_rx.recv() => match delivery {
                    Some(event) => self.forward(event),
                    None => break,
                },
                update = presence_rx.recv() => match update {
                    Ok(ServerEvent::UserStatus(status)) if status.user_id == self.identity.id => {}
                    Ok(event) => self.write(Outgoing::Event(event)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("[Gateway] {} skipped {} presence updates", self.connection_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        match ClientEvent::parse(text) {
            Ok(event) => self.handle_event(event).await,
            Err(e) => warn!("[Gateway] Ignoring frame from {}: {}", self.connection_id, e),
        }
    }

    async fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Authenticate(_) => {
                debug!("[Gateway] {} already authenticated", self.connection_id);
            }
            ClientEvent::SendMessage(payload) => {
                let sender = self.participant();
                let receiver = Participant::new(payload.receiver_id, payload.receiver_role);
                match self
                    .state
                    .send_direct(&self.store, &sender, &receiver, &payload.body)
                    .await
                {
                    Ok(message) => self.push(ServerEvent::sent(&message.id)),
                    Err(err) => {
                        if err.is_transient() {
                            warn!("[Gateway] Send {} -> {} failed: {}", sender, receiver, err);
                        } else {
                            debug!("[Gateway] Send {} -> {} refused: {}", sender, receiver, err);
                        }
                        self.push(ServerEvent::error(&err));
                    }
                }
            }
            ClientEvent::TypingStatus(payload) => {
                self.state.delivery.notify(
                    &self.identity.tenant,
                    &payload.receiver_id,
                    ServerEvent::UserTyping(UserTyping {
                        user_id: self.identity.id.clone(),
                        is_typing: payload.is_typing,
                    }),
                );
            }
            ClientEvent::MessageSeen(payload) => {
                let reader = self.participant();
                let marked = self
                    .state
                    .bounded(
                        self.state
                            .messages
                            .mark_read(&self.store, &payload.message_id, &reader),
                    )
                    .await;
                match marked {
                    Ok(message) => {
                        self.state.delivery.notify(
                            &self.identity.tenant,
                            &message.sender_id,
                            ServerEvent::seen(&message.id),
                        );
                    }
                    Err(err) => {
                        debug!("[Gateway] Seen receipt from {} refused: {}", reader, err);
                        self.push(ServerEvent::error(&err));
                    }
                }
            }
            ClientEvent::Pong => self.missed = 0,
        }
    }

    /// Deregister, announcing offline only if this connection was still current
    fn close(&self) {
        if self.state.presence.remove(&self.key(), self.connection_id) {
            self.state.presence.broadcast(
                &self.identity.tenant,
                ServerEvent::presence(&self.identity.id, false),
            );
        }
        info!(
            "[Gateway] {} disconnected ({})",
            self.participant(),
            self.connection_id
        );
    }
}
