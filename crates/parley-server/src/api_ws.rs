//! WebSocket gateway.
//!
//! Each accepted socket is served by one task that owns the connection's
//! session. The task waits on three sources at once: frames from the client,
//! events from the fabric mailbox, and the process shutdown signal. Whatever
//! ends the loop, the session's cleanup runs exactly once afterwards.

use crate::error::{GatewayError, FABRIC_FAILURE_CLOSE_CODE, FABRIC_FAILURE_REASON};
use crate::frames::{self, ChatEvent, Envelope, InboundFrame, OutboundFrame, ProtocolViolation, Signal};
use crate::middleware::authenticate;
use crate::persist::persist_chat;
use crate::presence::{self, announce_online};
use crate::rooms::{home_group, notify_channel};
use crate::AppState;
use axum::{
    extract::{
        ws::{CloseFrame, Message as AxumMessage, WebSocket},
        ConnectInfo, Extension, Path, Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_identity::UserIdentity;
use parley_types::{ConnectionId, RouteKind, UserId};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio::sync::mpsc;

/// WebSocket close code sent when the server is shutting down.
const GOING_AWAY_CLOSE_CODE: u16 = 1001;

type WsSender = SplitSink<WebSocket, AxumMessage>;
type WsReceiver = SplitStream<WebSocket>;

/// Query parameters for the WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    pub token: Option<String>,
}

/// Upgrade handler for `/ws/chat/{peer_id}`: a one-to-one room.
pub async fn chat_ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(peer_id): Path<String>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
) -> Response {
    let peer: UserId = match peer_id.parse() {
        Ok(peer) => peer,
        Err(e) => {
            tracing::warn!(remote_addr = %addr, "rejecting websocket with bad peer id: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    upgrade(state, addr, ws, params, RouteKind::Room { peer }).await
}

/// Upgrade handler for `/ws/notify`: the personal notification channel.
pub async fn notify_ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
) -> Response {
    upgrade(state, addr, ws, params, RouteKind::Notifications).await
}

/// Authenticates before accepting the upgrade, so a rejected client never
/// gets a socket, a mailbox or a presence registration. While the fabric is
/// down the upgrade is refused outright.
async fn upgrade(
    state: Arc<AppState>,
    addr: SocketAddr,
    ws: WebSocketUpgrade,
    params: WsConnectParams,
    route: RouteKind,
) -> Response {
    let Some(token) = params.token else {
        tracing::warn!(remote_addr = %addr, "websocket connect missing token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    if !state.fabric.is_available() {
        tracing::warn!(remote_addr = %addr, "refusing websocket while the fabric is down");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    match authenticate(&state, token).await {
        Ok(identity) => {
            tracing::info!(
                user_id = %identity.id,
                remote_addr = %addr,
                route = ?route,
                "websocket auth success"
            );
            ws.on_upgrade(move |socket| handle_socket(socket, state, identity, route))
        }
        Err(code) => {
            tracing::warn!(
                remote_addr = %addr,
                status = %code,
                "websocket auth failed"
            );
            code.into_response()
        }
    }
}

/// Lifecycle of an accepted connection. Credential checks happen before the
/// upgrade, so a session starts out authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Authenticated, registration not yet complete.
    Authenticated,
    /// Subscribed, registered and announced.
    Open,
    /// Cleanup in progress.
    Closing,
    /// Cleanup finished. Terminal.
    Closed,
}

/// Why the receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    /// The client closed or the stream ended.
    Client,
    /// Reading from or writing to the socket failed.
    Transport,
    /// The fabric or presence store is unavailable.
    Fabric,
    /// The process is shutting down.
    Shutdown,
}

struct Session {
    id: ConnectionId,
    user: UserIdentity,
    route: RouteKind,
    home_group: String,
    state: ConnectionState,
    registered: bool,
    opened_at: Instant,
}

impl Session {
    fn new(user: UserIdentity, route: RouteKind) -> Self {
        Self {
            id: ConnectionId::new(),
            home_group: home_group(user.id, route),
            user,
            route,
            state: ConnectionState::Authenticated,
            registered: false,
            opened_at: Instant::now(),
        }
    }

    /// The room group and peer, for room connections.
    fn room(&self) -> Option<(&str, UserId)> {
        self.route.peer().map(|peer| (self.home_group.as_str(), peer))
    }

    fn require_room(&self, kind: &str) -> Result<(&str, UserId), ProtocolViolation> {
        self.room()
            .ok_or_else(|| ProtocolViolation::NotInRoom(kind.to_string()))
    }

    /// Joins the home group, registers presence and announces the user.
    /// Subscription comes first so that replies to the probe are not missed.
    async fn open(&mut self, state: &AppState) -> Result<(), GatewayError> {
        state.fabric.subscribe(&self.home_group, self.id).await?;

        // Releasing a connection that never registered is a no-op, so mark it
        // before the attempt.
        self.registered = true;
        presence::mark_online(
            &state.presence,
            &state.fabric,
            self.user.id,
            self.id,
            self.room().map(|(room, _)| room),
        )
        .await?;

        self.state = ConnectionState::Open;
        tracing::info!(
            user_id = %self.user.id,
            connection_id = %self.id,
            group = %self.home_group,
            "connection open"
        );
        Ok(())
    }

    /// Releases everything the connection holds. Only the first call acts.
    async fn close(&mut self, state: &AppState) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        self.state = ConnectionState::Closing;

        if self.registered {
            match presence::mark_offline(&state.presence, &state.fabric, self.user.id, self.id)
                .await
            {
                Ok(went_offline) => {
                    tracing::debug!(
                        user_id = %self.user.id,
                        connection_id = %self.id,
                        went_offline,
                        "presence released"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %self.user.id,
                        connection_id = %self.id,
                        "failed to release presence: {}",
                        e
                    );
                }
            }
        }
        state.fabric.detach(self.id).await;

        self.state = ConnectionState::Closed;
        tracing::info!(
            user_id = %self.user.id,
            connection_id = %self.id,
            duration_ms = self.opened_at.elapsed().as_millis() as u64,
            "connection closed"
        );
    }

    async fn run(
        &self,
        state: &AppState,
        sender: &mut WsSender,
        receiver: &mut WsReceiver,
        mailbox: &mut mpsc::Receiver<Arc<Envelope>>,
    ) -> Disconnect {
        let mut shutdown = state.shutdown.subscribe();
        if *shutdown.borrow() {
            return Disconnect::Shutdown;
        }

        loop {
            tokio::select! {
                incoming = receiver.next() => {
                    let text = match incoming {
                        Some(Ok(AxumMessage::Text(text))) => text,
                        Some(Ok(AxumMessage::Binary(_))) => {
                            let err = GatewayError::from(ProtocolViolation::Binary);
                            if report(sender, &err).await.is_err() {
                                return Disconnect::Transport;
                            }
                            continue;
                        }
                        Some(Ok(AxumMessage::Close(_))) | None => return Disconnect::Client,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            tracing::debug!(connection_id = %self.id, "websocket read failed: {}", e);
                            return Disconnect::Transport;
                        }
                    };

                    if let Err(e) = self.dispatch(state, sender, text.as_str()).await {
                        if e.is_fatal() {
                            tracing::error!(
                                user_id = %self.user.id,
                                connection_id = %self.id,
                                "closing connection: {}",
                                e
                            );
                            return Disconnect::Fabric;
                        }
                        tracing::debug!(
                            user_id = %self.user.id,
                            connection_id = %self.id,
                            "frame refused: {}",
                            e
                        );
                        if report(sender, &e).await.is_err() {
                            return Disconnect::Transport;
                        }
                    }
                }
                delivered = mailbox.recv() => {
                    let Some(envelope) = delivered else {
                        tracing::warn!(connection_id = %self.id, "fabric mailbox closed");
                        return Disconnect::Fabric;
                    };
                    if let Err(reason) = self.deliver(state, sender, &envelope).await {
                        return reason;
                    }
                }
                _ = shutdown.changed() => return Disconnect::Shutdown,
            }
        }
    }

    /// Handles one client frame.
    async fn dispatch(
        &self,
        state: &AppState,
        sender: &mut WsSender,
        text: &str,
    ) -> Result<(), GatewayError> {
        match frames::decode(text, state.limits.max_message_len)? {
            InboundFrame::ChatMessage { message } => self.relay_chat(state, sender, message).await,
            InboundFrame::Reaction { message_id, emoji } => {
                let (room, _) = self.require_room("reaction")?;
                let frame = OutboundFrame::Reaction {
                    message_id,
                    emoji,
                    sender_id: self.user.id,
                };
                self.publish(state, room, false, frame).await
            }
            InboundFrame::Typing { is_typing } => {
                let (room, _) = self.require_room("typing")?;
                let frame = OutboundFrame::Typing {
                    is_typing,
                    sender_id: self.user.id,
                };
                self.publish(state, room, true, frame).await
            }
            InboundFrame::Signal(signal) => self.relay_signal(state, signal).await,
        }
    }

    /// Persists, then publishes to the room. The event goes out even when the
    /// write fails, marked unpersisted, and the sender alone hears about it.
    /// In that case the sender's own copy is written here, ahead of the error
    /// frame, and the fabric copy skips this connection.
    async fn relay_chat(
        &self,
        state: &AppState,
        sender: &mut WsSender,
        message: String,
    ) -> Result<(), GatewayError> {
        let (room, peer) = self.require_room("chat_message")?;

        match persist_chat(&state.pool, self.user.id, peer, message.clone()).await {
            Ok(stored) => {
                let event = ChatEvent {
                    id: Some(stored.id),
                    message: stored.content,
                    sender_id: stored.sender,
                    receiver_id: stored.receiver,
                    timestamp: stored.timestamp,
                    persisted: true,
                };
                self.publish(state, room, false, OutboundFrame::ChatMessage(event))
                    .await
            }
            Err(e) => {
                tracing::error!(
                    user_id = %self.user.id,
                    connection_id = %self.id,
                    group = %room,
                    "failed to persist message: {}",
                    e
                );
                let frame = OutboundFrame::ChatMessage(ChatEvent {
                    id: None,
                    message,
                    sender_id: self.user.id,
                    receiver_id: peer,
                    timestamp: parley_chat::now_timestamp(),
                    persisted: false,
                });
                if let Err(send_err) = send_frame(sender, &frame).await {
                    tracing::debug!(
                        connection_id = %self.id,
                        "failed to echo unpersisted message: {}",
                        send_err
                    );
                }
                let mut envelope = self.envelope(false, frame);
                envelope.echoed_by_origin = true;
                state.fabric.publish(room, envelope).await?;
                Err(e.into())
            }
        }
    }

    /// Relays an opaque signal to the room, and a call request to the
    /// callee's notification channel.
    async fn relay_signal(&self, state: &AppState, signal: Signal) -> Result<(), GatewayError> {
        let Signal {
            kind,
            payload,
            call,
        } = signal;

        let room = self.room();
        if room.is_none() && call.is_none() {
            return Err(ProtocolViolation::NotInRoom(kind).into());
        }

        if let Some((room, _)) = room {
            self.publish(state, room, true, OutboundFrame::Signal { payload })
                .await?;
        }

        if let Some(call) = call {
            // Any authenticated user may ring any other user.
            tracing::info!(
                user_id = %self.user.id,
                target = %call.target,
                "relaying call to notification channel"
            );
            let frame = OutboundFrame::IncomingCall {
                from: self.user.id,
                from_username: self.user.username.clone(),
                signal_data: call.signal_data,
            };
            self.publish(state, &notify_channel(call.target), false, frame)
                .await?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        state: &AppState,
        group: &str,
        self_exclude: bool,
        frame: OutboundFrame,
    ) -> Result<(), GatewayError> {
        state
            .fabric
            .publish(group, self.envelope(self_exclude, frame))
            .await?;
        Ok(())
    }

    fn envelope(&self, self_exclude: bool, frame: OutboundFrame) -> Envelope {
        Envelope {
            origin_user: self.user.id,
            origin_connection: self.id,
            self_exclude,
            echoed_by_origin: false,
            frame,
        }
    }

    /// Writes one fabric event to the socket, or answers it if it is a probe.
    async fn deliver(
        &self,
        state: &AppState,
        sender: &mut WsSender,
        envelope: &Envelope,
    ) -> Result<(), Disconnect> {
        if !envelope.delivers_to(self.user.id, self.id) {
            return Ok(());
        }

        if matches!(envelope.frame, OutboundFrame::PresenceProbe) {
            if let Some((room, _)) = self.room() {
                if let Err(e) = announce_online(&state.fabric, room, self.user.id, self.id).await {
                    tracing::error!(connection_id = %self.id, "failed to answer presence probe: {}", e);
                    return Err(Disconnect::Fabric);
                }
            }
            return Ok(());
        }

        send_frame(sender, &envelope.frame)
            .await
            .map_err(|_| Disconnect::Transport)
    }
}

async fn send_frame(sender: &mut WsSender, frame: &OutboundFrame) -> Result<(), axum::Error> {
    match frame.client_text() {
        Ok(Some(text)) => sender.send(AxumMessage::Text(text.into())).await,
        Ok(None) => Ok(()),
        Err(e) => {
            tracing::error!("failed to serialize outgoing frame: {}", e);
            Ok(())
        }
    }
}

/// Sends the error frame for a recoverable failure to this connection only.
async fn report(sender: &mut WsSender, err: &GatewayError) -> Result<(), axum::Error> {
    match err.to_frame() {
        Some(frame) => send_frame(sender, &frame).await,
        None => Ok(()),
    }
}

/// Serves one accepted socket until it closes.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    identity: UserIdentity,
    route: RouteKind,
) {
    let mut session = Session::new(identity, route);
    let mut mailbox = state.fabric.attach(session.id).await;
    let (mut sender, mut receiver) = socket.split();

    let outcome = match session.open(&state).await {
        Ok(()) => {
            session
                .run(&state, &mut sender, &mut receiver, &mut mailbox)
                .await
        }
        Err(e) => {
            tracing::error!(
                user_id = %session.user.id,
                connection_id = %session.id,
                "failed to open connection: {}",
                e
            );
            Disconnect::Fabric
        }
    };

    let close = match outcome {
        Disconnect::Fabric => Some((FABRIC_FAILURE_CLOSE_CODE, FABRIC_FAILURE_REASON)),
        Disconnect::Shutdown => Some((GOING_AWAY_CLOSE_CODE, "server shutting down")),
        Disconnect::Client | Disconnect::Transport => None,
    };
    if let Some((code, reason)) = close {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if let Err(e) = sender.send(AxumMessage::Close(Some(frame))).await {
            tracing::debug!(connection_id = %session.id, "failed to send close frame: {}", e);
        }
    }

    session.close(&state).await;
}
