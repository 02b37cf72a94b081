//! WebSocket transport for the signaling protocol.
//!
//! `GET /ws?token=...` verifies the session token and checks that the room
//! can take the connection before upgrading. A refused connection never
//! touches room state.
//!
//! After the upgrade the connection binds to its peer with a fresh session
//! id. Inbound frames are handled one at a time, in arrival order, by a
//! single task per connection. Outbound frames go through a bounded queue
//! drained by a writer task, which also sends keepalive pings.

use super::protocol::{parse_client_frame, ClientFrame, FrameError, ServerEvent, ServerFrame};
use super::session::SignalingSession;
use crate::actors::PeerRef;
use crate::auth::SessionClaims;
use crate::errors::RoomError;
use crate::observability::metrics;
use crate::registry::peer::{BindAction, Binding};
use crate::routes::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Parsed frames waiting for the connection's handler task.
const INBOUND_FRAME_BUFFER: usize = 64;

type InboundFrame = Result<ClientFrame, FrameError>;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    token: Option<String>,
}

/// Handler for `GET /ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
) -> Result<Response, RoomError> {
    let claims = params
        .token
        .ok_or(RoomError::InvalidToken)
        .and_then(|token| state.issuer.verify(&token))
        .inspect_err(|e| metrics::record_admission("connect", "rejected", Some(e.error_code())))?;

    state
        .registry
        .check_connect(claims.room_name.clone(), claims.peer_id.clone())
        .await
        .inspect_err(|e| metrics::record_admission("connect", "rejected", Some(e.error_code())))?;

    metrics::record_admission("connect", "success", None);
    Ok(ws.on_upgrade(move |socket| run_connection(socket, state, claims)))
}

#[instrument(
    skip_all,
    name = "room.signaling.connection",
    fields(room = %claims.room_name, session_id = tracing::field::Empty)
)]
async fn run_connection(socket: WebSocket, state: Arc<AppState>, claims: SessionClaims) {
    let signaling = state.config.signaling.clone();
    let session_id = Uuid::new_v4();
    tracing::Span::current().record("session_id", tracing::field::display(session_id));

    let (sink, mut stream) = socket.split();
    let (outbox, outbound) = mpsc::channel::<ServerFrame>(signaling.outbound_queue_capacity);

    let binding = Binding {
        session_id,
        outbox: outbox.clone(),
    };
    let action = state
        .registry
        .bind_session(
            claims.room_name.clone(),
            claims.peer_id.clone(),
            claims.display_name.clone(),
            binding,
        )
        .await;
    let action = match action {
        Ok(action) => action,
        Err(e) => {
            warn!(target: "room.signaling", error = %e, "Connection could not bind, closing");
            refuse(sink, &e).await;
            return;
        }
    };
    if action == BindAction::ReRegister {
        info!(target: "room.signaling", "Peer re-registered after an earlier disconnect");
    }

    metrics::connection_opened();
    let peer = PeerRef {
        room_name: claims.room_name,
        peer_id: claims.peer_id,
        session_id,
    };
    let session = SignalingSession::new(
        peer.clone(),
        state.registry.clone(),
        Arc::clone(&state.workers),
        signaling.clone(),
    );

    let mut writer = tokio::spawn(write_frames(sink, outbound, signaling.keepalive_interval));
    let (inbox, inbound) = mpsc::channel::<InboundFrame>(INBOUND_FRAME_BUFFER);
    let handler = tokio::spawn(handle_frames(session, inbound, outbox.clone()));

    let mut last_seen = Instant::now();
    let mut liveness = tokio::time::interval(signaling.keepalive_interval);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        if inbox.send(parse_client_frame(&text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => last_seen = Instant::now(),
                    Some(Err(e)) => {
                        debug!(target: "room.signaling", error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }

            _ = liveness.tick() => {
                if last_seen.elapsed() > signaling.keepalive_timeout {
                    info!(target: "room.signaling", "Keepalive timeout, closing connection");
                    break;
                }
            }

            _ = &mut writer => {
                debug!(target: "room.signaling", "Writer finished, closing connection");
                break;
            }
        }
    }

    writer.abort();
    drop(inbox);
    drop(outbox);
    // Frames already queued are skipped once the writer is gone; a request
    // in flight runs to completion and the registry discards its result.
    drop(handler);

    match state.registry.unbind_session(peer).await {
        Ok(removed) => info!(target: "room.signaling", removed, "Connection closed"),
        Err(e) => warn!(target: "room.signaling", error = %e, "Failed to unbind closed connection"),
    }
    metrics::connection_closed();
}

/// Handle inbound frames in arrival order.
///
/// Each frame is fully handled, reply included, before the next one starts.
async fn handle_frames(
    session: SignalingSession,
    mut inbound: mpsc::Receiver<InboundFrame>,
    outbox: mpsc::Sender<ServerFrame>,
) {
    while let Some(frame) = inbound.recv().await {
        if outbox.is_closed() {
            break;
        }
        let reply = match frame {
            Ok(ClientFrame::Request { id, request }) => {
                Some(ServerFrame::reply(id, session.handle_request(request).await))
            }
            Ok(ClientFrame::Notify(notification)) => session
                .handle_notification(notification)
                .await
                .err()
                .map(|e| ServerFrame::event(ServerEvent::from_error(&e))),
            Err(FrameError::BadRequest { id, reason }) => {
                debug!(target: "room.signaling", reason = %reason, "Invalid request");
                Some(ServerFrame::reply(id, Err(RoomError::Validation(reason))))
            }
            Err(FrameError::Malformed(reason)) => {
                debug!(target: "room.signaling", reason = %reason, "Malformed frame");
                Some(ServerFrame::event(ServerEvent::from_error(
                    &RoomError::Validation(reason),
                )))
            }
        };
        if let Some(reply) = reply {
            if outbox.send(reply).await.is_err() {
                break;
            }
        }
    }
}

/// Drain the outbound queue onto the socket and send keepalive pings.
///
/// Returns after a `room-closed` event has been written, when the socket
/// fails, or when every sender is gone.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerFrame>,
    keepalive_interval: Duration,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + keepalive_interval, keepalive_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                let closing = matches!(
                    &frame,
                    ServerFrame::Event { event: ServerEvent::RoomClosed { .. } }
                );
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(target: "room.signaling", frame = frame.name(), error = %e, "Failed to serialize frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
                if closing {
                    break;
                }
            }

            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// Tell the client why it could not bind, then close.
async fn refuse(mut sink: SplitSink<WebSocket, Message>, error: &RoomError) {
    let frame = ServerFrame::event(ServerEvent::from_error(error));
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = sink.send(Message::Text(text)).await;
    }
    let _ = sink.close().await;
}
