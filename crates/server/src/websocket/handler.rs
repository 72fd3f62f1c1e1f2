//! WebSocket handler for Axum
//!
//! Authenticates the handshake, then runs the connection's reader, writer and
//! pipeline worker tasks until either side closes.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use deskrelay_shared::{now_rfc3339, ServerEvent};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::auth::{TokenError, VerifiedIdentity};
use crate::state::AppState;

use super::connection::{Connection, Outbound};
use super::pipeline::MessagePipeline;

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: Option<String>,
}

/// WebSocket handler - upgrades HTTP connection to WebSocket
///
/// Authenticates via the `token` query parameter. Rejected handshakes are still
/// upgraded so the client receives a close code saying why.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> Response {
    match state.verifier.verify(params.token.as_deref()) {
        Ok(identity) => {
            tracing::info!(
                conversation_id = %identity.conversation_id,
                participant_id = %identity.participant_id,
                role = %identity.role,
                "WebSocket connection upgrade requested"
            );
            ws.on_upgrade(move |socket| handle_socket(socket, identity, state))
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                close_code = e.close_code(),
                "WebSocket auth failed"
            );
            ws.on_upgrade(move |socket| reject(socket, e))
        }
    }
}

/// Close a rejected handshake without ever joining a room
async fn reject(mut socket: WebSocket, error: TokenError) {
    let frame = CloseFrame {
        code: error.close_code(),
        reason: error.close_reason().into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Failed to send rejection close frame");
    }
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, identity: VerifiedIdentity, state: AppState) {
    let (sink, stream) = socket.split();

    // Create channel for sending frames to this connection
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let conn = Arc::new(Connection::new(&identity, tx));
    let session_id = conn.session_id;

    // Queued before joining so no room broadcast can overtake the acknowledgment
    if let Err(e) = conn.send(&ServerEvent::Connected {
        conversation_id: conn.conversation_id.clone(),
        timestamp: now_rfc3339(),
    }) {
        tracing::error!(session_id = %session_id, error = %e, "Failed to queue connection acknowledgment");
        return;
    }

    let room_size = state.registry.join(Arc::clone(&conn)).await;
    tracing::info!(
        session_id = %session_id,
        conversation_id = %conn.conversation_id,
        participant_id = %conn.participant_id,
        room_size,
        "WebSocket connection established"
    );

    // Inbound frames are processed in order, off the reader task
    let (work_tx, work_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(run_worker(
        Arc::clone(&state.pipeline),
        Arc::clone(&conn),
        work_rx,
    ));

    let mut send_task = tokio::spawn(write_frames(sink, rx));
    let mut recv_task = tokio::spawn(read_frames(stream, Arc::clone(&conn), work_tx));

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Cleanup on disconnect; a liveness eviction may already have done it
    state.registry.leave(&conn).await;
    tracing::info!(
        session_id = %session_id,
        conversation_id = %conn.conversation_id,
        "WebSocket connection closed"
    );
}

/// Owns the socket sink; exits after a close frame or a failed write
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        let result = match outbound {
            Outbound::Frame(text) => sink.send(Message::Text(text)).await,
            Outbound::Ping => sink.send(Message::Ping(Vec::new())).await,
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        };

        if result.is_err() {
            break; // Connection closed
        }
    }
}

/// Reads frames until the peer closes or the socket errors
async fn read_frames(
    mut stream: SplitStream<WebSocket>,
    conn: Arc<Connection>,
    work_tx: mpsc::UnboundedSender<String>,
) {
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(session_id = %conn.session_id, error = %e, "WebSocket read error");
                break;
            }
        };
        conn.touch();

        match msg {
            Message::Text(text) => {
                if work_tx.send(text).is_err() {
                    break;
                }
            }
            Message::Pong(_) => conn.mark_alive(),
            Message::Close(_) => {
                tracing::info!(session_id = %conn.session_id, "WebSocket close frame received");
                break;
            }
            Message::Ping(_) => {
                // Axum answers protocol pings automatically
            }
            Message::Binary(_) => {
                let _ = conn.send(&ServerEvent::error("Binary frames are not supported"));
            }
        }
    }
}

/// Runs queued frames through the pipeline
///
/// Not tied to the socket: in-flight persistence calls finish even if the
/// connection drops, only their replies are lost.
async fn run_worker(
    pipeline: Arc<MessagePipeline>,
    conn: Arc<Connection>,
    mut work_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = work_rx.recv().await {
        pipeline.handle_frame(&conn, &text).await;
    }
}
