//! Per-session duplex stream.
//!
//! `GET /interview/:id/stream?token=<wst>&since=<frame id>` upgrades to a
//! WebSocket carrying server-to-client JSON frames with a `type`
//! discriminator. The token is checked after the upgrade so the client
//! receives a proper close code: 4401 when the token is missing, 4403 when
//! it is invalid or mis-scoped.
//!
//! Frames arrive in publish order. A `since` parameter replays any frames
//! the session ring still buffers. Terminal frames (`SESSION_ENDED`,
//! `SESSION_COMPLETED`) are followed by a normal close; an evicted slow
//! subscriber is closed with reason `slow_consumer`.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use greenroom_core::token::Audience;
use serde::Deserialize;
use tracing::debug;

use super::AppState;

/// Close code for a missing token.
const CLOSE_UNAUTHENTICATED: u16 = 4401;

/// Close code for an invalid or mis-scoped token.
const CLOSE_FORBIDDEN: u16 = 4403;

/// Normal closure.
const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Deserialize)]
pub(super) struct StreamQuery {
    token: Option<String>,
    since: Option<u64>,
}

/// `GET /interview/:id/stream` (WST).
pub(super) async fn stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    ws.on_upgrade(move |socket| run(state, socket, session_id, query))
}

async fn run(state: AppState, mut socket: WebSocket, session_id: String, query: StreamQuery) {
    let Some(token) = query.token else {
        close(&mut socket, CLOSE_UNAUTHENTICATED, "token_missing").await;
        return;
    };
    if state
        .authority
        .verify(&token, Audience::Wst, Some(&session_id))
        .is_err()
    {
        close(&mut socket, CLOSE_FORBIDDEN, "token_invalid").await;
        return;
    }
    if state.service.get_session(&session_id).is_err() {
        close(&mut socket, CLOSE_FORBIDDEN, "not_found").await;
        return;
    }

    debug!(session_id = %session_id, since = ?query.since, "stream opened");
    let (replay, mut rx) = state.service.bus().subscribe(&session_id, query.since);

    let mut terminal_seen = false;
    for frame in replay {
        terminal_seen = frame.event.is_terminal();
        if send_frame(&mut socket, &frame).await.is_err() {
            return;
        }
        if terminal_seen {
            break;
        }
    }
    if terminal_seen {
        close(&mut socket, CLOSE_NORMAL, "session over").await;
        return;
    }

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        let terminal = frame.event.is_terminal();
                        if send_frame(&mut socket, &frame).await.is_err() {
                            return;
                        }
                        if terminal {
                            close(&mut socket, CLOSE_NORMAL, "session over").await;
                            return;
                        }
                    }
                    // The bus dropped this subscriber without a terminal
                    // frame: it fell behind.
                    None => {
                        close(&mut socket, CLOSE_NORMAL, "slow_consumer").await;
                        return;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(session_id = %session_id, "client closed stream");
                        return;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }
        }
    }
}

async fn send_frame(
    socket: &mut WebSocket,
    frame: &greenroom_core::fanout::StreamFrame,
) -> Result<(), axum::Error> {
    let Ok(payload) = serde_json::to_string(frame) else {
        return Ok(());
    };
    socket.send(Message::Text(payload)).await
}

async fn close(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}
