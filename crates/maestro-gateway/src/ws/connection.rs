use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use maestro_protocol::client::parse_command;
use maestro_protocol::server::ServerEvent;

use crate::app::AppState;
use crate::ws::handlers;

/// Going-away close code sent to every client on graceful shutdown.
const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Axum handler that upgrades HTTP to WebSocket at GET /ws.
///
/// Auth is a bearer token in the query string; the real auth layer sits in
/// front of this process, this check just keeps a bare deployment closed.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Some(ref expected) = state.orch.config.gateway.auth_token {
        if query.token.as_deref() != Some(expected.as_str()) {
            warn!("ws upgrade rejected: bad token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(|socket| handle_connection(socket, state))
        .into_response()
}

/// Per-connection task; lives for the entire WS session lifetime.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = uuid::Uuid::new_v4().simple().to_string();
    info!(conn_id, "ws connection opened");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sink, mut sink_rx) = mpsc::channel::<String>(256);

    // Writer half: frames queued by the engine flow out here; on shutdown
    // the client gets a going-away close.
    let shutdown = state.shutdown.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = sink_rx.recv() => {
                    match frame {
                        Some(json) => {
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.cancelled() => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_GOING_AWAY,
                            reason: "server shutting down".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Sessions this connection subscribed to, for unwatch on close.
    let mut subscribed: HashSet<String> = HashSet::new();

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let command = match parse_command(&text) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        debug!(conn_id, "malformed command: {e}");
                        let _ = sink.try_send(
                            ServerEvent::Error {
                                error: format!("bad command: {e}"),
                                tab_id: None,
                            }
                            .to_json(),
                        );
                        continue;
                    }
                };
                handlers::dispatch(&state, &sink, &mut subscribed, command).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            // Ping/pong is answered by the websocket layer.
            Ok(_) => {}
        }
    }

    for session_id in &subscribed {
        state.orch.remove_watcher(session_id, &sink);
    }
    drop(sink);
    // The writer owns the receiver half; it must be gone before
    // handle_disconnect probes channel liveness to arm idle timers.
    writer.abort();
    let _ = writer.await;
    state.orch.handle_disconnect();
    info!(conn_id, "ws connection closed");
}
