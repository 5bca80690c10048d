//! Log endpoints: REST history and WebSocket streaming.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::AppState;
use crate::loghub::{LogEntry, LogHub};

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    limit: Option<usize>,
    tag: Option<String>,
}

/// GET /logs?limit=&tag= — recent log entries.
pub async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Json<Value> {
    let entries = state
        .log_hub()
        .recent(query.limit.unwrap_or(200), query.tag.as_deref());
    let count = entries.len();
    Json(json!({ "entries": entries, "count": count }))
}

fn default_history() -> bool {
    true
}

fn default_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct WsLogsQuery {
    #[serde(default = "default_history")]
    history: bool,
    #[serde(default = "default_limit")]
    limit: usize,
    tag: Option<String>,
}

/// GET /ws/logs?history=&limit=&tag= — subscribe to the live log stream,
/// optionally replaying recent history first.
pub async fn ws_logs(
    State(state): State<AppState>,
    Query(query): Query<WsLogsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let hub = state.log_hub();
    ws.on_upgrade(move |socket| handle_socket(socket, hub, query))
}

async fn handle_socket(socket: WebSocket, hub: Arc<LogHub>, query: WsLogsQuery) {
    let (mut sender, mut receiver) = socket.split();

    // Replay and live are split atomically so the client sees no gap and
    // no duplicate across the boundary.
    let (id, replay, mut rx) = if query.history {
        hub.subscribe_with_history(query.limit, query.tag.as_deref())
    } else {
        let (id, rx) = hub.subscribe();
        (id, Vec::new(), rx)
    };
    debug!(subscriber = id, "log websocket connected");

    for entry in &replay {
        if send_frame(&mut sender, entry).await.is_err() {
            hub.unsubscribe(id);
            return;
        }
    }

    loop {
        tokio::select! {
            entry = rx.recv() => {
                match entry {
                    Some(entry) => {
                        if send_frame(&mut sender, &entry).await.is_err() {
                            break;
                        }
                    }
                    // Channel closed by close_all; end the connection.
                    None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            inbound = receiver.next() => {
                // Client frames are ignored; close or error tears down.
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    hub.unsubscribe(id);
    debug!(subscriber = id, "log websocket disconnected");
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    entry: &LogEntry,
) -> Result<(), axum::Error> {
    let frame = json!({ "type": "log", "data": entry });
    sender.send(Message::Text(frame.to_string().into())).await
}
