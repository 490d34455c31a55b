use axum::{
    extract::{State, ws::{Message, WebSocket, WebSocketUpgrade}},
    response::IntoResponse,
};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::events::AppEvent;
use crate::room::RoomCommand;
use crate::state::ServiceContext;

/// Event stream for the UI: one room snapshot on connect, then every
/// `AppEvent` as `{type, data}` JSON.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<ServiceContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn initial_snapshot(ctx: &ServiceContext) -> Option<String> {
    let (tx, rx) = oneshot::channel();
    ctx.room_tx.send(RoomCommand::Snapshot(tx)).await.ok()?;
    let snapshot = rx.await.ok()?;
    serde_json::to_string(&serde_json::json!({ "type": "RoomSnapshot", "data": snapshot })).ok()
}

async fn handle_socket(mut socket: WebSocket, ctx: ServiceContext) {
    // Subscribe before asking for the snapshot so nothing falls in between.
    let mut event_rx = ctx.event_tx.subscribe();
    debug!("UI client connected to the event stream of room {}", ctx.room_code);

    if let Some(json) = initial_snapshot(&ctx).await {
        if socket.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = event_rx.recv() => {
                match result {
                    Ok(event) => {
                        if !forward(&mut socket, &event).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event stream client lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            // The stream is one-way; only keepalives are answered.
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    debug!("UI client disconnected from the event stream");
}

/// False once the socket is gone.
async fn forward(socket: &mut WebSocket, event: &AppEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize event: {}", e);
            true
        }
    }
}
