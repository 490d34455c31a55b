pub mod chat;
pub mod player;
pub mod room;
pub mod voice;

use axum::{http::StatusCode, Json};

use crate::room::RoomCommand;
use crate::state::ServiceContext;

pub type ApiResult = Result<Json<serde_json::Value>, (StatusCode, String)>;

/// Queue a command for the room session and acknowledge it.
pub(crate) async fn send_command(ctx: &ServiceContext, command: RoomCommand) -> ApiResult {
    ctx.room_tx
        .send(command)
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, format!("Room session is gone: {}", e)))
}
