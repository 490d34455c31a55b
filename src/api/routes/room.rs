use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::room::{RoomCommand, RoomSnapshot};
use crate::state::ServiceContext;
use crate::sync::MediaSelection;

use super::{send_command, ApiResult};

pub async fn get_room(
    State(ctx): State<ServiceContext>,
) -> Result<Json<RoomSnapshot>, (StatusCode, String)> {
    let (tx, rx) = oneshot::channel();
    ctx.room_tx
        .send(RoomCommand::Snapshot(tx))
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, format!("Room session is gone: {}", e)))?;
    rx.await
        .map(Json)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, format!("No snapshot: {}", e)))
}

pub async fn play(State(ctx): State<ServiceContext>) -> ApiResult {
    send_command(&ctx, RoomCommand::Play).await
}

pub async fn pause(State(ctx): State<ServiceContext>) -> ApiResult {
    send_command(&ctx, RoomCommand::Pause).await
}

#[derive(Deserialize)]
pub struct SeekRequest {
    pub time: f64,
}

pub async fn seek(State(ctx): State<ServiceContext>, Json(body): Json<SeekRequest>) -> ApiResult {
    if !body.time.is_finite() || body.time < 0.0 {
        return Err((StatusCode::BAD_REQUEST, "time must be a non-negative number".into()));
    }
    send_command(&ctx, RoomCommand::Seek { time: body.time }).await
}

pub async fn leave(State(ctx): State<ServiceContext>) -> ApiResult {
    send_command(&ctx, RoomCommand::Leave).await
}

pub async fn close(State(ctx): State<ServiceContext>) -> ApiResult {
    send_command(&ctx, RoomCommand::CloseRoom).await
}

pub async fn set_media(
    State(ctx): State<ServiceContext>,
    Json(selection): Json<MediaSelection>,
) -> ApiResult {
    send_command(&ctx, RoomCommand::SelectMedia(selection)).await
}
