use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;

use crate::room::RoomCommand;
use crate::state::ServiceContext;

use super::{send_command, ApiResult};

#[derive(Deserialize)]
pub struct PlayerReport {
    pub time: f64,
    pub paused: bool,
}

/// What the UI's media element currently shows.
pub async fn report(State(ctx): State<ServiceContext>, Json(body): Json<PlayerReport>) -> ApiResult {
    if !body.time.is_finite() || body.time < 0.0 {
        return Err((StatusCode::BAD_REQUEST, "time must be a non-negative number".into()));
    }
    send_command(
        &ctx,
        RoomCommand::PlayerReport {
            time: body.time,
            paused: body.paused,
        },
    )
    .await
}

pub async fn ready(State(ctx): State<ServiceContext>) -> ApiResult {
    send_command(&ctx, RoomCommand::PlayerReady).await
}
