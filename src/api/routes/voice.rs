use axum::{extract::State, Json};
use serde::Deserialize;

use crate::room::RoomCommand;
use crate::state::ServiceContext;

use super::{send_command, ApiResult};

#[derive(Deserialize)]
pub struct SetMicRequest {
    pub enabled: bool,
}

pub async fn set_mic(State(ctx): State<ServiceContext>, Json(body): Json<SetMicRequest>) -> ApiResult {
    send_command(&ctx, RoomCommand::SetMic(body.enabled)).await
}

/// Retry every remote track that could not start playing.
pub async fn unblock_audio(State(ctx): State<ServiceContext>) -> ApiResult {
    send_command(&ctx, RoomCommand::UnblockAudio).await
}
