use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;

use crate::room::RoomCommand;
use crate::state::ServiceContext;

use super::{send_command, ApiResult};

#[derive(Deserialize)]
pub struct SendChatRequest {
    pub message: String,
    pub tone: Option<String>,
}

pub async fn send_chat(State(ctx): State<ServiceContext>, Json(body): Json<SendChatRequest>) -> ApiResult {
    if body.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message is empty".into()));
    }
    send_command(
        &ctx,
        RoomCommand::SendChat {
            message: body.message,
            tone: body.tone,
        },
    )
    .await
}
