use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{routes, websocket};
use crate::state::ServiceContext;

pub fn build_router(ctx: ServiceContext) -> Router {
    Router::new()
        // Room
        .route("/api/v1/room", get(routes::room::get_room))
        .route("/api/v1/room/play", post(routes::room::play))
        .route("/api/v1/room/pause", post(routes::room::pause))
        .route("/api/v1/room/seek", post(routes::room::seek))
        .route("/api/v1/room/leave", post(routes::room::leave))
        .route("/api/v1/room/close", post(routes::room::close))
        .route("/api/v1/room/media", put(routes::room::set_media))
        // Player element
        .route("/api/v1/player/report", post(routes::player::report))
        .route("/api/v1/player/ready", post(routes::player::ready))
        // Voice
        .route("/api/v1/voice/mic", put(routes::voice::set_mic))
        .route("/api/v1/voice/unblock", post(routes::voice::unblock_audio))
        // Chat
        .route("/api/v1/chat", post(routes::chat::send_chat))
        // WebSocket
        .route("/ws", get(websocket::ws_handler))
        // Middleware
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

pub async fn start_api_server(ctx: ServiceContext, port: u16) -> std::io::Result<()> {
    let router = build_router(ctx);
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API server listening on http://{}", addr);
    axum::serve(listener, router).await
}
