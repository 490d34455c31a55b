mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use common::{clock, MemberBuilder, ROOM};
use cowatch_lib::api::server::build_router;
use cowatch_lib::error::TransportError;
use cowatch_lib::events::create_event_bus;
use cowatch_lib::network::LocalHub;
use cowatch_lib::room::{run_room_session, COMMAND_QUEUE};
use cowatch_lib::state::ServiceContext;

struct TestApp {
    router: Router,
    runner: JoinHandle<Result<(), TransportError>>,
    hub: LocalHub,
}

async fn spawn_app() -> TestApp {
    let hub = LocalHub::new();
    let clock = clock();
    let (session, peer_rx, _) = MemberBuilder::new(&hub, &clock, "a").host().detached().await;
    let (room_tx, room_rx) = mpsc::channel(COMMAND_QUEUE);
    let (event_tx, _) = create_event_bus();
    let ctx = ServiceContext {
        room_code: ROOM.to_string(),
        client_id: "a".to_string(),
        room_tx,
        event_tx,
    };
    let runner = tokio::spawn(run_room_session(session, peer_rx, room_rx));
    TestApp {
        router: build_router(ctx),
        runner,
        hub,
    }
}

async fn send(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

async fn room(app: &TestApp) -> Value {
    let (status, body) = send(app, "GET", "/api/v1/room", None).await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_room_snapshot() {
    let app = spawn_app().await;
    let json = room(&app).await;
    assert_eq!(json["room_code"], ROOM);
    assert_eq!(json["client_id"], "a");
    assert_eq!(json["is_host"], true);
    assert_eq!(json["attached"], true);
    assert_eq!(json["mic"]["state"], "idle");
}

#[tokio::test]
async fn test_seek_then_play() {
    let app = spawn_app().await;

    let (status, body) = send(&app, "POST", "/api/v1/room/seek", Some(serde_json::json!({"time": 61.5}))).await;
    assert_eq!(status, StatusCode::OK);
    let ack: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(ack["ok"], true);

    let (status, _) = send(&app, "POST", "/api/v1/room/play", None).await;
    assert_eq!(status, StatusCode::OK);

    let json = room(&app).await;
    assert_eq!(json["record"]["isPlaying"], true);
    assert_eq!(json["record"]["lastKnownTime"], 61.5);
    assert_eq!(json["player_paused"], false);
}

#[tokio::test]
async fn test_invalid_seek_rejected() {
    let app = spawn_app().await;
    let (status, _) = send(&app, "POST", "/api/v1/room/seek", Some(serde_json::json!({"time": -3.0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let json = room(&app).await;
    assert!(json["record"].is_null());
}

#[tokio::test]
async fn test_player_report_validation() {
    let app = spawn_app().await;
    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/player/report",
        Some(serde_json::json!({"time": -1.0, "paused": true})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/player/report",
        Some(serde_json::json!({"time": 12.0, "paused": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(room(&app).await["player_time"], 12.0);
}

#[tokio::test]
async fn test_chat_and_media() {
    let app = spawn_app().await;

    let (status, _) = send(&app, "POST", "/api/v1/chat", Some(serde_json::json!({"message": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/chat",
        Some(serde_json::json!({"message": "hi all", "tone": "happy"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        "PUT",
        "/api/v1/room/media",
        Some(serde_json::json!({"mediaType": "series", "season": 1, "episode": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let json = room(&app).await;
    assert_eq!(json["media"]["mediaType"], "series");
    assert_eq!(json["media"]["episode"], 3);
    let chat = json["chat"].as_array().unwrap();
    assert_eq!(chat.len(), 2);
    assert_eq!(chat[0]["message"], "hi all");
    assert_eq!(chat[0]["tone"], "happy");
    assert_eq!(chat[1]["kind"], "notice");
}

#[tokio::test]
async fn test_leave_stops_the_session() {
    let app = spawn_app().await;
    let (status, _) = send(&app, "POST", "/api/v1/room/leave", None).await;
    assert_eq!(status, StatusCode::OK);

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), app.runner)
        .await
        .expect("session stops")
        .unwrap();
    assert!(result.is_ok());
    assert!(app.hub.members(ROOM).is_empty());

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/room/play")
        .body(Body::empty())
        .unwrap();
    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_mic_toggle() {
    let app = spawn_app().await;
    let (status, _) = send(&app, "PUT", "/api/v1/voice/mic", Some(serde_json::json!({"enabled": true}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(room(&app).await["mic"]["state"], "active");

    let (status, _) = send(&app, "PUT", "/api/v1/voice/mic", Some(serde_json::json!({"enabled": false}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(room(&app).await["mic"]["state"], "idle");
}

#[tokio::test]
async fn test_malformed_body_rejected() {
    let app = spawn_app().await;
    let (status, _) = send(&app, "PUT", "/api/v1/voice/mic", Some(serde_json::json!({"on": "yes"}))).await;
    assert!(status.is_client_error());
}
