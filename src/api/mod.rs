//! HTTP/WebSocket control surface driven by the UI.

pub mod routes;
pub mod server;
pub mod websocket;
