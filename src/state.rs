use tokio::sync::mpsc;

use crate::events::EventSender;
use crate::room::RoomCommand;

/// Handles shared by the API routes and the WebSocket bridge.
#[derive(Clone)]
pub struct ServiceContext {
    pub room_code: String,
    pub client_id: String,
    pub room_tx: mpsc::Sender<RoomCommand>,
    pub event_tx: EventSender,
}
