//! Room session facade: wires the channel transport, playback sync, state
//! reconciliation and the voice mesh together for one room code.

pub mod chat;
pub mod session;

use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::media::{LinkState, MicStatus};
use crate::models::PresenceMeta;
use crate::sync::{MediaSelection, PlaybackRecord};

pub use chat::{ChatEntry, ChatKind, ChatLog};
pub use session::{run_room_session, RoomSession, SessionParts};

/// Capacity of the command queue feeding a running session.
pub const COMMAND_QUEUE: usize = 64;

/// Who this client is inside a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomIdentity {
    pub room_code: String,
    /// Fresh per process; used as `from` on every outbound event.
    pub client_id: String,
    pub display_name: String,
    /// Cosmetic: only the host may close the room.
    pub is_host: bool,
}

impl RoomIdentity {
    pub fn new(room_code: impl Into<String>, display_name: impl Into<String>, is_host: bool) -> Self {
        Self {
            room_code: room_code.into(),
            client_id: Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            is_host,
        }
    }

    /// Identity with a caller-chosen client id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn presence(&self) -> PresenceMeta {
        PresenceMeta {
            name: self.display_name.clone(),
            id: self.client_id.clone(),
        }
    }
}

/// Requests from the UI layer to a running session.
#[derive(Debug)]
pub enum RoomCommand {
    Play,
    Pause,
    Seek { time: f64 },
    /// Position and paused flag observed by the UI's media element.
    PlayerReport { time: f64, paused: bool },
    PlayerReady,
    SelectMedia(MediaSelection),
    SetMic(bool),
    SendChat { message: String, tone: Option<String> },
    CloseRoom,
    UnblockAudio,
    Leave,
    Snapshot(oneshot::Sender<RoomSnapshot>),
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub peer_id: String,
    pub state: LinkState,
}

/// Point-in-time view of a session for the UI.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub room_code: String,
    pub client_id: String,
    pub display_name: String,
    pub is_host: bool,
    pub attached: bool,
    pub members: Vec<PresenceMeta>,
    pub record: Option<PlaybackRecord>,
    pub expected_time: Option<f64>,
    pub player_time: f64,
    pub player_paused: bool,
    pub player_ready: bool,
    pub media: Option<MediaSelection>,
    pub mic: MicStatus,
    pub peers: Vec<PeerSummary>,
    pub blocked_audio: Vec<String>,
    pub reconciling: bool,
    pub chat: Vec<ChatEntry>,
}
