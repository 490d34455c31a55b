use serde::Serialize;
use tokio::sync::broadcast;

use crate::media::mic::MicStatus;
use crate::models::PresenceMeta;
use crate::room::chat::ChatEntry;
use crate::sync::{MediaSelection, PlaybackRecord, PlayerAction, ReconcileOutcome};

/// Transport-agnostic application events.
/// Emitted by the room session, consumed by the WebSocket API.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum AppEvent {
    // Playback
    PlayerCommand { action: PlayerAction },
    PlaybackUpdated { record: PlaybackRecord, source: String },
    DriftCorrected { expected: f64, actual: f64 },
    ReconciliationFinished { outcome: ReconcileOutcome },
    MediaChanged { selection: MediaSelection, from: String },
    // Presence
    MemberJoined(PresenceMeta),
    MemberLeft(PresenceMeta),
    // Voice
    VoiceConnected { peer_id: String },
    VoiceDisconnected { peer_id: String },
    MicStateChanged(MicStatus),
    AudioBlocked { peer_ids: Vec<String> },
    AudioUnblocked { peer_ids: Vec<String> },
    // Chat / lifecycle
    ChatMessage(ChatEntry),
    RoomClosed { by: String },
    SessionEnded { room_code: String },
}

pub type EventSender = broadcast::Sender<AppEvent>;
pub type EventReceiver = broadcast::Receiver<AppEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}
