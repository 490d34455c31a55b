pub mod behaviour;
pub mod local;
pub mod swarm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::models::{PresenceMeta, RoomEvent};

pub use local::{LocalBus, LocalHub};
pub use swarm::SwarmTransport;

/// Capacity of the per-room inbound event queue.
pub const EVENT_QUEUE: usize = 256;

/// What a room subscriber receives from the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(RoomEvent),
    PresenceJoin(PresenceMeta),
    PresenceLeave(PresenceMeta),
    /// The subscription is live; it is now safe to broadcast.
    Subscribed,
}

/// Commands sent from room sessions to the network event loop
#[derive(Debug)]
pub enum NetworkCommand {
    Subscribe {
        room: String,
        presence: PresenceMeta,
        events: mpsc::Sender<TransportEvent>,
    },
    Publish {
        room: String,
        event: RoomEvent,
    },
    Track {
        room: String,
        presence: PresenceMeta,
    },
    Unsubscribe {
        room: String,
    },
}

/// Envelope on a room topic: application events and presence updates share
/// the same channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub enum ChannelFrame {
    Event(RoomEvent),
    Track(PresenceMeta),
    Untrack(PresenceMeta),
}

/// A named broadcast channel with presence, ordered per sender, no
/// delivery guarantee.
#[async_trait]
pub trait RoomTransport: Send + Sync {
    /// Join `room`, track `presence`, and return the inbound event stream.
    async fn subscribe(
        &self,
        room: &str,
        presence: PresenceMeta,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Fire-and-forget broadcast to everyone in the room.
    async fn publish(&self, room: &str, event: RoomEvent) -> Result<(), TransportError>;

    /// Re-announce presence metadata (e.g. after a rename).
    async fn track(&self, room: &str, presence: PresenceMeta) -> Result<(), TransportError>;

    async fn unsubscribe(&self, room: &str) -> Result<(), TransportError>;
}
