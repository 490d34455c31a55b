//! In-process channel transport.
//!
//! Several sessions in one process share a `LocalHub`; each gets its own
//! `LocalBus` connection. Delivery is ordered per sender, publishes are
//! echoed back to the sender, and presence joins/leaves are reported to
//! every other subscriber of the room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::models::{PresenceMeta, RoomEvent};
use crate::network::{RoomTransport, TransportEvent, EVENT_QUEUE};

struct Member {
    conn: u64,
    presence: PresenceMeta,
    events: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct HubState {
    rooms: HashMap<String, Vec<Member>>,
}

#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
    next_conn: Arc<AtomicU64>,
    no_echo: bool,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hub whose publishers do not hear their own broadcasts.
    pub fn without_self_echo() -> Self {
        Self {
            no_echo: true,
            ..Self::default()
        }
    }

    pub fn connect(&self) -> LocalBus {
        LocalBus {
            hub: self.clone(),
            conn: self.next_conn.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Presence currently tracked in `room`.
    pub fn members(&self, room: &str) -> Vec<PresenceMeta> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .rooms
            .get(room)
            .map(|m| m.iter().map(|m| m.presence.clone()).collect())
            .unwrap_or_default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HubState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }
}

fn deliver(targets: Vec<mpsc::Sender<TransportEvent>>, event: TransportEvent) {
    for tx in targets {
        if let Err(e) = tx.try_send(event.clone()) {
            warn!("Local bus dropped {:?}: {}", event, e);
        }
    }
}

/// One session's connection to a `LocalHub`.
pub struct LocalBus {
    hub: LocalHub,
    conn: u64,
}

#[async_trait]
impl RoomTransport for LocalBus {
    async fn subscribe(
        &self,
        room: &str,
        presence: PresenceMeta,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let conn = self.conn;
        let (existing, others) = self.hub.with_state(|state| {
            let members = state.rooms.entry(room.to_string()).or_default();
            if members.iter().any(|m| m.conn == conn) {
                return Err(TransportError::Subscribe(format!("already in room {room}")));
            }
            let existing: Vec<PresenceMeta> = members.iter().map(|m| m.presence.clone()).collect();
            let others: Vec<_> = members.iter().map(|m| m.events.clone()).collect();
            members.push(Member {
                conn,
                presence: presence.clone(),
                events: tx.clone(),
            });
            Ok((existing, others))
        })?;

        debug!("local bus: {} subscribed to {}", presence.id, room);
        deliver(vec![tx.clone()], TransportEvent::Subscribed);
        deliver(vec![tx.clone()], TransportEvent::PresenceJoin(presence.clone()));
        for meta in existing {
            deliver(vec![tx.clone()], TransportEvent::PresenceJoin(meta));
        }
        deliver(others, TransportEvent::PresenceJoin(presence));
        Ok(rx)
    }

    async fn publish(&self, room: &str, event: RoomEvent) -> Result<(), TransportError> {
        let conn = self.conn;
        let no_echo = self.hub.no_echo;
        let targets = self.hub.with_state(|state| {
            let members = state
                .rooms
                .get(room)
                .ok_or_else(|| TransportError::Publish(format!("not subscribed to {room}")))?;
            if !members.iter().any(|m| m.conn == conn) {
                return Err(TransportError::Publish(format!("not subscribed to {room}")));
            }
            Ok(members
                .iter()
                .filter(|m| !(no_echo && m.conn == conn))
                .map(|m| m.events.clone())
                .collect::<Vec<_>>())
        })?;
        deliver(targets, TransportEvent::Message(event));
        Ok(())
    }

    async fn track(&self, room: &str, presence: PresenceMeta) -> Result<(), TransportError> {
        let conn = self.conn;
        let (old, targets) = self.hub.with_state(|state| {
            let members = state
                .rooms
                .get_mut(room)
                .ok_or_else(|| TransportError::Publish(format!("not subscribed to {room}")))?;
            let member = members
                .iter_mut()
                .find(|m| m.conn == conn)
                .ok_or_else(|| TransportError::Publish(format!("not subscribed to {room}")))?;
            let old = std::mem::replace(&mut member.presence, presence.clone());
            let targets: Vec<_> = members.iter().map(|m| m.events.clone()).collect();
            Ok((old, targets))
        })?;
        if old != presence {
            deliver(targets.clone(), TransportEvent::PresenceLeave(old));
            deliver(targets, TransportEvent::PresenceJoin(presence));
        }
        Ok(())
    }

    async fn unsubscribe(&self, room: &str) -> Result<(), TransportError> {
        let conn = self.conn;
        let removed = self.hub.with_state(|state| {
            let members = state.rooms.get_mut(room)?;
            let idx = members.iter().position(|m| m.conn == conn)?;
            let gone = members.remove(idx);
            let others: Vec<_> = members.iter().map(|m| m.events.clone()).collect();
            if members.is_empty() {
                state.rooms.remove(room);
            }
            Some((gone.presence, others))
        });
        if let Some((presence, others)) = removed {
            debug!("local bus: {} left {}", presence.id, room);
            deliver(others, TransportEvent::PresenceLeave(presence));
        }
        Ok(())
    }
}
