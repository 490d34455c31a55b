use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SignalError;
use crate::models::IceCandidate;

use super::peer::{LinkState, PeerConnection, PeerConnector, PeerEvent};

/// One direct connection to a remote member.
pub struct PeerLink {
    pub peer_id: String,
    pub connection: Arc<dyn PeerConnection>,
    pub has_remote_description: bool,
    /// We sent an offer that has not been answered yet.
    pub awaiting_answer: bool,
    pub state: LinkState,
    pub opened_at: i64,
}

/// Owns every peer link of a session, at most one per remote peer, plus ICE
/// candidates that arrived before their link could take them.
pub struct PeerRegistry {
    connector: Arc<dyn PeerConnector>,
    events: mpsc::Sender<PeerEvent>,
    links: HashMap<String, PeerLink>,
    pending_ice: HashMap<String, Vec<IceCandidate>>,
}

impl PeerRegistry {
    pub fn new(connector: Arc<dyn PeerConnector>, events: mpsc::Sender<PeerEvent>) -> Self {
        Self {
            connector,
            events,
            links: HashMap::new(),
            pending_ice: HashMap::new(),
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerLink> {
        self.links.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerLink> {
        self.links.get_mut(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.links.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    /// Return the link for `peer_id`, opening one first if none exists.
    /// The bool is true when the link was created by this call.
    pub async fn get_or_create(
        &mut self,
        peer_id: &str,
        now_ms: i64,
    ) -> Result<(&mut PeerLink, bool), SignalError> {
        let created = !self.links.contains_key(peer_id);
        if created {
            let connection = self.connector.open(peer_id, self.events.clone()).await?;
            self.links.insert(
                peer_id.to_string(),
                PeerLink {
                    peer_id: peer_id.to_string(),
                    connection,
                    has_remote_description: false,
                    awaiting_answer: false,
                    state: LinkState::New,
                    opened_at: now_ms,
                },
            );
            info!("Opened peer link to {}", peer_id);
        }
        let link = self
            .links
            .get_mut(peer_id)
            .ok_or_else(|| SignalError::UnknownPeer(peer_id.to_string()))?;
        Ok((link, created))
    }

    /// Hold a candidate until `peer_id`'s remote description is set.
    pub fn buffer_candidate(&mut self, peer_id: &str, candidate: IceCandidate) {
        let queue = self.pending_ice.entry(peer_id.to_string()).or_default();
        queue.push(candidate);
        debug!("Buffered ICE candidate for {} ({} pending)", peer_id, queue.len());
    }

    pub fn pending_candidates(&self, peer_id: &str) -> usize {
        self.pending_ice.get(peer_id).map_or(0, Vec::len)
    }

    /// Apply every buffered candidate for `peer_id`, in arrival order.
    /// Individual failures are logged and skipped.
    pub async fn flush_candidates(&mut self, peer_id: &str) -> usize {
        let Some(link) = self.links.get(peer_id) else {
            return 0;
        };
        let queued = self.pending_ice.remove(peer_id).unwrap_or_default();
        let mut applied = 0;
        for candidate in queued {
            match link.connection.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => warn!("Dropping buffered candidate for {}: {}", peer_id, e),
            }
        }
        if applied > 0 {
            debug!("Applied {} buffered ICE candidates for {}", applied, peer_id);
        }
        applied
    }

    /// Close and remove the link only; candidates already buffered stay.
    pub async fn close_link(&mut self, peer_id: &str) -> bool {
        let Some(link) = self.links.remove(peer_id) else {
            return false;
        };
        if let Err(e) = link.connection.close().await {
            warn!("Error closing peer connection to {}: {}", peer_id, e);
        }
        info!("Closed peer connection to {}", peer_id);
        true
    }

    /// Forget everything about `peer_id`.
    pub async fn teardown(&mut self, peer_id: &str) -> bool {
        self.pending_ice.remove(peer_id);
        self.close_link(peer_id).await
    }

    pub async fn close_all(&mut self) {
        for peer_id in self.peer_ids() {
            self.close_link(&peer_id).await;
        }
        self.pending_ice.clear();
    }
}
