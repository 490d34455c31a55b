//! Join / offer / answer / ICE exchange that forms the voice mesh.
//!
//! Every handler returns the events to broadcast instead of sending them, so
//! the room session stays the only writer to the channel. Failures are
//! per-peer: they are logged and the step is skipped.

use tracing::{debug, info, warn};

use crate::models::{IceCandidate, IceNet, PeerNotice, RoomEvent, SdpNet, SessionDescription};
use crate::sync::SharedClock;

use super::peer::{LinkState, LocalAudioTrack};
use super::registry::PeerRegistry;

/// What a connection-state change did to the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkChange {
    Connected,
    TornDown,
    Unchanged,
}

pub struct Negotiator {
    self_id: String,
    registry: PeerRegistry,
    clock: SharedClock,
}

impl Negotiator {
    pub fn new(self_id: impl Into<String>, registry: PeerRegistry, clock: SharedClock) -> Self {
        Self {
            self_id: self_id.into(),
            registry,
            clock,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn join_notice(&self) -> RoomEvent {
        RoomEvent::WebrtcJoin(PeerNotice {
            from: self.self_id.clone(),
        })
    }

    pub fn leave_notice(&self) -> RoomEvent {
        RoomEvent::WebrtcLeave(PeerNotice {
            from: self.self_id.clone(),
        })
    }

    /// A member announced itself: the existing member becomes the offerer.
    pub async fn on_join(&mut self, from: &str, local: Option<&LocalAudioTrack>) -> Option<RoomEvent> {
        if from == self.self_id || self.registry.contains(from) {
            debug!("Ignoring join from {}: link already present", from);
            return None;
        }
        info!("{} joined the mesh; sending offer", from);
        let now = self.clock.now_ms();
        let connection = match self.registry.get_or_create(from, now).await {
            Ok((link, _)) => link.connection.clone(),
            Err(e) => {
                warn!("Failed to open link to {}: {}", from, e);
                return None;
            }
        };
        if let Err(e) = connection.ensure_audio_receiver().await {
            warn!("Audio receiver setup failed for {}: {}", from, e);
        }
        if let Some(track) = local {
            if let Err(e) = connection.set_outbound_audio(Some(track.clone())).await {
                warn!("Failed to attach microphone for {}: {}", from, e);
            }
        }
        self.offer(from).await
    }

    /// Create and set a fresh offer for an existing link, addressed to `peer_id`.
    pub async fn offer(&mut self, peer_id: &str) -> Option<RoomEvent> {
        let link = self.registry.get_mut(peer_id)?;
        match link.connection.create_offer().await {
            Ok(sdp) => {
                link.awaiting_answer = true;
                Some(RoomEvent::WebrtcOffer(SdpNet {
                    from: self.self_id.clone(),
                    to: peer_id.to_string(),
                    sdp,
                }))
            }
            Err(e) => {
                warn!("Failed to create offer for {}: {}", peer_id, e);
                None
            }
        }
    }

    pub async fn on_offer(
        &mut self,
        from: &str,
        sdp: SessionDescription,
        local: Option<&LocalAudioTrack>,
    ) -> Option<RoomEvent> {
        // Both sides offered at once: the lower id yields and starts over.
        let collision = self.registry.get(from).is_some_and(|l| l.awaiting_answer);
        if collision {
            if self.self_id.as_str() > from {
                debug!("Offer collision with {}; keeping ours", from);
                return None;
            }
            debug!("Offer collision with {}; accepting theirs", from);
            self.registry.close_link(from).await;
        }

        let now = self.clock.now_ms();
        let connection = match self.registry.get_or_create(from, now).await {
            Ok((link, _)) => link.connection.clone(),
            Err(e) => {
                warn!("Failed to open link to {}: {}", from, e);
                return None;
            }
        };
        if let Err(e) = connection.set_remote_description(sdp).await {
            warn!("Rejected offer from {}: {}", from, e);
            return None;
        }
        if let Some(link) = self.registry.get_mut(from) {
            link.has_remote_description = true;
        }
        self.registry.flush_candidates(from).await;

        if let Err(e) = connection.ensure_audio_receiver().await {
            warn!("Audio receiver setup failed for {}: {}", from, e);
        }
        if let Some(track) = local {
            if let Err(e) = connection.set_outbound_audio(Some(track.clone())).await {
                warn!("Failed to attach microphone for {}: {}", from, e);
            }
        }
        match connection.create_answer().await {
            Ok(answer) => {
                info!("Answering offer from {}", from);
                Some(RoomEvent::WebrtcAnswer(SdpNet {
                    from: self.self_id.clone(),
                    to: from.to_string(),
                    sdp: answer,
                }))
            }
            Err(e) => {
                warn!("Failed to answer {}: {}", from, e);
                None
            }
        }
    }

    pub async fn on_answer(&mut self, from: &str, sdp: SessionDescription) {
        let Some(link) = self.registry.get_mut(from) else {
            debug!("Answer from {} without a link; ignoring", from);
            return;
        };
        if let Err(e) = link.connection.set_remote_description(sdp).await {
            warn!("Rejected answer from {}: {}", from, e);
            return;
        }
        link.has_remote_description = true;
        link.awaiting_answer = false;
        info!("Applied WebRTC answer from peer {}", from);
        self.registry.flush_candidates(from).await;
    }

    /// Apply now if the remote description is set, otherwise hold it.
    pub async fn on_ice(&mut self, from: &str, candidate: IceCandidate) {
        let connection = self
            .registry
            .get(from)
            .filter(|link| link.has_remote_description)
            .map(|link| link.connection.clone());
        let Some(connection) = connection else {
            self.registry.buffer_candidate(from, candidate);
            return;
        };
        match connection.add_ice_candidate(candidate).await {
            Ok(()) => debug!("Added ICE candidate from peer {}", from),
            Err(e) => warn!("ICE candidate from {} not applied: {}", from, e),
        }
    }

    pub async fn on_leave(&mut self, from: &str) -> bool {
        let removed = self.registry.teardown(from).await;
        if removed {
            info!("{} left the mesh", from);
        }
        removed
    }

    /// Address a locally gathered candidate to the peer it belongs to.
    pub fn on_local_candidate(&self, peer_id: &str, candidate: IceCandidate) -> Option<RoomEvent> {
        if !self.registry.contains(peer_id) {
            return None;
        }
        Some(RoomEvent::WebrtcIce(IceNet {
            from: self.self_id.clone(),
            to: peer_id.to_string(),
            candidate,
        }))
    }

    pub async fn on_state_change(&mut self, peer_id: &str, state: LinkState) -> LinkChange {
        let Some(link) = self.registry.get_mut(peer_id) else {
            return LinkChange::Unchanged;
        };
        link.state = state;
        match state {
            LinkState::Connected => {
                info!("WebRTC connected to {}", peer_id);
                LinkChange::Connected
            }
            LinkState::Failed => {
                warn!("WebRTC link to {} failed; tearing down", peer_id);
                self.registry.teardown(peer_id).await;
                LinkChange::TornDown
            }
            LinkState::Disconnected => {
                info!("WebRTC link to {} disconnected; waiting for recovery", peer_id);
                LinkChange::Unchanged
            }
            _ => LinkChange::Unchanged,
        }
    }

    pub async fn close_all(&mut self) {
        self.registry.close_all().await;
    }
}
