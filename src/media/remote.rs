use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::events::{AppEvent, EventSender};

use super::audio::AudioBackend;
use super::peer::InboundAudio;

/// Plays remote peers' audio. Tracks whose output cannot be opened are held
/// until the user unblocks audio, and the user is asked once for all of them.
pub struct RemoteAudio {
    audio: Arc<dyn AudioBackend>,
    events: EventSender,
    forwarders: HashMap<String, JoinHandle<()>>,
    blocked: HashMap<String, Arc<dyn InboundAudio>>,
}

impl RemoteAudio {
    pub fn new(audio: Arc<dyn AudioBackend>, events: EventSender) -> Self {
        Self {
            audio,
            events,
            forwarders: HashMap::new(),
            blocked: HashMap::new(),
        }
    }

    pub fn playing(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.forwarders.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn blocked(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.blocked.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn attach(&mut self, peer_id: &str, track: Arc<dyn InboundAudio>) {
        self.stop(peer_id);
        if self.start(peer_id, track.clone()) {
            return;
        }
        let first = self.blocked.is_empty();
        self.blocked.insert(peer_id.to_string(), track);
        if first {
            let _ = self.events.send(AppEvent::AudioBlocked {
                peer_ids: self.blocked(),
            });
        }
    }

    /// Retry every held track. Returns the peers that now play.
    pub fn unblock(&mut self) -> Vec<String> {
        let held: Vec<_> = self.blocked.drain().collect();
        let mut started = Vec::new();
        for (peer_id, track) in held {
            if self.start(&peer_id, track.clone()) {
                started.push(peer_id);
            } else {
                self.blocked.insert(peer_id, track);
            }
        }
        started.sort();
        if !started.is_empty() {
            let _ = self.events.send(AppEvent::AudioUnblocked {
                peer_ids: started.clone(),
            });
        }
        if !self.blocked.is_empty() {
            let _ = self.events.send(AppEvent::AudioBlocked {
                peer_ids: self.blocked(),
            });
        }
        started
    }

    fn start(&mut self, peer_id: &str, track: Arc<dyn InboundAudio>) -> bool {
        let mut sink = match self.audio.open_output(peer_id) {
            Ok(sink) => sink,
            Err(e) => {
                warn!("Cannot play audio from {}: {}", peer_id, e);
                return false;
            }
        };
        let pid = peer_id.to_string();
        let handle = tokio::spawn(async move {
            while let Some(payload) = track.next_payload().await {
                sink.push(&payload);
            }
            info!("Remote track reader for {} exited", pid);
        });
        self.forwarders.insert(peer_id.to_string(), handle);
        true
    }

    pub fn stop(&mut self, peer_id: &str) {
        if let Some(handle) = self.forwarders.remove(peer_id) {
            handle.abort();
        }
        self.blocked.remove(peer_id);
    }

    pub fn stop_all(&mut self) {
        for (_, handle) in self.forwarders.drain() {
            handle.abort();
        }
        self.blocked.clear();
    }
}

impl Drop for RemoteAudio {
    fn drop(&mut self) {
        self.stop_all();
    }
}
