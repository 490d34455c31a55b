use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use webrtc::media::Sample;

use crate::events::{AppEvent, EventSender};
use crate::models::RoomEvent;

use super::audio::{AudioBackend, CaptureStream};
use super::peer::{LocalAudioTrack, OutboundAudio};
use super::signaling::Negotiator;

/// Microphone state as shown next to the mic control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum MicStatus {
    Idle,
    Starting,
    Active,
    Error(String),
}

/// Owns the single capture stream of a session and fans mic on/off out to
/// every peer link.
pub struct MicController {
    status: MicStatus,
    audio: Arc<dyn AudioBackend>,
    track: LocalAudioTrack,
    capture: Option<CaptureStream>,
    events: EventSender,
}

impl MicController {
    pub fn new(audio: Arc<dyn AudioBackend>, track: LocalAudioTrack, events: EventSender) -> Self {
        Self {
            status: MicStatus::Idle,
            audio,
            track,
            capture: None,
            events,
        }
    }

    pub fn status(&self) -> &MicStatus {
        &self.status
    }

    /// The outbound track, only while the microphone is live.
    pub fn active_track(&self) -> Option<&LocalAudioTrack> {
        self.capture.as_ref().map(|_| &self.track)
    }

    fn set_status(&mut self, status: MicStatus) {
        if self.status != status {
            debug!("mic: {:?} -> {:?}", self.status, status);
            self.status = status.clone();
            let _ = self.events.send(AppEvent::MicStateChanged(status));
        }
    }

    /// Turn the microphone on and renegotiate every link. With no links yet,
    /// announce ourselves instead.
    pub async fn enable(&mut self, negotiator: &mut Negotiator) -> Vec<RoomEvent> {
        if self.capture.is_none() {
            self.set_status(MicStatus::Starting);
            match self.audio.open_capture() {
                Ok(stream) => self.capture = Some(stream),
                Err(e) => {
                    warn!("Microphone capture failed: {}", e);
                    self.set_status(MicStatus::Error(e.to_string()));
                    return Vec::new();
                }
            }
        }
        self.set_status(MicStatus::Active);
        info!("Microphone enabled");

        if negotiator.registry().is_empty() {
            return vec![negotiator.join_notice()];
        }
        let track = self.track.clone();
        self.fan_out(negotiator, Some(track)).await
    }

    /// Release the device and switch every link to receive-only.
    pub async fn disable(&mut self, negotiator: &mut Negotiator) -> Vec<RoomEvent> {
        let was_live = self.stop_capture();
        if !was_live {
            return Vec::new();
        }
        info!("Microphone disabled");
        self.fan_out(negotiator, None).await
    }

    /// Drop the capture stream; true if one was held.
    pub fn stop_capture(&mut self) -> bool {
        let was_live = self.capture.take().is_some();
        if was_live || self.status != MicStatus::Idle {
            self.set_status(MicStatus::Idle);
        }
        was_live
    }

    async fn fan_out(
        &self,
        negotiator: &mut Negotiator,
        track: Option<LocalAudioTrack>,
    ) -> Vec<RoomEvent> {
        let mut offers = Vec::new();
        for peer_id in negotiator.registry().peer_ids() {
            let Some(connection) = negotiator
                .registry()
                .get(&peer_id)
                .map(|link| link.connection.clone())
            else {
                continue;
            };
            match connection.set_outbound_audio(track.clone()).await {
                Ok(OutboundAudio::Unchanged) => continue,
                Ok(change) => debug!("mic on {}: {:?}", peer_id, change),
                Err(e) => {
                    warn!("Failed to update outbound audio for {}: {}", peer_id, e);
                    continue;
                }
            }
            if let Some(offer) = negotiator.offer(&peer_id).await {
                offers.push(offer);
            }
        }
        offers
    }

    /// Next encoded frame from the microphone; pending while it is off.
    pub async fn next_packet(&mut self) -> Option<Vec<u8>> {
        match self.capture.as_mut() {
            Some(stream) => stream.packets.recv().await,
            None => std::future::pending().await,
        }
    }

    pub async fn write_packet(&self, opus: Vec<u8>) {
        let sample = Sample {
            data: opus.into(),
            duration: Duration::from_millis(20),
            ..Default::default()
        };
        if let Err(e) = self.track.write_sample(&sample).await {
            debug!("Failed to write audio sample: {}", e);
        }
    }

    /// Capture ended underneath us (device unplugged).
    pub fn on_capture_lost(&mut self) {
        if self.capture.take().is_some() {
            warn!("Microphone capture ended unexpectedly");
            self.set_status(MicStatus::Error("microphone stream ended".into()));
        }
    }
}
