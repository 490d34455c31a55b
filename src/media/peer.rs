use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as WrtcMediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::SignalError;
use crate::models::{IceCandidate, SdpKind, SessionDescription};

/// The session's outbound microphone track, shared by every peer link.
pub type LocalAudioTrack = Arc<TrackLocalStaticSample>;

/// Create the Opus track the microphone writes into.
pub fn new_local_audio_track(stream_id: &str) -> LocalAudioTrack {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 1,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        "audio-track".to_string(),
        stream_id.to_string(),
    ))
}

/// Connection state of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => LinkState::Connecting,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
            _ => LinkState::New,
        }
    }
}

/// What `set_outbound_audio` did to the link's audio sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundAudio {
    /// An existing sender now carries the track.
    Replaced,
    /// The track was attached to the link for the first time.
    Added,
    /// The sender was emptied and the transceiver set to receive-only.
    Cleared,
    Unchanged,
}

/// Source of Opus payloads received from a remote peer.
#[async_trait]
pub trait InboundAudio: Send + Sync {
    /// Next non-empty payload, or `None` once the track has ended.
    async fn next_payload(&self) -> Option<Vec<u8>>;
}

#[async_trait]
impl InboundAudio for TrackRemote {
    async fn next_payload(&self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 4096];
        loop {
            match self.read(&mut buf).await {
                Ok((rtp_packet, _attributes)) => {
                    if rtp_packet.payload.is_empty() {
                        continue;
                    }
                    return Some(rtp_packet.payload.to_vec());
                }
                Err(e) => {
                    debug!("Remote track read ended: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Events emitted by peer connections back to the room session.
pub enum PeerEvent {
    ConnectionStateChanged {
        peer_id: String,
        state: LinkState,
    },
    /// Received an audio track from a remote peer.
    RemoteTrack {
        peer_id: String,
        track: Arc<dyn InboundAudio>,
    },
    /// ICE candidate gathered; must be sent to that peer only.
    IceCandidate {
        peer_id: String,
        candidate: IceCandidate,
    },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::ConnectionStateChanged { peer_id, state } => f
                .debug_struct("ConnectionStateChanged")
                .field("peer_id", peer_id)
                .field("state", state)
                .finish(),
            PeerEvent::RemoteTrack { peer_id, .. } => f
                .debug_struct("RemoteTrack")
                .field("peer_id", peer_id)
                .finish_non_exhaustive(),
            PeerEvent::IceCandidate { peer_id, candidate } => f
                .debug_struct("IceCandidate")
                .field("peer_id", peer_id)
                .field("candidate", candidate)
                .finish(),
        }
    }
}

/// One direct connection to a remote peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Make sure audio can be received even while the local mic is off.
    async fn ensure_audio_receiver(&self) -> Result<(), SignalError>;

    /// Put `track` on the link's single audio sender, or clear it with `None`.
    async fn set_outbound_audio(
        &self,
        track: Option<LocalAudioTrack>,
    ) -> Result<OutboundAudio, SignalError>;

    /// Create an offer and set it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, SignalError>;

    /// Create an answer and set it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, SignalError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SignalError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalError>;

    async fn close(&self) -> Result<(), SignalError>;
}

/// Opens peer connections whose callbacks report into `events`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(
        &self,
        peer_id: &str,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, SignalError>;
}

/// webrtc-rs backed connector.
pub struct RtcConnector {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, SignalError> {
        let mut media_engine = WrtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SignalError::Connection(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            SignalError::Connection(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn open(
        &self,
        peer_id: &str,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, SignalError> {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(|e| {
            SignalError::Connection(format!("Failed to create peer connection: {}", e))
        })?);

        let pid = peer_id.to_string();

        // Connection state change
        let event_tx_state = events.clone();
        let pid_state = pid.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = event_tx_state.clone();
            let pid = pid_state.clone();
            Box::pin(async move {
                info!("WebRTC connection to {} state: {}", pid, state);
                let _ = tx
                    .send(PeerEvent::ConnectionStateChanged {
                        peer_id: pid,
                        state: state.into(),
                    })
                    .await;
            })
        }));

        // On track (remote audio)
        let event_tx_track = events.clone();
        let pid_track = pid.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = event_tx_track.clone();
            let pid = pid_track.clone();
            Box::pin(async move {
                if track.kind() == RTPCodecType::Audio {
                    info!("Received remote audio track from {}", pid);
                    let _ = tx
                        .send(PeerEvent::RemoteTrack {
                            peer_id: pid,
                            track,
                        })
                        .await;
                }
            })
        }));

        // ICE candidate gathering
        let event_tx_ice = events;
        let pid_ice = pid.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = event_tx_ice.clone();
            let pid = pid_ice.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!("Failed to serialize ICE candidate: {}", e);
                        return;
                    }
                };
                let _ = tx
                    .send(PeerEvent::IceCandidate {
                        peer_id: pid,
                        candidate: IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        },
                    })
                    .await;
            })
        }));

        info!("Created WebRTC peer connection for {}", peer_id);
        Ok(Arc::new(RtcPeer {
            peer_id: pid,
            pc,
            rtcp_reader: AtomicBool::new(false),
        }))
    }
}

struct RtcPeer {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    rtcp_reader: AtomicBool,
}

impl RtcPeer {
    /// The link's audio transceiver, created receive-only on first use.
    async fn audio_transceiver(&self) -> Result<Arc<RTCRtpTransceiver>, SignalError> {
        for transceiver in self.pc.get_transceivers().await {
            if transceiver.kind() == RTPCodecType::Audio {
                return Ok(transceiver);
            }
        }
        let transceiver = self
            .pc
            .add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| SignalError::Connection(format!("Failed to add audio transceiver: {}", e)))?;
        debug!("Added receive-only audio transceiver for {}", self.peer_id);
        Ok(transceiver)
    }

    // Drains RTCP for the sender; the read blocks until the sender starts.
    fn spawn_rtcp_reader(&self, sender: Arc<RTCRtpSender>) {
        if self.rtcp_reader.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
    }
}

fn same_track(current: &Arc<dyn TrackLocal + Send + Sync>, track: &LocalAudioTrack) -> bool {
    Arc::as_ptr(current) as *const () == Arc::as_ptr(track) as *const ()
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn ensure_audio_receiver(&self) -> Result<(), SignalError> {
        self.audio_transceiver().await.map(|_| ())
    }

    async fn set_outbound_audio(
        &self,
        track: Option<LocalAudioTrack>,
    ) -> Result<OutboundAudio, SignalError> {
        let transceiver = self.audio_transceiver().await?;
        let sender = transceiver.sender().await;
        let current = sender.track().await;

        let change = match (&track, &current) {
            (Some(track), Some(current)) if same_track(current, track) => {
                return Ok(OutboundAudio::Unchanged)
            }
            (None, None) => return Ok(OutboundAudio::Unchanged),
            (Some(_), Some(_)) => OutboundAudio::Replaced,
            (Some(_), None) => OutboundAudio::Added,
            (None, Some(_)) => OutboundAudio::Cleared,
        };

        let direction = if track.is_some() {
            RTCRtpTransceiverDirection::Sendrecv
        } else {
            RTCRtpTransceiverDirection::Recvonly
        };
        sender
            .replace_track(track.map(|t| t as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| SignalError::Connection(format!("Failed to replace track: {}", e)))?;
        transceiver.set_direction(direction).await;

        if change != OutboundAudio::Cleared {
            self.spawn_rtcp_reader(sender);
        }
        Ok(change)
    }

    async fn create_offer(&self) -> Result<SessionDescription, SignalError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| SignalError::Sdp(format!("Failed to create offer: {}", e)))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| SignalError::Sdp(format!("Failed to set local description: {}", e)))?;
        info!("Created WebRTC offer for peer {}", self.peer_id);
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SignalError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| SignalError::Sdp(format!("Failed to create answer: {}", e)))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| SignalError::Sdp(format!("Failed to set local description: {}", e)))?;
        info!("Created WebRTC answer for peer {}", self.peer_id);
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SignalError> {
        let parsed = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| SignalError::Sdp(format!("Failed to parse SDP: {}", e)))?;
        self.pc
            .set_remote_description(parsed)
            .await
            .map_err(|e| SignalError::Sdp(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| SignalError::Ice(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<(), SignalError> {
        self.pc
            .close()
            .await
            .map_err(|e| SignalError::Connection(format!("Error closing peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_connection_states() {
        assert_eq!(LinkState::from(RTCPeerConnectionState::Connected), LinkState::Connected);
        assert_eq!(LinkState::from(RTCPeerConnectionState::Failed), LinkState::Failed);
        assert_eq!(LinkState::from(RTCPeerConnectionState::Unspecified), LinkState::New);
    }

    #[test]
    fn local_track_is_audio() {
        let track = new_local_audio_track("room");
        assert_eq!(track.stream_id(), "room");
        assert_eq!(track.kind(), RTPCodecType::Audio);
    }

    fn audio_sections(sdp: &str) -> usize {
        sdp.lines().filter(|l| l.starts_with("m=audio")).count()
    }

    #[tokio::test]
    async fn mic_toggles_reuse_the_audio_transceiver() {
        let connector = RtcConnector::new(Vec::new()).unwrap();
        let (tx, _rx) = mpsc::channel(64);
        let link = connector.open("peer", tx).await.unwrap();
        let track = new_local_audio_track("room");

        link.ensure_audio_receiver().await.unwrap();
        link.ensure_audio_receiver().await.unwrap();
        let offer = link.create_offer().await.unwrap();
        assert_eq!(audio_sections(&offer.sdp), 1);
        assert!(offer.sdp.contains("a=recvonly"));

        let expected = [
            (true, OutboundAudio::Added),
            (true, OutboundAudio::Unchanged),
            (false, OutboundAudio::Cleared),
            (false, OutboundAudio::Unchanged),
            (true, OutboundAudio::Added),
            (false, OutboundAudio::Cleared),
            (true, OutboundAudio::Added),
        ];
        for (enabled, change) in expected {
            let outbound = enabled.then(|| track.clone());
            assert_eq!(link.set_outbound_audio(outbound).await.unwrap(), change);
            let offer = link.create_offer().await.unwrap();
            assert_eq!(audio_sections(&offer.sdp), 1, "mic {enabled}");
            let direction = if enabled { "a=sendrecv" } else { "a=recvonly" };
            assert!(offer.sdp.contains(direction), "mic {enabled}");
        }

        link.close().await.unwrap();
    }
}
