//! Peer-to-peer voice mesh: one connection per remote member, negotiated
//! over the room channel.

pub mod audio;
#[cfg(feature = "audio-io")]
pub mod codec;
pub mod mic;
pub mod peer;
pub mod registry;
pub mod remote;
pub mod signaling;

pub use audio::{AudioBackend, AudioSink, CaptureStream, NullAudio};
pub use mic::{MicController, MicStatus};
pub use peer::{
    new_local_audio_track, InboundAudio, LinkState, LocalAudioTrack, OutboundAudio,
    PeerConnection, PeerConnector, PeerEvent, RtcConnector,
};
pub use registry::{PeerLink, PeerRegistry};
pub use remote::RemoteAudio;
pub use signaling::{LinkChange, Negotiator};
