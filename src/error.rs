use std::path::PathBuf;

use thiserror::Error;

/// Malformed or out-of-shape frames received from the channel.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to decode room event: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ProtocolError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Failures while negotiating or driving a single peer connection.
/// These never escape the per-peer boundary; callers log and move on.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("session description error: {0}")]
    Sdp(String),
    #[error("ICE candidate error: {0}")]
    Ice(String),
    #[error("peer connection error: {0}")]
    Connection(String),
    #[error("no peer link for {0}")]
    UnknownPeer(String),
}

/// Local audio device failures. The `Display` text is shown next to the mic control.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("no audio device available")]
    NoDevice,
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("audio devices are not available in this build")]
    Unavailable,
    #[error("audio device error: {0}")]
    Device(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel transport closed")]
    Closed,
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}
