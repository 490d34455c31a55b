use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::sync::record::{MediaSelection, MediaType, PlaybackRecord};

// ============================================================
// Presence
// ============================================================

/// Metadata a member tracks on the channel's presence layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub name: String,
    pub id: String,
}

// ============================================================
// WebRTC signaling payload pieces (browser-compatible JSON)
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

// ============================================================
// Room event payloads
// ============================================================

/// Coarse pause/resume notice sent by the host alongside `playback_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackNotice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStateNet {
    pub from: String,
    pub is_playing: bool,
    pub last_known_time: f64,
    pub last_update_timestamp: i64,
    #[serde(default = "default_rate")]
    pub playback_rate: f64,
}

impl PlaybackStateNet {
    pub fn new(from: impl Into<String>, record: &PlaybackRecord) -> Self {
        Self {
            from: from.into(),
            is_playing: record.is_playing,
            last_known_time: record.last_known_time,
            last_update_timestamp: record.last_update_timestamp,
            playback_rate: record.playback_rate,
        }
    }

    pub fn record(&self) -> PlaybackRecord {
        PlaybackRecord {
            is_playing: self.is_playing,
            last_known_time: self.last_known_time,
            last_update_timestamp: self.last_update_timestamp,
            playback_rate: self.playback_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRequestNet {
    pub from: String,
    pub request_id: String,
}

/// Full room state: either a reply to a `state_request` or a periodic broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSyncNet {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub is_response_to_request: bool,
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
    pub is_playing: bool,
    pub last_known_time: f64,
    pub last_update_timestamp: i64,
    #[serde(default = "default_rate")]
    pub playback_rate: f64,
}

impl StateSyncNet {
    pub fn new(
        from: impl Into<String>,
        request_id: Option<String>,
        record: &PlaybackRecord,
        selection: Option<&MediaSelection>,
    ) -> Self {
        Self {
            from: from.into(),
            is_response_to_request: request_id.is_some(),
            request_id,
            paused: !record.is_playing,
            media_type: selection.map(|s| s.media_type),
            season: selection.and_then(|s| s.season),
            episode: selection.and_then(|s| s.episode),
            is_playing: record.is_playing,
            last_known_time: record.last_known_time,
            last_update_timestamp: record.last_update_timestamp,
            playback_rate: record.playback_rate,
        }
    }

    pub fn record(&self) -> PlaybackRecord {
        PlaybackRecord {
            is_playing: self.is_playing,
            last_known_time: self.last_known_time,
            last_update_timestamp: self.last_update_timestamp,
            playback_rate: self.playback_rate,
        }
    }

    pub fn selection(&self) -> Option<MediaSelection> {
        self.media_type.map(|media_type| MediaSelection {
            media_type,
            season: self.season,
            episode: self.episode,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChangeNet {
    pub from: String,
    pub name: String,
    pub media_type: MediaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
}

impl MediaChangeNet {
    pub fn selection(&self) -> MediaSelection {
        MediaSelection {
            media_type: self.media_type,
            season: self.season,
            episode: self.episode,
        }
    }
}

/// `{from}` only: join, leave and room-closed notices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNotice {
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpNet {
    pub from: String,
    pub to: String,
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceNet {
    pub from: String,
    pub to: String,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatNet {
    pub id: String,
    pub from: String,
    pub name: String,
    pub message: String,
    #[serde(default = "default_tone")]
    pub tone: String,
}

fn default_rate() -> f64 {
    1.0
}

fn default_tone() -> String {
    "default".to_string()
}

// ============================================================
// Room events (over the broadcast channel)
// ============================================================

/// Every event that travels over a room's broadcast channel, as `{type, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RoomEvent {
    #[serde(rename = "playback")]
    Playback(PlaybackNotice),
    #[serde(rename = "playback_state")]
    PlaybackState(PlaybackStateNet),
    #[serde(rename = "state_request")]
    StateRequest(StateRequestNet),
    #[serde(rename = "state_sync")]
    StateSync(StateSyncNet),
    #[serde(rename = "media_change")]
    MediaChange(MediaChangeNet),
    #[serde(rename = "webrtc-join")]
    WebrtcJoin(PeerNotice),
    #[serde(rename = "webrtc-offer")]
    WebrtcOffer(SdpNet),
    #[serde(rename = "webrtc-answer")]
    WebrtcAnswer(SdpNet),
    #[serde(rename = "webrtc-ice")]
    WebrtcIce(IceNet),
    #[serde(rename = "webrtc-leave")]
    WebrtcLeave(PeerNotice),
    #[serde(rename = "chat")]
    Chat(ChatNet),
    #[serde(rename = "room_closed")]
    RoomClosed(PeerNotice),
}

impl RoomEvent {
    /// Decode and validate a frame received from the channel.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let event: RoomEvent = serde_json::from_slice(data)?;
        event.validate()?;
        Ok(event)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Wire name of the event, as used in the `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            RoomEvent::Playback(_) => "playback",
            RoomEvent::PlaybackState(_) => "playback_state",
            RoomEvent::StateRequest(_) => "state_request",
            RoomEvent::StateSync(_) => "state_sync",
            RoomEvent::MediaChange(_) => "media_change",
            RoomEvent::WebrtcJoin(_) => "webrtc-join",
            RoomEvent::WebrtcOffer(_) => "webrtc-offer",
            RoomEvent::WebrtcAnswer(_) => "webrtc-answer",
            RoomEvent::WebrtcIce(_) => "webrtc-ice",
            RoomEvent::WebrtcLeave(_) => "webrtc-leave",
            RoomEvent::Chat(_) => "chat",
            RoomEvent::RoomClosed(_) => "room_closed",
        }
    }

    /// Client id of the sender, when the payload carries one.
    pub fn sender(&self) -> Option<&str> {
        match self {
            RoomEvent::Playback(p) => p.from.as_deref(),
            RoomEvent::PlaybackState(p) => Some(&p.from),
            RoomEvent::StateRequest(p) => Some(&p.from),
            RoomEvent::StateSync(p) => Some(&p.from),
            RoomEvent::MediaChange(p) => Some(&p.from),
            RoomEvent::WebrtcJoin(p) | RoomEvent::WebrtcLeave(p) | RoomEvent::RoomClosed(p) => {
                Some(&p.from)
            }
            RoomEvent::WebrtcOffer(p) | RoomEvent::WebrtcAnswer(p) => Some(&p.from),
            RoomEvent::WebrtcIce(p) => Some(&p.from),
            RoomEvent::Chat(p) => Some(&p.from),
        }
    }

    /// Addressee of a peer-to-peer message; `None` for room-wide broadcasts.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            RoomEvent::WebrtcOffer(p) | RoomEvent::WebrtcAnswer(p) => Some(&p.to),
            RoomEvent::WebrtcIce(p) => Some(&p.to),
            _ => None,
        }
    }

    /// Shape checks applied to every inbound event.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(from) = self.sender() {
            non_empty("from", from)?;
        }
        match self {
            RoomEvent::PlaybackState(p) => {
                check_time("lastKnownTime", p.last_known_time)?;
                check_rate(p.playback_rate)?;
                check_timestamp(p.last_update_timestamp)
            }
            RoomEvent::StateSync(p) => {
                check_time("lastKnownTime", p.last_known_time)?;
                check_rate(p.playback_rate)?;
                check_timestamp(p.last_update_timestamp)?;
                if p.is_response_to_request && p.request_id.is_none() {
                    return Err(ProtocolError::invalid(
                        "requestId",
                        "missing on a response to a state request",
                    ));
                }
                Ok(())
            }
            RoomEvent::StateRequest(p) => non_empty("requestId", &p.request_id),
            RoomEvent::WebrtcOffer(p) => {
                non_empty("to", &p.to)?;
                expect_kind(&p.sdp, SdpKind::Offer)
            }
            RoomEvent::WebrtcAnswer(p) => {
                non_empty("to", &p.to)?;
                expect_kind(&p.sdp, SdpKind::Answer)
            }
            RoomEvent::WebrtcIce(p) => non_empty("to", &p.to),
            RoomEvent::Chat(p) => non_empty("id", &p.id),
            _ => Ok(()),
        }
    }
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        return Err(ProtocolError::invalid(field, "must not be empty"));
    }
    Ok(())
}

fn check_time(field: &'static str, value: f64) -> Result<(), ProtocolError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ProtocolError::invalid(field, format!("{value} is not a playback position")));
    }
    Ok(())
}

fn check_rate(rate: f64) -> Result<(), ProtocolError> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(ProtocolError::invalid("playbackRate", format!("{rate} must be positive")));
    }
    Ok(())
}

fn check_timestamp(ts: i64) -> Result<(), ProtocolError> {
    if ts < 0 {
        return Err(ProtocolError::invalid("lastUpdateTimestamp", "must not be negative"));
    }
    Ok(())
}

fn expect_kind(desc: &SessionDescription, kind: SdpKind) -> Result<(), ProtocolError> {
    if desc.kind != kind {
        return Err(ProtocolError::invalid("sdp", format!("expected {kind:?}, got {:?}", desc.kind)));
    }
    non_empty("sdp", &desc.sdp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_browser_playback_state() {
        let raw = br#"{"type":"playback_state","payload":{"from":"c1","isPlaying":true,"lastKnownTime":12.5,"lastUpdateTimestamp":1700000000000,"playbackRate":1}}"#;
        let event = RoomEvent::decode(raw).unwrap();
        match &event {
            RoomEvent::PlaybackState(p) => {
                assert!(p.is_playing);
                assert_eq!(p.last_known_time, 12.5);
                assert_eq!(p.record().last_update_timestamp, 1_700_000_000_000);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(event.sender(), Some("c1"));
        assert_eq!(event.recipient(), None);
    }

    #[test]
    fn playback_rate_defaults_to_one() {
        let raw = br#"{"type":"playback_state","payload":{"from":"c1","isPlaying":false,"lastKnownTime":3,"lastUpdateTimestamp":5}}"#;
        match RoomEvent::decode(raw).unwrap() {
            RoomEvent::PlaybackState(p) => assert_eq!(p.playback_rate, 1.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_negative_position() {
        let raw = br#"{"type":"playback_state","payload":{"from":"c1","isPlaying":true,"lastKnownTime":-1,"lastUpdateTimestamp":5}}"#;
        let err = RoomEvent::decode(raw).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField { field: "lastKnownTime", .. }));
    }

    #[test]
    fn rejects_missing_required_field() {
        let raw = br#"{"type":"webrtc-offer","payload":{"from":"a","sdp":{"type":"offer","sdp":"v=0"}}}"#;
        assert!(matches!(RoomEvent::decode(raw), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn rejects_answer_sent_as_offer() {
        let raw = br#"{"type":"webrtc-offer","payload":{"from":"a","to":"b","sdp":{"type":"answer","sdp":"v=0"}}}"#;
        assert!(matches!(
            RoomEvent::decode(raw),
            Err(ProtocolError::InvalidField { field: "sdp", .. })
        ));
    }

    #[test]
    fn response_without_request_id_is_rejected() {
        let raw = br#"{"type":"state_sync","payload":{"from":"a","isResponseToRequest":true,"paused":true,"isPlaying":false,"lastKnownTime":1,"lastUpdateTimestamp":1}}"#;
        assert!(RoomEvent::decode(raw).is_err());
    }

    #[test]
    fn ice_candidate_uses_browser_field_names() {
        let event = RoomEvent::WebrtcIce(IceNet {
            from: "a".into(),
            to: "b".into(),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        });
        let json: serde_json::Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "webrtc-ice");
        assert_eq!(json["payload"]["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(json["payload"]["candidate"]["sdpMid"], "0");
        assert_eq!(event.recipient(), Some("b"));
    }

    #[test]
    fn legacy_playback_notice_has_optional_sender() {
        let event = RoomEvent::decode(br#"{"type":"playback","payload":{"paused":true}}"#).unwrap();
        assert_eq!(event.sender(), None);
        assert_eq!(event.name(), "playback");
    }

    #[test]
    fn state_sync_round_trips_selection() {
        let record = PlaybackRecord::paused_at(42.3, 10);
        let selection = MediaSelection::episode(2, 5);
        let sync = StateSyncNet::new("h", Some("r1".into()), &record, Some(&selection));
        assert!(sync.is_response_to_request);
        assert!(sync.paused);
        assert_eq!(sync.selection(), Some(selection));
        assert_eq!(sync.record(), record);
    }
}
