#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use cowatch_lib::config::Config;
use cowatch_lib::error::{CaptureError, SignalError, TransportError};
use cowatch_lib::events::{create_event_bus, AppEvent, EventReceiver};
use cowatch_lib::media::{
    AudioBackend, AudioSink, CaptureStream, InboundAudio, LinkState, LocalAudioTrack,
    OutboundAudio, PeerConnection, PeerConnector, PeerEvent,
};
use cowatch_lib::models::{IceCandidate, PresenceMeta, RoomEvent, SdpKind, SessionDescription};
use cowatch_lib::network::{LocalBus, LocalHub, RoomTransport, TransportEvent};
use cowatch_lib::room::{RoomCommand, RoomIdentity, RoomSession, SessionParts};
use cowatch_lib::sync::{ManualClock, Player, VirtualPlayer};

pub const ROOM: &str = "MOVIE1";
pub const START_MS: i64 = 1_700_000_000_000;

// ============================================================
// Fake peer connections
// ============================================================

#[derive(Debug, Default)]
struct ConnState {
    local: Option<SdpKind>,
    remote: Option<SdpKind>,
    receivers: usize,
    active_senders: usize,
    max_active_senders: usize,
    candidates: Vec<IceCandidate>,
    offers: usize,
    connected: bool,
    closed: bool,
}

/// Records every call; reports "connected" once both descriptions are set.
pub struct FakeConnection {
    pub peer_id: String,
    events: mpsc::Sender<PeerEvent>,
    state: Mutex<ConnState>,
}

impl FakeConnection {
    fn state(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.state.lock().unwrap()
    }

    pub fn active_senders(&self) -> usize {
        self.state().active_senders
    }

    pub fn max_active_senders(&self) -> usize {
        self.state().max_active_senders
    }

    pub fn receivers(&self) -> usize {
        self.state().receivers
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state().candidates.clone()
    }

    pub fn offers(&self) -> usize {
        self.state().offers
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn has_remote_description(&self) -> bool {
        self.state().remote.is_some()
    }

    fn gathered_candidate(&self) {
        let _ = self.events.try_send(PeerEvent::IceCandidate {
            peer_id: self.peer_id.clone(),
            candidate: IceCandidate {
                candidate: format!("candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host ufrag {}", self.peer_id),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        });
    }

    fn maybe_connected(&self) {
        let mut state = self.state();
        if state.connected || state.closed || state.local.is_none() || state.remote.is_none() {
            return;
        }
        state.connected = true;
        drop(state);
        let _ = self.events.try_send(PeerEvent::ConnectionStateChanged {
            peer_id: self.peer_id.clone(),
            state: LinkState::Connected,
        });
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn ensure_audio_receiver(&self) -> Result<(), SignalError> {
        let mut state = self.state();
        if state.receivers == 0 {
            state.receivers = 1;
        }
        Ok(())
    }

    async fn set_outbound_audio(
        &self,
        track: Option<LocalAudioTrack>,
    ) -> Result<OutboundAudio, SignalError> {
        let mut state = self.state();
        let change = match (track.is_some(), state.active_senders > 0) {
            (true, true) => OutboundAudio::Unchanged,
            (true, false) => {
                state.active_senders += 1;
                OutboundAudio::Added
            }
            (false, true) => {
                state.active_senders -= 1;
                OutboundAudio::Cleared
            }
            (false, false) => OutboundAudio::Unchanged,
        };
        state.max_active_senders = state.max_active_senders.max(state.active_senders);
        Ok(change)
    }

    async fn create_offer(&self) -> Result<SessionDescription, SignalError> {
        {
            let mut state = self.state();
            state.local = Some(SdpKind::Offer);
            state.offers += 1;
        }
        self.gathered_candidate();
        Ok(SessionDescription::offer(format!("v=0 offer from {}", self.peer_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SignalError> {
        {
            let mut state = self.state();
            if state.remote != Some(SdpKind::Offer) {
                return Err(SignalError::Sdp("no remote offer".into()));
            }
            state.local = Some(SdpKind::Answer);
        }
        self.gathered_candidate();
        self.maybe_connected();
        Ok(SessionDescription::answer(format!("v=0 answer for {}", self.peer_id)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SignalError> {
        {
            let mut state = self.state();
            if desc.kind == SdpKind::Answer && state.local != Some(SdpKind::Offer) {
                return Err(SignalError::Sdp("answer without a local offer".into()));
            }
            state.remote = Some(desc.kind);
        }
        if desc.kind == SdpKind::Answer {
            self.maybe_connected();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalError> {
        let mut state = self.state();
        if state.remote.is_none() {
            return Err(SignalError::Ice("remote description not set".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), SignalError> {
        self.state().closed = true;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    opened: Arc<Mutex<Vec<Arc<FakeConnection>>>>,
}

impl FakeConnector {
    /// Every connection ever opened to `peer_id`, oldest first.
    pub fn connections(&self, peer_id: &str) -> Vec<Arc<FakeConnection>> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.peer_id == peer_id)
            .cloned()
            .collect()
    }

    pub fn latest(&self, peer_id: &str) -> Arc<FakeConnection> {
        self.connections(peer_id)
            .pop()
            .unwrap_or_else(|| panic!("no connection to {peer_id}"))
    }

    pub fn opened_to(&self, peer_id: &str) -> usize {
        self.connections(peer_id).len()
    }

    pub fn all(&self) -> Vec<Arc<FakeConnection>> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn open(
        &self,
        peer_id: &str,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, SignalError> {
        let connection = Arc::new(FakeConnection {
            peer_id: peer_id.to_string(),
            events,
            state: Mutex::new(ConnState::default()),
        });
        self.opened.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

// ============================================================
// Fake audio devices
// ============================================================

/// Capture always works and never yields packets; output can be blocked.
#[derive(Clone, Default)]
pub struct FakeAudio {
    output_blocked: Arc<AtomicBool>,
    captures_open: Arc<Mutex<usize>>,
}

struct CaptureGuard {
    _keepalive: mpsc::Sender<Vec<u8>>,
    open: Arc<Mutex<usize>>,
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        *self.open.lock().unwrap() -= 1;
    }
}

struct NullSink;

impl AudioSink for NullSink {
    fn push(&mut self, _opus: &[u8]) {}
}

impl FakeAudio {
    pub fn block_output(&self, blocked: bool) {
        self.output_blocked.store(blocked, Ordering::SeqCst);
    }

    /// Capture streams currently held by sessions.
    pub fn captures_open(&self) -> usize {
        *self.captures_open.lock().unwrap()
    }
}

impl AudioBackend for FakeAudio {
    fn open_capture(&self) -> Result<CaptureStream, CaptureError> {
        let (tx, rx) = mpsc::channel(8);
        *self.captures_open.lock().unwrap() += 1;
        Ok(CaptureStream::new(
            rx,
            CaptureGuard {
                _keepalive: tx,
                open: self.captures_open.clone(),
            },
        ))
    }

    fn open_output(&self, _peer_id: &str) -> Result<Box<dyn AudioSink>, CaptureError> {
        if self.output_blocked.load(Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied);
        }
        Ok(Box::new(NullSink))
    }
}

/// A remote track that stays silent until dropped.
pub struct SilentTrack;

#[async_trait]
impl InboundAudio for SilentTrack {
    async fn next_payload(&self) -> Option<Vec<u8>> {
        std::future::pending().await
    }
}

// ============================================================
// Lossy channel
// ============================================================

/// A `LocalBus` that silently loses its first `webrtc-join` broadcasts, as
/// a freshly subscribed gossip node does before it has any topic peers.
pub struct DroppingJoins {
    inner: LocalBus,
    remaining: AtomicUsize,
}

#[async_trait]
impl RoomTransport for DroppingJoins {
    async fn subscribe(
        &self,
        room: &str,
        presence: PresenceMeta,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        self.inner.subscribe(room, presence).await
    }

    async fn publish(&self, room: &str, event: RoomEvent) -> Result<(), TransportError> {
        if matches!(event, RoomEvent::WebrtcJoin(_))
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Ok(());
        }
        self.inner.publish(room, event).await
    }

    async fn track(&self, room: &str, presence: PresenceMeta) -> Result<(), TransportError> {
        self.inner.track(room, presence).await
    }

    async fn unsubscribe(&self, room: &str) -> Result<(), TransportError> {
        self.inner.unsubscribe(room).await
    }
}

// ============================================================
// Room members over a LocalHub
// ============================================================

pub fn test_config() -> Config {
    Config::default()
}

pub struct Member {
    pub session: RoomSession,
    pub rx: mpsc::Receiver<TransportEvent>,
    pub peer_rx: mpsc::Receiver<PeerEvent>,
    pub connector: FakeConnector,
    pub audio: FakeAudio,
    pub events: EventReceiver,
}

impl Member {
    pub fn id(&self) -> String {
        self.session.self_id().to_string()
    }

    pub async fn command(&mut self, command: RoomCommand) {
        self.session.handle_command(command).await;
    }

    pub fn player_time(&self) -> f64 {
        self.session.player().current_time()
    }

    /// Everything emitted on the app event bus so far.
    pub fn drain_events(&mut self) -> Vec<AppEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub struct MemberBuilder<'a> {
    hub: &'a LocalHub,
    clock: &'a Arc<ManualClock>,
    id: String,
    host: bool,
    ready: bool,
    lost_joins: usize,
    config: Config,
}

impl<'a> MemberBuilder<'a> {
    pub fn new(hub: &'a LocalHub, clock: &'a Arc<ManualClock>, id: &str) -> Self {
        Self {
            hub,
            clock,
            id: id.to_string(),
            host: false,
            ready: true,
            lost_joins: 0,
            config: test_config(),
        }
    }

    pub fn host(mut self) -> Self {
        self.host = true;
        self
    }

    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    /// Lose this member's first `count` join announcements.
    pub fn losing_joins(mut self, count: usize) -> Self {
        self.lost_joins = count;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Build the session, mark its player ready if asked, and subscribe.
    pub async fn attach(self) -> Member {
        let connector = FakeConnector::default();
        let audio = FakeAudio::default();
        let (mut session, peer_rx, events) = self.build(connector.clone(), audio.clone()).await;
        let rx = session.attach().await.expect("attach");
        Member {
            session,
            rx,
            peer_rx,
            connector,
            audio,
            events,
        }
    }

    /// A session that has not subscribed yet, for `run_room_session`.
    pub async fn detached(self) -> (RoomSession, mpsc::Receiver<PeerEvent>, EventReceiver) {
        self.build(FakeConnector::default(), FakeAudio::default()).await
    }

    async fn build(
        self,
        connector: FakeConnector,
        audio: FakeAudio,
    ) -> (RoomSession, mpsc::Receiver<PeerEvent>, EventReceiver) {
        let (events_tx, events) = create_event_bus();
        let transport: Arc<dyn RoomTransport> = if self.lost_joins > 0 {
            Arc::new(DroppingJoins {
                inner: self.hub.connect(),
                remaining: AtomicUsize::new(self.lost_joins),
            })
        } else {
            Arc::new(self.hub.connect())
        };
        let parts = SessionParts {
            transport,
            connector: Arc::new(connector.clone()),
            audio: Arc::new(audio.clone()),
            clock: self.clock.clone(),
            player: Box::new(VirtualPlayer::new(self.clock.clone())),
            events: events_tx,
        };
        let identity = RoomIdentity::new(ROOM, format!("user-{}", self.id), self.host)
            .with_client_id(self.id.clone());
        let (mut session, peer_rx) = RoomSession::new(identity, self.config, parts);
        if self.ready {
            session.handle_command(RoomCommand::PlayerReady).await;
        }
        (session, peer_rx, events)
    }
}

/// Deliver queued channel traffic and peer-connection events until every
/// member is idle.
pub async fn pump(members: &mut [&mut Member]) {
    for _ in 0..1_000 {
        let mut progressed = false;
        for member in members.iter_mut() {
            while let Ok(event) = member.rx.try_recv() {
                member.session.dispatch(event).await;
                progressed = true;
            }
            while let Ok(event) = member.peer_rx.try_recv() {
                member.session.on_peer_event(event).await;
                progressed = true;
            }
        }
        if !progressed {
            return;
        }
    }
    panic!("room traffic did not settle");
}

pub fn clock() -> Arc<ManualClock> {
    ManualClock::new(START_MS)
}
