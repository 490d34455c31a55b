use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::TransportError;
use crate::events::{AppEvent, EventSender};
use crate::media::{
    new_local_audio_track, AudioBackend, LinkChange, MicController, MicStatus, Negotiator,
    PeerConnector, PeerEvent, PeerRegistry, RemoteAudio,
};
use crate::models::{
    ChatNet, MediaChangeNet, PeerNotice, PlaybackNotice, PlaybackStateNet, PresenceMeta,
    RoomEvent, StateRequestNet, StateSyncNet,
};
use crate::network::{RoomTransport, TransportEvent};
use crate::sync::{
    DeadlineAction, MediaSelection, PlaybackRecord, PlaybackSync, Player, PlayerAction,
    ReconcileOutcome, Reconciler, ReplyVerdict, SharedClock,
};

use super::chat::{ChatEntry, ChatLog};
use super::{PeerSummary, RoomCommand, RoomIdentity, RoomSnapshot};

const PEER_EVENT_QUEUE: usize = 256;

/// Collaborators a session is built from.
pub struct SessionParts {
    pub transport: Arc<dyn RoomTransport>,
    pub connector: Arc<dyn PeerConnector>,
    pub audio: Arc<dyn AudioBackend>,
    pub clock: SharedClock,
    pub player: Box<dyn Player>,
    pub events: EventSender,
}

fn new_reconciler(config: &Config) -> Reconciler {
    Reconciler::new(
        config.sync.state_request_timeout_ms,
        config.sync.state_request_retries,
        config.sync.reply_window_ms,
    )
}

fn new_chat_log(config: &Config) -> ChatLog {
    ChatLog::new(config.chat.max_entries, config.chat.notice_dedup_window_ms)
}

/// Last player change driven by a remote record.
#[derive(Debug, Clone, Copy)]
struct AppliedRemote {
    at_ms: i64,
}

/// All state of one client in one room.
///
/// Inbound traffic enters through `dispatch` (channel) and `on_peer_event`
/// (peer connections); the UI drives it through `handle_command`. Every
/// outbound broadcast is best-effort: failures are logged and dropped.
pub struct RoomSession {
    identity: RoomIdentity,
    config: Config,
    clock: SharedClock,
    transport: Arc<dyn RoomTransport>,
    player: Box<dyn Player>,
    sync: PlaybackSync,
    reconciler: Reconciler,
    negotiator: Negotiator,
    mic: MicController,
    remote_audio: RemoteAudio,
    chat: ChatLog,
    members: BTreeMap<String, PresenceMeta>,
    media: Option<MediaSelection>,
    events: EventSender,
    attached: bool,
    applied_remote: Option<AppliedRemote>,
    last_join_notice_ms: i64,
}

impl RoomSession {
    /// Build a detached session. The returned receiver carries the events of
    /// every peer connection the session opens.
    pub fn new(
        identity: RoomIdentity,
        config: Config,
        parts: SessionParts,
    ) -> (Self, mpsc::Receiver<PeerEvent>) {
        let (peer_tx, peer_rx) = mpsc::channel(PEER_EVENT_QUEUE);
        let registry = PeerRegistry::new(parts.connector, peer_tx);
        let negotiator = Negotiator::new(identity.client_id.clone(), registry, parts.clock.clone());
        let track = new_local_audio_track(&identity.client_id);
        let mic = MicController::new(parts.audio.clone(), track, parts.events.clone());
        let remote_audio = RemoteAudio::new(parts.audio, parts.events.clone());

        let session = Self {
            sync: PlaybackSync::new(config.sync.drift_tolerance_secs),
            reconciler: new_reconciler(&config),
            chat: new_chat_log(&config),
            identity,
            config,
            clock: parts.clock,
            transport: parts.transport,
            player: parts.player,
            negotiator,
            mic,
            remote_audio,
            members: BTreeMap::new(),
            media: None,
            events: parts.events,
            attached: false,
            applied_remote: None,
            last_join_notice_ms: 0,
        };
        (session, peer_rx)
    }

    pub fn identity(&self) -> &RoomIdentity {
        &self.identity
    }

    pub fn self_id(&self) -> &str {
        &self.identity.client_id
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn player(&self) -> &dyn Player {
        self.player.as_ref()
    }

    pub fn player_mut(&mut self) -> &mut dyn Player {
        self.player.as_mut()
    }

    pub fn record(&self) -> Option<&PlaybackRecord> {
        self.sync.record()
    }

    pub fn media(&self) -> Option<&MediaSelection> {
        self.media.as_ref()
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn mic_status(&self) -> &MicStatus {
        self.mic.status()
    }

    pub fn members(&self) -> Vec<PresenceMeta> {
        self.members.values().cloned().collect()
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    pub fn is_reconciling(&self) -> bool {
        self.reconciler.is_pending()
    }

    /// Epoch millis at which `reconcile_tick` next has work to do.
    pub fn next_reconcile_deadline(&self) -> Option<i64> {
        self.reconciler.next_deadline()
    }

    fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.events.send(event);
    }

    async fn publish(&self, event: RoomEvent) {
        let name = event.name();
        if let Err(e) = self.transport.publish(&self.identity.room_code, event).await {
            warn!("Failed to broadcast {} in room {}: {}", name, self.identity.room_code, e);
        }
    }

    async fn publish_all(&self, events: Vec<RoomEvent>) {
        for event in events {
            self.publish(event).await;
        }
    }

    // ============================================================
    // Lifecycle
    // ============================================================

    /// Subscribe to the room channel. The join notice and the state request
    /// go out once the transport reports the subscription live.
    /// Room state always starts empty, so rejoining reconciles afresh.
    pub async fn attach(&mut self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let rx = self
            .transport
            .subscribe(&self.identity.room_code, self.identity.presence())
            .await?;
        self.reset_room_state();
        self.attached = true;
        info!(
            "Attached to room {} as {} ({})",
            self.identity.room_code, self.identity.display_name, self.identity.client_id
        );
        Ok(rx)
    }

    /// Leave the room: announce it, release the microphone, close every peer
    /// link and unsubscribe.
    pub async fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.publish(self.negotiator.leave_notice()).await;
        self.mic.stop_capture();
        self.remote_audio.stop_all();
        self.negotiator.close_all().await;
        if let Err(e) = self.transport.unsubscribe(&self.identity.room_code).await {
            warn!("Failed to unsubscribe from room {}: {}", self.identity.room_code, e);
        }
        self.attached = false;
        self.members.clear();
        info!("Detached from room {}", self.identity.room_code);
        self.emit(AppEvent::SessionEnded {
            room_code: self.identity.room_code.clone(),
        });
    }

    fn reset_room_state(&mut self) {
        self.sync = PlaybackSync::new(self.config.sync.drift_tolerance_secs);
        self.reconciler = new_reconciler(&self.config);
        self.chat = new_chat_log(&self.config);
        self.members.clear();
        self.media = None;
        self.applied_remote = None;
    }

    async fn on_subscribed(&mut self) {
        self.last_join_notice_ms = self.now();
        self.publish(self.negotiator.join_notice()).await;
        let request_id = self.reconciler.begin(self.now());
        info!("Requesting room state ({})", request_id);
        self.publish(RoomEvent::StateRequest(StateRequestNet {
            from: self.self_id().to_string(),
            request_id,
        }))
        .await;
    }

    // ============================================================
    // Inbound channel traffic
    // ============================================================

    /// Single entry point for everything the channel delivers.
    pub async fn dispatch(&mut self, event: TransportEvent) {
        if !self.attached {
            return;
        }
        match event {
            TransportEvent::Subscribed => self.on_subscribed().await,
            TransportEvent::PresenceJoin(meta) => self.on_presence_join(meta),
            TransportEvent::PresenceLeave(meta) => self.on_presence_leave(meta).await,
            TransportEvent::Message(message) => self.on_message(message).await,
        }
    }

    fn on_presence_join(&mut self, meta: PresenceMeta) {
        if self.members.insert(meta.id.clone(), meta.clone()).is_none() {
            info!("{} ({}) is in the room", meta.name, meta.id);
            self.emit(AppEvent::MemberJoined(meta));
        }
    }

    async fn on_presence_leave(&mut self, meta: PresenceMeta) {
        if self.members.remove(&meta.id).is_some() {
            info!("{} ({}) left the room", meta.name, meta.id);
            self.emit(AppEvent::MemberLeft(meta.clone()));
        }
        if meta.id != self.identity.client_id {
            self.drop_peer(&meta.id).await;
        }
    }

    async fn on_message(&mut self, event: RoomEvent) {
        if let Some(to) = event.recipient() {
            if to != self.identity.client_id {
                return;
            }
        }
        let from_self = event.sender() == Some(self.identity.client_id.as_str());
        if from_self && !matches!(event, RoomEvent::StateRequest(_) | RoomEvent::StateSync(_)) {
            return;
        }
        debug!("room {}: {}", self.identity.room_code, event.name());

        match event {
            RoomEvent::PlaybackState(p) => {
                self.sync.adopt(p.record());
                self.apply_record(&p.from);
            }
            RoomEvent::Playback(p) => self.on_playback_notice(p),
            RoomEvent::StateRequest(p) => self.on_state_request(p, from_self).await,
            RoomEvent::StateSync(p) => self.on_state_sync(p, from_self),
            RoomEvent::MediaChange(p) => self.on_media_change(p),
            RoomEvent::WebrtcJoin(p) => {
                let offer = self
                    .negotiator
                    .on_join(&p.from, self.mic.active_track())
                    .await;
                if let Some(offer) = offer {
                    self.publish(offer).await;
                }
            }
            RoomEvent::WebrtcOffer(p) => {
                let answer = self
                    .negotiator
                    .on_offer(&p.from, p.sdp, self.mic.active_track())
                    .await;
                if let Some(answer) = answer {
                    self.publish(answer).await;
                }
            }
            RoomEvent::WebrtcAnswer(p) => self.negotiator.on_answer(&p.from, p.sdp).await,
            RoomEvent::WebrtcIce(p) => self.negotiator.on_ice(&p.from, p.candidate).await,
            RoomEvent::WebrtcLeave(p) => self.drop_peer(&p.from).await,
            RoomEvent::Chat(p) => {
                let entry = ChatEntry::from_net(p, self.now());
                if self.chat.push(entry.clone()) {
                    self.emit(AppEvent::ChatMessage(entry));
                }
            }
            RoomEvent::RoomClosed(p) => self.on_room_closed(p).await,
        }
    }

    /// Coarse pause/resume from the host. Only acted on when it disagrees
    /// with the record we hold.
    fn on_playback_notice(&mut self, notice: PlaybackNotice) {
        let now = self.now();
        let agrees = self
            .sync
            .record()
            .is_some_and(|r| r.is_playing != notice.paused);
        if agrees {
            return;
        }
        let rate = self.sync.record().map_or(1.0, |r| r.playback_rate);
        let time = self
            .sync
            .expected_time(now)
            .unwrap_or_else(|| self.player.current_time());
        self.sync.adopt(PlaybackRecord {
            is_playing: !notice.paused,
            last_known_time: time,
            last_update_timestamp: now,
            playback_rate: rate,
        });
        let source = notice.from.unwrap_or_else(|| "host".to_string());
        self.apply_record(&source);
    }

    /// Answer a state request when we hold something worth handing over. Our
    /// own request is only answered from an agreed record.
    async fn on_state_request(&mut self, request: StateRequestNet, from_self: bool) {
        let meaningful = if from_self {
            self.sync.record().is_some()
        } else {
            self.sync.has_meaningful_state(self.player.is_ready())
        };
        if !meaningful {
            debug!("No state to offer for request {}", request.request_id);
            return;
        }
        let record = self.current_record();
        debug!("Answering state request {} from {}", request.request_id, request.from);
        self.publish(RoomEvent::StateSync(StateSyncNet::new(
            self.self_id(),
            Some(request.request_id),
            &record,
            self.media.as_ref(),
        )))
        .await;
    }

    fn on_state_sync(&mut self, sync: StateSyncNet, from_self: bool) {
        if !sync.is_response_to_request {
            if !from_self {
                self.adopt_full_state(&sync);
            }
            return;
        }
        let Some(request_id) = sync.request_id.as_deref() else {
            return;
        };
        let now = self.now();
        match self
            .reconciler
            .on_reply(request_id, sync.last_update_timestamp, now)
        {
            ReplyVerdict::Accept => {
                info!("Reconciled room state from {}", sync.from);
                self.adopt_full_state(&sync);
                self.emit(AppEvent::ReconciliationFinished {
                    outcome: ReconcileOutcome::Synced {
                        from: sync.from.clone(),
                    },
                });
            }
            ReplyVerdict::Ignore => debug!("Ignoring state reply {} from {}", request_id, sync.from),
        }
    }

    fn adopt_full_state(&mut self, sync: &StateSyncNet) {
        if let Some(selection) = sync.selection() {
            if self.media != Some(selection) {
                self.media = Some(selection);
                self.emit(AppEvent::MediaChanged {
                    selection,
                    from: sync.from.clone(),
                });
            }
        }
        self.sync.adopt(sync.record());
        self.apply_record(&sync.from);
    }

    fn on_media_change(&mut self, change: MediaChangeNet) {
        let selection = change.selection();
        self.media = Some(selection);
        let text = format!("{} switched to {}", change.name, selection.label());
        if let Some(entry) = self.chat.notice(&text, self.now()) {
            self.emit(AppEvent::ChatMessage(entry));
        }
        self.emit(AppEvent::MediaChanged {
            selection,
            from: change.from,
        });
    }

    async fn on_room_closed(&mut self, notice: PeerNotice) {
        if self.identity.is_host {
            return;
        }
        info!("Room {} closed by {}", self.identity.room_code, notice.from);
        self.emit(AppEvent::RoomClosed { by: notice.from });
        self.detach().await;
    }

    async fn drop_peer(&mut self, peer_id: &str) {
        self.remote_audio.stop(peer_id);
        if self.negotiator.on_leave(peer_id).await {
            self.emit(AppEvent::VoiceDisconnected {
                peer_id: peer_id.to_string(),
            });
        }
    }

    // ============================================================
    // Peer connections
    // ============================================================

    pub async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::ConnectionStateChanged { peer_id, state } => {
                match self.negotiator.on_state_change(&peer_id, state).await {
                    LinkChange::Connected => self.emit(AppEvent::VoiceConnected { peer_id }),
                    LinkChange::TornDown => {
                        self.remote_audio.stop(&peer_id);
                        self.emit(AppEvent::VoiceDisconnected { peer_id });
                    }
                    LinkChange::Unchanged => {}
                }
            }
            PeerEvent::RemoteTrack { peer_id, track } => {
                if self.negotiator.registry().contains(&peer_id) {
                    info!("Receiving audio from {}", peer_id);
                    self.remote_audio.attach(&peer_id, track);
                }
            }
            PeerEvent::IceCandidate { peer_id, candidate } => {
                if let Some(event) = self.negotiator.on_local_candidate(&peer_id, candidate) {
                    self.publish(event).await;
                }
            }
        }
    }

    // ============================================================
    // Playback
    // ============================================================

    /// Our record, or one read off the player when nothing was agreed yet.
    /// A paused reading is stamped 0 so that any agreed record outranks it.
    fn current_record(&self) -> PlaybackRecord {
        if let Some(record) = self.sync.record() {
            return *record;
        }
        let is_playing = !self.player.is_paused();
        PlaybackRecord {
            is_playing,
            last_known_time: self.player.current_time(),
            last_update_timestamp: if is_playing { self.now() } else { 0 },
            playback_rate: 1.0,
        }
    }

    /// Drive the player onto the stored record.
    fn apply_record(&mut self, source: &str) {
        let now = self.now();
        let actions = self.sync.plan_apply(self.player.snapshot(), now);
        self.apply_actions(&actions, now);
        if let Some(record) = self.sync.record() {
            self.emit(AppEvent::PlaybackUpdated {
                record: *record,
                source: source.to_string(),
            });
        }
    }

    fn apply_actions(&mut self, actions: &[PlayerAction], now: i64) {
        if actions.is_empty() {
            return;
        }
        for action in actions {
            self.player.apply(*action);
        }
        self.applied_remote = Some(AppliedRemote { at_ms: now });
    }

    /// Record a local transport action and broadcast it. The host also sends
    /// the coarse pause/resume notice for play and pause.
    async fn broadcast_local(&mut self, is_playing: bool, notice: bool) {
        let now = self.now();
        let record = self
            .sync
            .local_action(self.player.snapshot(), is_playing, now);
        self.applied_remote = None;
        self.publish(RoomEvent::PlaybackState(PlaybackStateNet::new(
            self.self_id(),
            &record,
        )))
        .await;
        if notice && self.identity.is_host {
            self.publish(RoomEvent::Playback(PlaybackNotice {
                from: Some(self.self_id().to_string()),
                paused: !is_playing,
            }))
            .await;
        }
        self.emit(AppEvent::PlaybackUpdated {
            record,
            source: self.self_id().to_string(),
        });
    }

    /// Reports arriving right after a remote update are the UI catching up
    /// with it. The drift loop corrects any stale position they carry.
    fn is_echo(&self, now: i64) -> bool {
        self.applied_remote
            .is_some_and(|applied| now - applied.at_ms <= self.config.sync.echo_guard_ms as i64)
    }

    async fn on_player_report(&mut self, time: f64, paused: bool) {
        let before = self.player.snapshot();
        self.player.report(time, paused);
        let toggled = before.paused != paused;
        let jumped = (before.current_time - time).abs() > self.sync.tolerance();
        if !toggled && !jumped {
            return;
        }
        if self.is_echo(self.now()) {
            debug!("Player report at {:.2}s follows a remote update; not rebroadcasting", time);
            return;
        }
        self.broadcast_local(!paused, toggled).await;
    }

    fn on_player_ready(&mut self) {
        self.player.set_ready(true);
        let now = self.now();
        let actions = self.sync.on_ready(self.player.snapshot(), now);
        if !actions.is_empty() {
            info!("Player ready; applying latched room state");
            self.apply_actions(&actions, now);
        }
    }

    /// One drift-loop tick. Returns the corrective seek target, if any.
    pub fn drift_tick(&mut self) -> Option<f64> {
        let now = self.now();
        let snapshot = self.player.snapshot();
        let PlayerAction::Seek { time } = self.sync.drift_correction(snapshot, now)? else {
            return None;
        };
        info!(
            "Drift of {:.2}s detected; seeking to {:.2}s",
            snapshot.current_time - time,
            time
        );
        self.apply_actions(&[PlayerAction::Seek { time }], now);
        self.emit(AppEvent::DriftCorrected {
            expected: time,
            actual: snapshot.current_time,
        });
        Some(time)
    }

    /// Announce ourselves again while a present member still has no voice
    /// link; the first `webrtc-join` can go out before the channel reaches
    /// anyone.
    pub async fn mesh_tick(&mut self) {
        if !self.attached {
            return;
        }
        let now = self.now();
        if now - self.last_join_notice_ms < self.config.voice.rejoin_interval_ms as i64 {
            return;
        }
        let unlinked: Vec<String> = self
            .members
            .keys()
            .filter(|id| id.as_str() != self.self_id() && !self.negotiator.registry().contains(id))
            .cloned()
            .collect();
        if unlinked.is_empty() {
            return;
        }
        debug!("No voice link to {:?}; announcing again", unlinked);
        self.last_join_notice_ms = now;
        self.publish(self.negotiator.join_notice()).await;
    }

    /// Handle an expired reconciliation deadline.
    pub async fn reconcile_tick(&mut self) {
        match self.reconciler.on_deadline(self.now()) {
            Some(DeadlineAction::Retry(request_id)) => {
                info!("No state reply yet; retrying ({})", request_id);
                self.publish(RoomEvent::StateRequest(StateRequestNet {
                    from: self.self_id().to_string(),
                    request_id,
                }))
                .await;
            }
            Some(DeadlineAction::GiveUp) => {
                info!("No member answered the state request; keeping defaults");
                self.emit(AppEvent::ReconciliationFinished {
                    outcome: ReconcileOutcome::Defaulted,
                });
            }
            None => {}
        }
    }

    /// Host heartbeat: rebroadcast the full state while playing.
    pub async fn host_resync(&mut self) {
        if !self.identity.is_host {
            return;
        }
        let Some(record) = self.sync.record().copied() else {
            return;
        };
        if !record.is_playing {
            return;
        }
        self.publish(RoomEvent::StateSync(StateSyncNet::new(
            self.self_id(),
            None,
            &record,
            self.media.as_ref(),
        )))
        .await;
    }

    // ============================================================
    // Commands
    // ============================================================

    pub async fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Play => {
                self.player.play();
                self.broadcast_local(true, true).await;
            }
            RoomCommand::Pause => {
                self.player.pause();
                self.broadcast_local(false, true).await;
            }
            RoomCommand::Seek { time } => {
                self.player.seek(time);
                let playing = !self.player.is_paused();
                self.broadcast_local(playing, false).await;
            }
            RoomCommand::PlayerReport { time, paused } => self.on_player_report(time, paused).await,
            RoomCommand::PlayerReady => self.on_player_ready(),
            RoomCommand::SelectMedia(selection) => self.select_media(selection).await,
            RoomCommand::SetMic(on) => {
                let outbound = if on {
                    self.mic.enable(&mut self.negotiator).await
                } else {
                    self.mic.disable(&mut self.negotiator).await
                };
                self.publish_all(outbound).await;
            }
            RoomCommand::SendChat { message, tone } => self.send_chat(message, tone).await,
            RoomCommand::CloseRoom => {
                if !self.identity.is_host {
                    warn!("Only the host can close room {}", self.identity.room_code);
                    return;
                }
                info!("Closing room {}", self.identity.room_code);
                self.publish(RoomEvent::RoomClosed(PeerNotice {
                    from: self.self_id().to_string(),
                }))
                .await;
                self.detach().await;
            }
            RoomCommand::UnblockAudio => {
                self.remote_audio.unblock();
            }
            RoomCommand::Leave => self.detach().await,
            RoomCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn select_media(&mut self, selection: MediaSelection) {
        self.media = Some(selection);
        let text = format!("{} switched to {}", self.identity.display_name, selection.label());
        if let Some(entry) = self.chat.notice(&text, self.now()) {
            self.emit(AppEvent::ChatMessage(entry));
        }
        self.emit(AppEvent::MediaChanged {
            selection,
            from: self.self_id().to_string(),
        });
        self.publish(RoomEvent::MediaChange(MediaChangeNet {
            from: self.self_id().to_string(),
            name: self.identity.display_name.clone(),
            media_type: selection.media_type,
            season: selection.season,
            episode: selection.episode,
        }))
        .await;
    }

    async fn send_chat(&mut self, message: String, tone: Option<String>) {
        let message = message.trim().to_string();
        if message.is_empty() {
            return;
        }
        let chat = ChatNet {
            id: Uuid::new_v4().to_string(),
            from: self.self_id().to_string(),
            name: self.identity.display_name.clone(),
            message,
            tone: tone.unwrap_or_else(|| "default".to_string()),
        };
        let entry = ChatEntry::from_net(chat.clone(), self.now());
        if self.chat.push(entry.clone()) {
            self.emit(AppEvent::ChatMessage(entry));
        }
        self.publish(RoomEvent::Chat(chat)).await;
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let now = self.now();
        let player = self.player.snapshot();
        RoomSnapshot {
            room_code: self.identity.room_code.clone(),
            client_id: self.identity.client_id.clone(),
            display_name: self.identity.display_name.clone(),
            is_host: self.identity.is_host,
            attached: self.attached,
            members: self.members(),
            record: self.sync.record().copied(),
            expected_time: self.sync.expected_time(now),
            player_time: player.current_time,
            player_paused: player.paused,
            player_ready: player.ready,
            media: self.media,
            mic: self.mic.status().clone(),
            peers: self
                .negotiator
                .registry()
                .peer_ids()
                .into_iter()
                .filter_map(|peer_id| {
                    let link = self.negotiator.registry().get(&peer_id)?;
                    Some(PeerSummary {
                        state: link.state,
                        peer_id,
                    })
                })
                .collect(),
            blocked_audio: self.remote_audio.blocked(),
            reconciling: self.reconciler.is_pending(),
            chat: self.chat.entries().cloned().collect(),
        }
    }

    async fn next_mic_packet(&mut self) -> Option<Vec<u8>> {
        self.mic.next_packet().await
    }
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Run a session until it leaves the room, the command channel closes or the
/// transport goes away.
pub async fn run_room_session(
    mut session: RoomSession,
    mut peer_rx: mpsc::Receiver<PeerEvent>,
    mut cmd_rx: mpsc::Receiver<RoomCommand>,
) -> Result<(), TransportError> {
    let mut transport_rx = session.attach().await?;

    let mut drift = tokio::time::interval(session.config.sync.drift_interval());
    drift.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut resync = session
        .config
        .sync
        .host_resync_interval_ms
        .filter(|_| session.identity.is_host)
        .map(|ms| {
            let mut interval = tokio::time::interval(Duration::from_millis(ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

    info!("Room session started for {}", session.identity.room_code);

    loop {
        let deadline = session
            .next_reconcile_deadline()
            .map(|at| Duration::from_millis((at - session.now()).max(0) as u64));
        let reconcile_wait = async move {
            match deadline {
                Some(wait) => tokio::time::sleep(wait).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = transport_rx.recv() => {
                match event {
                    Some(event) => session.dispatch(event).await,
                    None => {
                        warn!("Room channel closed");
                        break;
                    }
                }
            }
            Some(event) = peer_rx.recv() => {
                session.on_peer_event(event).await;
            }
            command = cmd_rx.recv() => {
                match command {
                    Some(command) => session.handle_command(command).await,
                    None => {
                        session.detach().await;
                        break;
                    }
                }
            }
            _ = drift.tick() => {
                session.drift_tick();
                session.mesh_tick().await;
            }
            _ = reconcile_wait => {
                session.reconcile_tick().await;
            }
            _ = tick_optional(&mut resync) => {
                session.host_resync().await;
            }
            packet = session.next_mic_packet() => {
                match packet {
                    Some(opus) => session.mic.write_packet(opus).await,
                    None => session.mic.on_capture_lost(),
                }
            }
        }

        if !session.is_attached() {
            break;
        }
    }

    session.detach().await;
    info!("Room session for {} stopped", session.identity.room_code);
    Ok(())
}
