use tracing::debug;

use crate::events::{AppEvent, EventSender};

use super::clock::SharedClock;
use super::engine::{PlayerAction, PlayerSnapshot};

/// Control surface of the opaque local media element.
pub trait Player: Send + Sync {
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, time: f64);
    fn current_time(&self) -> f64;
    fn is_paused(&self) -> bool;
    fn is_ready(&self) -> bool;

    /// State observed by the UI's media element (position, paused).
    fn report(&mut self, _time: f64, _paused: bool) {}

    /// Readiness signal from the media element.
    fn set_ready(&mut self, _ready: bool) {}

    fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            current_time: self.current_time(),
            paused: self.is_paused(),
            ready: self.is_ready(),
        }
    }

    fn apply(&mut self, action: PlayerAction) {
        match action {
            PlayerAction::Play => self.play(),
            PlayerAction::Pause => self.pause(),
            PlayerAction::Seek { time } => self.seek(time),
        }
    }
}

/// Clock-driven playhead standing in for the real media element.
///
/// The daemon feeds it what the UI reports (`report`, `set_ready`) and every
/// command the engine issues is forwarded to the UI as `AppEvent::PlayerCommand`.
pub struct VirtualPlayer {
    clock: SharedClock,
    anchor_time: f64,
    anchor_ms: i64,
    paused: bool,
    ready: bool,
    rate: f64,
    events: Option<EventSender>,
    seeks: usize,
}

impl VirtualPlayer {
    pub fn new(clock: SharedClock) -> Self {
        let now = clock.now_ms();
        Self {
            clock,
            anchor_time: 0.0,
            anchor_ms: now,
            paused: true,
            ready: false,
            rate: 1.0,
            events: None,
            seeks: 0,
        }
    }

    pub fn with_events(clock: SharedClock, events: EventSender) -> Self {
        let mut player = Self::new(clock);
        player.events = Some(events);
        player
    }

    /// Shift the playhead without telling anyone, as a drifting decoder would.
    pub fn nudge(&mut self, offset_secs: f64) {
        let now = self.current_time();
        self.anchor_time = (now + offset_secs).max(0.0);
        self.anchor_ms = self.clock.now_ms();
    }

    pub fn set_rate(&mut self, rate: f64) {
        self.rebase();
        self.rate = rate;
    }

    /// Number of seeks issued since creation.
    pub fn seek_count(&self) -> usize {
        self.seeks
    }

    fn rebase(&mut self) {
        self.anchor_time = self.current_time();
        self.anchor_ms = self.clock.now_ms();
    }

    fn emit(&self, action: PlayerAction) {
        if let Some(events) = &self.events {
            let _ = events.send(AppEvent::PlayerCommand { action });
        }
    }
}

impl Player for VirtualPlayer {
    fn play(&mut self) {
        self.rebase();
        self.paused = false;
        debug!("player: play at {:.2}s", self.anchor_time);
        self.emit(PlayerAction::Play);
    }

    fn pause(&mut self) {
        self.rebase();
        self.paused = true;
        debug!("player: pause at {:.2}s", self.anchor_time);
        self.emit(PlayerAction::Pause);
    }

    fn seek(&mut self, time: f64) {
        self.anchor_time = time.max(0.0);
        self.anchor_ms = self.clock.now_ms();
        self.seeks += 1;
        debug!("player: seek to {:.2}s", self.anchor_time);
        self.emit(PlayerAction::Seek { time: self.anchor_time });
    }

    fn current_time(&self) -> f64 {
        if self.paused {
            return self.anchor_time;
        }
        let elapsed = (self.clock.now_ms() - self.anchor_ms).max(0) as f64 / 1000.0;
        self.anchor_time + elapsed * self.rate
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    /// Take the UI's observed position as the new truth.
    fn report(&mut self, time: f64, paused: bool) {
        self.anchor_time = time.max(0.0);
        self.anchor_ms = self.clock.now_ms();
        self.paused = paused;
    }

    fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }
}
