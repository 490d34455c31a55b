use serde::{Deserialize, Serialize};

use super::record::PlaybackRecord;

/// A command for the local player, planned from the shared record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlayerAction {
    Play,
    Pause,
    Seek { time: f64 },
}

/// What the player looks like right now.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerSnapshot {
    pub current_time: f64,
    pub paused: bool,
    pub ready: bool,
}

/// Holds the local copy of the room's playback record and plans the player
/// commands that bring the local player onto it.
///
/// Nothing in here touches the player or the network; the session applies
/// the returned actions and broadcasts the returned records.
#[derive(Debug, Clone)]
pub struct PlaybackSync {
    record: Option<PlaybackRecord>,
    tolerance: f64,
    pending_apply: bool,
    has_played: bool,
}

impl PlaybackSync {
    pub fn new(tolerance_secs: f64) -> Self {
        Self {
            record: None,
            tolerance: tolerance_secs,
            pending_apply: false,
            has_played: false,
        }
    }

    pub fn record(&self) -> Option<&PlaybackRecord> {
        self.record.as_ref()
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// True while a remote record is waiting for the player to become ready.
    pub fn is_latched(&self) -> bool {
        self.pending_apply
    }

    /// Whether this member has state worth handing to a late joiner.
    pub fn has_meaningful_state(&self, player_ready: bool) -> bool {
        self.has_played || player_ready
    }

    /// Expected position at `now_ms`, if a record exists.
    pub fn expected_time(&self, now_ms: i64) -> Option<f64> {
        self.record.map(|r| r.projected_time(now_ms))
    }

    /// Record a local play/pause/seek and return the record to broadcast.
    pub fn local_action(
        &mut self,
        snapshot: PlayerSnapshot,
        is_playing: bool,
        now_ms: i64,
    ) -> PlaybackRecord {
        let rate = self.record.map(|r| r.playback_rate).unwrap_or(1.0);
        let record = PlaybackRecord {
            is_playing,
            last_known_time: snapshot.current_time,
            last_update_timestamp: now_ms,
            playback_rate: rate,
        };
        self.has_played |= is_playing;
        self.pending_apply = false;
        self.record = Some(record);
        record
    }

    /// Overwrite the local record with one received from the room.
    pub fn adopt(&mut self, record: PlaybackRecord) {
        self.has_played |= record.is_playing || record.last_known_time > 0.0;
        self.record = Some(record);
    }

    /// Plan the actions that put the player on the stored record.
    ///
    /// A player that is not ready yet gets nothing; the intent is latched and
    /// replayed by `on_ready`.
    pub fn plan_apply(&mut self, snapshot: PlayerSnapshot, now_ms: i64) -> Vec<PlayerAction> {
        let Some(record) = self.record else {
            return Vec::new();
        };
        if !snapshot.ready {
            self.pending_apply = true;
            return Vec::new();
        }
        self.pending_apply = false;

        let mut actions = Vec::new();
        let target = record.projected_time(now_ms);
        if (snapshot.current_time - target).abs() > self.tolerance {
            actions.push(PlayerAction::Seek { time: target });
        }
        if record.is_playing && snapshot.paused {
            actions.push(PlayerAction::Play);
        } else if !record.is_playing && !snapshot.paused {
            actions.push(PlayerAction::Pause);
        }
        actions
    }

    /// Replay a latched remote record once the player signals readiness.
    pub fn on_ready(&mut self, snapshot: PlayerSnapshot, now_ms: i64) -> Vec<PlayerAction> {
        if !self.pending_apply {
            return Vec::new();
        }
        self.plan_apply(snapshot, now_ms)
    }

    /// One drift-loop tick: a corrective seek when the player wandered off
    /// the projected timeline by more than the tolerance.
    pub fn drift_correction(&self, snapshot: PlayerSnapshot, now_ms: i64) -> Option<PlayerAction> {
        let record = self.record?;
        if !record.is_playing || !snapshot.ready || self.pending_apply {
            return None;
        }
        let expected = record.projected_time(now_ms);
        if (snapshot.current_time - expected).abs() > self.tolerance {
            Some(PlayerAction::Seek { time: expected })
        } else {
            None
        }
    }
}
