use serde::Serialize;
use uuid::Uuid;

/// How a reconciliation round ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Synced { from: String },
    Defaulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyVerdict {
    Accept,
    Ignore,
}

/// What to do when the reconciliation deadline passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadlineAction {
    /// Re-broadcast `state_request` under this fresh id.
    Retry(String),
    /// Nobody answered; stay on defaults.
    GiveUp,
}

#[derive(Debug, Clone)]
struct Outstanding {
    request_id: String,
    deadline_ms: i64,
    attempts: u32,
}

#[derive(Debug, Clone)]
struct Answered {
    request_id: String,
    record_ts: i64,
    until_ms: i64,
}

/// Tracks this member's own `state_request` and decides which `state_sync`
/// replies to it are applied.
///
/// The first matching reply wins immediately. During the reply window a
/// later reply to the same request replaces it only when its record is
/// strictly newer; anything else is ignored.
#[derive(Debug, Clone)]
pub struct Reconciler {
    timeout_ms: i64,
    retries: u32,
    reply_window_ms: i64,
    outstanding: Option<Outstanding>,
    answered: Option<Answered>,
}

impl Reconciler {
    pub fn new(timeout_ms: u64, retries: u32, reply_window_ms: u64) -> Self {
        Self {
            timeout_ms: timeout_ms as i64,
            retries,
            reply_window_ms: reply_window_ms as i64,
            outstanding: None,
            answered: None,
        }
    }

    /// Start a new round and return the request id to broadcast.
    pub fn begin(&mut self, now_ms: i64) -> String {
        let request_id = Uuid::new_v4().to_string();
        self.outstanding = Some(Outstanding {
            request_id: request_id.clone(),
            deadline_ms: now_ms + self.timeout_ms,
            attempts: 0,
        });
        self.answered = None;
        request_id
    }

    pub fn is_pending(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Earliest instant at which `on_deadline` has work to do.
    pub fn next_deadline(&self) -> Option<i64> {
        let a = self.outstanding.as_ref().map(|o| o.deadline_ms);
        let b = self.answered.as_ref().map(|a| a.until_ms);
        match (a, b) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_reply(&mut self, request_id: &str, record_ts: i64, now_ms: i64) -> ReplyVerdict {
        if self
            .outstanding
            .as_ref()
            .is_some_and(|o| o.request_id == request_id)
        {
            self.outstanding = None;
            self.answered = Some(Answered {
                request_id: request_id.to_string(),
                record_ts,
                until_ms: now_ms + self.reply_window_ms,
            });
            return ReplyVerdict::Accept;
        }

        match &mut self.answered {
            Some(answered)
                if answered.request_id == request_id
                    && now_ms < answered.until_ms
                    && record_ts > answered.record_ts =>
            {
                answered.record_ts = record_ts;
                ReplyVerdict::Accept
            }
            _ => ReplyVerdict::Ignore,
        }
    }

    pub fn on_deadline(&mut self, now_ms: i64) -> Option<DeadlineAction> {
        if self.answered.as_ref().is_some_and(|a| now_ms >= a.until_ms) {
            self.answered = None;
        }

        let outstanding = self.outstanding.as_mut()?;
        if now_ms < outstanding.deadline_ms {
            return None;
        }
        if outstanding.attempts < self.retries {
            outstanding.attempts += 1;
            outstanding.request_id = Uuid::new_v4().to_string();
            outstanding.deadline_ms = now_ms + self.timeout_ms;
            return Some(DeadlineAction::Retry(outstanding.request_id.clone()));
        }
        self.outstanding = None;
        Some(DeadlineAction::GiveUp)
    }
}
