//! Playback synchronization: the shared record, its projection to "now",
//! drift correction and late-joiner reconciliation.

pub mod clock;
pub mod engine;
pub mod player;
pub mod reconcile;
pub mod record;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use engine::{PlaybackSync, PlayerAction, PlayerSnapshot};
pub use player::{Player, VirtualPlayer};
pub use reconcile::{DeadlineAction, ReconcileOutcome, Reconciler, ReplyVerdict};
pub use record::{MediaSelection, MediaType, PlaybackRecord};
