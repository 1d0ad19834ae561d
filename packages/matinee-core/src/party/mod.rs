//! Room synchronization engine.
//!
//! Responsibilities:
//! - Room registry and playback state machine ([`engine`])
//! - Barrier-based seek/resume coordination ([`barrier`])
//! - Buffer-aware pause/resume control ([`buffer`])
//! - Heartbeat-driven drift compensation ([`heartbeat`])
//! - Broadcast fan-out and dead-peer reaping ([`broadcast`])
//!
//! All state lives behind one mutex inside [`engine::PartyEngine`];
//! the sibling modules add `impl` blocks for their concern. Timer-driven
//! tasks (delayed buffer pause, barrier timeout, reaper) revalidate an
//! epoch under that mutex before mutating, so a stale task is a no-op.

pub mod barrier;
pub mod broadcast;
pub mod buffer;
pub mod engine;
pub mod heartbeat;
pub mod model;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
pub(crate) mod testing;

pub use barrier::{BarrierResume, BarrierStart, SeekOutcome};
pub use buffer::BufferStartOutcome;
pub use engine::{JoinOutcome, LeaveOutcome, PartyEngine, PauseOutcome, VideoUpdate};
pub use heartbeat::Correction;
pub use model::{
    ChatMessage, ClientConnection, PauseReason, PlaybackSnapshot, ReplyTo, RoomStateSnapshot,
    SendFailure, UserSummary, VideoFormat,
};
