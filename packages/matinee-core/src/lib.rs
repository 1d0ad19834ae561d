//! Matinee Core - shared library for the Matinee watch-party server.
//!
//! This crate provides the room synchronization engine behind Matinee: a
//! set of independent rooms, each with an authoritative playback position,
//! a participant roster, and a chat log, coordinated over WebSockets. It is
//! designed to be used by the standalone headless server and by embedders
//! that want the engine without the HTTP surface.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`party`]: The synchronization engine: room registry, playback state
//!   machine, barrier coordinator, buffer controller, drift compensator,
//!   and broadcast fabric
//! - [`protocol`]: JSON wire messages exchanged with clients
//! - [`api`]: Axum HTTP/WebSocket layer (thin handlers over the engine)
//! - [`media`]: External media metadata resolution (yt-dlp backend)
//! - [`state`]: Application configuration
//! - [`error`]: Centralized error types
//!
//! # Concurrency model
//!
//! One mutex guards the room registry and every room field; it is held only
//! across in-memory reads and writes, never across network sends. Outbound
//! frames to a single client are serialized by that client's connection.
//! Timer-driven tasks (delayed buffer pause, barrier timeout, dead-peer
//! reaper) revalidate an epoch under the mutex before touching anything, so
//! superseded tasks are no-ops.

#![warn(clippy::all)]

pub mod api;
pub mod error;
pub mod media;
pub mod party;
pub mod protocol;
pub mod protocol_constants;
pub mod state;
pub mod utils;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, ServerError, WsConnectionManager};
pub use error::{MatineeError, MatineeResult};
pub use media::{MediaInfo, MediaResolver, YtDlpResolver};
pub use party::{
    BarrierResume, BarrierStart, ChatMessage, ClientConnection, Correction, JoinOutcome,
    LeaveOutcome, PartyEngine, PauseOutcome, PauseReason, PlaybackSnapshot, ReplyTo,
    RoomStateSnapshot, SeekOutcome, SendFailure, UserSummary, VideoFormat, VideoUpdate,
};
pub use protocol::{Inbound, Outbound};
pub use state::Config;
pub use utils::{generate_room_token, is_valid_room_token};
