//! Synchronization protocol constants.
//!
//! Thresholds for the drift compensator, buffer controller, and connection
//! router. These are tunables calibrated against real client behavior, not
//! hard protocol requirements; changing one shifts how aggressively the
//! server corrects clients.

// ─────────────────────────────────────────────────────────────────────────────
// Connection Router
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum accepted inbound frame size (bytes). Oversized frames get an
/// error reply; the connection stays open.
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;

/// Per-second budget for high-frequency message types
/// (`ping`, `seek`, `seek_ready`, `buffer_start`, `buffer_end`).
/// Excess is dropped silently.
pub const HIGH_FREQ_LIMIT_PER_SEC: u32 = 30;

/// Per-second budget for every other message type. Excess gets an error reply.
pub const GENERAL_LIMIT_PER_SEC: u32 = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Broadcast Fabric
// ─────────────────────────────────────────────────────────────────────────────

/// Timeout for a single outbound send (seconds). A send that does not
/// complete in time flags the user as dead; the message is never retried.
pub const SEND_TIMEOUT_SECS: f64 = 0.8;

/// Interval between dead-peer reaper sweeps (seconds).
pub const REAPER_INTERVAL_SECS: u64 = 30;

// ─────────────────────────────────────────────────────────────────────────────
// Barrier Coordinator
// ─────────────────────────────────────────────────────────────────────────────

/// Default barrier timeout (seconds). When it fires, the barrier
/// force-completes with the same resume semantics as full readiness.
pub const BARRIER_TIMEOUT_SECS: f64 = 8.0;

/// A `pause` carrying a time this far from live server time is
/// reinterpreted as a seek (seconds).
pub const SEEK_VIA_PAUSE_THRESHOLD_SECS: f64 = 2.0;

/// Seek dedup: a seek within this distance of the live position...
pub const SEEK_DEDUP_DISTANCE_SECS: f64 = 0.2;

/// ...arriving this soon after the previous seek is dropped (seconds).
pub const SEEK_DEDUP_WINDOW_SECS: f64 = 0.15;

// ─────────────────────────────────────────────────────────────────────────────
// Buffer Controller
// ─────────────────────────────────────────────────────────────────────────────

/// Per-user dedup window for `buffer_start` events (seconds).
pub const BUFFER_START_DEDUP_SECS: f64 = 0.3;

/// Delay before a reported buffer stall pauses the room (seconds). Gives the
/// client a chance to recover before the whole room stops.
pub const DELAYED_BUFFER_PAUSE_SECS: f64 = 2.0;

/// A buffer episode shorter than this never triggers auto-resume; it is
/// treated as noise (seconds).
pub const MIN_BUFFER_DURATION_SECS: f64 = 2.0;

/// Buffer events this soon after a seek only record bookkeeping (seconds).
pub const SEEK_DEBOUNCE_WINDOW_SECS: f64 = 2.0;

/// Sliding window for per-user buffer spam suppression (seconds).
pub const BUFFER_SPAM_WINDOW_SECS: f64 = 30.0;

/// Buffer triggers beyond this count inside the spam window stop scheduling
/// delayed pauses.
pub const BUFFER_SPAM_MAX_TRIGGERS: u32 = 3;

/// Auto-resume is suppressed this long after a manual pause (seconds).
pub const AUTO_RESUME_DEBOUNCE_SECS: f64 = 1.0;

// ─────────────────────────────────────────────────────────────────────────────
// Heartbeat / Drift Compensator
// ─────────────────────────────────────────────────────────────────────────────

/// Drift beyond this magnitude forces a hard seek (seconds).
pub const HARD_SYNC_DRIFT_SECS: f64 = 3.0;

/// Drift beyond this magnitude gets a playback-rate nudge (seconds).
pub const SOFT_SYNC_DRIFT_SECS: f64 = 0.5;

/// Playback rate sent to clients running behind the room.
pub const RATE_SPEED_UP: f64 = 1.03;

/// Playback rate sent to clients running ahead of the room.
pub const RATE_SLOW_DOWN: f64 = 0.97;

/// Minimum spacing between hard syncs to one user (seconds).
pub const SYNC_DEBOUNCE_SECS: f64 = 3.0;

/// Heartbeats whose reported time moved less than this count as a stall
/// sample (seconds).
pub const STALL_TOLERANCE_SECS: f64 = 0.05;

/// Consecutive stall samples before a hard recovery sync.
pub const STALL_COUNT_THRESHOLD: u32 = 2;

/// Drift math is skipped this long after a seek (seconds).
pub const POST_SEEK_GRACE_SECS: f64 = 1.0;

/// No corrections within this distance of the end of a known-duration VOD
/// (seconds).
pub const END_OF_VIDEO_GRACE_SECS: f64 = 0.5;

/// Clamp margin kept before the end of a known-duration VOD (seconds).
/// HLS durations are unreliable, so the clamp never applies to HLS.
pub const DURATION_CLAMP_MARGIN_SECS: f64 = 0.25;

// ─────────────────────────────────────────────────────────────────────────────
// Rooms & Chat
// ─────────────────────────────────────────────────────────────────────────────

/// Length of generated room tokens.
pub const ROOM_TOKEN_LEN: usize = 8;

/// Maximum retained chat messages per room.
pub const CHAT_LOG_CAP: usize = 100;

/// Chat messages included in a room-state snapshot.
pub const CHAT_SNAPSHOT_LEN: usize = 50;

// ─────────────────────────────────────────────────────────────────────────────
// Media Resolver
// ─────────────────────────────────────────────────────────────────────────────

/// Timeout for one yt-dlp extraction (seconds).
pub const RESOLVER_TIMEOUT_SECS: u64 = 30;

/// Timeout for the optional stream availability probe (seconds).
pub const AVAILABILITY_PROBE_TIMEOUT_SECS: u64 = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Service identifier reported by the health endpoint.
pub const SERVICE_ID: &str = "matinee";
