//! Data model for watch-party rooms.
//!
//! [`Room`] carries the authoritative playback tuple plus all the debounce
//! clocks and epoch ledgers the controllers need; [`User`] carries
//! per-connection drift state. Everything here is mutated only under the
//! engine mutex; the structs themselves are plain data.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol_constants::{CHAT_LOG_CAP, DURATION_CLAMP_MARGIN_SECS};

// ─────────────────────────────────────────────────────────────────────────────
// Wire-Level Enums
// ─────────────────────────────────────────────────────────────────────────────

/// Container format of the room's current video.
///
/// HLS durations are unreliable (live edges, rolling playlists), so every
/// duration-based clamp in the engine is disabled for HLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    /// HTTP Live Streaming playlist.
    #[default]
    Hls,
    /// Progressive MP4.
    Mp4,
    /// Progressive WebM.
    Webm,
}

impl VideoFormat {
    /// Infers the format from a URL when no resolver metadata is available.
    #[must_use]
    pub fn infer_from_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.contains(".m3u8") {
            Self::Hls
        } else if lower.contains(".webm") {
            Self::Webm
        } else {
            Self::Mp4
        }
    }

    /// Parses a resolver-reported extension, defaulting to MP4.
    #[must_use]
    pub fn from_ext(ext: &str) -> Self {
        match ext {
            "hls" | "m3u8" => Self::Hls,
            "webm" => Self::Webm,
            _ => Self::Mp4,
        }
    }
}

/// Why the room is currently paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Not paused, or paused with no recorded cause.
    #[default]
    #[serde(rename = "")]
    None,
    /// A user pressed pause.
    Manual,
    /// The buffer controller paused the room for a stalled client.
    Buffer,
    /// A seek barrier is holding the room.
    Seek,
    /// A coordinated resume barrier is holding the room.
    ResumeSync,
}

impl PauseReason {
    /// Whether this reason belongs to an active barrier.
    #[must_use]
    pub fn is_barrier(self) -> bool {
        matches!(self, Self::Seek | Self::ResumeSync)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client Connection Seam
// ─────────────────────────────────────────────────────────────────────────────

/// Error returned when a frame could not be delivered to a client.
#[derive(Debug, Error)]
#[error("connection send failed: {0}")]
pub struct SendFailure(pub String);

/// Outbound half of one client connection.
///
/// Implementations must serialize concurrent callers internally (the
/// per-user send lock), so a heartbeat correction and a room broadcast
/// never interleave on one socket. The production implementation wraps an
/// axum WebSocket sink; tests use a channel-backed double.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    /// Sends one serialized frame.
    async fn send_text(&self, payload: &str) -> Result<(), SendFailure>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat
// ─────────────────────────────────────────────────────────────────────────────

/// Quoted message carried inside a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyTo {
    pub username: String,
    pub message: String,
    #[serde(default)]
    pub avatar: String,
}

/// One chat message.
///
/// `timestamp` is wall-clock ISO-8601, the only place wall time appears;
/// every scheduling clock in the engine is monotonic.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub username: String,
    pub avatar: String,
    pub message: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────────────────────────

/// A connected participant.
pub struct User {
    /// Short unique token identifying this user.
    pub user_id: String,
    pub username: String,
    pub avatar: String,
    /// Outbound connection handle; sends are serialized inside it.
    pub conn: Arc<dyn ClientConnection>,
    /// Monotonic join order within the room (host election key).
    pub joined_seq: u64,

    // Stall detection
    /// Client media time reported by the last heartbeat.
    pub last_client_time: f64,
    /// Consecutive heartbeats whose reported time failed to advance.
    pub stall_count: u32,
    /// Last hard sync sent to this user (0 = never).
    pub last_sync_time: f64,
    /// Last playback rate sent to this user.
    pub last_rate_sent: f64,

    // Buffer spam suppression
    /// Last accepted buffer_start from this user (0 = never).
    pub last_buffer_trigger_time: f64,
    /// Buffer triggers inside the current spam window.
    pub buffer_trigger_count: u32,

    /// Set when a send to this user failed; the reaper collects flagged
    /// users on its next sweep (0 = healthy).
    pub last_send_failed_at: f64,
}

impl User {
    /// Creates a fresh user with all trackers zeroed.
    pub fn new(
        user_id: String,
        username: String,
        avatar: String,
        conn: Arc<dyn ClientConnection>,
        joined_seq: u64,
    ) -> Self {
        Self {
            user_id,
            username,
            avatar,
            conn,
            joined_seq,
            last_client_time: 0.0,
            stall_count: 0,
            last_sync_time: 0.0,
            last_rate_sent: 1.0,
            last_buffer_trigger_time: 0.0,
            buffer_trigger_count: 0,
            last_send_failed_at: 0.0,
        }
    }
}

/// User identity as exposed in snapshots and roster broadcasts.
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub user_id: String,
    pub username: String,
    pub avatar: String,
    pub is_host: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Rooms
// ─────────────────────────────────────────────────────────────────────────────

/// One watch-party room.
///
/// Created on first join, destroyed the moment the last user leaves.
pub struct Room {
    pub room_id: String,

    // Video metadata
    pub video_url: String,
    pub video_title: String,
    pub video_format: VideoFormat,
    /// Video duration in seconds; 0 = unknown or live.
    pub video_duration: f64,
    pub subtitle_url: String,
    pub user_agent: String,
    pub referer: String,

    // Authoritative playback tuple
    pub is_playing: bool,
    pub current_time: f64,
    /// Monotonic instant the playback tuple was last written.
    pub updated_at: f64,
    pub pause_reason: PauseReason,

    // Roster
    pub users: HashMap<String, User>,
    /// First-joined user; re-elected on host departure.
    pub host_id: Option<String>,
    next_join_seq: u64,

    // Buffer tracking
    pub buffering_users: HashSet<String>,
    pub buffer_start_time_by_user: HashMap<String, f64>,
    pub buffer_end_time_by_user: HashMap<String, f64>,

    // Debounce clocks (monotonic seconds, 0 = never)
    pub last_play_time: f64,
    /// Last manual pause; buffer pauses do not stamp this.
    pub last_pause_time: f64,
    pub last_seek_time: f64,
    pub last_auto_resume_time: f64,
    pub last_recovery_time: f64,

    // Delayed-pause ledger: a scheduled task exists for a user iff their id
    // is a key here, and it fires only if its captured epoch still matches
    // `buffer_pause_epoch_by_user`.
    pub pending_buffer_pause: HashMap<String, u64>,
    pub buffer_pause_epoch_by_user: HashMap<String, u64>,

    // Barrier state
    pub seek_sync_epoch: u64,
    pub seek_sync_waiting_users: HashSet<String>,
    pub seek_sync_was_playing: bool,
    pub seek_sync_target_time: f64,
    /// Epoch captured by the pending timeout task, if one is scheduled.
    pub pending_barrier_timeout: Option<u64>,

    // Chat
    pub chat_messages: VecDeque<ChatMessage>,
}

impl Room {
    /// Creates an empty room.
    pub fn new(room_id: String) -> Self {
        Self {
            room_id,
            video_url: String::new(),
            video_title: String::new(),
            video_format: VideoFormat::default(),
            video_duration: 0.0,
            subtitle_url: String::new(),
            user_agent: String::new(),
            referer: String::new(),
            is_playing: false,
            current_time: 0.0,
            updated_at: 0.0,
            pause_reason: PauseReason::None,
            users: HashMap::new(),
            host_id: None,
            next_join_seq: 0,
            buffering_users: HashSet::new(),
            buffer_start_time_by_user: HashMap::new(),
            buffer_end_time_by_user: HashMap::new(),
            last_play_time: 0.0,
            last_pause_time: 0.0,
            last_seek_time: 0.0,
            last_auto_resume_time: 0.0,
            last_recovery_time: 0.0,
            pending_buffer_pause: HashMap::new(),
            buffer_pause_epoch_by_user: HashMap::new(),
            seek_sync_epoch: 0,
            seek_sync_waiting_users: HashSet::new(),
            seek_sync_was_playing: false,
            seek_sync_target_time: 0.0,
            pending_barrier_timeout: None,
            chat_messages: VecDeque::new(),
        }
    }

    /// Returns the next join sequence number.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_join_seq;
        self.next_join_seq += 1;
        seq
    }

    /// Clamps a position to the playable range.
    ///
    /// Known-duration VODs keep a small margin before the end so a hard seek
    /// never lands past the last frame. HLS durations are untrusted, so HLS
    /// (and unknown durations) only clamp the low end.
    #[must_use]
    pub fn clamp_time(&self, time: f64) -> f64 {
        if self.video_duration > 0.0 && self.video_format != VideoFormat::Hls {
            let max = (self.video_duration - DURATION_CLAMP_MARGIN_SECS).max(0.0);
            time.clamp(0.0, max)
        } else {
            time.max(0.0)
        }
    }

    /// Live playback position at `now`.
    #[must_use]
    pub fn live_time(&self, now: f64) -> f64 {
        if self.is_playing {
            self.clamp_time(self.current_time + (now - self.updated_at))
        } else {
            self.current_time
        }
    }

    /// Resets every user's rate tracker so the next heartbeat re-evaluates
    /// what rate the client should be running at.
    pub fn reset_rate_trackers(&mut self) {
        for user in self.users.values_mut() {
            user.last_rate_sent = 1.0;
        }
    }

    /// Picks the earliest-joined remaining user (host re-election).
    #[must_use]
    pub fn first_joined_user(&self) -> Option<String> {
        self.users
            .values()
            .min_by_key(|u| u.joined_seq)
            .map(|u| u.user_id.clone())
    }

    /// Roster in join order, with the host flagged.
    #[must_use]
    pub fn user_summaries(&self) -> Vec<UserSummary> {
        let mut users: Vec<&User> = self.users.values().collect();
        users.sort_by_key(|u| u.joined_seq);
        users
            .into_iter()
            .map(|u| UserSummary {
                user_id: u.user_id.clone(),
                username: u.username.clone(),
                avatar: u.avatar.clone(),
                is_host: self.host_id.as_deref() == Some(u.user_id.as_str()),
            })
            .collect()
    }

    /// Appends a chat message, keeping the log bounded.
    pub fn push_chat(&mut self, msg: ChatMessage) {
        self.chat_messages.push_back(msg);
        while self.chat_messages.len() > CHAT_LOG_CAP {
            self.chat_messages.pop_front();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshots
// ─────────────────────────────────────────────────────────────────────────────

/// Full room snapshot sent as `room_state`.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStateSnapshot {
    pub room_id: String,
    pub video_url: String,
    pub video_title: String,
    pub video_format: VideoFormat,
    pub video_duration: f64,
    pub subtitle_url: String,
    pub user_agent: String,
    pub referer: String,
    pub current_time: f64,
    pub is_playing: bool,
    /// Media proxy base URL for client-side URL composition.
    pub proxy_url: String,
    pub users: Vec<UserSummary>,
    pub chat_messages: Vec<ChatMessage>,
}

/// Minimal playback view used by handlers that only need the tuple.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackSnapshot {
    pub is_playing: bool,
    pub current_time: f64,
    pub updated_at: f64,
    pub pause_reason: PauseReason,
}
