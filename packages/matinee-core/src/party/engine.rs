//! Room registry and playback state machine.
//!
//! [`PartyEngine`] owns the process-wide `room_id -> Room` map behind a
//! single mutex. Every mutation of room state (inbound handlers, barrier
//! timeouts, delayed buffer pauses, the reaper) goes through methods on
//! this type, each of which completes its read-check-write cycle under one
//! lock acquisition. The mutex is never held across network I/O.
//!
//! Methods take an explicit `now` (monotonic seconds from [`PartyEngine::now`])
//! so the admission and debounce tables are directly testable with synthetic
//! clocks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::protocol_constants::{
    AUTO_RESUME_DEBOUNCE_SECS, BARRIER_TIMEOUT_SECS, CHAT_SNAPSHOT_LEN,
};
use crate::utils::within_window;

use super::model::{
    ChatMessage, ClientConnection, PauseReason, PlaybackSnapshot, ReplyTo, Room,
    RoomStateSnapshot, User, UserSummary, VideoFormat,
};

/// New video metadata applied by `update_video`.
#[derive(Debug, Clone, Default)]
pub struct VideoUpdate {
    pub url: String,
    pub title: String,
    pub format: VideoFormat,
    /// Seconds; 0 = unknown. Callers must pass 0 for HLS.
    pub duration: f64,
    pub user_agent: String,
    pub referer: String,
    pub subtitle_url: String,
}

/// Result of attaching a user to a room.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub user_id: String,
    pub username: String,
    pub avatar: String,
    pub users: Vec<UserSummary>,
}

/// Result of detaching a user from a room.
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub user_id: String,
    pub username: String,
    /// Roster after departure (empty if the room was destroyed).
    pub users: Vec<UserSummary>,
    pub room_destroyed: bool,
    /// Set when this departure emptied a barrier's waiting set and the
    /// barrier resumed playback.
    pub barrier_resume: Option<super::barrier::BarrierResume>,
}

/// Result of a pause request.
#[derive(Debug, Clone)]
pub enum PauseOutcome {
    /// Room paused at this position.
    Paused { current_time: f64 },
    /// The carried time was far from live time; reinterpreted as a seek.
    SeekViaPause(super::barrier::BarrierStart),
    /// Admission rejected the request; no state changed.
    Rejected,
}

/// The room synchronization engine.
///
/// One instance per process; all collaborators hold an `Arc` to it.
pub struct PartyEngine {
    rooms: Mutex<HashMap<String, Room>>,
    origin: Instant,
    barrier_timeout_secs: f64,
}

impl PartyEngine {
    /// Creates an engine with the default barrier timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_barrier_timeout(BARRIER_TIMEOUT_SECS)
    }

    /// Creates an engine with a custom barrier timeout (seconds).
    #[must_use]
    pub fn with_barrier_timeout(barrier_timeout_secs: f64) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            origin: Instant::now(),
            barrier_timeout_secs,
        }
    }

    /// Monotonic seconds since engine start. All scheduling and debounce
    /// clocks use this origin; wall time never enters the state machine.
    #[must_use]
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    pub(crate) fn barrier_timeout_secs(&self) -> f64 {
        self.barrier_timeout_secs
    }

    pub(crate) fn rooms(&self) -> &Mutex<HashMap<String, Room>> {
        &self.rooms
    }

    /// Whether a room currently exists.
    #[must_use]
    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.lock().contains_key(room_id)
    }

    /// Number of live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Roster
    // ─────────────────────────────────────────────────────────────────────────

    /// Attaches a user to a room, creating the room on first join.
    ///
    /// The first user becomes host.
    pub fn join(
        &self,
        room_id: &str,
        conn: Arc<dyn ClientConnection>,
        username: String,
        avatar: String,
    ) -> JoinOutcome {
        let mut rooms = self.rooms.lock();
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id.to_string()));

        let user_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let seq = room.next_seq();
        let user = User::new(user_id.clone(), username.clone(), avatar.clone(), conn, seq);

        if room.host_id.is_none() {
            room.host_id = Some(user_id.clone());
        }
        room.users.insert(user_id.clone(), user);

        log::info!(
            "[Party] {} joined room {} ({} users)",
            user_id,
            room_id,
            room.users.len()
        );

        JoinOutcome {
            user_id,
            username,
            avatar,
            users: room.user_summaries(),
        }
    }

    /// Detaches a user. Re-elects the host, completes a barrier the user was
    /// blocking, and destroys the room in the same critical section when it
    /// empties.
    pub fn leave(&self, room_id: &str, user_id: &str, now: f64) -> Option<LeaveOutcome> {
        let mut rooms = self.rooms.lock();
        let room = rooms.get_mut(room_id)?;
        let user = room.users.remove(user_id)?;

        room.buffering_users.remove(user_id);
        room.buffer_start_time_by_user.remove(user_id);
        room.buffer_end_time_by_user.remove(user_id);
        room.pending_buffer_pause.remove(user_id);
        room.buffer_pause_epoch_by_user.remove(user_id);

        if room.host_id.as_deref() == Some(user_id) {
            room.host_id = room.first_joined_user();
        }

        // A departing user cannot hold up a barrier.
        let mut barrier_resume = None;
        if room.seek_sync_waiting_users.remove(user_id)
            && room.pause_reason.is_barrier()
            && room.seek_sync_waiting_users.is_empty()
        {
            barrier_resume = Some(Self::complete_barrier_locked(room, now));
        }

        let room_destroyed = room.users.is_empty();
        let users = room.user_summaries();
        if room_destroyed {
            rooms.remove(room_id);
            log::info!("[Party] Room {} destroyed (last user left)", room_id);
        } else {
            log::info!(
                "[Party] {} left room {} ({} users remain)",
                user_id,
                room_id,
                users.len()
            );
        }

        Some(LeaveOutcome {
            user_id: user_id.to_string(),
            username: user.username,
            users,
            room_destroyed,
            barrier_resume,
        })
    }

    /// Looks up a user's display name.
    #[must_use]
    pub fn username_of(&self, room_id: &str, user_id: &str) -> Option<String> {
        let rooms = self.rooms.lock();
        let room = rooms.get(room_id)?;
        Some(room.users.get(user_id)?.username.clone())
    }

    /// Roster of a room in join order.
    #[must_use]
    pub fn room_users(&self, room_id: &str) -> Vec<UserSummary> {
        self.rooms
            .lock()
            .get(room_id)
            .map(|r| r.user_summaries())
            .unwrap_or_default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Video
    // ─────────────────────────────────────────────────────────────────────────

    /// Replaces the room's video and resets all dynamic state: pending
    /// delayed-pause and barrier tasks are invalidated, buffer sets and
    /// timing maps cleared, debounce clocks zeroed, playback rewound.
    pub fn update_video(&self, room_id: &str, update: VideoUpdate, now: f64) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };

        Self::cancel_all_buffer_pauses_locked(room);
        Self::cancel_barrier_locked(room);

        room.video_url = update.url;
        room.video_title = update.title;
        room.video_format = update.format;
        room.video_duration = if update.format == VideoFormat::Hls {
            0.0
        } else {
            update.duration.max(0.0)
        };
        room.user_agent = update.user_agent;
        room.referer = update.referer;
        room.subtitle_url = update.subtitle_url;

        room.is_playing = false;
        room.current_time = 0.0;
        room.updated_at = now;
        room.pause_reason = PauseReason::None;

        room.buffering_users.clear();
        room.buffer_start_time_by_user.clear();
        room.buffer_end_time_by_user.clear();
        room.last_play_time = 0.0;
        room.last_pause_time = 0.0;
        room.last_seek_time = 0.0;
        room.last_auto_resume_time = 0.0;
        room.last_recovery_time = 0.0;
        room.reset_rate_trackers();

        log::info!("[Party] Room {} video changed: {}", room_id, room.video_url);
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Playback State Machine
    // ─────────────────────────────────────────────────────────────────────────

    /// Manual play: clears buffer state, cancels any barrier, and resumes
    /// from the paused position. Returns the resumed position, or `None` if
    /// the room is missing or already playing.
    pub fn manual_play(&self, room_id: &str, now: f64) -> Option<f64> {
        let mut rooms = self.rooms.lock();
        let room = rooms.get_mut(room_id)?;
        if room.is_playing {
            return None;
        }

        room.buffering_users.clear();
        Self::cancel_all_buffer_pauses_locked(room);
        Self::cancel_barrier_locked(room);

        Some(Self::resume_soft_locked(room, now))
    }

    /// Pause request with seek-via-pause fallback.
    ///
    /// A carried `time` more than 2 s from live server time while playing is
    /// a seek intent from a client whose UI issues seek-as-pause; it opens a
    /// barrier instead of pausing in place.
    pub fn pause_request(
        &self,
        room_id: &str,
        requested_time: Option<f64>,
        now: f64,
    ) -> PauseOutcome {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(room_id) else {
            return PauseOutcome::Rejected;
        };

        if let Some(req) = requested_time {
            if req >= 0.0 && room.is_playing {
                let live = room.live_time(now);
                if (req - live).abs() > crate::protocol_constants::SEEK_VIA_PAUSE_THRESHOLD_SECS {
                    let start = Self::begin_barrier_locked(
                        room,
                        PauseReason::Seek,
                        req,
                        true,
                        now,
                        None,
                    );
                    return PauseOutcome::SeekViaPause(start);
                }
            }
        }

        // Manual pause overrides a system pause; everything else in the
        // admission table protects against pause/resume flapping.
        Self::cancel_barrier_locked(room);
        if !Self::should_accept_pause_locked(room, now) {
            return PauseOutcome::Rejected;
        }

        let current_time = Self::pause_now_locked(room, now, PauseReason::Manual);
        PauseOutcome::Paused { current_time }
    }

    /// Generic playback setter. Clears the buffering set when flipping to
    /// playing. Exposed for collaborators that own their own admission
    /// logic; the message handlers use the richer operations above.
    pub fn update_playback_state(
        &self,
        room_id: &str,
        is_playing: bool,
        current_time: f64,
        now: f64,
    ) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };
        room.is_playing = is_playing;
        room.current_time = room.clamp_time(current_time);
        room.updated_at = now;
        if is_playing {
            room.buffering_users.clear();
            Self::cancel_all_buffer_pauses_locked(room);
            room.pause_reason = PauseReason::None;
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Snapshots
    // ─────────────────────────────────────────────────────────────────────────

    /// Full room snapshot. State is captured under the lock; the live
    /// position is derived afterwards.
    #[must_use]
    pub fn get_room_state(&self, room_id: &str, now: f64) -> Option<RoomStateSnapshot> {
        let (mut snapshot, playback, duration, format) = {
            let rooms = self.rooms.lock();
            let room = rooms.get(room_id)?;
            let chat_start = room.chat_messages.len().saturating_sub(CHAT_SNAPSHOT_LEN);
            let snapshot = RoomStateSnapshot {
                room_id: room.room_id.clone(),
                video_url: room.video_url.clone(),
                video_title: room.video_title.clone(),
                video_format: room.video_format,
                video_duration: room.video_duration,
                subtitle_url: room.subtitle_url.clone(),
                user_agent: room.user_agent.clone(),
                referer: room.referer.clone(),
                current_time: room.current_time,
                is_playing: room.is_playing,
                proxy_url: String::new(),
                users: room.user_summaries(),
                chat_messages: room.chat_messages.iter().skip(chat_start).cloned().collect(),
            };
            let playback = PlaybackSnapshot {
                is_playing: room.is_playing,
                current_time: room.current_time,
                updated_at: room.updated_at,
                pause_reason: room.pause_reason,
            };
            (snapshot, playback, room.video_duration, room.video_format)
        };

        if playback.is_playing {
            let live = playback.current_time + (now - playback.updated_at);
            snapshot.current_time = clamp_outside_lock(live, duration, format);
        }
        Some(snapshot)
    }

    /// Playback tuple only.
    #[must_use]
    pub fn get_playback_snapshot(&self, room_id: &str) -> Option<PlaybackSnapshot> {
        let rooms = self.rooms.lock();
        let room = rooms.get(room_id)?;
        Some(PlaybackSnapshot {
            is_playing: room.is_playing,
            current_time: room.current_time,
            updated_at: room.updated_at,
            pause_reason: room.pause_reason,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Chat
    // ─────────────────────────────────────────────────────────────────────────

    /// Appends a chat message attributed to `user_id`.
    pub fn add_chat_message(
        &self,
        room_id: &str,
        user_id: &str,
        message: String,
        reply_to: Option<ReplyTo>,
    ) -> Option<ChatMessage> {
        let mut rooms = self.rooms.lock();
        let room = rooms.get_mut(room_id)?;
        let user = room.users.get(user_id)?;
        let msg = ChatMessage {
            username: user.username.clone(),
            avatar: user.avatar.clone(),
            message,
            timestamp: chrono::Local::now().to_rfc3339(),
            reply_to,
        };
        room.push_chat(msg.clone());
        Some(msg)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Locked Helpers (shared with barrier/buffer/heartbeat impls)
    // ─────────────────────────────────────────────────────────────────────────

    /// Pause admission table. Rejects requests that would fight a recovery,
    /// an auto-resume, or an in-flight buffer episode.
    pub(crate) fn should_accept_pause_locked(room: &Room, now: f64) -> bool {
        if !room.is_playing
            && !matches!(room.pause_reason, PauseReason::Buffer | PauseReason::Seek)
        {
            return false;
        }
        if within_window(now, room.last_recovery_time, 2.0) {
            return false;
        }
        if within_window(now, room.last_auto_resume_time, 0.3) {
            return false;
        }
        if within_window(now, room.last_play_time, 0.5)
            && within_window(now, room.last_auto_resume_time, 0.5)
        {
            return false;
        }
        let max_end = room
            .buffer_end_time_by_user
            .values()
            .copied()
            .fold(0.0, f64::max);
        if within_window(now, max_end, 0.2) {
            return false;
        }
        let max_start = room
            .buffer_start_time_by_user
            .values()
            .copied()
            .fold(0.0, f64::max);
        if within_window(now, max_start, 0.5) {
            return false;
        }
        true
    }

    /// Stops playback at the live position and records why.
    ///
    /// Only a manual pause stamps `last_pause_time`; the auto-resume
    /// debounce must not be armed by the buffer controller's own pauses.
    pub(crate) fn pause_now_locked(room: &mut Room, now: f64, reason: PauseReason) -> f64 {
        let live = room.live_time(now);
        room.is_playing = false;
        room.current_time = live;
        room.updated_at = now;
        room.pause_reason = reason;
        if reason == PauseReason::Manual {
            room.last_pause_time = now;
        }
        room.reset_rate_trackers();
        live
    }

    /// Non-barrier resume from the paused position.
    pub(crate) fn resume_soft_locked(room: &mut Room, now: f64) -> f64 {
        let t = room.clamp_time(room.current_time);
        room.current_time = t;
        room.is_playing = true;
        room.updated_at = now;
        room.pause_reason = PauseReason::None;
        room.last_play_time = now;
        room.reset_rate_trackers();
        t
    }

    /// Invalidates every scheduled delayed buffer pause in the room.
    pub(crate) fn cancel_all_buffer_pauses_locked(room: &mut Room) {
        let users: Vec<String> = room.pending_buffer_pause.keys().cloned().collect();
        for user_id in users {
            Self::cancel_buffer_pause_for_locked(room, &user_id);
        }
    }

    /// Invalidates one user's scheduled delayed buffer pause, if any.
    pub(crate) fn cancel_buffer_pause_for_locked(room: &mut Room, user_id: &str) {
        *room
            .buffer_pause_epoch_by_user
            .entry(user_id.to_string())
            .or_insert(0) += 1;
        room.pending_buffer_pause.remove(user_id);
    }

    /// Hook used by auto-resume; kept here so the stamp lives next to the
    /// other clock writers.
    pub(crate) fn auto_resume_debounce_ok(room: &Room, now: f64) -> bool {
        !within_window(now, room.last_pause_time, AUTO_RESUME_DEBOUNCE_SECS)
    }
}

impl Default for PartyEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Duration clamp usable on a copied tuple, outside the lock.
fn clamp_outside_lock(time: f64, duration: f64, format: VideoFormat) -> f64 {
    if duration > 0.0 && format != VideoFormat::Hls {
        let max = (duration - crate::protocol_constants::DURATION_CLAMP_MARGIN_SECS).max(0.0);
        time.clamp(0.0, max)
    } else {
        time.max(0.0)
    }
}
