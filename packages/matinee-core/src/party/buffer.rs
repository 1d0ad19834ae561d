//! Buffer controller: per-user buffering reports, delayed pauses, and
//! auto-resume.
//!
//! A single client hitting a buffer stall should not stop the room
//! instantly; it gets 2 s to recover. Only if it is still stalled does the
//! room pause, and once every stalled client reports recovery the room
//! resumes on its own. Per-user spam suppression keeps a flapping client
//! from pausing the room in a loop.

use std::sync::Arc;
use std::time::Duration;

use crate::protocol::Outbound;
use crate::protocol_constants::{
    BUFFER_SPAM_MAX_TRIGGERS, BUFFER_SPAM_WINDOW_SECS, BUFFER_START_DEDUP_SECS,
    DELAYED_BUFFER_PAUSE_SECS, MIN_BUFFER_DURATION_SECS, SEEK_DEBOUNCE_WINDOW_SECS,
};
use crate::utils::within_window;

use super::engine::PartyEngine;
use super::model::PauseReason;

/// How a `buffer_start` report was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStartOutcome {
    /// Duplicate within the dedup window; no state changed.
    Rejected,
    /// Spam suppression active; any scheduled pause was cancelled.
    Suppressed,
    /// Bookkeeping recorded, no pause scheduled.
    Recorded,
    /// Bookkeeping recorded and a delayed pause scheduled under this epoch.
    PauseScheduled(u64),
    /// Unknown room or user.
    NoRoom,
}

impl PartyEngine {
    // ─────────────────────────────────────────────────────────────────────────
    // buffer_start
    // ─────────────────────────────────────────────────────────────────────────

    /// Records a `buffer_start` and schedules the delayed pause task when
    /// one was admitted. This is the entry point used by the router.
    pub fn buffer_start_and_schedule(
        self: &Arc<Self>,
        room_id: &str,
        user_id: &str,
        now: f64,
    ) -> BufferStartOutcome {
        let outcome = self.buffer_start(room_id, user_id, now);
        if let BufferStartOutcome::PauseScheduled(epoch) = outcome {
            self.spawn_delayed_buffer_pause(room_id.to_string(), user_id.to_string(), epoch);
        }
        outcome
    }

    /// Classifies and records a `buffer_start` under one lock acquisition.
    ///
    /// Admission: a report within 0.3 s of the user's previous one is
    /// rejected outright. Accepted reports count against the 30 s spam
    /// window; past 3 triggers the report is suppressed (cancelling any
    /// scheduled pause so a stale task cannot fire later). A user's first
    /// ever report, and reports inside the post-seek grace window, only
    /// record bookkeeping and never pause the room.
    pub fn buffer_start(&self, room_id: &str, user_id: &str, now: f64) -> BufferStartOutcome {
        let mut rooms = self.rooms().lock();
        let Some(room) = rooms.get_mut(room_id) else {
            return BufferStartOutcome::NoRoom;
        };
        let Some(user) = room.users.get_mut(user_id) else {
            return BufferStartOutcome::NoRoom;
        };

        if within_window(now, user.last_buffer_trigger_time, BUFFER_START_DEDUP_SECS) {
            return BufferStartOutcome::Rejected;
        }

        if within_window(now, user.last_buffer_trigger_time, BUFFER_SPAM_WINDOW_SECS) {
            user.buffer_trigger_count += 1;
        } else {
            user.buffer_trigger_count = 1;
        }
        user.last_buffer_trigger_time = now;

        if user.buffer_trigger_count > BUFFER_SPAM_MAX_TRIGGERS {
            log::debug!(
                "[Buffer] {} suppressed in room {} ({} triggers in window)",
                user_id,
                room_id,
                user.buffer_trigger_count
            );
            Self::cancel_buffer_pause_for_locked(room, user_id);
            return BufferStartOutcome::Suppressed;
        }

        let first_ever = !room.buffer_start_time_by_user.contains_key(user_id);
        room.buffer_start_time_by_user
            .insert(user_id.to_string(), now);
        room.buffering_users.insert(user_id.to_string());

        if first_ever || within_window(now, room.last_seek_time, SEEK_DEBOUNCE_WINDOW_SECS) {
            return BufferStartOutcome::Recorded;
        }

        if !room.is_playing {
            return BufferStartOutcome::Recorded;
        }

        // Supersede any scheduled task for this user and schedule afresh.
        room.pending_buffer_pause.remove(user_id);
        let entry = room
            .buffer_pause_epoch_by_user
            .entry(user_id.to_string())
            .or_insert(0);
        *entry += 1;
        let epoch = *entry;
        room.pending_buffer_pause.insert(user_id.to_string(), epoch);
        BufferStartOutcome::PauseScheduled(epoch)
    }

    fn spawn_delayed_buffer_pause(self: &Arc<Self>, room_id: String, user_id: String, epoch: u64) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(DELAYED_BUFFER_PAUSE_SECS)).await;
            let now = engine.now();
            if let Some((current_time, username)) =
                engine.check_and_apply_buffer_pause(&room_id, &user_id, epoch, now)
            {
                engine
                    .broadcast_to_room(
                        &room_id,
                        &Outbound::sync(false, current_time, true)
                            .triggered_by(format!("System (Buffer Pause: {})", username)),
                        None,
                    )
                    .await;
            }
        });
    }

    /// Delayed pause body. Aborts unless the captured epoch is still
    /// current, the user is still buffering, and the room is still playing;
    /// otherwise pauses at the clamped live position.
    ///
    /// Returns the paused position and the triggering user's name when the
    /// pause applied.
    pub fn check_and_apply_buffer_pause(
        &self,
        room_id: &str,
        user_id: &str,
        epoch: u64,
        now: f64,
    ) -> Option<(f64, String)> {
        let mut rooms = self.rooms().lock();
        let room = rooms.get_mut(room_id)?;

        if room.buffer_pause_epoch_by_user.get(user_id) != Some(&epoch) {
            return None;
        }
        if room.pending_buffer_pause.get(user_id) != Some(&epoch) {
            return None;
        }
        room.pending_buffer_pause.remove(user_id);

        if !room.buffering_users.contains(user_id) || !room.is_playing {
            return None;
        }

        let username = room
            .users
            .get(user_id)
            .map(|u| u.username.clone())
            .unwrap_or_else(|| user_id.to_string());
        let current_time = Self::pause_now_locked(room, now, PauseReason::Buffer);
        log::info!(
            "[Buffer] Room {} paused at {:.2}s waiting on {}",
            room_id,
            current_time,
            username
        );
        Some((current_time, username))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // buffer_end
    // ─────────────────────────────────────────────────────────────────────────

    /// Records a `buffer_end` and decides auto-resume under one lock.
    ///
    /// Short episodes (< 2 s) are noise and never resume the room. Resume
    /// requires: the room paused with reason `buffer`, no manual pause
    /// within the last second, and an empty buffering set. Returns the
    /// resume position when the room resumed.
    pub fn buffer_end_and_check_resume(
        &self,
        room_id: &str,
        user_id: &str,
        now: f64,
    ) -> Option<f64> {
        let mut rooms = self.rooms().lock();
        let room = rooms.get_mut(room_id)?;
        if !room.users.contains_key(user_id) {
            return None;
        }

        room.buffer_end_time_by_user.insert(user_id.to_string(), now);
        room.buffering_users.remove(user_id);
        Self::cancel_buffer_pause_for_locked(room, user_id);

        let start = room.buffer_start_time_by_user.get(user_id).copied()?;
        if now - start < MIN_BUFFER_DURATION_SECS {
            return None;
        }

        if room.pause_reason != PauseReason::Buffer
            || room.is_playing
            || !Self::auto_resume_debounce_ok(room, now)
            || !room.buffering_users.is_empty()
        {
            return None;
        }

        room.is_playing = true;
        room.updated_at = now;
        room.pause_reason = PauseReason::None;
        room.last_auto_resume_time = now;
        log::info!(
            "[Buffer] Room {} auto-resumed at {:.2}s",
            room_id,
            room.current_time
        );
        Some(room.current_time)
    }
}
