//! Heartbeat-driven drift compensation.
//!
//! Every `ping` carries the client's media position. The compensator
//! compares it against the authoritative live time and picks at most one
//! correction: a hard seek for stalls and large drift, a playback-rate
//! nudge for small drift, or a rate renormalization once the client is back
//! in step. Corrections target a single user; the caller delivers them on
//! that user's serialized connection.

use crate::protocol_constants::{
    END_OF_VIDEO_GRACE_SECS, HARD_SYNC_DRIFT_SECS, POST_SEEK_GRACE_SECS, RATE_SLOW_DOWN,
    RATE_SPEED_UP, SOFT_SYNC_DRIFT_SECS, STALL_COUNT_THRESHOLD, STALL_TOLERANCE_SECS,
    SYNC_DEBOUNCE_SECS,
};

use super::engine::PartyEngine;
use super::model::{PauseReason, VideoFormat};

/// Correction chosen for one heartbeat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    /// Force the client to jump to the server position and keep playing.
    Hard { current_time: f64 },
    /// Nudge the client's playback rate (0.97, 1.0, or 1.03).
    Rate { rate: f64 },
}

impl PartyEngine {
    /// Processes one heartbeat and returns the correction to send, if any.
    ///
    /// The `syncing` flag means the client is mid-seek; all drift math is
    /// skipped and only the reported position is recorded.
    pub fn handle_heartbeat(
        &self,
        room_id: &str,
        user_id: &str,
        client_time: f64,
        syncing: bool,
        now: f64,
    ) -> Option<Correction> {
        let mut rooms = self.rooms().lock();
        let room = rooms.get_mut(room_id)?;

        if syncing {
            if let Some(user) = room.users.get_mut(user_id) {
                user.last_client_time = client_time;
            }
            return None;
        }

        // Paused room: the only useful correction is undoing a leftover
        // rate modulation, once.
        if !room.is_playing {
            let user = room.users.get_mut(user_id)?;
            user.last_client_time = client_time;
            user.stall_count = 0;
            if user.last_rate_sent != 1.0 {
                user.last_rate_sent = 1.0;
                return Some(Correction::Rate { rate: 1.0 });
            }
            return None;
        }

        // A barrier owns the room; clients are expected to be out of step.
        if room.pause_reason == PauseReason::Seek {
            if let Some(user) = room.users.get_mut(user_id) {
                user.last_client_time = client_time;
            }
            return None;
        }

        let server_time = room.live_time(now);

        // Let VODs run out naturally instead of fighting the last frame.
        if room.video_duration > 0.0
            && room.video_format != VideoFormat::Hls
            && server_time > room.video_duration - END_OF_VIDEO_GRACE_SECS
        {
            return None;
        }

        let last_seek_time = room.last_seek_time;

        let user = room.users.get_mut(user_id)?;
        if (client_time - user.last_client_time).abs() < STALL_TOLERANCE_SECS {
            user.stall_count += 1;
        } else {
            user.stall_count = 0;
        }
        user.last_client_time = client_time;

        if last_seek_time > 0.0 && now - last_seek_time < POST_SEEK_GRACE_SECS {
            user.stall_count = 0;
            return None;
        }

        let drift = client_time - server_time;
        let stall_suspected = user.stall_count >= STALL_COUNT_THRESHOLD;
        let sync_debounce_ok = now - user.last_sync_time > SYNC_DEBOUNCE_SECS;

        // Hard sync: stuck client, or drift too large for rate nudging.
        if (stall_suspected || drift.abs() > HARD_SYNC_DRIFT_SECS) && sync_debounce_ok {
            if stall_suspected {
                log::info!(
                    "[Heartbeat] {} in room {} stalled at {:.2}s, forcing sync to {:.2}s",
                    user_id,
                    room_id,
                    client_time,
                    server_time
                );
            } else {
                log::debug!(
                    "[Heartbeat] {} in room {} drifted {:.2}s, forcing sync",
                    user_id,
                    room_id,
                    drift
                );
            }
            user.last_sync_time = now;
            user.stall_count = 0;
            user.last_rate_sent = 1.0;
            room.last_recovery_time = now;
            room.last_auto_resume_time = now;
            return Some(Correction::Hard {
                current_time: server_time,
            });
        }

        // Soft sync: modulate rate until the drift closes.
        if drift.abs() > SOFT_SYNC_DRIFT_SECS && sync_debounce_ok {
            let rate = if drift < 0.0 {
                RATE_SPEED_UP
            } else {
                RATE_SLOW_DOWN
            };
            if rate != user.last_rate_sent {
                user.last_rate_sent = rate;
                return Some(Correction::Rate { rate });
            }
            return None;
        }

        // Back in step: renormalize once if we previously modulated.
        if drift.abs() < SOFT_SYNC_DRIFT_SECS && user.last_rate_sent != 1.0 {
            user.last_rate_sent = 1.0;
            return Some(Correction::Rate { rate: 1.0 });
        }

        None
    }
}
