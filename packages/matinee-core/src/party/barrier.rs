//! Barrier coordinator for seeks and coordinated resumes.
//!
//! A barrier pauses the room, pins it to a target position, and waits for
//! every other participant to confirm readiness before resuming (if the
//! room was playing). Each barrier carries an epoch; readiness reports and
//! the timeout task only act when their captured epoch still matches, so a
//! superseded barrier can never resume the room.

use std::sync::Arc;
use std::time::Duration;

use crate::protocol_constants::{SEEK_DEDUP_DISTANCE_SECS, SEEK_DEDUP_WINDOW_SECS};
use crate::protocol::Outbound;

use super::engine::PartyEngine;
use super::model::{PauseReason, Room};

/// A freshly opened barrier.
#[derive(Debug, Clone)]
pub struct BarrierStart {
    pub epoch: u64,
    /// Target position after duration clamping.
    pub target_time: f64,
    /// Whether the room was playing when the barrier opened (and so will
    /// resume on completion).
    pub was_playing: bool,
    /// True when there was no one to wait for and the barrier completed in
    /// the same critical section that opened it.
    pub completed_immediately: bool,
}

/// Outcome of a completed barrier.
#[derive(Debug, Clone, Copy)]
pub struct BarrierResume {
    /// Whether playback resumed (the room was playing when the barrier opened).
    pub should_resume: bool,
    pub current_time: f64,
}

/// Result of a seek request.
#[derive(Debug, Clone)]
pub enum SeekOutcome {
    /// Barrier opened (or opened-and-completed for a solo room).
    Started(BarrierStart),
    /// Duplicate of a just-processed seek; dropped.
    Deduped,
    /// Unknown room.
    NoRoom,
}

impl PartyEngine {
    // ─────────────────────────────────────────────────────────────────────────
    // Public Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Handles a seek request from `user_id`, opening a seek barrier.
    ///
    /// Near-duplicate seeks (within 0.2 s of the live position, arriving
    /// within 0.15 s of the previous seek) are dropped: several clients
    /// double-fire seek events for one scrub gesture.
    pub fn seek(
        self: &Arc<Self>,
        room_id: &str,
        user_id: &str,
        target_time: f64,
        now: f64,
    ) -> SeekOutcome {
        let start = {
            let mut rooms = self.rooms().lock();
            let Some(room) = rooms.get_mut(room_id) else {
                return SeekOutcome::NoRoom;
            };

            let prev_seek = room.last_seek_time;
            room.last_seek_time = now;

            let live = room.live_time(now);
            if prev_seek > 0.0
                && (live - target_time).abs() < SEEK_DEDUP_DISTANCE_SECS
                && now - prev_seek < SEEK_DEDUP_WINDOW_SECS
            {
                return SeekOutcome::Deduped;
            }

            let was_playing = room.is_playing;
            Self::begin_barrier_locked(
                room,
                PauseReason::Seek,
                target_time,
                was_playing,
                now,
                Some(user_id),
            )
        };

        if !start.completed_immediately {
            self.spawn_barrier_timeout(room_id.to_string(), start.epoch);
        }
        SeekOutcome::Started(start)
    }

    /// Opens a barrier from a seek-via-pause request (already decided under
    /// the pause lock) and schedules its timeout.
    pub(crate) fn arm_barrier_timeout(self: &Arc<Self>, room_id: &str, start: &BarrierStart) {
        if !start.completed_immediately {
            self.spawn_barrier_timeout(room_id.to_string(), start.epoch);
        }
    }

    /// Records that `user_id` finished seeking for barrier `epoch`.
    ///
    /// Stale epochs and non-barrier states are no-ops, so replayed or late
    /// `seek_ready` frames cannot resume a superseded barrier. Returns the
    /// resume outcome when this report emptied the waiting set.
    pub fn mark_barrier_ready(
        &self,
        room_id: &str,
        user_id: &str,
        epoch: u64,
        now: f64,
    ) -> Option<BarrierResume> {
        let mut rooms = self.rooms().lock();
        let room = rooms.get_mut(room_id)?;

        if !room.pause_reason.is_barrier() || room.seek_sync_epoch != epoch {
            return None;
        }
        if !room.seek_sync_waiting_users.remove(user_id) {
            return None;
        }
        if !room.seek_sync_waiting_users.is_empty() {
            return None;
        }
        Some(Self::complete_barrier_locked(room, now))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Locked Helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Opens a barrier: bumps the epoch (invalidating any prior barrier and
    /// its timeout), pins the room paused at the clamped target, snapshots
    /// the set of users that must confirm, and resets per-user rate state.
    ///
    /// The initiator is excluded from the waiting set; their player is the
    /// one that asked for this position. A room with no one else to wait
    /// for completes in place.
    pub(crate) fn begin_barrier_locked(
        room: &mut Room,
        reason: PauseReason,
        target_time: f64,
        was_playing: bool,
        now: f64,
        initiator: Option<&str>,
    ) -> BarrierStart {
        debug_assert!(reason.is_barrier());

        room.pending_barrier_timeout = None;
        room.seek_sync_epoch += 1;
        let epoch = room.seek_sync_epoch;

        let clamped = room.clamp_time(target_time);
        room.seek_sync_was_playing = was_playing;
        room.seek_sync_target_time = clamped;
        room.seek_sync_waiting_users = room
            .users
            .keys()
            .filter(|id| initiator != Some(id.as_str()))
            .cloned()
            .collect();

        room.is_playing = false;
        room.current_time = clamped;
        room.updated_at = now;
        room.pause_reason = reason;
        room.buffering_users.clear();
        Self::cancel_all_buffer_pauses_locked(room);
        room.reset_rate_trackers();

        if room.seek_sync_waiting_users.is_empty() {
            let resume = Self::complete_barrier_locked(room, now);
            BarrierStart {
                epoch,
                target_time: clamped,
                was_playing: resume.should_resume,
                completed_immediately: true,
            }
        } else {
            room.pending_barrier_timeout = Some(epoch);
            log::debug!(
                "[Barrier] Room {} epoch {} waiting on {} user(s) at {:.2}s",
                room.room_id,
                epoch,
                room.seek_sync_waiting_users.len(),
                clamped
            );
            BarrierStart {
                epoch,
                target_time: clamped,
                was_playing,
                completed_immediately: false,
            }
        }
    }

    /// Completes the active barrier: resumes if the room was playing when
    /// it opened, clears the reason, and bumps the epoch so any in-flight
    /// timeout for this barrier dies on its epoch check.
    pub(crate) fn complete_barrier_locked(room: &mut Room, now: f64) -> BarrierResume {
        let should_resume = room.seek_sync_was_playing;

        room.pending_barrier_timeout = None;
        room.seek_sync_waiting_users.clear();
        room.seek_sync_was_playing = false;
        room.seek_sync_epoch += 1;

        if should_resume {
            room.is_playing = true;
            room.updated_at = now;
        }
        room.pause_reason = PauseReason::None;

        BarrierResume {
            should_resume,
            current_time: room.current_time,
        }
    }

    /// Abandons any active barrier without completing it (manual play or
    /// pause override, video change). The epoch bump invalidates the
    /// scheduled timeout.
    pub(crate) fn cancel_barrier_locked(room: &mut Room) {
        if room.pending_barrier_timeout.is_some() || !room.seek_sync_waiting_users.is_empty() {
            room.seek_sync_epoch += 1;
        }
        room.pending_barrier_timeout = None;
        room.seek_sync_waiting_users.clear();
        room.seek_sync_was_playing = false;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Timeout Task
    // ─────────────────────────────────────────────────────────────────────────

    fn spawn_barrier_timeout(self: &Arc<Self>, room_id: String, epoch: u64) {
        let engine = Arc::clone(self);
        let timeout = self.barrier_timeout_secs();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(timeout)).await;
            engine.fire_barrier_timeout(&room_id, epoch).await;
        });
    }

    /// Timeout body: if the barrier is still the active one, force-complete
    /// it with the same resume semantics as full readiness. A slow client
    /// should degrade into drift correction, not hold the room forever.
    pub(crate) async fn fire_barrier_timeout(self: &Arc<Self>, room_id: &str, epoch: u64) {
        let now = self.now();
        let resume = {
            let mut rooms = self.rooms().lock();
            let Some(room) = rooms.get_mut(room_id) else {
                return;
            };
            if !room.pause_reason.is_barrier()
                || room.seek_sync_epoch != epoch
                || room.seek_sync_waiting_users.is_empty()
            {
                return;
            }
            log::warn!(
                "[Barrier] Room {} epoch {} timed out with {} user(s) unconfirmed",
                room_id,
                epoch,
                room.seek_sync_waiting_users.len()
            );
            Self::complete_barrier_locked(room, now)
        };

        if resume.should_resume {
            self.broadcast_to_room(
                room_id,
                &Outbound::sync(true, resume.current_time, true)
                    .triggered_by("System (Seek Sync Timeout)"),
                None,
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::party::engine::{PauseOutcome, VideoUpdate};
    use crate::party::model::VideoFormat;
    use crate::party::testing::RecordingConnection;

    fn setup() -> (Arc<PartyEngine>, String, String, String) {
        let engine = Arc::new(PartyEngine::new());
        let a = engine
            .join("ROOM", RecordingConnection::arc(), "alice".into(), "🎬".into())
            .user_id;
        let b = engine
            .join("ROOM", RecordingConnection::arc(), "bob".into(), "🎬".into())
            .user_id;
        let c = engine
            .join("ROOM", RecordingConnection::arc(), "carol".into(), "🎬".into())
            .user_id;
        engine.update_video(
            "ROOM",
            VideoUpdate {
                url: "http://x/y.mp4".into(),
                format: VideoFormat::Mp4,
                duration: 600.0,
                ..Default::default()
            },
            0.0,
        );
        (engine, a, b, c)
    }

    #[tokio::test]
    async fn seek_opens_barrier_and_waits_for_others() {
        let (engine, alice, bob, carol) = setup();
        engine.manual_play("ROOM", 0.0);

        let start = match engine.seek("ROOM", &alice, 120.0, 20.0) {
            SeekOutcome::Started(s) => s,
            other => panic!("expected barrier, got {:?}", other),
        };
        assert!(!start.completed_immediately);
        assert!(start.was_playing);
        assert_eq!(start.target_time, 120.0);

        let snap = engine.get_playback_snapshot("ROOM").unwrap();
        assert!(!snap.is_playing);
        assert_eq!(snap.pause_reason, PauseReason::Seek);
        assert_eq!(snap.current_time, 120.0);

        // Bob confirms; Carol still pending.
        assert!(engine
            .mark_barrier_ready("ROOM", &bob, start.epoch, 21.0)
            .is_none());

        // Carol confirms; barrier completes and resumes.
        let resume = engine
            .mark_barrier_ready("ROOM", &carol, start.epoch, 22.0)
            .unwrap();
        assert!(resume.should_resume);
        assert_eq!(resume.current_time, 120.0);
        assert!(engine.get_playback_snapshot("ROOM").unwrap().is_playing);
    }

    #[tokio::test]
    async fn leave_completes_barrier() {
        let (engine, alice, bob, carol) = setup();
        engine.manual_play("ROOM", 0.0);

        let start = match engine.seek("ROOM", &alice, 120.0, 20.0) {
            SeekOutcome::Started(s) => s,
            other => panic!("expected barrier, got {:?}", other),
        };
        assert!(engine
            .mark_barrier_ready("ROOM", &bob, start.epoch, 21.0)
            .is_none());

        // Carol disconnects while the room waits on her.
        let outcome = engine.leave("ROOM", &carol, 22.0).unwrap();
        let resume = outcome.barrier_resume.expect("barrier should complete");
        assert!(resume.should_resume);
        assert!(engine.get_playback_snapshot("ROOM").unwrap().is_playing);
    }

    #[tokio::test]
    async fn stale_seek_ready_is_a_noop() {
        let (engine, alice, bob, _carol) = setup();
        engine.manual_play("ROOM", 0.0);

        let first = match engine.seek("ROOM", &alice, 120.0, 20.0) {
            SeekOutcome::Started(s) => s,
            other => panic!("{:?}", other),
        };
        let second = match engine.seek("ROOM", &alice, 240.0, 21.0) {
            SeekOutcome::Started(s) => s,
            other => panic!("{:?}", other),
        };
        assert!(second.epoch > first.epoch);

        // Ready for the superseded barrier does nothing.
        assert!(engine
            .mark_barrier_ready("ROOM", &bob, first.epoch, 22.0)
            .is_none());
        let snap = engine.get_playback_snapshot("ROOM").unwrap();
        assert!(!snap.is_playing);
        assert_eq!(snap.current_time, 240.0);
    }

    #[tokio::test]
    async fn duplicate_seek_ready_is_idempotent() {
        let (engine, alice, bob, carol) = setup();
        engine.manual_play("ROOM", 0.0);

        let start = match engine.seek("ROOM", &alice, 120.0, 20.0) {
            SeekOutcome::Started(s) => s,
            other => panic!("{:?}", other),
        };
        assert!(engine
            .mark_barrier_ready("ROOM", &bob, start.epoch, 21.0)
            .is_none());
        // Replayed frame: same user, same epoch.
        assert!(engine
            .mark_barrier_ready("ROOM", &bob, start.epoch, 21.1)
            .is_none());

        let resume = engine
            .mark_barrier_ready("ROOM", &carol, start.epoch, 22.0)
            .unwrap();
        assert!(resume.should_resume);

        // And again after completion.
        assert!(engine
            .mark_barrier_ready("ROOM", &carol, start.epoch, 23.0)
            .is_none());
    }

    #[tokio::test]
    async fn seek_dedup_drops_double_fire() {
        let (engine, alice, _bob, _carol) = setup();
        engine.manual_play("ROOM", 0.0);

        // First seek from a scrub gesture.
        match engine.seek("ROOM", &alice, 120.0, 20.0) {
            SeekOutcome::Started(_) => {}
            other => panic!("{:?}", other),
        }
        // Double-fire: target matches the pinned position, 0.1s later.
        assert!(matches!(
            engine.seek("ROOM", &alice, 120.1, 20.1),
            SeekOutcome::Deduped
        ));
        // A genuinely different target goes through.
        assert!(matches!(
            engine.seek("ROOM", &alice, 300.0, 20.2),
            SeekOutcome::Started(_)
        ));
    }

    #[tokio::test]
    async fn seek_target_is_clamped_to_duration() {
        let (engine, alice, _bob, _carol) = setup();
        engine.manual_play("ROOM", 0.0);

        let start = match engine.seek("ROOM", &alice, 10_000.0, 20.0) {
            SeekOutcome::Started(s) => s,
            other => panic!("{:?}", other),
        };
        assert!((start.target_time - 599.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn solo_seek_completes_immediately() {
        let engine = Arc::new(PartyEngine::new());
        let alice = engine
            .join("SOLO", RecordingConnection::arc(), "alice".into(), "🎬".into())
            .user_id;
        engine.update_video(
            "SOLO",
            VideoUpdate {
                url: "http://x/y.mp4".into(),
                format: VideoFormat::Mp4,
                duration: 600.0,
                ..Default::default()
            },
            0.0,
        );
        engine.manual_play("SOLO", 0.0);

        let start = match engine.seek("SOLO", &alice, 120.0, 20.0) {
            SeekOutcome::Started(s) => s,
            other => panic!("{:?}", other),
        };
        assert!(start.completed_immediately);
        let snap = engine.get_playback_snapshot("SOLO").unwrap();
        assert!(snap.is_playing);
        assert_eq!(snap.current_time, 120.0);
    }

    #[tokio::test(start_paused = true)]
    async fn barrier_timeout_force_completes() {
        let (engine, alice, _bob, _carol) = setup();
        engine.manual_play("ROOM", 0.0);

        let now = engine.now();
        match engine.seek("ROOM", &alice, 120.0, now) {
            SeekOutcome::Started(s) => assert!(!s.completed_immediately),
            other => panic!("{:?}", other),
        }
        assert!(!engine.get_playback_snapshot("ROOM").unwrap().is_playing);

        // No one confirms; the timeout resumes the room.
        tokio::time::sleep(Duration::from_secs_f64(8.5)).await;
        tokio::task::yield_now().await;
        let snap = engine.get_playback_snapshot("ROOM").unwrap();
        assert!(snap.is_playing);
        assert_eq!(snap.pause_reason, PauseReason::None);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_barrier_timeout_is_inert() {
        let (engine, alice, bob, carol) = setup();
        engine.manual_play("ROOM", 0.0);

        let first = match engine.seek("ROOM", &alice, 120.0, engine.now()) {
            SeekOutcome::Started(s) => s,
            other => panic!("{:?}", other),
        };
        // Everyone confirms quickly; the room resumes at 120.
        engine.mark_barrier_ready("ROOM", &bob, first.epoch, engine.now());
        engine.mark_barrier_ready("ROOM", &carol, first.epoch, engine.now());
        assert!(engine.get_playback_snapshot("ROOM").unwrap().is_playing);

        // Let the stale timeout fire; it must not disturb playback.
        tokio::time::sleep(Duration::from_secs_f64(9.0)).await;
        tokio::task::yield_now().await;
        let snap = engine.get_playback_snapshot("ROOM").unwrap();
        assert!(snap.is_playing);
        assert_eq!(snap.current_time, 120.0);
    }

    #[tokio::test]
    async fn seek_via_pause_opens_barrier() {
        let (engine, _alice, _bob, _carol) = setup();
        engine.manual_play("ROOM", 0.0);

        // Live time ~40s; pause carrying 200s is a seek intent.
        let outcome = engine.pause_request("ROOM", Some(200.0), 40.0);
        let start = match outcome {
            PauseOutcome::SeekViaPause(s) => s,
            other => panic!("expected seek-via-pause, got {:?}", other),
        };
        engine.arm_barrier_timeout("ROOM", &start);
        assert!(start.was_playing);
        assert_eq!(start.target_time, 200.0);

        let snap = engine.get_playback_snapshot("ROOM").unwrap();
        assert_eq!(snap.pause_reason, PauseReason::Seek);
        assert_eq!(snap.current_time, 200.0);
    }

    #[tokio::test]
    async fn pause_near_live_time_is_a_plain_pause() {
        let (engine, _alice, _bob, _carol) = setup();
        engine.manual_play("ROOM", 0.0);

        let outcome = engine.pause_request("ROOM", Some(10.5), 10.0);
        match outcome {
            PauseOutcome::Paused { current_time } => assert!((current_time - 10.0).abs() < 1e-9),
            other => panic!("expected plain pause, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn barrier_epoch_strictly_increases() {
        let (engine, alice, _bob, _carol) = setup();
        engine.manual_play("ROOM", 0.0);

        let mut last = 0;
        for i in 0..5 {
            let now = 20.0 + i as f64;
            if let SeekOutcome::Started(s) = engine.seek("ROOM", &alice, 50.0 * (i + 1) as f64, now)
            {
                assert!(s.epoch > last);
                last = s.epoch;
            } else {
                panic!("seek {} failed", i);
            }
        }
    }
}
