//! Broadcast fabric: fan-out to a room and the dead-peer reaper.
//!
//! Connection handles are snapshotted under the engine mutex, and all
//! network sends happen after it is released. Each send runs inside the
//! user's own send serializer (the connection implementation) under a short
//! timeout; a failed or timed-out send flags the user for the reaper rather
//! than aborting the broadcast for everyone else.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::protocol::Outbound;
use crate::protocol_constants::{REAPER_INTERVAL_SECS, SEND_TIMEOUT_SECS};

use super::engine::PartyEngine;
use super::model::ClientConnection;

impl PartyEngine {
    /// Sends a message to every user in a room, optionally excluding one.
    ///
    /// Sends fan out concurrently; one slow client cannot delay the others
    /// beyond its own send timeout.
    pub async fn broadcast_to_room(
        &self,
        room_id: &str,
        message: &Outbound,
        exclude_user_id: Option<&str>,
    ) {
        let targets: Vec<(String, Arc<dyn ClientConnection>)> = {
            let rooms = self.rooms().lock();
            let Some(room) = rooms.get(room_id) else {
                return;
            };
            room.users
                .values()
                .filter(|u| exclude_user_id != Some(u.user_id.as_str()))
                .map(|u| (u.user_id.clone(), Arc::clone(&u.conn)))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let Some(payload) = message.to_json() else {
            return;
        };

        let sends = targets.iter().map(|(user_id, conn)| {
            let payload = payload.as_str();
            async move {
                match tokio::time::timeout(
                    Duration::from_secs_f64(SEND_TIMEOUT_SECS),
                    conn.send_text(payload),
                )
                .await
                {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => {
                        log::warn!("[Broadcast] Send to {} failed: {}", user_id, e);
                        Some(user_id.clone())
                    }
                    Err(_) => {
                        log::warn!("[Broadcast] Send to {} timed out", user_id);
                        Some(user_id.clone())
                    }
                }
            }
        });

        let failed: Vec<String> = futures::future::join_all(sends)
            .await
            .into_iter()
            .flatten()
            .collect();

        if !failed.is_empty() {
            self.flag_dead_users(room_id, &failed);
        }
    }

    /// Sends a message to one user on their serialized connection.
    ///
    /// Returns whether the send succeeded.
    pub async fn send_to_user(&self, room_id: &str, user_id: &str, message: &Outbound) -> bool {
        let conn = {
            let rooms = self.rooms().lock();
            let Some(room) = rooms.get(room_id) else {
                return false;
            };
            let Some(user) = room.users.get(user_id) else {
                return false;
            };
            Arc::clone(&user.conn)
        };
        let Some(payload) = message.to_json() else {
            return false;
        };

        let sent = matches!(
            tokio::time::timeout(
                Duration::from_secs_f64(SEND_TIMEOUT_SECS),
                conn.send_text(&payload),
            )
            .await,
            Ok(Ok(()))
        );
        if !sent {
            log::warn!("[Broadcast] Direct send to {} failed", user_id);
            self.flag_dead_users(room_id, std::slice::from_ref(&user_id.to_string()));
        }
        sent
    }

    /// Stamps `last_send_failed_at` on users whose sends failed. The message
    /// itself is never retried; the reaper collects flagged users later.
    fn flag_dead_users(&self, room_id: &str, user_ids: &[String]) {
        let now = self.now();
        let mut rooms = self.rooms().lock();
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        for user_id in user_ids {
            if let Some(user) = room.users.get_mut(user_id) {
                user.last_send_failed_at = now;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reaper
    // ─────────────────────────────────────────────────────────────────────────

    /// Starts the periodic dead-peer reaper. Runs until the token cancels.
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(REAPER_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a sweep never
            // races server startup.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        log::info!("[Reaper] Stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        engine.reap_dead_users().await;
                    }
                }
            }
        });
    }

    /// One reaper sweep: removes every user flagged by a failed send,
    /// re-electing hosts and completing barriers exactly as a voluntary
    /// leave would, then announces the departures.
    pub async fn reap_dead_users(self: &Arc<Self>) {
        let flagged: Vec<(String, String)> = {
            let rooms = self.rooms().lock();
            rooms
                .iter()
                .flat_map(|(room_id, room)| {
                    room.users
                        .values()
                        .filter(|u| u.last_send_failed_at > 0.0)
                        .map(|u| (room_id.clone(), u.user_id.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for (room_id, user_id) in flagged {
            let now = self.now();
            let Some(outcome) = self.leave(&room_id, &user_id, now) else {
                continue;
            };
            log::info!("[Reaper] Collected dead user {} from room {}", user_id, room_id);
            if outcome.room_destroyed {
                continue;
            }
            self.broadcast_to_room(
                &room_id,
                &Outbound::UserLeft {
                    username: outcome.username.clone(),
                    user_id: outcome.user_id.clone(),
                    users: outcome.users.clone(),
                },
                None,
            )
            .await;
            if let Some(resume) = outcome.barrier_resume {
                if resume.should_resume {
                    self.broadcast_to_room(
                        &room_id,
                        &Outbound::sync(true, resume.current_time, true)
                            .triggered_by("System (Seek Sync Complete)"),
                        None,
                    )
                    .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::party::engine::VideoUpdate;
    use crate::party::model::VideoFormat;
    use crate::party::testing::RecordingConnection;

    fn make_engine() -> Arc<PartyEngine> {
        Arc::new(PartyEngine::new())
    }

    #[tokio::test]
    async fn broadcast_reaches_all_users() {
        let engine = make_engine();
        let alice_conn = RecordingConnection::new();
        let bob_conn = RecordingConnection::new();
        engine.join("ROOM", alice_conn.clone(), "alice".into(), "🎬".into());
        engine.join("ROOM", bob_conn.clone(), "bob".into(), "🎬".into());

        engine
            .broadcast_to_room("ROOM", &Outbound::Typing { username: "x".into() }, None)
            .await;

        assert_eq!(alice_conn.sent().len(), 1);
        assert_eq!(bob_conn.sent().len(), 1);
        assert!(alice_conn.sent()[0].contains("\"typing\""));
    }

    #[tokio::test]
    async fn broadcast_excludes_requested_user() {
        let engine = make_engine();
        let alice_conn = RecordingConnection::new();
        let bob_conn = RecordingConnection::new();
        let alice = engine
            .join("ROOM", alice_conn.clone(), "alice".into(), "🎬".into())
            .user_id;
        engine.join("ROOM", bob_conn.clone(), "bob".into(), "🎬".into());

        engine
            .broadcast_to_room(
                "ROOM",
                &Outbound::Typing { username: "alice".into() },
                Some(&alice),
            )
            .await;

        assert!(alice_conn.sent().is_empty());
        assert_eq!(bob_conn.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_flags_user_and_spares_others() {
        let engine = make_engine();
        let alice_conn = RecordingConnection::failing();
        let bob_conn = RecordingConnection::new();
        let alice = engine
            .join("ROOM", alice_conn.clone(), "alice".into(), "🎬".into())
            .user_id;
        engine.join("ROOM", bob_conn.clone(), "bob".into(), "🎬".into());

        engine
            .broadcast_to_room("ROOM", &Outbound::Typing { username: "x".into() }, None)
            .await;

        // Bob still got the frame; Alice is flagged, not removed.
        assert_eq!(bob_conn.sent().len(), 1);
        let rooms = engine.rooms().lock();
        let room = rooms.get("ROOM").unwrap();
        assert!(room.users[&alice].last_send_failed_at > 0.0);
        assert_eq!(room.users.len(), 2);
    }

    #[tokio::test]
    async fn reaper_removes_flagged_users_and_announces() {
        let engine = make_engine();
        let alice_conn = RecordingConnection::failing();
        let bob_conn = RecordingConnection::new();
        let alice = engine
            .join("ROOM", alice_conn.clone(), "alice".into(), "🎬".into())
            .user_id;
        engine.join("ROOM", bob_conn.clone(), "bob".into(), "🎬".into());

        engine
            .broadcast_to_room("ROOM", &Outbound::Typing { username: "x".into() }, None)
            .await;
        engine.reap_dead_users().await;

        let users = engine.room_users("ROOM");
        assert_eq!(users.len(), 1);
        assert!(users.iter().all(|u| u.user_id != alice));
        // Bob was told: typing frame + user_left frame.
        let sent = bob_conn.sent();
        assert!(sent.iter().any(|s| s.contains("\"user_left\"")));
        // Host moved to Bob.
        assert!(users[0].is_host);
    }

    #[tokio::test]
    async fn reaper_destroys_emptied_rooms() {
        let engine = make_engine();
        let conn = RecordingConnection::failing();
        engine.join("ROOM", conn, "alice".into(), "🎬".into());

        engine
            .broadcast_to_room("ROOM", &Outbound::Typing { username: "x".into() }, None)
            .await;
        assert!(engine.room_exists("ROOM"));
        engine.reap_dead_users().await;
        assert!(!engine.room_exists("ROOM"));
    }

    #[tokio::test]
    async fn reaped_user_completes_barrier() {
        let engine = make_engine();
        let alice_conn = RecordingConnection::new();
        let bob_conn = RecordingConnection::failing();
        let alice = engine
            .join("ROOM", alice_conn.clone(), "alice".into(), "🎬".into())
            .user_id;
        engine.join("ROOM", bob_conn, "bob".into(), "🎬".into());
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
        engine.manual_play("ROOM", 0.0);

        // Alice seeks; only Bob must confirm, but Bob's socket is dead.
        match engine.seek("ROOM", &alice, 120.0, 1.0) {
            crate::party::barrier::SeekOutcome::Started(s) => {
                assert!(!s.completed_immediately)
            }
            other => panic!("{:?}", other),
        }
        engine
            .broadcast_to_room("ROOM", &Outbound::seek_sync(120.0, 1), None)
            .await;
        engine.reap_dead_users().await;

        // Bob's removal emptied the waiting set; the room resumed.
        let snap = engine.get_playback_snapshot("ROOM").unwrap();
        assert!(snap.is_playing);
        assert_eq!(snap.current_time, 120.0);
        let sent = alice_conn.sent();
        assert!(sent
            .iter()
            .any(|s| s.contains("Seek Sync Complete")));
    }

    #[tokio::test]
    async fn send_to_user_targets_one_connection() {
        let engine = make_engine();
        let alice_conn = RecordingConnection::new();
        let bob_conn = RecordingConnection::new();
        let alice = engine
            .join("ROOM", alice_conn.clone(), "alice".into(), "🎬".into())
            .user_id;
        engine.join("ROOM", bob_conn.clone(), "bob".into(), "🎬".into());

        assert!(
            engine
                .send_to_user("ROOM", &alice, &Outbound::SyncCorrection { rate: 1.03 })
                .await
        );
        assert_eq!(alice_conn.sent().len(), 1);
        assert!(bob_conn.sent().is_empty());
    }
}
