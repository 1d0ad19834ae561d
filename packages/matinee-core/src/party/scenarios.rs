//! End-to-end engine scenarios: several clients, one room, full event
//! sequences driven the way the connection router drives them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::barrier::SeekOutcome;
use super::buffer::BufferStartOutcome;
use super::engine::{PartyEngine, PauseOutcome, VideoUpdate};
use super::heartbeat::Correction;
use super::model::VideoFormat;
use super::testing::RecordingConnection;
use crate::protocol::Outbound;

fn mp4_video(duration: f64) -> VideoUpdate {
    VideoUpdate {
        url: "http://x/y.mp4".into(),
        title: "Feature".into(),
        format: VideoFormat::Mp4,
        duration,
        ..Default::default()
    }
}

fn last_json(conn: &RecordingConnection) -> Value {
    let sent = conn.sent();
    serde_json::from_str(sent.last().expect("no frames sent")).unwrap()
}

/// Two clients, play, an in-sync heartbeat, then a shared pause.
#[tokio::test]
async fn two_client_basic_sync() {
    let engine = Arc::new(PartyEngine::new());
    let alice_conn = RecordingConnection::new();
    let bob_conn = RecordingConnection::new();
    let _alice = engine
        .join("ABCD1234", alice_conn.clone(), "alice".into(), "🎬".into())
        .user_id;
    let bob = engine
        .join("ABCD1234", bob_conn.clone(), "bob".into(), "🎬".into())
        .user_id;

    // Alice changes the video; the resolver reported mp4/600s.
    assert!(engine.update_video("ABCD1234", mp4_video(600.0), 0.0));

    // Alice plays from the start.
    let resumed = engine.manual_play("ABCD1234", 0.0).unwrap();
    assert_eq!(resumed, 0.0);

    // Five seconds in, Bob's heartbeat matches the server exactly.
    assert_eq!(
        engine.handle_heartbeat("ABCD1234", &bob, 5.0, false, 5.0),
        None
    );

    // At t=10 Alice pauses at her local position.
    let outcome = engine.pause_request("ABCD1234", Some(10.0), 10.0);
    let paused = match outcome {
        PauseOutcome::Paused { current_time } => current_time,
        other => panic!("expected pause, got {:?}", other),
    };
    assert!((paused - 10.0).abs() < 1e-9);

    engine
        .broadcast_to_room(
            "ABCD1234",
            &Outbound::sync(false, paused, true).triggered_by("alice"),
            None,
        )
        .await;

    for conn in [&alice_conn, &bob_conn] {
        let v = last_json(conn);
        assert_eq!(v["type"], "sync");
        assert_eq!(v["is_playing"], false);
        assert_eq!(v["current_time"], 10.0);
        assert_eq!(v["force_seek"], true);
    }
}

/// Seek barrier: one confirmation plus one disconnect completes it.
#[tokio::test]
async fn seek_barrier_completion() {
    let engine = Arc::new(PartyEngine::new());
    let alice = engine
        .join("ROOM", RecordingConnection::arc(), "alice".into(), "🎬".into())
        .user_id;
    let bob = engine
        .join("ROOM", RecordingConnection::arc(), "bob".into(), "🎬".into())
        .user_id;
    let carol = engine
        .join("ROOM", RecordingConnection::arc(), "carol".into(), "🎬".into())
        .user_id;
    engine.update_video("ROOM", mp4_video(600.0), 0.0);
    engine.manual_play("ROOM", 0.0);

    // Playing at ~20s, Alice seeks to 120.
    let start = match engine.seek("ROOM", &alice, 120.0, 20.0) {
        SeekOutcome::Started(s) => s,
        other => panic!("{:?}", other),
    };
    assert!(!start.completed_immediately);
    assert!(start.was_playing);

    // Bob confirms readiness; Carol is still pending, no resume yet.
    assert!(engine
        .mark_barrier_ready("ROOM", &bob, start.epoch, 21.0)
        .is_none());
    assert!(!engine.get_playback_snapshot("ROOM").unwrap().is_playing);

    // Carol disconnects; the waiting set empties and the room resumes.
    let outcome = engine.leave("ROOM", &carol, 22.0).unwrap();
    let resume = outcome.barrier_resume.expect("barrier must complete");
    assert!(resume.should_resume);
    assert_eq!(resume.current_time, 120.0);

    let snap = engine.get_playback_snapshot("ROOM").unwrap();
    assert!(snap.is_playing);
    assert_eq!(snap.current_time, 120.0);
}

/// Buffer stall pauses the room after the grace delay, then recovery
/// auto-resumes it. Runs on the real clock end to end, including the
/// initial video-load buffer episode every player emits.
#[tokio::test]
async fn buffer_pause_then_auto_resume() {
    let engine = Arc::new(PartyEngine::new());
    let conn = RecordingConnection::new();
    let user = engine
        .join("ROOM", conn.clone(), "alice".into(), "🎬".into())
        .user_id;
    engine.update_video("ROOM", mp4_video(600.0), engine.now());

    // Initial load buffering while paused (first-ever grace consumed here).
    assert_eq!(
        engine.buffer_start_and_schedule("ROOM", &user, engine.now()),
        BufferStartOutcome::Recorded
    );
    engine.buffer_end_and_check_resume("ROOM", &user, engine.now());

    tokio::time::sleep(Duration::from_millis(400)).await;
    engine.manual_play("ROOM", engine.now());

    // Mid-playback stall.
    match engine.buffer_start_and_schedule("ROOM", &user, engine.now()) {
        BufferStartOutcome::PauseScheduled(_) => {}
        other => panic!("expected scheduled pause, got {:?}", other),
    }

    // The delayed pause fires 2s later.
    tokio::time::sleep(Duration::from_millis(2300)).await;
    let snap = engine.get_playback_snapshot("ROOM").unwrap();
    assert!(!snap.is_playing);
    assert_eq!(snap.pause_reason, super::model::PauseReason::Buffer);
    let pause_frame = last_json(&conn);
    assert_eq!(pause_frame["type"], "sync");
    assert_eq!(pause_frame["is_playing"], false);
    assert!(pause_frame["triggered_by"]
        .as_str()
        .unwrap()
        .contains("Buffer Pause"));

    // Recovery: episode lasted > 2s, nobody else buffering.
    let resumed = engine.buffer_end_and_check_resume("ROOM", &user, engine.now());
    let resumed = resumed.expect("auto-resume should fire");
    assert!((resumed - snap.current_time).abs() < 1e-9);
    assert!(engine.get_playback_snapshot("ROOM").unwrap().is_playing);
}

/// Spam suppression: a flapping client cannot pause the room repeatedly.
#[tokio::test]
async fn buffer_spam_suppression() {
    let engine = Arc::new(PartyEngine::new());
    let user = engine
        .join("ROOM", RecordingConnection::arc(), "alice".into(), "🎬".into())
        .user_id;
    engine.update_video("ROOM", mp4_video(600.0), 0.0);
    engine.manual_play("ROOM", 0.0);

    let mut scheduled = Vec::new();
    for t in [0.0_f64, 5.0, 10.0, 15.0] {
        match engine.buffer_start("ROOM", &user, t) {
            BufferStartOutcome::PauseScheduled(epoch) => scheduled.push((t, epoch)),
            BufferStartOutcome::Recorded | BufferStartOutcome::Suppressed => {}
            other => panic!("{:?}", other),
        }
        engine.buffer_end_and_check_resume("ROOM", &user, t + 0.4);
    }

    // The first event fell under the load grace and the fourth was
    // suppressed by the trigger counter; at most two tasks were scheduled,
    // and every one of them was cancelled by the matching buffer_end.
    assert!(scheduled.len() <= 2);
    let mut pauses = 0;
    for (t, epoch) in scheduled {
        if engine
            .check_and_apply_buffer_pause("ROOM", &user, epoch, t + 2.0)
            .is_some()
        {
            pauses += 1;
        }
    }
    assert_eq!(pauses, 0);
    assert!(engine.get_playback_snapshot("ROOM").unwrap().is_playing);
}

/// Stalled client gets a single hard recovery sync.
#[tokio::test]
async fn stall_recovery() {
    let engine = Arc::new(PartyEngine::new());
    let conn = RecordingConnection::new();
    let user = engine
        .join("ROOM", conn.clone(), "alice".into(), "🎬".into())
        .user_id;
    engine.update_video("ROOM", mp4_video(600.0), 0.0);
    engine.manual_play("ROOM", 0.0);

    assert_eq!(engine.handle_heartbeat("ROOM", &user, 5.0, false, 5.0), None);
    assert_eq!(
        engine.handle_heartbeat("ROOM", &user, 5.01, false, 5.4),
        None
    );
    let correction = engine.handle_heartbeat("ROOM", &user, 5.02, false, 9.0);
    let server_time = match correction {
        Some(Correction::Hard { current_time }) => current_time,
        other => panic!("expected hard sync, got {:?}", other),
    };
    assert!((server_time - 9.0).abs() < 1e-9);

    // Delivery, as the router does it: a per-user sync frame.
    engine
        .send_to_user(
            "ROOM",
            &user,
            &Outbound::sync(true, server_time, true)
                .triggered_by("System (Heartbeat Sync)"),
        )
        .await;
    let v = last_json(&conn);
    assert_eq!(v["type"], "sync");
    assert_eq!(v["force_seek"], true);
    assert_eq!(v["triggered_by"], "System (Heartbeat Sync)");

    let rooms = engine.rooms().lock();
    assert_eq!(rooms.get("ROOM").unwrap().users[&user].last_rate_sent, 1.0);
}

/// A pause carrying a far-away position is treated as a seek.
#[tokio::test]
async fn seek_via_pause() {
    let engine = Arc::new(PartyEngine::new());
    let alice_conn = RecordingConnection::new();
    let bob_conn = RecordingConnection::new();
    engine.join("ROOM", alice_conn.clone(), "alice".into(), "🎬".into());
    engine.join("ROOM", bob_conn.clone(), "bob".into(), "🎬".into());
    engine.update_video("ROOM", mp4_video(600.0), 0.0);
    engine.manual_play("ROOM", 0.0);

    // Live time ~40s; the client's pause carries 200s.
    let start = match engine.pause_request("ROOM", Some(200.0), 40.0) {
        PauseOutcome::SeekViaPause(s) => s,
        other => panic!("expected seek-via-pause, got {:?}", other),
    };
    engine.arm_barrier_timeout("ROOM", &start);
    assert_eq!(start.target_time, 200.0);

    engine
        .broadcast_to_room(
            "ROOM",
            &Outbound::seek_sync(start.target_time, start.epoch)
                .triggered_by("alice (Seek via Pause)"),
            None,
        )
        .await;

    for conn in [&alice_conn, &bob_conn] {
        let v = last_json(conn);
        assert_eq!(v["type"], "sync");
        assert_eq!(v["is_playing"], false);
        assert_eq!(v["current_time"], 200.0);
        assert_eq!(v["seek_sync"], true);
        assert_eq!(v["seek_epoch"], start.epoch);
        assert_eq!(v["triggered_by"], "alice (Seek via Pause)");
    }

    let snap = engine.get_playback_snapshot("ROOM").unwrap();
    assert_eq!(snap.pause_reason, super::model::PauseReason::Seek);
    assert_eq!(snap.current_time, 200.0);
}

/// Rapid interleaved seeks from several users leave exactly one barrier.
#[tokio::test]
async fn interleaved_seeks_keep_one_barrier() {
    let engine = Arc::new(PartyEngine::new());
    let users: Vec<String> = ["alice", "bob", "carol"]
        .iter()
        .map(|n| {
            engine
                .join("ROOM", RecordingConnection::arc(), (*n).to_string(), "🎬".into())
                .user_id
        })
        .collect();
    engine.update_video("ROOM", mp4_video(600.0), 0.0);
    engine.manual_play("ROOM", 0.0);

    let mut epochs = Vec::new();
    for (i, user) in users.iter().enumerate() {
        let now = 10.0 + i as f64;
        if let SeekOutcome::Started(s) = engine.seek("ROOM", user, 100.0 * (i + 1) as f64, now) {
            epochs.push(s.epoch);
        }
    }
    assert!(epochs.windows(2).all(|w| w[0] < w[1]));

    // Only the newest barrier is live; readiness against older epochs is
    // discarded and the waiting set tracks the final seek only.
    let rooms = engine.rooms().lock();
    let room = rooms.get("ROOM").unwrap();
    assert_eq!(room.seek_sync_epoch, *epochs.last().unwrap());
    assert_eq!(room.current_time, 300.0);
    assert_eq!(room.seek_sync_waiting_users.len(), 2);
}
