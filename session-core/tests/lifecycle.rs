//! End-to-end lifecycle scenarios driven through the orchestrator with
//! in-memory repositories, a temporary data root and `/bin/cat` standing in
//! for the hosted game.

#![cfg(unix)]

use session_core::adapter::AdapterRegistry;
use session_core::config::RecordingConfig;
use session_core::error::CoreError;
use session_core::model::{EventKind, Game, GameStatus, SessionStatus};
use session_core::orchestrator::{OrchestratorOptions, SessionOrchestrator, StartSessionRequest};
use session_core::repository::{
    InMemoryEventRepository, InMemoryGameRepository, InMemorySaveRepository,
    InMemorySessionRepository, Repositories, SaveRepository,
};
use session_core::saves::{SaveStore, checksum_prefix};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    orchestrator: SessionOrchestrator,
    repos: Repositories,
    events: Arc<InMemoryEventRepository>,
    root: PathBuf,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let events = Arc::new(InMemoryEventRepository::new());
    let game = Game {
        id: "nethack".to_owned(),
        name: "NetHack".to_owned(),
        binary: PathBuf::from("/bin/cat"),
        args: Vec::new(),
        cwd: None,
        env: HashMap::new(),
        max_cpu_millis: None,
        max_memory_mib: None,
        status: GameStatus::Enabled,
    };
    let repos = Repositories {
        games: Arc::new(InMemoryGameRepository::new(vec![game])),
        sessions: Arc::new(InMemorySessionRepository::new()),
        saves: Arc::new(InMemorySaveRepository::new()),
        events: events.clone(),
    };
    let saves = SaveStore::new(root.clone(), repos.saves.clone());
    let opts = OrchestratorOptions {
        data_root: root.clone(),
        pty_grace: Duration::from_secs(2),
        ring_capacity: 100,
        frame_channel_capacity: 1000,
        max_spectators: 4,
        recording: RecordingConfig {
            enabled: true,
            ..RecordingConfig::default()
        },
    };
    let orchestrator = SessionOrchestrator::new(opts, AdapterRegistry::empty(), saves, repos.clone());
    Harness {
        orchestrator,
        repos,
        events,
        root,
        _dir: dir,
    }
}

fn start_request(user_id: u64, username: &str) -> StartSessionRequest {
    StartSessionRequest {
        user_id,
        username: username.to_owned(),
        game_id: "nethack".to_owned(),
        cols: 80,
        rows: 24,
        record: None,
    }
}

async fn wait_for_status(
    harness: &Harness,
    session_id: &str,
    wanted: SessionStatus,
) -> SessionStatus {
    for _ in 0..100 {
        let session = harness.orchestrator.get_session(session_id).await.unwrap();
        if session.status == wanted {
            return session.status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    harness
        .orchestrator
        .get_session(session_id)
        .await
        .unwrap()
        .status
}

async fn event_count(harness: &Harness, session_id: &str, kind: EventKind) -> usize {
    harness
        .events
        .all()
        .await
        .iter()
        .filter(|e| e.kind == kind && e.session_id == session_id)
        .count()
}

fn scratch_save(root: &Path, session_id: &str) -> PathBuf {
    root.join("sessions").join(session_id).join("save/save.dat")
}

#[tokio::test]
async fn fresh_user_starts_with_an_empty_scratch() {
    let hx = harness();
    let session = hx
        .orchestrator
        .start_session(start_request(7, "alice"))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Active);
    assert!(session.pid.unwrap() > 0);
    assert!(hx.root.join("sessions").join(&session.id).is_dir());
    // No save existed, so nothing was staged.
    assert!(!scratch_save(&hx.root, &session.id).exists());
    assert_eq!(event_count(&hx, &session.id, EventKind::SessionStart).await, 1);

    // Decline the auto-pick prompt; input must flow without error.
    hx.orchestrator.write_input(&session.id, b"n").await.unwrap();

    hx.orchestrator.stop_session(&session.id, None).await.unwrap();
}

#[tokio::test]
async fn save_round_trips_through_stop_and_resume() {
    let hx = harness();
    let session = hx
        .orchestrator
        .start_session(start_request(7, "alice"))
        .await
        .unwrap();

    // The game "writes" its save into the scratch directory.
    let scratch = scratch_save(&hx.root, &session.id);
    tokio::fs::create_dir_all(scratch.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&scratch, b"game-progress-v1").await.unwrap();

    hx.orchestrator.stop_session(&session.id, None).await.unwrap();

    let stopped = hx.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(stopped.status, SessionStatus::Ended);
    assert!(stopped.ended_at.is_some());
    assert_eq!(event_count(&hx, &session.id, EventKind::SessionEnd).await, 1);

    let archived = hx
        .root
        .join("saves/user_7/nethack")
        .join(format!("save_{}.dat", session.id));
    assert_eq!(
        tokio::fs::read(&archived).await.unwrap(),
        b"game-progress-v1"
    );
    let save = hx
        .repos
        .saves
        .find_active_by_user_and_game(7, "nethack")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(save.checksum, checksum_prefix(b"game-progress-v1"));

    // A new session for the same user resumes from the archived save.
    let second = hx
        .orchestrator
        .start_session(start_request(7, "alice"))
        .await
        .unwrap();
    assert_ne!(second.id, session.id);
    assert_eq!(
        tokio::fs::read(scratch_save(&hx.root, &second.id))
            .await
            .unwrap(),
        b"game-progress-v1"
    );
    hx.orchestrator.stop_session(&second.id, None).await.unwrap();
}

#[tokio::test]
async fn one_active_session_per_user_and_game() {
    let hx = harness();
    let session = hx
        .orchestrator
        .start_session(start_request(7, "alice"))
        .await
        .unwrap();

    let err = hx
        .orchestrator
        .start_session(start_request(7, "alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AlreadyExists(_)));

    // A different user is unaffected.
    let other = hx
        .orchestrator
        .start_session(start_request(8, "bob"))
        .await
        .unwrap();

    hx.orchestrator.stop_session(&session.id, None).await.unwrap();
    hx.orchestrator.stop_session(&other.id, None).await.unwrap();

    // After the stop the slot frees up again.
    let replacement = hx
        .orchestrator
        .start_session(start_request(7, "alice"))
        .await
        .unwrap();
    hx.orchestrator
        .stop_session(&replacement.id, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn stopping_twice_is_idempotent() {
    let hx = harness();
    let session = hx
        .orchestrator
        .start_session(start_request(7, "alice"))
        .await
        .unwrap();

    hx.orchestrator.stop_session(&session.id, None).await.unwrap();
    let once = hx.orchestrator.get_session(&session.id).await.unwrap();
    hx.orchestrator.stop_session(&session.id, None).await.unwrap();
    let twice = hx.orchestrator.get_session(&session.id).await.unwrap();

    assert_eq!(once.status, SessionStatus::Ended);
    assert_eq!(twice.status, once.status);
    assert_eq!(twice.ended_at, once.ended_at);
    assert_eq!(event_count(&hx, &session.id, EventKind::SessionEnd).await, 1);
}

#[tokio::test]
async fn externally_killed_child_fails_the_session() {
    let hx = harness();
    let session = hx
        .orchestrator
        .start_session(start_request(7, "alice"))
        .await
        .unwrap();
    let pid = session.pid.unwrap();

    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }

    let status = wait_for_status(&hx, &session.id, SessionStatus::Failed).await;
    assert_eq!(status, SessionStatus::Failed);
    let failed = hx.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(
        failed.failure_reason.as_deref(),
        Some("Process terminated unexpectedly")
    );
    assert_eq!(event_count(&hx, &session.id, EventKind::GameCrashed).await, 1);
}

#[tokio::test]
async fn player_reconnect_resumes_from_the_ring() {
    let hx = harness();
    let session = hx
        .orchestrator
        .start_session(start_request(7, "alice"))
        .await
        .unwrap();

    hx.orchestrator
        .write_input(&session.id, b"hello ring\n")
        .await
        .unwrap();

    // Wait for the echo to come back through the fan-out.
    let mut streamed = 0;
    for _ in 0..100 {
        streamed = hx
            .orchestrator
            .get_session(&session.id)
            .await
            .unwrap()
            .frames_streamed;
        if streamed > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(streamed > 0, "no frames observed");

    let (_record, mut frames) = hx.orchestrator.attach_player(&session.id, 7).await.unwrap();
    let mut seen = Vec::new();
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_millis(500), frames.recv()).await
    {
        seen.extend_from_slice(&frame.data);
        if seen.windows(10).any(|w| w == b"hello ring") {
            break;
        }
    }
    assert!(
        seen.windows(10).any(|w| w == b"hello ring"),
        "catch-up missed the echoed input: {seen:?}"
    );
    drop(frames);

    // Dropping the stream leaves the session untouched; a fresh attach
    // catches up again.
    let alive = hx.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(alive.status, SessionStatus::Active);
    let (_record, mut frames) = hx.orchestrator.attach_player(&session.id, 7).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(1), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id, 0, "catch-up starts with the reset hint");

    // Only the owner may attach as the player.
    let err = hx.orchestrator.attach_player(&session.id, 8).await.unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied(_)));

    hx.orchestrator.stop_session(&session.id, None).await.unwrap();
}

#[tokio::test]
async fn spectators_join_catch_up_and_leave() {
    let hx = harness();
    let session = hx
        .orchestrator
        .start_session(start_request(7, "alice"))
        .await
        .unwrap();

    let info = hx
        .orchestrator
        .add_spectator(&session.id, 21, "watcher")
        .await
        .unwrap();
    assert_eq!(info.user_id, 21);
    assert!(info.active);
    assert_eq!(event_count(&hx, &session.id, EventKind::SpectatorJoin).await, 1);

    // The same user cannot join twice.
    let err = hx
        .orchestrator
        .add_spectator(&session.id, 21, "watcher")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AlreadyExists(_)));

    // The stream attach claims the parked frames, reset hint first.
    let (_handle, mut frames) = hx
        .orchestrator
        .attach_spectator(&session.id, 21, "watcher")
        .await
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(1), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.id, 0);

    hx.orchestrator
        .remove_spectator(&session.id, 21)
        .await
        .unwrap();
    assert_eq!(event_count(&hx, &session.id, EventKind::SpectatorLeave).await, 1);
    let session_view = hx.orchestrator.get_session(&session.id).await.unwrap();
    assert!(session_view.spectators.is_empty());

    // Removing again reports not found.
    let err = hx
        .orchestrator
        .remove_spectator(&session.id, 21)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));

    hx.orchestrator.stop_session(&session.id, None).await.unwrap();
}

#[tokio::test]
async fn pause_suppresses_input_until_resume() {
    let hx = harness();
    let session = hx
        .orchestrator
        .start_session(start_request(7, "alice"))
        .await
        .unwrap();

    hx.orchestrator.pause_session(&session.id).await.unwrap();
    let paused = hx.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);

    // Accepted but dropped while paused.
    hx.orchestrator
        .write_input(&session.id, b"swallowed\n")
        .await
        .unwrap();

    // Pausing twice is rejected, resume restores the state machine.
    assert!(hx.orchestrator.pause_session(&session.id).await.is_err());
    hx.orchestrator.resume_session(&session.id).await.unwrap();
    let resumed = hx.orchestrator.get_session(&session.id).await.unwrap();
    assert_eq!(resumed.status, SessionStatus::Active);

    hx.orchestrator.stop_session(&session.id, None).await.unwrap();
}

#[tokio::test]
async fn recording_file_appears_for_recorded_sessions() {
    let hx = harness();
    let session = hx
        .orchestrator
        .start_session(start_request(7, "alice"))
        .await
        .unwrap();
    let recording = session.recording_path.clone().expect("recording enabled");
    assert!(recording.starts_with(hx.root.join("recordings")));

    hx.orchestrator
        .write_input(&session.id, b"for the record\n")
        .await
        .unwrap();
    // Wait until the echo reached the recorder.
    for _ in 0..100 {
        if hx
            .orchestrator
            .get_session(&session.id)
            .await
            .unwrap()
            .frames_streamed
            > 0
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    hx.orchestrator.stop_session(&session.id, None).await.unwrap();

    let raw = std::fs::read(&recording).unwrap();
    assert!(raw.len() > 12, "recording holds at least one frame");
}
