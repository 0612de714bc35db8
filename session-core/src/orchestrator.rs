//! The session lifecycle engine. Owns the state machine
//! starting → active → ending → ended/failed, coordinates the adapter, save
//! store, PTY runtime, stream manager and recorder, and is the only component
//! that mutates a session record.
//!
//! Process exit binding is detached from the RPC that created the session:
//! the launch runs on its own task and the exit callback fires on a
//! background context, so cancelling the creation RPC never kills the child.

use crate::adapter::{AdapterRegistry, GameAdapter};
use crate::config::{GatewayConfig, RecordingConfig};
use crate::error::{CoreError, Result};
use crate::events::EventBus;
use crate::model::{EventKind, Frame, Game, Session, SessionId, SessionStatus};
use crate::pty::PtyProcess;
use crate::recorder::TtyrecRecorder;
use crate::repository::{GameRepository, Repositories, SessionRepository};
use crate::saves::SaveStore;
use crate::services::{PodPhase, PodPhaseChange};
use crate::stream::{SpectatorHandle, StreamManager};
use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tunables of the runtime, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub data_root: PathBuf,
    pub pty_grace: Duration,
    pub ring_capacity: usize,
    pub frame_channel_capacity: usize,
    pub max_spectators: usize,
    pub recording: RecordingConfig,
}

impl OrchestratorOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        OrchestratorOptions {
            data_root: config.data_root.clone(),
            pty_grace: Duration::from_secs(config.pty_grace_secs),
            ring_capacity: config.ring_capacity,
            frame_channel_capacity: config.frame_channel_capacity,
            max_spectators: config.max_spectators,
            recording: config.recording.clone(),
        }
    }
}

/// Request to start a playthrough.
#[derive(Debug, Clone)]
pub struct StartSessionRequest {
    pub user_id: u64,
    pub username: String,
    pub game_id: String,
    pub cols: u16,
    pub rows: u16,
    /// Overrides the configured recording default for this session.
    pub record: Option<bool>,
}

/// How a session came to its end.
enum ExitDisposition {
    /// The child exited on its own.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// An explicit stop request.
    Stopped { reason: Option<String> },
    /// Orphaned process or other crash.
    Failed { reason: String },
}

/// In-process handle of a running session. The persisted record stays
/// authoritative; this carries what only exists while the process lives.
struct LiveSession {
    id: SessionId,
    scratch: PathBuf,
    stream: Arc<StreamManager>,
    pty: Arc<PtyProcess>,
    adapter: Arc<dyn GameAdapter>,
    input_paused: AtomicBool,
    last_activity_ns: AtomicI64,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Spectator streams registered over the RPC surface and not yet claimed
    /// by a stream attach.
    pending_streams: tokio::sync::Mutex<HashMap<u64, (Arc<SpectatorHandle>, mpsc::Receiver<Frame>)>>,
}

impl LiveSession {
    fn touch(&self) {
        self.last_activity_ns
            .store(Utc::now().timestamp_nanos_opt().unwrap_or(0), Ordering::Relaxed);
    }
}

struct Inner {
    opts: OrchestratorOptions,
    adapters: AdapterRegistry,
    saves: SaveStore,
    repos: Repositories,
    events: EventBus,
    live: RwLock<HashMap<SessionId, Arc<LiveSession>>>,
}

/// Cheaply cloneable handle on the lifecycle engine.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    pub fn new(
        opts: OrchestratorOptions,
        adapters: AdapterRegistry,
        saves: SaveStore,
        repos: Repositories,
    ) -> Self {
        let events = EventBus::new(repos.events.clone());
        SessionOrchestrator {
            inner: Arc::new(Inner {
                opts,
                adapters,
                saves,
                repos,
                events,
                live: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn scratch_dir(&self, session_id: &str) -> PathBuf {
        self.inner.opts.data_root.join("sessions").join(session_id)
    }

    /// Validates the request, persists the starting record and launches the
    /// child on a detached task. Returns once the session is active (or the
    /// launch failed); dropping the returned future does not kill the child.
    pub async fn start_session(&self, req: StartSessionRequest) -> Result<Session> {
        if req.cols == 0 || req.rows == 0 {
            return Err(CoreError::InvalidArgument(format!(
                "terminal dimensions must be positive, got {}x{}",
                req.cols, req.rows
            )));
        }
        if req.username.is_empty() {
            return Err(CoreError::InvalidArgument("username is empty".to_owned()));
        }
        let game = self
            .inner
            .repos
            .games
            .find_by_id(&req.game_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("game {}", req.game_id)))?;
        if game.status != crate::model::GameStatus::Enabled {
            return Err(CoreError::InvalidArgument(format!(
                "game {} is not enabled",
                game.id
            )));
        }
        let actives = self
            .inner
            .repos
            .sessions
            .find_active_by_user(req.user_id)
            .await?;
        if actives.iter().any(|s| s.game_id == req.game_id) {
            return Err(CoreError::AlreadyExists(format!(
                "user {} already has an active session for {}",
                req.user_id, req.game_id
            )));
        }

        let session = Session::new(req.user_id, &req.username, &req.game_id, req.cols, req.rows);
        self.inner.repos.sessions.save(&session).await?;

        // Detach the launch from the caller: cancelling the creation RPC only
        // cancels the response, not the session.
        let this = self.clone();
        let record = req.record;
        let task =
            tokio::spawn(async move { this.launch(session, game, record).await });
        task.await
            .map_err(|e| CoreError::Internal(format!("launch task failed: {e}")))?
    }

    /// Stages the save, prepares the environment, spawns the child and wires
    /// the per-session tasks. Runs on a background task.
    async fn launch(
        &self,
        mut session: Session,
        game: Game,
        record: Option<bool>,
    ) -> Result<Session> {
        let scratch = self.scratch_dir(&session.id);
        if let Err(error) = tokio::fs::create_dir_all(scratch.join("save")).await {
            return self
                .fail_start(session, &scratch, format!("scratch dir creation failed: {error}"))
                .await;
        }
        let adapter = self.inner.adapters.get(&game.id);

        // Only an active save may feed a new session; a corrupted one is
        // quarantined and the session starts fresh.
        match self.inner.saves.find_active(session.user_id, &game.id).await {
            Ok(Some(save)) => match self.inner.saves.stage_into(&scratch, &save).await {
                Ok(()) => {}
                Err(CoreError::Integrity(reason)) => {
                    tracing::warn!(
                        session_id = %session.id,
                        save_id = %save.id,
                        reason,
                        "active save failed integrity check, starting without it"
                    );
                    let save_id = save.id.clone();
                    if let Err(error) = self.inner.saves.mark_corrupt(save).await {
                        tracing::warn!(?error, save_id = %save_id, "failed to mark save corrupt");
                    }
                    self.inner
                        .events
                        .emit(
                            EventKind::SaveCorrupt,
                            &session.id,
                            session.user_id,
                            &game.id,
                            json!({ "save_id": save_id }),
                        )
                        .await;
                }
                Err(error) => {
                    tracing::warn!(?error, session_id = %session.id, "save staging failed");
                }
            },
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(?error, session_id = %session.id, "active save lookup failed");
            }
        }

        if let Err(error) = adapter.setup_environment(&session, &scratch) {
            return self
                .fail_start(session, &scratch, format!("environment setup failed: {error}"))
                .await;
        }
        let spec = match adapter.prepare_command(&session, &game, &scratch) {
            Ok(spec) => spec,
            Err(error) => {
                return self
                    .fail_start(session, &scratch, format!("command assembly failed: {error}"))
                    .await;
            }
        };

        let this = self.clone();
        let exit_session_id = session.id.clone();
        let on_exit = Box::new(move |code: Option<i32>, signal: Option<i32>| {
            // The exit handler runs on a background context, never on the
            // creation RPC.
            tokio::spawn(async move {
                this.finalize(&exit_session_id, ExitDisposition::Exited { code, signal })
                    .await;
            });
        });

        let (pty, output) = match PtyProcess::spawn(&spec, session.rows, session.cols, on_exit) {
            Ok(pair) => pair,
            Err(error) => {
                return self
                    .fail_start(session, &scratch, format!("spawn failed: {error}"))
                    .await;
            }
        };

        session.pid = pty.pid();
        session.status = SessionStatus::Active;
        session.last_activity = Utc::now();

        let recorder = if self.inner.opts.recording.enabled && record.unwrap_or(true) {
            match TtyrecRecorder::create(
                &self.inner.opts.data_root,
                &session.id,
                &self.inner.opts.recording,
            ) {
                Ok(recorder) => {
                    session.recording_path = Some(recorder.path().to_path_buf());
                    Some(recorder)
                }
                Err(error) => {
                    tracing::warn!(?error, session_id = %session.id, "recorder unavailable");
                    None
                }
            }
        } else {
            None
        };

        self.inner.repos.sessions.save(&session).await?;

        let stream = StreamManager::new(
            &session.id,
            self.inner.opts.ring_capacity,
            self.inner.opts.frame_channel_capacity,
        );
        let live = Arc::new(LiveSession {
            id: session.id.clone(),
            scratch,
            stream: stream.clone(),
            pty,
            adapter: adapter.clone(),
            input_paused: AtomicBool::new(false),
            last_activity_ns: AtomicI64::new(Utc::now().timestamp_nanos_opt().unwrap_or(0)),
            reader: Mutex::new(None),
            pending_streams: tokio::sync::Mutex::new(HashMap::new()),
        });
        let reader = tokio::spawn(Self::pump_output(live.clone(), recorder, output));
        *lock(&live.reader) = Some(reader);
        self.inner
            .live
            .write()
            .await
            .insert(session.id.clone(), live);

        self.inner
            .events
            .emit(
                EventKind::SessionStart,
                &session.id,
                session.user_id,
                &session.game_id,
                json!({ "pid": session.pid, "cols": session.cols, "rows": session.rows }),
            )
            .await;
        tracing::info!(
            session_id = %session.id,
            user_id = session.user_id,
            game_id = %session.game_id,
            pid = ?session.pid,
            "session started"
        );
        Ok(session)
    }

    /// The per-session reader: post-processes chunks, feeds the recorder,
    /// publishes frames and detects readiness for the initial input.
    async fn pump_output(
        live: Arc<LiveSession>,
        mut recorder: Option<TtyrecRecorder>,
        mut output: mpsc::Receiver<Bytes>,
    ) {
        let mut ready = false;
        while let Some(chunk) = output.recv().await {
            let processed = live.adapter.process_output(chunk);
            if processed.is_empty() {
                continue;
            }
            if !ready && live.adapter.is_ready(&processed) {
                ready = true;
                let initial = live.adapter.initial_input();
                if !initial.is_empty() {
                    if let Err(error) = live.pty.write(initial) {
                        tracing::warn!(?error, session_id = %live.id, "initial input failed");
                    }
                }
            }
            // The frame goes to the recording pipeline first, then to fan-out.
            let frame = live.stream.next_frame(processed);
            if let Some(recorder) = recorder.as_mut() {
                recorder.record(&frame);
            }
            live.stream.publish_frame(frame);
            live.touch();
        }
        if let Some(recorder) = recorder.as_mut() {
            recorder.finish();
        }
    }

    /// Failure on the starting → failed edge: clean the scratch, persist the
    /// failure and surface it.
    async fn fail_start(
        &self,
        mut session: Session,
        scratch: &std::path::Path,
        reason: String,
    ) -> Result<Session> {
        if let Err(error) = tokio::fs::remove_dir_all(scratch).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(?error, session_id = %session.id, "scratch cleanup failed");
            }
        }
        session.status = SessionStatus::Failed;
        session.failure_reason = Some(reason.clone());
        session.ended_at = Some(Utc::now());
        if let Err(error) = self.inner.repos.sessions.save(&session).await {
            tracing::warn!(?error, session_id = %session.id, "failed to persist failed session");
        }
        self.inner
            .events
            .emit(
                EventKind::GameCrashed,
                &session.id,
                session.user_id,
                &session.game_id,
                json!({ "reason": reason.as_str() }),
            )
            .await;
        tracing::error!(session_id = %session.id, reason, "session start failed");
        Err(CoreError::Resource(reason))
    }

    /// Runs the ending → ended/failed edge exactly once per session: tears
    /// down the live handle, drains the stream, archives the save and
    /// persists the terminal state. End-of-session persistence failures are
    /// logged but never roll the transition back.
    async fn finalize(&self, session_id: &str, exit: ExitDisposition) {
        let live = { self.inner.live.write().await.remove(session_id) };
        let Some(live) = live else {
            // A competing finalizer won, or the controller restarted and only
            // the record is left.
            if let ExitDisposition::Failed { reason } = exit {
                self.close_detached(session_id, Some(reason)).await;
            }
            return;
        };

        let mut session = match self.inner.repos.sessions.find_by_id(session_id).await {
            Ok(Some(session)) => session,
            other => {
                tracing::error!(session_id, ?other, "session record lost at finalize");
                live.stream.shutdown().await;
                live.pty.close(self.inner.opts.pty_grace).await;
                return;
            }
        };

        session.status = SessionStatus::Ending;
        if let Err(error) = self.inner.repos.sessions.save(&session).await {
            tracing::warn!(?error, session_id, "failed to persist ending state");
        }

        // Make sure the child is gone, then drain the frame channel.
        live.pty.close(self.inner.opts.pty_grace).await;
        session.frames_streamed = live.stream.frames_published();
        session.spectators = live.stream.spectator_infos();
        live.stream.shutdown().await;
        let reader = lock(&live.reader).take();
        if let Some(reader) = reader {
            if let Err(error) = reader.await {
                tracing::warn!(?error, session_id, "reader task panicked");
            }
        }

        // Save archival is always attempted on this edge.
        if let Err(error) = self.inner.saves.archive_from(&live.scratch, &session).await {
            tracing::warn!(?error, session_id, "save archival failed at session end");
        }
        if let Err(error) = live.adapter.cleanup_environment(&session, &live.scratch) {
            tracing::warn!(?error, session_id, "adapter cleanup failed");
        }

        let now = Utc::now();
        session.ended_at = Some(now);
        session.last_activity = now;
        let (kind, metadata) = match exit {
            ExitDisposition::Exited { code, signal } => {
                session.exit_code = code;
                session.term_signal = signal;
                // Explicit stops never reach this arm, so anything but a
                // clean zero exit means the process died on us.
                let crashed = signal.is_some() || code.is_some_and(|c| c != 0);
                if crashed {
                    let reason = "Process terminated unexpectedly".to_owned();
                    session.status = SessionStatus::Failed;
                    session.failure_reason = Some(reason.clone());
                    (
                        EventKind::GameCrashed,
                        json!({ "reason": reason, "exit_code": code, "signal": signal }),
                    )
                } else {
                    session.status = SessionStatus::Ended;
                    (EventKind::SessionEnd, json!({ "exit_code": code }))
                }
            }
            ExitDisposition::Stopped { reason } => {
                session.status = SessionStatus::Ended;
                (EventKind::SessionEnd, json!({ "reason": reason }))
            }
            ExitDisposition::Failed { reason } => {
                session.status = SessionStatus::Failed;
                session.failure_reason = Some(reason.clone());
                (EventKind::GameCrashed, json!({ "reason": reason }))
            }
        };
        if let Err(error) = self.inner.repos.sessions.save(&session).await {
            tracing::warn!(?error, session_id, "failed to persist terminal state");
        }
        self.inner
            .events
            .emit(kind, session_id, session.user_id, &session.game_id, metadata)
            .await;
        tracing::info!(session_id, status = %session.status, "session finalized");
    }

    /// Terminal transition for a session without a live handle (controller
    /// restart, pod backend). Archives the scratch save best effort.
    async fn close_detached(&self, session_id: &str, failure: Option<String>) {
        let session = match self.inner.repos.sessions.find_by_id(session_id).await {
            Ok(Some(session)) => session,
            _ => return,
        };
        if session.status.is_terminal() {
            return;
        }
        let mut session = session;
        let scratch = self.scratch_dir(session_id);
        if scratch.exists() {
            if let Err(error) = self.inner.saves.archive_from(&scratch, &session).await {
                tracing::warn!(?error, session_id, "detached save archival failed");
            }
        }
        let now = Utc::now();
        session.ended_at = Some(now);
        session.last_activity = now;
        let (kind, metadata) = match failure {
            Some(reason) => {
                session.status = SessionStatus::Failed;
                session.failure_reason = Some(reason.clone());
                (EventKind::GameCrashed, json!({ "reason": reason }))
            }
            None => {
                session.status = SessionStatus::Ended;
                (EventKind::SessionEnd, json!({}))
            }
        };
        if let Err(error) = self.inner.repos.sessions.save(&session).await {
            tracing::warn!(?error, session_id, "failed to persist detached close");
        }
        self.inner
            .events
            .emit(kind, session_id, session.user_id, &session.game_id, metadata)
            .await;
    }

    /// Stops a session. Idempotent: stopping an already terminal session is a
    /// no-op success.
    pub async fn stop_session(&self, session_id: &str, reason: Option<String>) -> Result<()> {
        let record = self
            .inner
            .repos
            .sessions
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))?;
        if record.status.is_terminal() {
            return Ok(());
        }
        let has_live = self.inner.live.read().await.contains_key(session_id);
        if has_live {
            self.finalize(session_id, ExitDisposition::Stopped { reason })
                .await;
        } else {
            self.close_detached(session_id, None).await;
        }
        Ok(())
    }

    /// Marks an orphaned or crashed session failed, archiving what can be
    /// salvaged. Used by the reaper.
    pub async fn fail_session(&self, session_id: &str, reason: &str) {
        self.finalize(
            session_id,
            ExitDisposition::Failed {
                reason: reason.to_owned(),
            },
        )
        .await;
    }

    /// Suspends input delivery. The reader keeps running.
    pub async fn pause_session(&self, session_id: &str) -> Result<()> {
        let live = self.live_handle(session_id).await?;
        let mut session = self.record(session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(CoreError::InvalidArgument(format!(
                "cannot pause a {} session",
                session.status
            )));
        }
        live.input_paused.store(true, Ordering::Relaxed);
        session.status = SessionStatus::Paused;
        self.inner.repos.sessions.save(&session).await
    }

    pub async fn resume_session(&self, session_id: &str) -> Result<()> {
        let live = self.live_handle(session_id).await?;
        let mut session = self.record(session_id).await?;
        if session.status != SessionStatus::Paused {
            return Err(CoreError::InvalidArgument(format!(
                "cannot resume a {} session",
                session.status
            )));
        }
        live.input_paused.store(false, Ordering::Relaxed);
        session.status = SessionStatus::Active;
        self.inner.repos.sessions.save(&session).await
    }

    /// Forwards user keystrokes. Dropped while the session is paused.
    pub async fn write_input(&self, session_id: &str, bytes: &[u8]) -> Result<()> {
        let live = self.live_handle(session_id).await?;
        if live.input_paused.load(Ordering::Relaxed) {
            return Ok(());
        }
        live.pty.write(bytes)?;
        live.touch();
        Ok(())
    }

    pub async fn resize_terminal(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(CoreError::InvalidArgument(format!(
                "terminal dimensions must be positive, got {cols}x{rows}"
            )));
        }
        let live = self.live_handle(session_id).await?;
        live.pty.resize(cols, rows)?;
        let mut session = self.record(session_id).await?;
        session.cols = cols;
        session.rows = rows;
        self.inner.repos.sessions.save(&session).await
    }

    /// Registers a spectator and parks its frame stream for a later attach.
    pub async fn add_spectator(
        &self,
        session_id: &str,
        user_id: u64,
        username: &str,
    ) -> Result<crate::model::SpectatorInfo> {
        let live = self.live_handle(session_id).await?;
        let (handle, stream) = self.join_spectator(&live, user_id, username).await?;
        let info = handle.info();
        live.pending_streams
            .lock()
            .await
            .insert(user_id, (handle, stream));
        Ok(info)
    }

    /// A stream attach in spectate mode: claims the parked stream from a
    /// prior RPC join, or joins directly.
    pub async fn attach_spectator(
        &self,
        session_id: &str,
        user_id: u64,
        username: &str,
    ) -> Result<(Arc<SpectatorHandle>, mpsc::Receiver<Frame>)> {
        let live = self.live_handle(session_id).await?;
        if let Some(parked) = live.pending_streams.lock().await.remove(&user_id) {
            return Ok(parked);
        }
        self.join_spectator(&live, user_id, username).await
    }

    async fn join_spectator(
        &self,
        live: &Arc<LiveSession>,
        user_id: u64,
        username: &str,
    ) -> Result<(Arc<SpectatorHandle>, mpsc::Receiver<Frame>)> {
        if live.stream.has(user_id) {
            return Err(CoreError::AlreadyExists(format!(
                "spectator {user_id} already watches session {}",
                live.id
            )));
        }
        if live.stream.spectator_infos().len() >= self.inner.opts.max_spectators {
            return Err(CoreError::Unavailable(format!(
                "session {} reached its spectator limit",
                live.id
            )));
        }
        let (handle, stream) = live.stream.subscribe(user_id, username);
        if let Ok(mut session) = self.record(&live.id).await {
            session.spectators = live.stream.spectator_infos();
            if let Err(error) = self.inner.repos.sessions.save(&session).await {
                tracing::warn!(?error, session_id = %live.id, "failed to persist spectator list");
            }
            self.inner
                .events
                .emit(
                    EventKind::SpectatorJoin,
                    &live.id,
                    session.user_id,
                    &session.game_id,
                    json!({ "spectator_id": user_id, "spectator": username }),
                )
                .await;
        }
        Ok((handle, stream))
    }

    /// Removes a spectator. Its frame channel closes, ending any attached
    /// socket.
    pub async fn remove_spectator(&self, session_id: &str, user_id: u64) -> Result<()> {
        let live = self.live_handle(session_id).await?;
        live.pending_streams.lock().await.remove(&user_id);
        if !live.stream.remove(user_id) {
            return Err(CoreError::NotFound(format!(
                "spectator {user_id} on session {session_id}"
            )));
        }
        if let Ok(mut session) = self.record(session_id).await {
            session.spectators = live.stream.spectator_infos();
            if let Err(error) = self.inner.repos.sessions.save(&session).await {
                tracing::warn!(?error, session_id, "failed to persist spectator list");
            }
            self.inner
                .events
                .emit(
                    EventKind::SpectatorLeave,
                    session_id,
                    session.user_id,
                    &session.game_id,
                    json!({ "spectator_id": user_id }),
                )
                .await;
        }
        Ok(())
    }

    /// The owning player's stream attach. A reconnect resumes from the ring.
    pub async fn attach_player(
        &self,
        session_id: &str,
        user_id: u64,
    ) -> Result<(Session, mpsc::Receiver<Frame>)> {
        let session = self.record(session_id).await?;
        if session.user_id != user_id {
            return Err(CoreError::PermissionDenied(format!(
                "session {session_id} belongs to another user"
            )));
        }
        let live = self.live_handle(session_id).await?;
        let (_handle, stream) = live.stream.subscribe_player(user_id, &session.username);
        Ok((session, stream))
    }

    /// The session record, refreshed with live streaming info when available.
    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        let mut session = self.record(session_id).await?;
        if let Some(live) = self.inner.live.read().await.get(session_id) {
            session.frames_streamed = live.stream.frames_published();
            session.spectators = live.stream.spectator_infos();
            let ns = live.last_activity_ns.load(Ordering::Relaxed);
            if ns > 0 {
                session.last_activity = chrono::DateTime::from_timestamp_nanos(ns);
            }
        }
        Ok(session)
    }

    pub async fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<Session>> {
        let mut sessions = match status {
            Some(status) => self.inner.repos.sessions.find_by_status(status).await?,
            None => self.inner.repos.sessions.find_all().await?,
        };
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }

    /// Maps a pod phase change onto the session state machine: a terminal pod
    /// is the same as a local process exit.
    pub async fn handle_pod_phase(&self, change: PodPhaseChange) {
        let failure = match change.phase {
            PodPhase::Succeeded => None,
            PodPhase::Failed => Some(
                change
                    .message
                    .clone()
                    .unwrap_or_else(|| "pod failed".to_owned()),
            ),
            PodPhase::Pending | PodPhase::Running => return,
        };
        let sessions = match self.inner.repos.sessions.find_all().await {
            Ok(sessions) => sessions,
            Err(error) => {
                tracing::warn!(?error, "session scan for pod event failed");
                return;
            }
        };
        let Some(session) = sessions.into_iter().find(|s| {
            !s.status.is_terminal() && s.pod_name.as_deref() == Some(change.handle.name.as_str())
        }) else {
            return;
        };
        self.inner
            .events
            .emit(
                EventKind::PodStop,
                &session.id,
                session.user_id,
                &session.game_id,
                json!({ "pod": change.handle.name, "exit_code": change.exit_code }),
            )
            .await;
        self.close_detached(&session.id, failure).await;
    }

    /// Live session ids, for the reaper's sweep.
    pub async fn live_session_ids(&self) -> Vec<SessionId> {
        self.inner.live.read().await.keys().cloned().collect()
    }

    /// Live sessions without input or output activity for longer than
    /// `max_idle`, candidates for the janitor's idle sweep.
    pub async fn idle_sessions(&self, max_idle: Duration) -> Vec<SessionId> {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(max_idle.as_nanos() as i64);
        self.inner
            .live
            .read()
            .await
            .iter()
            .filter(|(_, live)| live.last_activity_ns.load(Ordering::Relaxed) < cutoff)
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn live_handle(&self, session_id: &str) -> Result<Arc<LiveSession>> {
        self.inner
            .live
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("live session {session_id}")))
    }

    async fn record(&self, session_id: &str) -> Result<Session> {
        self.inner
            .repos
            .sessions
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterRegistry;
    use crate::model::{Game, GameStatus};
    use crate::repository::{
        InMemoryEventRepository, InMemoryGameRepository, InMemorySaveRepository,
        InMemorySessionRepository,
    };
    use std::collections::HashMap as StdHashMap;

    fn test_game(id: &str, status: GameStatus) -> Game {
        Game {
            id: id.to_owned(),
            name: id.to_owned(),
            binary: PathBuf::from("/bin/cat"),
            args: Vec::new(),
            cwd: None,
            env: StdHashMap::new(),
            max_cpu_millis: None,
            max_memory_mib: None,
            status,
        }
    }

    fn orchestrator(root: &std::path::Path, games: Vec<Game>) -> SessionOrchestrator {
        let repos = Repositories {
            games: Arc::new(InMemoryGameRepository::new(games)),
            sessions: Arc::new(InMemorySessionRepository::new()),
            saves: Arc::new(InMemorySaveRepository::new()),
            events: Arc::new(InMemoryEventRepository::new()),
        };
        let saves = SaveStore::new(root.to_path_buf(), repos.saves.clone());
        let opts = OrchestratorOptions {
            data_root: root.to_path_buf(),
            pty_grace: Duration::from_secs(1),
            ring_capacity: 100,
            frame_channel_capacity: 1000,
            max_spectators: 4,
            recording: RecordingConfig {
                enabled: false,
                ..RecordingConfig::default()
            },
        };
        SessionOrchestrator::new(opts, AdapterRegistry::empty(), saves, repos)
    }

    fn start_request(game_id: &str) -> StartSessionRequest {
        StartSessionRequest {
            user_id: 1,
            username: "alice".to_owned(),
            game_id: game_id.to_owned(),
            cols: 80,
            rows: 24,
            record: None,
        }
    }

    #[tokio::test]
    async fn start_rejects_zero_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), vec![test_game("g", GameStatus::Enabled)]);
        let mut req = start_request("g");
        req.cols = 0;
        let err = orchestrator.start_session(req).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn start_rejects_unknown_game() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), Vec::new());
        let err = orchestrator
            .start_session(start_request("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn start_rejects_disabled_game() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            orchestrator(dir.path(), vec![test_game("g", GameStatus::Maintenance)]);
        let err = orchestrator
            .start_session(start_request("g"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn stop_of_unknown_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), Vec::new());
        let err = orchestrator
            .stop_session("missing", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
