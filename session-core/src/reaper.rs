//! The janitor: periodically reconciles the live process world with the
//! persisted session world. Orphaned processes, expired session rows, stale
//! scratch directories, excess saves and old recordings are all handled here.
//!
//! Every pass is idempotent and safe to run next to live sessions.

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::model::{EventKind, SaveStatus, SessionStatus};
use crate::orchestrator::SessionOrchestrator;
use crate::repository::{Repositories, SaveRepository, SessionRepository};
use crate::saves::SaveStore;
use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

const ORPHAN_REASON: &str = "Process terminated unexpectedly";

/// Sweep cadence and retention knobs.
#[derive(Debug, Clone)]
pub struct ReaperOptions {
    pub interval: Duration,
    /// Terminal sessions older than this get purged from the repository.
    pub session_max_age: chrono::Duration,
    /// Active saves kept per (user, game).
    pub saves_keep: usize,
    pub recording_retention: Duration,
    /// Stop sessions idle for longer than this. None disables the sweep.
    pub idle_timeout: Option<Duration>,
}

impl ReaperOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        ReaperOptions {
            interval: Duration::from_secs(config.reaper_interval_secs),
            session_max_age: chrono::Duration::hours(config.session_expiry_hours as i64),
            saves_keep: config.saves_keep,
            recording_retention: Duration::from_secs(
                u64::from(config.recording.retention_days) * 24 * 60 * 60,
            ),
            idle_timeout: (config.idle_timeout_minutes > 0)
                .then(|| Duration::from_secs(config.idle_timeout_minutes * 60)),
        }
    }
}

/// The periodic reconciliation task.
#[derive(Clone)]
pub struct Reaper {
    orchestrator: SessionOrchestrator,
    repos: Repositories,
    saves: SaveStore,
    events: EventBus,
    data_root: PathBuf,
    opts: ReaperOptions,
}

impl Reaper {
    pub fn new(
        orchestrator: SessionOrchestrator,
        repos: Repositories,
        saves: SaveStore,
        data_root: PathBuf,
        opts: ReaperOptions,
    ) -> Self {
        let events = EventBus::new(repos.events.clone());
        Reaper {
            orchestrator,
            repos,
            saves,
            events,
            data_root,
            opts,
        }
    }

    /// Runs sweeps forever at the configured interval.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.opts.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.sweep().await;
        }
    }

    /// One full janitor pass.
    pub async fn sweep(&self) {
        if let Err(error) = self.sweep_orphans().await {
            tracing::warn!(?error, "orphan sweep failed");
        }
        if let Some(max_idle) = self.opts.idle_timeout {
            self.sweep_idle(max_idle).await;
        }
        if let Err(error) = self.purge_expired_sessions().await {
            tracing::warn!(?error, "session purge failed");
        }
        if let Err(error) = self.clean_stale_scratch().await {
            tracing::warn!(?error, "scratch cleanup failed");
        }
        if let Err(error) = self.rotate_saves().await {
            tracing::warn!(?error, "save rotation failed");
        }
        self.purge_old_recordings().await;
    }

    /// Probes the pid of every starting or active session; sessions whose
    /// process is gone transition to failed.
    async fn sweep_orphans(&self) -> Result<()> {
        let mut candidates = self
            .repos
            .sessions
            .find_by_status(SessionStatus::Starting)
            .await?;
        candidates.extend(
            self.repos
                .sessions
                .find_by_status(SessionStatus::Active)
                .await?,
        );
        for session in candidates {
            let Some(pid) = session.pid else {
                continue;
            };
            if process_alive(pid) {
                continue;
            }
            tracing::warn!(
                session_id = %session.id,
                pid,
                "orphaned session, marking failed"
            );
            self.orchestrator
                .fail_session(&session.id, ORPHAN_REASON)
                .await;
        }
        Ok(())
    }

    /// Stops sessions whose player went away without detaching cleanly.
    async fn sweep_idle(&self, max_idle: Duration) {
        for session_id in self.orchestrator.idle_sessions(max_idle).await {
            tracing::info!(%session_id, "stopping idle session");
            if let Err(error) = self
                .orchestrator
                .stop_session(&session_id, Some("idle timeout".to_owned()))
                .await
            {
                tracing::warn!(?error, %session_id, "idle stop failed");
            }
        }
    }

    async fn purge_expired_sessions(&self) -> Result<()> {
        let removed = self
            .repos
            .sessions
            .delete_expired(self.opts.session_max_age)
            .await?;
        if removed > 0 {
            tracing::info!(removed, "purged expired sessions");
        }
        Ok(())
    }

    /// Deletes the scratch directory of ended and failed sessions once every
    /// active save of that (user, game) verifies; non-verifying saves are
    /// marked corrupt and the scratch stays as evidence.
    async fn clean_stale_scratch(&self) -> Result<()> {
        let mut finished = self
            .repos
            .sessions
            .find_by_status(SessionStatus::Ended)
            .await?;
        finished.extend(
            self.repos
                .sessions
                .find_by_status(SessionStatus::Failed)
                .await?,
        );
        for session in finished {
            let scratch = self.data_root.join("sessions").join(&session.id);
            if !scratch.exists() {
                continue;
            }
            let mut all_verify = true;
            let saves = self.repos.saves.find_by_user(session.user_id).await?;
            for save in saves {
                if save.game_id != session.game_id || save.status != SaveStatus::Active {
                    continue;
                }
                if !self.saves.verify(&save).await {
                    all_verify = false;
                    if let Err(error) = self.saves.mark_corrupt(save).await {
                        tracing::warn!(?error, "failed to mark save corrupt");
                    }
                }
            }
            if !all_verify {
                tracing::warn!(
                    session_id = %session.id,
                    "keeping scratch dir, saves failed verification"
                );
                continue;
            }
            if let Err(error) = tokio::fs::remove_dir_all(&scratch).await {
                tracing::warn!(?error, session_id = %session.id, "scratch removal failed");
                continue;
            }
            self.events
                .emit(
                    EventKind::SessionCleaned,
                    &session.id,
                    session.user_id,
                    &session.game_id,
                    json!({}),
                )
                .await;
        }
        Ok(())
    }

    /// Rotation driven by recently finished sessions: each (user, game) pair
    /// keeps its most recent saves, older actives get archived with backups.
    async fn rotate_saves(&self) -> Result<()> {
        let mut finished = self
            .repos
            .sessions
            .find_by_status(SessionStatus::Ended)
            .await?;
        finished.extend(
            self.repos
                .sessions
                .find_by_status(SessionStatus::Failed)
                .await?,
        );
        let mut seen: HashSet<(u64, String)> = HashSet::new();
        for session in finished {
            if !seen.insert((session.user_id, session.game_id.clone())) {
                continue;
            }
            self.saves
                .archive_excess(session.user_id, &session.game_id, self.opts.saves_keep)
                .await?;
        }
        Ok(())
    }

    /// Deletes recordings whose mtime is older than the retention window.
    async fn purge_old_recordings(&self) {
        let dir = self.data_root.join("recordings");
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let Ok(age) = modified.elapsed() else {
                continue;
            };
            if age > self.opts.recording_retention {
                if let Err(error) = std::fs::remove_file(entry.path()) {
                    tracing::warn!(?error, path = %entry.path().display(), "recording removal failed");
                } else {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "purged old recordings");
        }
    }
}

/// True if the process exists, even when we lack permission to signal it.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as i32, 0) };
    if result == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    matches!(err.raw_os_error(), Some(libc::EPERM))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap probe available; never false-kill a session.
    true
}
