//! The persistent data model: games, sessions, saves and events, plus the
//! in-flight frame and spectator records used by the streaming path.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Unique session identifier, a uuid in string form.
pub type SessionId = String;

/// Generate a fresh session id.
pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string()
}

/// Administrative status of a game entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Enabled,
    Disabled,
    Maintenance,
    Deprecated,
}

/// Immutable descriptor of one hosted game. Built from configuration and never
/// mutated during a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub name: String,
    /// Absolute path of the game binary.
    pub binary: PathBuf,
    pub args: Vec<String>,
    /// Working directory. Defaults to the per-session scratch directory.
    pub cwd: Option<PathBuf>,
    /// Base environment handed to the adapter.
    pub env: HashMap<String, String>,
    /// Advisory CPU cap in milli-cores, interpreted by pod backends only.
    pub max_cpu_millis: Option<u32>,
    /// Advisory memory cap in MiB, interpreted by pod backends only.
    pub max_memory_mib: Option<u32>,
    pub status: GameStatus,
}

/// Terminal state of a session. At most one state at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Active,
    Paused,
    Ending,
    Ended,
    Failed,
}

impl SessionStatus {
    /// Ended and failed sessions never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Failed)
    }

    /// States that count against the one-active-session-per-game rule.
    pub fn occupies_game(self) -> bool {
        matches!(
            self,
            SessionStatus::Starting | SessionStatus::Active | SessionStatus::Paused
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Ending => "ending",
            SessionStatus::Ended => "ended",
            SessionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A spectator as recorded on the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectatorInfo {
    pub user_id: u64,
    pub username: String,
    pub joined_at: DateTime<Utc>,
    pub active: bool,
    pub bytes_sent: u64,
}

/// One playthrough. Owned and exclusively mutated by the orchestrator; every
/// other component observes through repository reads or live handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: u64,
    pub username: String,
    pub game_id: String,
    pub cols: u16,
    pub rows: u16,
    pub pid: Option<u32>,
    /// Set instead of `pid` when a pod backend hosts the process.
    pub pod_name: Option<String>,
    pub exit_code: Option<i32>,
    pub term_signal: Option<i32>,
    pub status: SessionStatus,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub recording_path: Option<PathBuf>,
    pub frames_streamed: u64,
    pub spectators: Vec<SpectatorInfo>,
}

impl Session {
    /// A fresh session record in the starting state.
    pub fn new(user_id: u64, username: &str, game_id: &str, cols: u16, rows: u16) -> Self {
        let now = Utc::now();
        Session {
            id: new_session_id(),
            user_id,
            username: username.to_owned(),
            game_id: game_id.to_owned(),
            cols,
            rows,
            pid: None,
            pod_name: None,
            exit_code: None,
            term_signal: None,
            status: SessionStatus::Starting,
            failure_reason: None,
            started_at: now,
            last_activity: now,
            ended_at: None,
            recording_path: None,
            frames_streamed: 0,
            spectators: Vec::new(),
        }
    }
}

/// Lifecycle state of a durable save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStatus {
    Active,
    Corrupt,
    Archived,
    Deleted,
}

/// Game supplied metadata attached to a save. All fields are best effort.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveMetadata {
    pub game_version: Option<String>,
    pub character: Option<String>,
    pub level: Option<u32>,
    pub score: Option<u64>,
    pub playtime_seconds: Option<u64>,
    pub location: Option<String>,
}

/// A rotated copy of a prior save blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveBackup {
    pub path: PathBuf,
    pub checksum: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Durable per (user, game) save artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Save {
    pub id: String,
    pub user_id: u64,
    pub game_id: String,
    pub path: PathBuf,
    pub size: u64,
    /// Hex of the first 8 bytes of SHA-256 of the blob, 16 chars.
    pub checksum: String,
    pub metadata: SaveMetadata,
    /// Ordered by creation time, oldest first.
    pub backups: Vec<SaveBackup>,
    pub status: SaveStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable chunk of PTY output. Once published a frame is never mutated.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing per session, starting at 1. Id 0 is reserved
    /// for synthetic catch-up frames such as the terminal reset hint.
    pub id: u64,
    pub timestamp_ns: i64,
    pub data: Bytes,
}

/// Kinds of lifecycle and spectator events the core appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    GameCrashed,
    SpectatorJoin,
    SpectatorLeave,
    SessionCleaned,
    SaveCorrupt,
    PodStart,
    PodStop,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SessionStart => "session.start",
            EventKind::SessionEnd => "session.end",
            EventKind::GameCrashed => "game.crashed",
            EventKind::SpectatorJoin => "spectator.join",
            EventKind::SpectatorLeave => "spectator.leave",
            EventKind::SessionCleaned => "session.cleaned",
            EventKind::SaveCorrupt => "save.corrupt",
            EventKind::PodStart => "pod.start",
            EventKind::PodStop => "pod.stop",
        }
    }
}

/// Append-only observability record. Events reference sessions by id but do
/// not own them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub session_id: SessionId,
    pub user_id: u64,
    pub game_id: String,
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        kind: EventKind,
        session_id: &str,
        user_id: u64,
        game_id: &str,
        metadata: serde_json::Value,
    ) -> Self {
        Event {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            session_id: session_id.to_owned(),
            user_id,
            game_id: game_id.to_owned(),
            metadata,
            at: Utc::now(),
        }
    }
}
