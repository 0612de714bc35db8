//! Gateway configuration, loaded from a JSON file at startup. The game list
//! can be reloaded at runtime without restarting the service; everything else
//! is fixed for the process lifetime.

use crate::error::{CoreError, Result};
use crate::model::{Game, GameStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Recording options for the ttyrec writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Compress recordings with gzip.
    #[serde(default)]
    pub gzip: bool,
    /// Rotate to a numbered sibling once a recording file exceeds this size.
    #[serde(default)]
    pub max_file_bytes: Option<u64>,
    /// The janitor deletes recordings older than this.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        RecordingConfig {
            enabled: true,
            gzip: false,
            max_file_bytes: None,
            retention_days: default_retention_days(),
        }
    }
}

/// One game entry of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    pub id: String,
    pub name: String,
    pub binary: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Adapter name. Missing entries resolve to the default adapter.
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub max_cpu_millis: Option<u32>,
    #[serde(default)]
    pub max_memory_mib: Option<u32>,
    #[serde(default = "default_game_status")]
    pub status: GameStatus,
}

impl GameConfig {
    /// The immutable game descriptor handed to the runtime.
    pub fn to_game(&self) -> Game {
        Game {
            id: self.id.clone(),
            name: self.name.clone(),
            binary: self.binary.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            max_cpu_millis: self.max_cpu_millis,
            max_memory_mib: self.max_memory_mib,
            status: self.status,
        }
    }
}

/// The complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Root of the filesystem layout: sessions/, saves/, recordings/.
    pub data_root: PathBuf,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// Persisted sessions older than this (after their end) get purged.
    #[serde(default = "default_session_expiry_hours")]
    pub session_expiry_hours: u64,
    /// Grace window between SIGTERM and SIGKILL on close.
    #[serde(default = "default_pty_grace_secs")]
    pub pty_grace_secs: u64,
    /// Sessions without player activity for this long get stopped by the
    /// janitor. Zero disables the idle sweep.
    #[serde(default)]
    pub idle_timeout_minutes: u64,
    /// Frames kept for spectator catch-up.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Bounded channel between the PTY reader and the dispatcher.
    #[serde(default = "default_frame_channel_capacity")]
    pub frame_channel_capacity: usize,
    #[serde(default = "default_max_spectators")]
    pub max_spectators: usize,
    /// Active saves kept per (user, game) before rotation archives the rest.
    #[serde(default = "default_saves_keep")]
    pub saves_keep: usize,
    #[serde(default)]
    pub recording: RecordingConfig,
    pub games: Vec<GameConfig>,
}

impl GatewayConfig {
    /// Reads and parses the configuration file.
    pub async fn load(path: &Path) -> Result<Self> {
        let json_content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CoreError::Unavailable(format!("failed to read config file: {e}")))?;
        let config: GatewayConfig = serde_json::from_str(&json_content)
            .map_err(|e| CoreError::InvalidArgument(format!("failed to parse config: {e}")))?;
        if config.games.is_empty() {
            tracing::warn!("configuration lists no games");
        }
        Ok(config)
    }
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

fn default_game_status() -> GameStatus {
    GameStatus::Enabled
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_owned()
}

fn default_reaper_interval_secs() -> u64 {
    30
}

fn default_session_expiry_hours() -> u64 {
    24
}

fn default_pty_grace_secs() -> u64 {
    5
}

fn default_ring_capacity() -> usize {
    100
}

fn default_frame_channel_capacity() -> usize {
    1000
}

fn default_max_spectators() -> usize {
    16
}

fn default_saves_keep() -> usize {
    3
}
