//! Per-game strategy objects. An adapter owns everything game-specific:
//! command assembly, environment preparation, output post-processing and
//! readiness detection. The runtime never interprets game behavior itself,
//! it only routes bytes and drives the lifecycle.

use crate::config::GameConfig;
use crate::error::{CoreError, Result};
use crate::model::{Game, Session};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The argv, environment and working directory a session's child process
/// starts with. The child inherits exactly this environment, nothing ambient.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

/// Game-specific hooks around a session's child process.
pub trait GameAdapter: Send + Sync {
    /// Assembles the command for the child. `scratch` is the per-session
    /// working directory.
    fn prepare_command(&self, session: &Session, game: &Game, scratch: &Path)
    -> Result<CommandSpec>;

    /// Creates per-user directories, config files and lock dirs. Idempotent.
    fn setup_environment(&self, session: &Session, scratch: &Path) -> Result<()>;

    /// Removes lock files and other transient state. Idempotent.
    fn cleanup_environment(&self, session: &Session, scratch: &Path) -> Result<()>;

    /// Bytes fed to the PTY once [`GameAdapter::is_ready`] first reports true.
    fn initial_input(&self) -> &[u8] {
        b""
    }

    /// Heuristic deciding that the child finished its own initialization.
    fn is_ready(&self, recent_output: &[u8]) -> bool {
        !recent_output.is_empty()
    }

    /// Pass-through or rewrite of PTY output before recording and fan-out.
    fn process_output(&self, bytes: Bytes) -> Bytes {
        bytes
    }
}

/// Shared environment assembly: the configured base plus the terminal and
/// identity variables every curses program expects.
fn base_env(session: &Session, game: &Game, scratch: &Path) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = game
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if !game.env.contains_key("TERM") {
        env.push(("TERM".to_owned(), "xterm-256color".to_owned()));
    }
    env.push(("HOME".to_owned(), scratch.display().to_string()));
    env.push(("USER".to_owned(), session.username.clone()));
    env.push(("LOGNAME".to_owned(), session.username.clone()));
    env
}

/// Sane no-ops for games that need nothing special.
pub struct DefaultAdapter;

impl GameAdapter for DefaultAdapter {
    fn prepare_command(
        &self,
        session: &Session,
        game: &Game,
        scratch: &Path,
    ) -> Result<CommandSpec> {
        Ok(CommandSpec {
            binary: game.binary.clone(),
            args: game.args.clone(),
            env: base_env(session, game, scratch),
            cwd: game.cwd.clone().unwrap_or_else(|| scratch.to_path_buf()),
        })
    }

    fn setup_environment(&self, _session: &Session, scratch: &Path) -> Result<()> {
        std::fs::create_dir_all(scratch.join("save"))?;
        Ok(())
    }

    fn cleanup_environment(&self, _session: &Session, _scratch: &Path) -> Result<()> {
        Ok(())
    }
}

/// NetHack needs a per-user rc file, a playground save directory and stale
/// lock removal after crashes.
pub struct NetHackAdapter;

impl NetHackAdapter {
    fn rc_path(scratch: &Path) -> PathBuf {
        scratch.join(".nethackrc")
    }
}

impl GameAdapter for NetHackAdapter {
    fn prepare_command(
        &self,
        session: &Session,
        game: &Game,
        scratch: &Path,
    ) -> Result<CommandSpec> {
        let mut env = base_env(session, game, scratch);
        env.push((
            "NETHACKOPTIONS".to_owned(),
            format!("@{}", Self::rc_path(scratch).display()),
        ));
        let mut args = game.args.clone();
        args.push("-u".to_owned());
        args.push(session.username.clone());
        Ok(CommandSpec {
            binary: game.binary.clone(),
            args,
            env,
            cwd: game.cwd.clone().unwrap_or_else(|| scratch.to_path_buf()),
        })
    }

    fn setup_environment(&self, session: &Session, scratch: &Path) -> Result<()> {
        std::fs::create_dir_all(scratch.join("save"))?;
        let rc = Self::rc_path(scratch);
        if !rc.exists() {
            let contents = format!(
                "OPTIONS=name:{}\nOPTIONS=!autopickup\nOPTIONS=windowtype:tty\n",
                session.username
            );
            std::fs::write(&rc, contents)?;
        }
        Ok(())
    }

    fn cleanup_environment(&self, _session: &Session, scratch: &Path) -> Result<()> {
        // NetHack leaves <uid><name>.0 style lock files behind on a crash.
        let save_dir = scratch.join("save");
        let Ok(entries) = std::fs::read_dir(&save_dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.contains("lock") || name.ends_with(".0") {
                if let Err(error) = std::fs::remove_file(entry.path()) {
                    tracing::warn!(?error, file = %name, "failed to remove stale lock file");
                }
            }
        }
        Ok(())
    }

    fn is_ready(&self, recent_output: &[u8]) -> bool {
        // The opening question or the first screen paint both mean the game
        // is accepting input.
        contains(recent_output, b"Shall I pick")
            || contains(recent_output, b"--More--")
            || contains(recent_output, b"\x1b[2J")
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Maps game ids to adapters. Registration is static at startup from the
/// configuration list; absent adapters resolve to the default.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn GameAdapter>>,
    default: Arc<dyn GameAdapter>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdapterRegistry {
    /// Builds the registry. Misconfiguration (unknown adapter name, missing
    /// binary) fails registration fatally.
    pub fn build(configs: &[GameConfig]) -> Result<Self> {
        let default: Arc<dyn GameAdapter> = Arc::new(DefaultAdapter);
        let mut adapters: HashMap<String, Arc<dyn GameAdapter>> = HashMap::new();
        for config in configs {
            if !config.binary.is_file() {
                return Err(CoreError::InvalidArgument(format!(
                    "game {}: binary {} does not exist",
                    config.id,
                    config.binary.display()
                )));
            }
            let adapter: Arc<dyn GameAdapter> = match config.adapter.as_deref() {
                None | Some("default") => default.clone(),
                Some("nethack") => Arc::new(NetHackAdapter),
                Some(other) => {
                    return Err(CoreError::InvalidArgument(format!(
                        "game {}: unknown adapter {other}",
                        config.id
                    )));
                }
            };
            adapters.insert(config.id.clone(), adapter);
        }
        Ok(AdapterRegistry { adapters, default })
    }

    /// An empty registry resolving everything to the default adapter. For tests.
    pub fn empty() -> Self {
        AdapterRegistry {
            adapters: HashMap::new(),
            default: Arc::new(DefaultAdapter),
        }
    }

    pub fn get(&self, game_id: &str) -> Arc<dyn GameAdapter> {
        self.adapters
            .get(game_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GameStatus, Session};

    fn test_game(binary: &Path) -> Game {
        Game {
            id: "g".to_owned(),
            name: "G".to_owned(),
            binary: binary.to_path_buf(),
            args: vec!["-X".to_owned()],
            cwd: None,
            env: HashMap::from([("SHELL".to_owned(), "/bin/sh".to_owned())]),
            max_cpu_millis: None,
            max_memory_mib: None,
            status: GameStatus::Enabled,
        }
    }

    #[test]
    fn default_adapter_assembles_pristine_environment() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(1, "alice", "g", 80, 24);
        let game = test_game(Path::new("/bin/cat"));
        let spec = DefaultAdapter
            .prepare_command(&session, &game, dir.path())
            .unwrap();

        assert_eq!(spec.binary, PathBuf::from("/bin/cat"));
        assert_eq!(spec.args, vec!["-X".to_owned()]);
        assert_eq!(spec.cwd, dir.path());
        let lookup = |key: &str| {
            spec.env
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(lookup("SHELL").as_deref(), Some("/bin/sh"));
        assert_eq!(lookup("TERM").as_deref(), Some("xterm-256color"));
        assert_eq!(lookup("USER").as_deref(), Some("alice"));
        assert_eq!(lookup("HOME").as_deref(), Some(&*dir.path().display().to_string()));
    }

    #[test]
    fn nethack_setup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(1, "alice", "nethack", 80, 24);
        NetHackAdapter.setup_environment(&session, dir.path()).unwrap();
        let rc = dir.path().join(".nethackrc");
        let first = std::fs::read_to_string(&rc).unwrap();
        assert!(first.contains("name:alice"));

        NetHackAdapter.setup_environment(&session, dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&rc).unwrap(), first);
        assert!(dir.path().join("save").is_dir());
    }

    #[test]
    fn nethack_readiness_triggers_on_prompt_or_clear() {
        assert!(NetHackAdapter.is_ready(b"Shall I pick a character for you?"));
        assert!(NetHackAdapter.is_ready(b"\x1b[2J\x1b[H"));
        assert!(!NetHackAdapter.is_ready(b"loading..."));
    }

    #[test]
    fn registry_falls_back_to_default_for_unknown_games() {
        let registry = AdapterRegistry::empty();
        let adapter = registry.get("no-such-game");
        assert!(adapter.is_ready(b"x"));
        assert!(adapter.initial_input().is_empty());
    }

    #[test]
    fn registry_rejects_missing_binaries() {
        let config = GameConfig {
            id: "ghost".to_owned(),
            name: "Ghost".to_owned(),
            binary: PathBuf::from("/no/such/binary"),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            adapter: None,
            max_cpu_millis: None,
            max_memory_mib: None,
            status: GameStatus::Enabled,
        };
        let err = AdapterRegistry::build(std::slice::from_ref(&config)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }
}
