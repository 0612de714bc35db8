//! This module holds the shared application state of the gateway and the
//! hot-reload of the game list. It provides:
//! - [`AppState`]: the orchestrator plus the services every handler needs
//! - [`reload_games`]: re-reading the game list from the configuration file
//!   so new games can be added without restarting the service

use session_core::config::GatewayConfig;
use session_core::model::Game;
use session_core::orchestrator::SessionOrchestrator;
use session_core::repository::InMemoryGameRepository;
use session_core::services::{CredentialService, DirectoryService};
use std::path::PathBuf;
use std::sync::Arc;

/// The application state.
pub struct AppState {
    /// The session lifecycle engine.
    pub orchestrator: SessionOrchestrator,
    /// The game list, replaceable at runtime.
    pub games: Arc<InMemoryGameRepository>,
    /// Token validation for stream attaches.
    pub credentials: Arc<dyn CredentialService>,
    /// User directory, consumed for registration and display only.
    pub directory: Arc<dyn DirectoryService>,
    /// Where the configuration was loaded from, for reloads.
    pub config_path: PathBuf,
}

/// Reloads the configuration file and replaces the game list. Adapters stay
/// as registered at startup; games added here run on the default adapter.
pub async fn reload_games(state: &Arc<AppState>) -> Result<Vec<Game>, String> {
    let config = GatewayConfig::load(&state.config_path)
        .await
        .map_err(|e| format!("Failed to reload config: {e}"))?;
    let games: Vec<Game> = config.games.iter().map(|g| g.to_game()).collect();
    state.games.replace_all(games.clone()).await;
    Ok(games)
}
