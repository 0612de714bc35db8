mod handlers;
mod state;
mod stream_ws;

use crate::handlers::{
    add_spectator, get_session, healthz, list_games, list_sessions, login, pause_session,
    register, reload_handler, remove_spectator, resize_terminal, resume_session,
    start_session, stop_session,
};
use crate::state::AppState;
use crate::stream_ws::stream_handler;
use axum::Router;
use axum::routing::get;
use axum::routing::post;
use session_core::adapter::AdapterRegistry;
use session_core::config::GatewayConfig;
use session_core::orchestrator::{OrchestratorOptions, SessionOrchestrator};
use session_core::reaper::{Reaper, ReaperOptions};
use session_core::repository::{
    InMemoryEventRepository, InMemoryGameRepository, InMemorySaveRepository,
    InMemorySessionRepository, Repositories,
};
use session_core::saves::SaveStore;
use session_core::services::{StaticCredentials, StaticDirectory};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
/// Activates error tracing, loads the configuration, wires the session
/// runtime, spawns the reaper task, then sets up the routing system to serve
/// the session control surface and the stream web sockets.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=trace", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true) // Module path (e.g. gateway_server::stream_ws)
                .with_thread_ids(true) // Thread-ID (helpful for Tokio)
                .with_thread_names(true), // Thread-Name
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gateway.json"));
    let config = match GatewayConfig::load(&config_path).await {
        Ok(config) => config,
        Err(message) => {
            tracing::error!(%message, path = %config_path.display(), "Initial load error.");
            panic!("Initial load error: {}", message);
        }
    };

    // Misconfigured games (missing binaries, unknown adapters) are fatal.
    let adapters = match AdapterRegistry::build(&config.games) {
        Ok(adapters) => adapters,
        Err(message) => {
            tracing::error!(%message, "Adapter registration error.");
            panic!("Adapter registration error: {}", message);
        }
    };

    let games = Arc::new(InMemoryGameRepository::new(
        config.games.iter().map(|g| g.to_game()).collect(),
    ));
    let repos = Repositories {
        games: games.clone(),
        sessions: Arc::new(InMemorySessionRepository::new()),
        saves: Arc::new(InMemorySaveRepository::new()),
        events: Arc::new(InMemoryEventRepository::new()),
    };
    let saves = SaveStore::new(config.data_root.clone(), repos.saves.clone());
    let orchestrator = SessionOrchestrator::new(
        OrchestratorOptions::from_config(&config),
        adapters,
        saves.clone(),
        repos.clone(),
    );

    let reaper = Reaper::new(
        orchestrator.clone(),
        repos.clone(),
        saves,
        config.data_root.clone(),
        ReaperOptions::from_config(&config),
    );
    tokio::spawn(reaper.run());

    let app_state = Arc::new(AppState {
        orchestrator,
        games,
        credentials: Arc::new(StaticCredentials::new()),
        directory: Arc::new(StaticDirectory::new()),
        config_path,
    });

    let app = Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/sessions", post(start_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(stop_session))
        .route("/sessions/{id}/resize", post(resize_terminal))
        .route("/sessions/{id}/pause", post(pause_session))
        .route("/sessions/{id}/resume", post(resume_session))
        .route("/sessions/{id}/spectators", post(add_spectator))
        .route(
            "/sessions/{id}/spectators/{user_id}",
            axum::routing::delete(remove_spectator),
        )
        .route("/sessions/{id}/stream", get(stream_handler))
        .route("/games", get(list_games))
        .route("/reload", get(reload_handler))
        .route("/healthz", get(healthz))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .unwrap();
    tracing::info!(addr = %config.listen_addr, "gateway listening");

    axum::serve(listener, app).await.unwrap();
}
