//! REST handlers of the session control surface: start/stop/resize, session
//! queries, spectator management and the operational endpoints. Validation
//! and authorization fail fast here; everything else is delegated to the
//! orchestrator.

use crate::state::{AppState, reload_games};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use session_core::CoreError;
use session_core::model::{Session, SessionStatus, SpectatorInfo};
use session_core::orchestrator::StartSessionRequest;
use session_core::repository::GameRepository;
use session_core::services::RegisterRequest;
use std::sync::Arc;

/// Maps the core error taxonomy onto HTTP statuses.
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::AlreadyExists(_) => StatusCode::CONFLICT,
            CoreError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            CoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Integrity(_)
            | CoreError::Resource(_)
            | CoreError::Io(_)
            | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Deserialize)]
pub struct RegisterBody {
    pub username: String,
    pub password: String,
    pub email: String,
}

/// Pass-through to the external directory service.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let profile = state
        .directory
        .register_user(RegisterRequest {
            username: body.username,
            password: body.password,
            email: body.email,
        })
        .await?;
    Ok(Json(json!({
        "id": profile.id,
        "username": profile.username,
        "email": profile.email,
        "admin": profile.admin,
    })))
}

#[derive(Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

/// Pass-through to the external credential service. Tokens stay opaque.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state
        .credentials
        .login(&body.username, &body.password, "local")
        .await?;
    Ok(Json(json!({
        "access_token": outcome.access_token,
        "refresh_token": outcome.refresh_token,
        "user": {
            "id": outcome.user.user_id,
            "username": outcome.user.username,
            "admin": outcome.user.admin,
        },
    })))
}

#[derive(Deserialize)]
pub struct StartSessionBody {
    pub user_id: u64,
    pub username: String,
    pub game_id: String,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub record: Option<bool>,
}

pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartSessionBody>,
) -> Result<Json<Session>, ApiError> {
    let session = state
        .orchestrator
        .start_session(StartSessionRequest {
            user_id: body.user_id,
            username: body.username,
            game_id: body.game_id,
            cols: body.cols,
            rows: body.rows,
            record: body.record,
        })
        .await?;
    Ok(Json(session))
}

#[derive(Deserialize)]
pub struct StopParams {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(params): Query<StopParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .orchestrator
        .stop_session(&session_id, params.reason)
        .await?;
    Ok(Json(json!({ "stopped": session_id })))
}

#[derive(Deserialize)]
pub struct ResizeBody {
    pub cols: u16,
    pub rows: u16,
}

pub async fn resize_terminal(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(body): Json<ResizeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .orchestrator
        .resize_terminal(&session_id, body.cols, body.rows)
        .await?;
    Ok(Json(json!({ "cols": body.cols, "rows": body.rows })))
}

pub async fn pause_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.orchestrator.pause_session(&session_id).await?;
    Ok(Json(json!({ "paused": session_id })))
}

pub async fn resume_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.orchestrator.resume_session(&session_id).await?;
    Ok(Json(json!({ "resumed": session_id })))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.orchestrator.get_session(&session_id).await?))
}

#[derive(Deserialize)]
pub struct SessionFilter {
    #[serde(default)]
    pub status: Option<SessionStatus>,
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<SessionFilter>,
) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.orchestrator.list_sessions(filter.status).await?))
}

#[derive(Deserialize)]
pub struct AddSpectatorBody {
    pub user_id: u64,
    pub username: String,
}

pub async fn add_spectator(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(body): Json<AddSpectatorBody>,
) -> Result<Json<SpectatorInfo>, ApiError> {
    let info = state
        .orchestrator
        .add_spectator(&session_id, body.user_id, &body.username)
        .await?;
    Ok(Json(info))
}

pub async fn remove_spectator(
    State(state): State<Arc<AppState>>,
    Path((session_id, user_id)): Path<(String, u64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .orchestrator
        .remove_spectator(&session_id, user_id)
        .await?;
    Ok(Json(json!({ "removed": user_id })))
}

pub async fn list_games(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<session_core::model::Game>>, ApiError> {
    Ok(Json(state.games.find_enabled().await?))
}

/// Forces the reload of the config file and lists the games. This enables
/// adding new games without restarting the service.
pub async fn reload_handler(State(state): State<Arc<AppState>>) -> String {
    match reload_games(&state).await {
        Ok(games) => games
            .iter()
            .map(|game| format!("Game: {:<30} Status: {:?}", game.id, game.status))
            .collect::<Vec<_>>()
            .join("\n"),
        Err(e) => {
            format!("Config reload failed: {}", e)
        }
    }
}

/// Liveness summary for the SSH gateway's probes.
pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let live = state.orchestrator.live_session_ids().await;
    Json(json!({ "status": "ok", "live_sessions": live.len() }))
}
