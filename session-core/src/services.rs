//! Contracts of the external collaborators: credential service, directory
//! service and the optional pod backend. The core consumes these behind
//! traits; tokens and user records stay opaque.

use crate::error::{CoreError, Result};
use crate::model::{Game, Session};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::sync::mpsc;

/// The identity a validated token resolves to.
#[derive(Debug, Clone)]
pub struct TokenIdentity {
    pub user_id: u64,
    pub username: String,
    pub admin: bool,
}

/// Result of a login or token refresh.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub access_token: String,
    pub refresh_token: String,
    pub user: TokenIdentity,
}

/// External authentication. Tokens are opaque to the core.
#[async_trait]
pub trait CredentialService: Send + Sync {
    async fn login(&self, username: &str, password: &str, client_ip: &str)
    -> Result<LoginOutcome>;
    async fn validate_token(&self, token: &str) -> Result<TokenIdentity>;
    async fn refresh_token(&self, token: &str) -> Result<LoginOutcome>;
}

/// A user profile as the directory service reports it. Display and
/// authorization checks only; the core never modifies users.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub id: u64,
    pub username: String,
    pub email: String,
    pub admin: bool,
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub email: String,
}

/// External user directory.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    async fn get_user_by_id(&self, id: u64) -> Result<UserProfile>;
    async fn register_user(&self, req: RegisterRequest) -> Result<UserProfile>;
}

/// Token store for local deployments and tests. Tokens map straight to
/// identities; there is no expiry.
#[derive(Default)]
pub struct StaticCredentials {
    tokens: RwLock<HashMap<String, TokenIdentity>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a token for an identity and returns the token.
    pub async fn issue(&self, user_id: u64, username: &str, admin: bool) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let identity = TokenIdentity {
            user_id,
            username: username.to_owned(),
            admin,
        };
        self.tokens.write().await.insert(token.clone(), identity);
        token
    }
}

#[async_trait]
impl CredentialService for StaticCredentials {
    async fn login(
        &self,
        username: &str,
        _password: &str,
        _client_ip: &str,
    ) -> Result<LoginOutcome> {
        // Local mode accepts any password and mints a fresh identity.
        let user_id = self.tokens.read().await.len() as u64 + 1;
        let token = self.issue(user_id, username, false).await;
        Ok(LoginOutcome {
            access_token: token.clone(),
            refresh_token: token,
            user: TokenIdentity {
                user_id,
                username: username.to_owned(),
                admin: false,
            },
        })
    }

    async fn validate_token(&self, token: &str) -> Result<TokenIdentity> {
        self.tokens
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| CoreError::PermissionDenied("unknown token".to_owned()))
    }

    async fn refresh_token(&self, token: &str) -> Result<LoginOutcome> {
        let identity = self.validate_token(token).await?;
        Ok(LoginOutcome {
            access_token: token.to_owned(),
            refresh_token: token.to_owned(),
            user: identity,
        })
    }
}

/// Directory for local deployments and tests: profiles live in memory.
#[derive(Default)]
pub struct StaticDirectory {
    users: RwLock<HashMap<u64, UserProfile>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl StaticDirectory {
    pub fn new() -> Self {
        StaticDirectory {
            users: RwLock::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl DirectoryService for StaticDirectory {
    async fn get_user_by_id(&self, id: u64) -> Result<UserProfile> {
        self.users
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("user {id}")))
    }

    async fn register_user(&self, req: RegisterRequest) -> Result<UserProfile> {
        if req.username.is_empty() {
            return Err(CoreError::InvalidArgument("username is empty".to_owned()));
        }
        if !req.email.contains('@') {
            return Err(CoreError::InvalidArgument(format!(
                "bad email address {}",
                req.email
            )));
        }
        let mut users = self.users.write().await;
        if users.values().any(|u| u.username == req.username) {
            return Err(CoreError::AlreadyExists(format!(
                "username {}",
                req.username
            )));
        }
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let profile = UserProfile {
            id,
            username: req.username,
            email: req.email,
            admin: false,
        };
        users.insert(id, profile.clone());
        Ok(profile)
    }
}

/// Handle of a pod hosting a game process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodHandle {
    pub name: String,
    pub namespace: String,
}

/// Pod lifecycle phases the backend reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One observed phase change, fed into the orchestrator's state machine.
#[derive(Debug, Clone)]
pub struct PodPhaseChange {
    pub handle: PodHandle,
    pub phase: PodPhase,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

/// Optional orchestrator backend running game processes in isolated
/// containers. A pod reaching `Succeeded` or `Failed` maps onto the same
/// transitions as a local process exit.
#[async_trait]
pub trait PodBackend: Send + Sync {
    async fn start_pod(&self, session: &Session, game: &Game) -> Result<PodHandle>;
    async fn stop_pod(&self, handle: &PodHandle, grace: Duration) -> Result<()>;
    /// Streams phase changes into the given channel until the backend shuts down.
    async fn watch_pods(&self, updates: mpsc::Sender<PodPhaseChange>) -> Result<()>;
    async fn list_active_pods(&self) -> Result<Vec<PodHandle>>;
}
