//! Repository contracts for games, sessions, saves and events, plus the
//! in-memory implementations the gateway binary and the tests run on.
//!
//! Implementations are expected to be idempotent on `save` with the same id
//! and to surface not-found as `Ok(None)`, distinguishable from transport
//! errors.

use crate::error::Result;
use crate::model::{Event, Game, GameStatus, Save, SaveBackup, Session, SessionStatus};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Read access to the configured game list.
#[async_trait]
pub trait GameRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Game>>;
    async fn find_enabled(&self) -> Result<Vec<Game>>;
}

/// Persistence of session records.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert or replace by id.
    async fn save(&self, session: &Session) -> Result<()>;
    async fn find_by_id(&self, id: &str) -> Result<Option<Session>>;
    /// Sessions of this user in a state that occupies a game slot.
    async fn find_active_by_user(&self, user_id: u64) -> Result<Vec<Session>>;
    async fn find_by_status(&self, status: SessionStatus) -> Result<Vec<Session>>;
    async fn find_all(&self) -> Result<Vec<Session>>;
    /// Deletes terminal sessions whose end is older than `max_age`. Returns the count.
    async fn delete_expired(&self, max_age: Duration) -> Result<usize>;
}

/// Persistence of save records.
#[async_trait]
pub trait SaveRepository: Send + Sync {
    /// Insert or replace by id.
    async fn save(&self, save: &Save) -> Result<()>;
    async fn find_active_by_user_and_game(&self, user_id: u64, game_id: &str)
    -> Result<Option<Save>>;
    /// Appends a backup record to an existing save.
    async fn save_backup(&self, save_id: &str, backup: &SaveBackup) -> Result<()>;
    async fn find_by_user(&self, user_id: u64) -> Result<Vec<Save>>;
}

/// Append-only event sink.
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn save_event(&self, event: &Event) -> Result<()>;
}

/// Game repository over a replaceable in-memory list, fed from configuration.
#[derive(Default)]
pub struct InMemoryGameRepository {
    games: RwLock<HashMap<String, Game>>,
}

impl InMemoryGameRepository {
    pub fn new(games: Vec<Game>) -> Self {
        let map = games.into_iter().map(|g| (g.id.clone(), g)).collect();
        InMemoryGameRepository {
            games: RwLock::new(map),
        }
    }

    /// Replace the whole list, used by configuration reload.
    pub async fn replace_all(&self, games: Vec<Game>) {
        let map = games.into_iter().map(|g| (g.id.clone(), g)).collect();
        let mut guard = self.games.write().await;
        *guard = map;
    }
}

#[async_trait]
impl GameRepository for InMemoryGameRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Game>> {
        Ok(self.games.read().await.get(id).cloned())
    }

    async fn find_enabled(&self) -> Result<Vec<Game>> {
        Ok(self
            .games
            .read()
            .await
            .values()
            .filter(|g| g.status == GameStatus::Enabled)
            .cloned()
            .collect())
    }
}

/// Session repository over an in-memory map.
#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn save(&self, session: &Session) -> Result<()> {
        let mut guard = self.sessions.write().await;
        guard.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn find_active_by_user(&self, user_id: u64) -> Result<Vec<Session>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id && s.status.occupies_game())
            .cloned()
            .collect())
    }

    async fn find_by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn find_all(&self) -> Result<Vec<Session>> {
        Ok(self.sessions.read().await.values().cloned().collect())
    }

    async fn delete_expired(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let mut guard = self.sessions.write().await;
        let before = guard.len();
        guard.retain(|_, s| match (s.status.is_terminal(), s.ended_at) {
            (true, Some(ended)) => ended > cutoff,
            _ => true,
        });
        Ok(before - guard.len())
    }
}

/// Save repository over an in-memory map.
#[derive(Default)]
pub struct InMemorySaveRepository {
    saves: RwLock<HashMap<String, Save>>,
}

impl InMemorySaveRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SaveRepository for InMemorySaveRepository {
    async fn save(&self, save: &Save) -> Result<()> {
        let mut guard = self.saves.write().await;
        guard.insert(save.id.clone(), save.clone());
        Ok(())
    }

    async fn find_active_by_user_and_game(
        &self,
        user_id: u64,
        game_id: &str,
    ) -> Result<Option<Save>> {
        // At most one save per (user, game) is active; pick the freshest if an
        // implementation ever violated that.
        let guard = self.saves.read().await;
        let mut found: Option<&Save> = None;
        for save in guard.values() {
            if save.user_id == user_id
                && save.game_id == game_id
                && save.status == crate::model::SaveStatus::Active
            {
                match found {
                    Some(prior) if prior.updated_at >= save.updated_at => {}
                    _ => found = Some(save),
                }
            }
        }
        Ok(found.cloned())
    }

    async fn save_backup(&self, save_id: &str, backup: &SaveBackup) -> Result<()> {
        let mut guard = self.saves.write().await;
        let Some(save) = guard.get_mut(save_id) else {
            return Err(crate::error::CoreError::NotFound(format!(
                "save {save_id} for backup"
            )));
        };
        save.backups.push(backup.clone());
        Ok(())
    }

    async fn find_by_user(&self, user_id: u64) -> Result<Vec<Save>> {
        Ok(self
            .saves
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }
}

/// Event repository that appends to an in-memory log.
#[derive(Default)]
pub struct InMemoryEventRepository {
    events: RwLock<Vec<Event>>,
}

impl InMemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything appended so far.
    pub async fn all(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn save_event(&self, event: &Event) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}

/// The repository bundle the orchestrator and reaper share.
#[derive(Clone)]
pub struct Repositories {
    pub games: Arc<dyn GameRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub saves: Arc<dyn SaveRepository>,
    pub events: Arc<dyn EventRepository>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Session;

    #[tokio::test]
    async fn active_lookup_ignores_terminal_sessions() {
        let repo = InMemorySessionRepository::new();
        let mut a = Session::new(7, "alice", "nethack", 80, 24);
        a.status = SessionStatus::Active;
        repo.save(&a).await.unwrap();
        let mut b = Session::new(7, "alice", "nethack", 80, 24);
        b.status = SessionStatus::Ended;
        b.ended_at = Some(Utc::now());
        repo.save(&b).await.unwrap();

        let active = repo.find_active_by_user(7).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
    }

    #[tokio::test]
    async fn delete_expired_keeps_live_and_recent_sessions() {
        let repo = InMemorySessionRepository::new();
        let mut old = Session::new(1, "a", "g", 80, 24);
        old.status = SessionStatus::Ended;
        old.ended_at = Some(Utc::now() - Duration::hours(48));
        repo.save(&old).await.unwrap();
        let mut live = Session::new(2, "b", "g", 80, 24);
        live.status = SessionStatus::Active;
        repo.save(&live).await.unwrap();

        let removed = repo.delete_expired(Duration::hours(24)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(repo.find_by_id(&old.id).await.unwrap().is_none());
        assert!(repo.find_by_id(&live.id).await.unwrap().is_some());
    }
}
