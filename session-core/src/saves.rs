//! Durable save lifecycle: staging into session scratch directories,
//! archival back into the per-user store, rotation and integrity checks.
//!
//! All blob writes go to a `.tmp` sibling first and are renamed into place.
//! A save is valid only if its size is non-zero and its checksum matches.

use crate::error::{CoreError, Result};
use crate::model::{Save, SaveBackup, SaveMetadata, SaveStatus, Session};
use crate::repository::SaveRepository;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the save blob inside a session scratch directory.
const SCRATCH_SAVE: &str = "save/save.dat";

/// Hex of the first 8 bytes of SHA-256 of the blob, 16 chars. A fast
/// integrity check, not a cryptographic guarantee.
pub fn checksum_prefix(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Maps (user, game) to the active durable save and moves blobs between the
/// per-user archive and session scratch directories.
#[derive(Clone)]
pub struct SaveStore {
    root: PathBuf,
    repo: Arc<dyn SaveRepository>,
}

impl SaveStore {
    pub fn new(root: PathBuf, repo: Arc<dyn SaveRepository>) -> Self {
        SaveStore { root, repo }
    }

    fn user_dir(&self, user_id: u64, game_id: &str) -> PathBuf {
        self.root
            .join("saves")
            .join(format!("user_{user_id}"))
            .join(game_id)
    }

    /// The active save for this user and game, if any.
    pub async fn find_active(&self, user_id: u64, game_id: &str) -> Result<Option<Save>> {
        self.repo.find_active_by_user_and_game(user_id, game_id).await
    }

    /// Copies the save blob into `{scratch}/save/save.dat`. Fails with an
    /// integrity error if the stored blob no longer matches its checksum.
    pub async fn stage_into(&self, scratch: &Path, save: &Save) -> Result<()> {
        let blob = tokio::fs::read(&save.path).await.map_err(|e| {
            CoreError::Integrity(format!("save {} blob unreadable: {e}", save.id))
        })?;
        if blob.is_empty() || checksum_prefix(&blob) != save.checksum {
            return Err(CoreError::Integrity(format!(
                "save {} checksum mismatch",
                save.id
            )));
        }
        let dest = scratch.join(SCRATCH_SAVE);
        write_atomic(&dest, &blob).await?;
        tracing::debug!(save_id = %save.id, dest = %dest.display(), "staged save");
        Ok(())
    }

    /// Archives the scratch save at session end, if one exists. Appends a
    /// backup of the prior active blob before the record is overwritten and
    /// returns the published save.
    pub async fn archive_from(&self, scratch: &Path, session: &Session) -> Result<Option<Save>> {
        let source = scratch.join(SCRATCH_SAVE);
        let blob = match tokio::fs::read(&source).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if blob.is_empty() {
            return Err(CoreError::Integrity(format!(
                "scratch save of session {} is empty",
                session.id
            )));
        }

        let dir = self.user_dir(session.user_id, &session.game_id);
        let dest = dir.join(format!("save_{}.dat", session.id));
        write_atomic(&dest, &blob).await?;
        let checksum = checksum_prefix(&blob);
        let now = Utc::now();

        let prior = self
            .repo
            .find_active_by_user_and_game(session.user_id, &session.game_id)
            .await?;
        let save = match prior {
            Some(mut save) => {
                let backup = self.backup_blob(&save).await?;
                self.repo.save_backup(&save.id, &backup).await?;
                save.backups.push(backup);
                save.path = dest;
                save.size = blob.len() as u64;
                save.checksum = checksum;
                save.updated_at = now;
                save.status = SaveStatus::Active;
                save
            }
            None => Save {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: session.user_id,
                game_id: session.game_id.clone(),
                path: dest,
                size: blob.len() as u64,
                checksum,
                metadata: SaveMetadata::default(),
                backups: Vec::new(),
                status: SaveStatus::Active,
                created_at: now,
                updated_at: now,
            },
        };
        self.repo.save(&save).await?;
        tracing::info!(
            save_id = %save.id,
            session_id = %session.id,
            size = save.size,
            "archived session save"
        );
        Ok(Some(save))
    }

    /// Copies a save's blob to a `.bak.{epoch}` sibling and returns the record.
    async fn backup_blob(&self, save: &Save) -> Result<SaveBackup> {
        let epoch = Utc::now().timestamp_millis();
        let backup_path = PathBuf::from(format!("{}.bak.{epoch}", save.path.display()));
        tokio::fs::copy(&save.path, &backup_path).await?;
        Ok(SaveBackup {
            path: backup_path,
            checksum: save.checksum.clone(),
            size: save.size,
            created_at: Utc::now(),
        })
    }

    /// Keeps the `keep_n` most recent active saves for this user and game and
    /// archives the rest, backing up each archived blob. Returns how many
    /// saves were archived.
    pub async fn archive_excess(&self, user_id: u64, game_id: &str, keep_n: usize) -> Result<usize> {
        let mut actives: Vec<Save> = self
            .repo
            .find_by_user(user_id)
            .await?
            .into_iter()
            .filter(|s| s.game_id == game_id && s.status == SaveStatus::Active)
            .collect();
        actives.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let mut archived = 0;
        for mut save in actives.into_iter().skip(keep_n) {
            let backup = self.backup_blob(&save).await?;
            self.repo.save_backup(&save.id, &backup).await?;
            save.backups.push(backup);
            save.status = SaveStatus::Archived;
            save.updated_at = Utc::now();
            self.repo.save(&save).await?;
            archived += 1;
        }
        if archived > 0 {
            tracing::info!(user_id, game_id, archived, "rotated excess saves");
        }
        Ok(archived)
    }

    /// Recomputes the blob checksum and compares. A missing or empty blob
    /// verifies false, never errors.
    pub async fn verify(&self, save: &Save) -> bool {
        match tokio::fs::read(&save.path).await {
            Ok(blob) => !blob.is_empty() && checksum_prefix(&blob) == save.checksum,
            Err(_) => false,
        }
    }

    pub async fn mark_corrupt(&self, mut save: Save) -> Result<Save> {
        save.status = SaveStatus::Corrupt;
        save.updated_at = Utc::now();
        self.repo.save(&save).await?;
        tracing::warn!(save_id = %save.id, "save marked corrupt");
        Ok(save)
    }

    /// Marks the record deleted and removes the blob best effort.
    pub async fn delete(&self, mut save: Save) -> Result<Save> {
        save.status = SaveStatus::Deleted;
        save.updated_at = Utc::now();
        self.repo.save(&save).await?;
        if let Err(error) = tokio::fs::remove_file(&save.path).await {
            tracing::warn!(?error, save_id = %save.id, "failed to remove deleted save blob");
        }
        Ok(save)
    }
}

/// Write to a `.tmp` sibling, then rename into place.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| CoreError::InvalidArgument(format!("bad save path {}", path.display())))?;
    let tmp = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
