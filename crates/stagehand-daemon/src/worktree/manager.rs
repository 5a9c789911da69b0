//! Worktree manager: git worktree operations + DB persistence.
//!
//! The manager is the sole owner of workspace locks. Pipeline code acquires
//! a locked worktree for a (card, job) pair, works inside it, and releases
//! it; a background reclaim sweep removes trees whose owning job is done.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::storage::{Database, DatabaseError, JobState, Worktree, WorktreeStatus};

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Git command failed: {0}")]
    Git(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Worktree not found: {0}")]
    NotFound(String),

    #[error("Worktree {0} is locked by another holder")]
    Locked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid name: {0}")]
    InvalidName(String),
}

/// Worktree manager settings.
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Base directory for worktree checkouts.
    pub root: PathBuf,
    /// Duration a worktree lock stays valid without renewal.
    pub lock_ttl: Duration,
}

/// Validate a card/branch path segment: alphanumeric, hyphens, underscores,
/// slashes, dots. Rejects path traversal (`..`), leading dashes, and
/// control characters.
fn validate_name(name: &str) -> Result<(), WorktreeError> {
    if name.is_empty() {
        return Err(WorktreeError::InvalidName("name cannot be empty".into()));
    }
    if name.starts_with('-') {
        return Err(WorktreeError::InvalidName(
            "name cannot start with a dash".into(),
        ));
    }
    if name.contains("..") {
        return Err(WorktreeError::InvalidName(
            "name cannot contain '..'".into(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(WorktreeError::InvalidName(format!(
            "name contains invalid characters: {name}"
        )));
    }
    Ok(())
}

/// Manages git worktrees and their lifecycle.
#[derive(Clone)]
pub struct WorktreeManager {
    db: Database,
    config: WorktreeConfig,
}

impl WorktreeManager {
    pub const fn new(db: Database, config: WorktreeConfig) -> Self {
        Self { db, config }
    }

    /// Acquire a locked worktree for a (card, job) pair.
    ///
    /// Reuses an existing worktree for the card when one is free (or its
    /// lock has expired); otherwise creates a fresh checkout with
    /// `git worktree add -b stagehand/<card>-<n> <path> <base_ref>`.
    /// Creation failure parks the record in `error` and is surfaced to the
    /// caller; there is no retry loop against a broken base ref.
    pub async fn acquire(
        &self,
        project_id: &str,
        card_id: &str,
        job_id: &str,
        repo_path: &Path,
        base_ref: &str,
        holder: &str,
    ) -> Result<Worktree, WorktreeError> {
        validate_name(card_id)?;
        validate_name(base_ref)?;

        let lock_ms = lock_ms(self.config.lock_ttl);

        if let Some(existing) = self.db.find_reusable_worktree(card_id).await? {
            if let Some(locked) = self.db.lock_worktree(&existing.id, holder, lock_ms).await? {
                debug!(worktree_id = %locked.id, card_id, holder, "Reusing existing worktree");
                return Ok(locked);
            }
        }

        if !repo_path.exists() {
            return Err(WorktreeError::NotFound(format!(
                "Repository not found at {}",
                repo_path.display()
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let n = self.db.count_worktrees_for_card(card_id).await? + 1;
        let branch = format!("stagehand/{card_id}-{n}");
        validate_name(&branch)?;

        let dir = self.config.root.join(project_id);
        let path = dir.join(&id);
        tokio::fs::create_dir_all(&dir).await?;

        self.db
            .create_worktree(
                &id,
                project_id,
                card_id,
                job_id,
                &path.to_string_lossy(),
                &repo_path.to_string_lossy(),
                &branch,
                base_ref,
            )
            .await?;

        debug!(worktree_id = %id, card_id, branch, base_ref, "Spawning git worktree add");
        let output = tokio::process::Command::new("git")
            .args(["worktree", "add", "-b", &branch])
            .arg(&path)
            .arg(base_ref)
            .current_dir(repo_path)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let error = format!("git worktree add failed: {}", stderr.trim());
            warn!(worktree_id = %id, card_id, error = %error, "Worktree creation failed");
            self.db.set_worktree_error(&id, &error).await?;
            return Err(WorktreeError::Git(error));
        }

        info!(worktree_id = %id, card_id, branch, path = %path.display(), "Created git worktree");
        self.db
            .set_worktree_status(&id, WorktreeStatus::Ready)
            .await?;

        self.db
            .lock_worktree(&id, holder, lock_ms)
            .await?
            .ok_or_else(|| WorktreeError::Locked(id))
    }

    /// Renew the caller's lock on a worktree.
    pub async fn renew_lock(&self, id: &str, holder: &str) -> Result<Worktree, WorktreeError> {
        self.db
            .lock_worktree(id, holder, lock_ms(self.config.lock_ttl))
            .await?
            .ok_or_else(|| WorktreeError::Locked(id.to_string()))
    }

    /// Release the caller's lock, returning the tree to `ready`.
    pub async fn release(&self, id: &str, holder: &str) -> Result<(), WorktreeError> {
        if self.db.unlock_worktree(id, holder).await?.is_none() {
            return Err(WorktreeError::Locked(id.to_string()));
        }
        debug!(worktree_id = id, holder, "Worktree released");
        Ok(())
    }

    /// Flag a worktree for the reclaim sweep.
    pub async fn request_cleanup(&self, id: &str) -> Result<(), WorktreeError> {
        self.db.get_worktree(id).await?;
        self.db.request_worktree_cleanup(id).await?;
        info!(worktree_id = id, "Worktree cleanup requested");
        Ok(())
    }

    /// Get a worktree record.
    pub async fn get(&self, id: &str) -> Result<Worktree, WorktreeError> {
        Ok(self.db.get_worktree(id).await?)
    }

    /// Checkout path for a worktree, verified to exist on disk.
    pub async fn checkout_path(&self, id: &str) -> Result<PathBuf, WorktreeError> {
        let wt = self.db.get_worktree(id).await?;
        let path = PathBuf::from(&wt.path);
        if !path.exists() {
            return Err(WorktreeError::NotFound(format!(
                "Worktree {id} path does not exist on disk: {}",
                path.display()
            )));
        }
        Ok(path)
    }

    /// Reclaim sweep: remove worktrees whose owning job is terminal (or
    /// gone) and whose lock has expired. Never touches a tree with a live
    /// lock or a job still in flight. Returns the number removed.
    pub async fn reclaim(&self) -> Result<usize, WorktreeError> {
        let candidates = self.db.list_sweepable_worktrees().await?;
        let mut removed = 0;

        for wt in candidates {
            let terminal = match self.db.get_job(&wt.job_id).await {
                Ok(job) => job.job_state().is_some_and(JobState::is_terminal),
                Err(DatabaseError::NotFound(_)) => true,
                Err(e) => return Err(e.into()),
            };
            if !terminal {
                continue;
            }

            self.remove(&wt).await?;
            removed += 1;
        }

        Ok(removed)
    }

    /// Remove a single worktree: `git worktree remove --force` then delete
    /// the row. A git failure is logged and the row is deleted anyway so a
    /// manually-deleted checkout cannot wedge the sweep.
    async fn remove(&self, wt: &Worktree) -> Result<(), WorktreeError> {
        self.db
            .set_worktree_status(&wt.id, WorktreeStatus::Cleaning)
            .await?;

        let path = Path::new(&wt.path);
        if path.exists() {
            let output = tokio::process::Command::new("git")
                .args(["worktree", "remove", "--force"])
                .arg(path)
                .current_dir(&wt.repo_path)
                .output()
                .await?;

            if output.status.success() {
                info!(worktree_id = %wt.id, path = %path.display(), "Removed git worktree");
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(
                    worktree_id = %wt.id,
                    error = %stderr.trim(),
                    "git worktree remove failed, deleting record anyway"
                );
            }
        }

        self.db.delete_worktree(&wt.id).await?;
        Ok(())
    }
}

#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn lock_ms(ttl: Duration) -> i64 {
    ttl.as_millis() as i64
}
