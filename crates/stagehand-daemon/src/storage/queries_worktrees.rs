//! Database queries for worktree records.

use stagehand_core::db::{unix_timestamp, unix_timestamp_ms};

use super::db::{Database, DatabaseError};
use super::models::{Worktree, WorktreeStatus};

impl Database {
    // =========================================================================
    // Worktree queries
    // =========================================================================

    /// Insert a new worktree record in the `creating` state.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_worktree(
        &self,
        id: &str,
        project_id: &str,
        card_id: &str,
        job_id: &str,
        path: &str,
        repo_path: &str,
        branch: &str,
        base_ref: &str,
    ) -> Result<Worktree, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO worktrees
                (id, project_id, card_id, job_id, path, repo_path, branch, base_ref,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(id)
        .bind(project_id)
        .bind(card_id)
        .bind(job_id)
        .bind(path)
        .bind(repo_path)
        .bind(branch)
        .bind(base_ref)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_worktree(id).await
    }

    /// Get a worktree by ID.
    pub async fn get_worktree(&self, id: &str) -> Result<Worktree, DatabaseError> {
        sqlx::query_as::<_, Worktree>("SELECT * FROM worktrees WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Worktree {id}")))
    }

    /// Find a reusable worktree for a card: one that is ready, or locked
    /// with an expired lock. Removed and errored trees never match.
    pub async fn find_reusable_worktree(
        &self,
        card_id: &str,
    ) -> Result<Option<Worktree>, DatabaseError> {
        let now_ms = unix_timestamp_ms();

        let wt = sqlx::query_as::<_, Worktree>(
            r"
            SELECT * FROM worktrees
            WHERE card_id = ?
              AND (status = 'ready'
                   OR (status = 'locked' AND (lock_expires_at IS NULL OR lock_expires_at <= ?)))
            ORDER BY created_at DESC
            LIMIT 1
            ",
        )
        .bind(card_id)
        .bind(now_ms)
        .fetch_optional(self.pool())
        .await?;

        Ok(wt)
    }

    /// Update a worktree's lifecycle status.
    pub async fn set_worktree_status(
        &self,
        id: &str,
        status: WorktreeStatus,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE worktrees SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Record a creation or cleanup failure and park the tree in `error`.
    pub async fn set_worktree_error(&self, id: &str, error: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE worktrees SET status = 'error', last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Take the exclusive lock on a worktree. Succeeds when the tree is
    /// ready, when the caller already holds the lock, or when a previous
    /// holder's lock has expired. Returns `None` when the lock is held by
    /// someone else.
    pub async fn lock_worktree(
        &self,
        id: &str,
        locked_by: &str,
        lock_ttl_ms: i64,
    ) -> Result<Option<Worktree>, DatabaseError> {
        let now_ms = unix_timestamp_ms();

        let wt = sqlx::query_as::<_, Worktree>(
            r"
            UPDATE worktrees
            SET status = 'locked', locked_by = ?1, lock_expires_at = ?2, updated_at = ?3
            WHERE id = ?4
              AND (status = 'ready'
                   OR (status = 'locked'
                       AND (locked_by = ?1
                            OR lock_expires_at IS NULL
                            OR lock_expires_at <= ?5)))
            RETURNING *
            ",
        )
        .bind(locked_by)
        .bind(now_ms + lock_ttl_ms)
        .bind(unix_timestamp())
        .bind(id)
        .bind(now_ms)
        .fetch_optional(self.pool())
        .await?;

        Ok(wt)
    }

    /// Release the lock held by `locked_by`, returning the tree to `ready`.
    /// A no-op when the caller does not hold the lock.
    pub async fn unlock_worktree(
        &self,
        id: &str,
        locked_by: &str,
    ) -> Result<Option<Worktree>, DatabaseError> {
        let wt = sqlx::query_as::<_, Worktree>(
            r"
            UPDATE worktrees
            SET status = 'ready', locked_by = NULL, lock_expires_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'locked' AND locked_by = ?
            RETURNING *
            ",
        )
        .bind(unix_timestamp())
        .bind(id)
        .bind(locked_by)
        .fetch_optional(self.pool())
        .await?;

        Ok(wt)
    }

    /// Flag a worktree for removal by the reclaim sweep.
    pub async fn request_worktree_cleanup(&self, id: &str) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        sqlx::query("UPDATE worktrees SET cleanup_requested_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Worktrees the sweep may consider: still present, and any lock has
    /// expired. Whether the owning job is terminal is the caller's check.
    pub async fn list_sweepable_worktrees(&self) -> Result<Vec<Worktree>, DatabaseError> {
        let now_ms = unix_timestamp_ms();

        let trees = sqlx::query_as::<_, Worktree>(
            r"
            SELECT * FROM worktrees
            WHERE status NOT IN ('removed', 'cleaning')
              AND (status != 'locked' OR lock_expires_at IS NULL OR lock_expires_at <= ?)
            ORDER BY created_at ASC
            ",
        )
        .bind(now_ms)
        .fetch_all(self.pool())
        .await?;

        Ok(trees)
    }

    /// Number of worktrees ever created for a card, for branch suffixes.
    pub async fn count_worktrees_for_card(&self, card_id: &str) -> Result<i64, DatabaseError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM worktrees WHERE card_id = ?")
                .bind(card_id)
                .fetch_one(self.pool())
                .await?;

        Ok(count)
    }

    /// List worktrees in a given status.
    pub async fn list_worktrees_by_status(
        &self,
        status: WorktreeStatus,
    ) -> Result<Vec<Worktree>, DatabaseError> {
        let trees = sqlx::query_as::<_, Worktree>(
            "SELECT * FROM worktrees WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(self.pool())
        .await?;

        Ok(trees)
    }

    /// Delete a worktree row after its directory has been removed.
    pub async fn delete_worktree(&self, id: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM worktrees WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }
}
