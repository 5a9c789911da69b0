//! Database queries for the job queue.

use stagehand_core::db::{unix_timestamp, unix_timestamp_ms};

use super::db::{Database, DatabaseError};
use super::models::{Job, JobPhase, JobState};

impl Database {
    // =========================================================================
    // Job queries
    // =========================================================================

    /// Insert a new queued job.
    pub async fn create_job(
        &self,
        id: &str,
        project_id: &str,
        card_id: Option<&str>,
        job_type: &str,
        payload: &str,
    ) -> Result<Job, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO jobs (id, project_id, card_id, job_type, payload, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(id)
        .bind(project_id)
        .bind(card_id)
        .bind(job_type)
        .bind(payload)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_job(id).await
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: &str) -> Result<Job, DatabaseError> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Job {id}")))
    }

    /// Atomically claim the oldest claimable job for a worker.
    ///
    /// A job is claimable when it is queued, or running with an expired
    /// lease. Jobs whose card holds a live worktree lock owned by another
    /// worker are skipped, as are jobs in `excluded_projects` (projects
    /// whose worker slots are all taken). The whole claim is a single
    /// UPDATE so two workers can never take the same job.
    pub async fn claim_next_job(
        &self,
        worker_id: &str,
        lease_ttl_ms: i64,
        excluded_projects: &[String],
    ) -> Result<Option<Job>, DatabaseError> {
        let now_ms = unix_timestamp_ms();
        let now = unix_timestamp();

        let mut sql = String::from(
            r"
            UPDATE jobs
            SET state = 'running',
                worker_id = ?1,
                lease_until = ?2,
                attempts = attempts + 1,
                updated_at = ?3
            WHERE id = (
                SELECT j.id FROM jobs j
                WHERE (j.state = 'queued'
                       OR (j.state = 'running'
                           AND j.lease_until IS NOT NULL
                           AND j.lease_until <= ?4))
                  AND NOT EXISTS (
                      SELECT 1 FROM worktrees w
                      WHERE w.card_id = j.card_id
                        AND w.status = 'locked'
                        AND w.locked_by != ?1
                        AND w.lock_expires_at > ?4
                  )
            ",
        );
        if !excluded_projects.is_empty() {
            let placeholders = (0..excluded_projects.len())
                .map(|i| format!("?{}", 5 + i))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!("  AND j.project_id NOT IN ({placeholders})\n"));
        }
        sql.push_str(
            r"
                ORDER BY j.created_at ASC, j.id ASC
                LIMIT 1
            )
            RETURNING *
            ",
        );

        let mut query = sqlx::query_as::<_, Job>(&sql)
            .bind(worker_id)
            .bind(now_ms + lease_ttl_ms)
            .bind(now)
            .bind(now_ms);
        for project in excluded_projects {
            query = query.bind(project.as_str());
        }
        let job = query.fetch_optional(self.pool()).await?;

        Ok(job)
    }

    /// Extend the lease on a running job. Returns the renewed job, or `None`
    /// when the lease was lost: the job is no longer running, or another
    /// worker has claimed it.
    pub async fn renew_lease(
        &self,
        job_id: &str,
        worker_id: &str,
        lease_ttl_ms: i64,
    ) -> Result<Option<Job>, DatabaseError> {
        let now_ms = unix_timestamp_ms();

        let job = sqlx::query_as::<_, Job>(
            r"
            UPDATE jobs
            SET lease_until = ?, updated_at = ?
            WHERE id = ? AND worker_id = ? AND state = 'running'
            RETURNING *
            ",
        )
        .bind(now_ms + lease_ttl_ms)
        .bind(unix_timestamp())
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(job)
    }

    /// Move a running job to a terminal or parked state, clearing the lease.
    /// Terminal rows are never rewritten: the guard only matches jobs that
    /// are still in flight.
    pub async fn finish_job(
        &self,
        job_id: &str,
        state: JobState,
        result: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<Option<Job>, DatabaseError> {
        let job = sqlx::query_as::<_, Job>(
            r"
            UPDATE jobs
            SET state = ?,
                worker_id = NULL,
                lease_until = NULL,
                result = COALESCE(?, result),
                last_error = ?,
                updated_at = ?
            WHERE id = ? AND state IN ('queued', 'running', 'blocked')
            RETURNING *
            ",
        )
        .bind(state.as_str())
        .bind(result)
        .bind(last_error)
        .bind(unix_timestamp())
        .bind(job_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(job)
    }

    /// Put a non-terminal job back in the queue, clearing its lease.
    pub async fn requeue_job(&self, job_id: &str) -> Result<Option<Job>, DatabaseError> {
        let job = sqlx::query_as::<_, Job>(
            r"
            UPDATE jobs
            SET state = 'queued', worker_id = NULL, lease_until = NULL, updated_at = ?
            WHERE id = ? AND state IN ('running', 'blocked')
            RETURNING *
            ",
        )
        .bind(unix_timestamp())
        .bind(job_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(job)
    }

    /// Advance the persisted pipeline phase for a running job.
    pub async fn set_job_phase(&self, job_id: &str, phase: JobPhase) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE jobs SET phase = ?, updated_at = ? WHERE id = ?")
            .bind(phase.as_str())
            .bind(unix_timestamp())
            .bind(job_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Give back the attempt consumed by a claim that suspended rather
    /// than failed (approval gate, dependency wait).
    pub async fn refund_job_attempt(&self, job_id: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE jobs SET attempts = MAX(attempts - 1, 0) WHERE id = ?")
            .bind(job_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Record the most recent error without changing state.
    pub async fn record_job_error(&self, job_id: &str, error: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE jobs SET last_error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(unix_timestamp())
            .bind(job_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Merge a JSON payload patch into the job's payload.
    pub async fn set_job_payload(&self, job_id: &str, payload: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE jobs SET payload = ?, updated_at = ? WHERE id = ?")
            .bind(payload)
            .bind(unix_timestamp())
            .bind(job_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Requeue every running job whose lease has expired. Returns the
    /// affected jobs so the caller can log and emit events for them.
    pub async fn requeue_expired_leases(&self) -> Result<Vec<Job>, DatabaseError> {
        let now_ms = unix_timestamp_ms();

        let jobs = sqlx::query_as::<_, Job>(
            r"
            UPDATE jobs
            SET state = 'queued', worker_id = NULL, lease_until = NULL, updated_at = ?
            WHERE state = 'running' AND lease_until IS NOT NULL AND lease_until <= ?
            RETURNING *
            ",
        )
        .bind(unix_timestamp())
        .bind(now_ms)
        .fetch_all(self.pool())
        .await?;

        Ok(jobs)
    }

    /// Non-terminal jobs created before `cutoff` (Unix seconds), for the
    /// pipeline-timeout sweep.
    pub async fn list_overdue_jobs(&self, cutoff: i64) -> Result<Vec<Job>, DatabaseError> {
        let jobs = sqlx::query_as::<_, Job>(
            r"
            SELECT * FROM jobs
            WHERE state IN ('queued', 'running', 'blocked') AND created_at < ?
            ORDER BY created_at ASC, id ASC
            ",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;

        Ok(jobs)
    }

    /// Creation time of the oldest queued job, if any.
    pub async fn oldest_queued_at(&self) -> Result<Option<i64>, DatabaseError> {
        let at = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MIN(created_at) FROM jobs WHERE state = 'queued'",
        )
        .fetch_one(self.pool())
        .await?;

        Ok(at)
    }

    /// Count jobs per state.
    pub async fn count_jobs_by_state(&self) -> Result<Vec<(String, i64)>, DatabaseError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT state, COUNT(*) FROM jobs GROUP BY state ORDER BY state",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }
}
