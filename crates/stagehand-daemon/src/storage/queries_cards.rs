//! Database queries for plan approvals, card dependencies, and follow-ups.

use stagehand_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{ApprovalStatus, CardDependency, FollowUpInstruction, PlanApproval};

impl Database {
    // =========================================================================
    // Plan approval queries
    // =========================================================================

    /// Record a pending plan approval for a job.
    pub async fn create_plan_approval(
        &self,
        job_id: &str,
        plan: &str,
        planning_mode: &str,
    ) -> Result<PlanApproval, DatabaseError> {
        let approval = sqlx::query_as::<_, PlanApproval>(
            r"
            INSERT INTO plan_approvals (job_id, plan, planning_mode, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING *
            ",
        )
        .bind(job_id)
        .bind(plan)
        .bind(planning_mode)
        .bind(unix_timestamp())
        .fetch_one(self.pool())
        .await?;

        Ok(approval)
    }

    /// The most recent approval record for a job, if any.
    pub async fn latest_approval_for_job(
        &self,
        job_id: &str,
    ) -> Result<Option<PlanApproval>, DatabaseError> {
        let approval = sqlx::query_as::<_, PlanApproval>(
            "SELECT * FROM plan_approvals WHERE job_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(approval)
    }

    /// Decide a pending approval. The `status = 'pending'` guard makes the
    /// decision idempotent: a second decision on the same record is a no-op
    /// and returns `None`.
    pub async fn decide_approval(
        &self,
        approval_id: i64,
        status: ApprovalStatus,
        reviewer_notes: Option<&str>,
    ) -> Result<Option<PlanApproval>, DatabaseError> {
        let approval = sqlx::query_as::<_, PlanApproval>(
            r"
            UPDATE plan_approvals
            SET status = ?, reviewer_notes = ?, decided_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING *
            ",
        )
        .bind(status.as_str())
        .bind(reviewer_notes)
        .bind(unix_timestamp())
        .bind(approval_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(approval)
    }

    /// List all pending approvals, oldest first.
    pub async fn list_pending_approvals(&self) -> Result<Vec<PlanApproval>, DatabaseError> {
        let approvals = sqlx::query_as::<_, PlanApproval>(
            "SELECT * FROM plan_approvals WHERE status = 'pending' ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(approvals)
    }

    // =========================================================================
    // Card dependency queries
    // =========================================================================

    /// Insert a dependency edge. The UNIQUE constraint rejects duplicate
    /// (card, depends_on) pairs.
    pub async fn create_card_dependency(
        &self,
        card_id: &str,
        depends_on_card_id: &str,
        required_status: &str,
        blocking_statuses: &str,
    ) -> Result<CardDependency, DatabaseError> {
        let dep = sqlx::query_as::<_, CardDependency>(
            r"
            INSERT INTO card_dependencies
                (card_id, depends_on_card_id, required_status, blocking_statuses, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            ",
        )
        .bind(card_id)
        .bind(depends_on_card_id)
        .bind(required_status)
        .bind(blocking_statuses)
        .bind(unix_timestamp())
        .fetch_one(self.pool())
        .await?;

        Ok(dep)
    }

    /// Active edges leaving a card (what it depends on).
    pub async fn list_dependencies_of(
        &self,
        card_id: &str,
    ) -> Result<Vec<CardDependency>, DatabaseError> {
        let deps = sqlx::query_as::<_, CardDependency>(
            "SELECT * FROM card_dependencies WHERE card_id = ? AND is_active = 1 ORDER BY id ASC",
        )
        .bind(card_id)
        .fetch_all(self.pool())
        .await?;

        Ok(deps)
    }

    /// Active edges entering a card (what depends on it).
    pub async fn list_dependents_of(
        &self,
        card_id: &str,
    ) -> Result<Vec<CardDependency>, DatabaseError> {
        let deps = sqlx::query_as::<_, CardDependency>(
            r"
            SELECT * FROM card_dependencies
            WHERE depends_on_card_id = ? AND is_active = 1
            ORDER BY id ASC
            ",
        )
        .bind(card_id)
        .fetch_all(self.pool())
        .await?;

        Ok(deps)
    }

    /// All active edges in the graph.
    pub async fn list_all_dependencies(&self) -> Result<Vec<CardDependency>, DatabaseError> {
        let deps = sqlx::query_as::<_, CardDependency>(
            "SELECT * FROM card_dependencies WHERE is_active = 1 ORDER BY id ASC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(deps)
    }

    /// Soft-delete an edge. Returns whether a live edge was deactivated.
    pub async fn deactivate_card_dependency(
        &self,
        card_id: &str,
        depends_on_card_id: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE card_dependencies SET is_active = 0
            WHERE card_id = ? AND depends_on_card_id = ? AND is_active = 1
            ",
        )
        .bind(card_id)
        .bind(depends_on_card_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Card status mirror
    // =========================================================================

    /// Current status of a card, if the host has reported one.
    pub async fn get_card_status(&self, card_id: &str) -> Result<Option<String>, DatabaseError> {
        let status = sqlx::query_scalar::<_, String>(
            "SELECT status FROM card_statuses WHERE card_id = ?",
        )
        .bind(card_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(status)
    }

    /// Upsert a card's current status.
    pub async fn set_card_status(&self, card_id: &str, status: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO card_statuses (card_id, status, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(card_id) DO UPDATE SET status = excluded.status,
                                              updated_at = excluded.updated_at
            ",
        )
        .bind(card_id)
        .bind(status)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    // =========================================================================
    // Follow-up instruction queries
    // =========================================================================

    /// Queue a follow-up instruction against a job or a card.
    pub async fn create_follow_up(
        &self,
        job_id: Option<&str>,
        card_id: Option<&str>,
        instruction_type: &str,
        content: &str,
        priority: i64,
    ) -> Result<FollowUpInstruction, DatabaseError> {
        let followup = sqlx::query_as::<_, FollowUpInstruction>(
            r"
            INSERT INTO follow_up_instructions
                (job_id, card_id, instruction_type, content, priority, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            ",
        )
        .bind(job_id)
        .bind(card_id)
        .bind(instruction_type)
        .bind(content)
        .bind(priority)
        .bind(unix_timestamp())
        .fetch_one(self.pool())
        .await?;

        Ok(followup)
    }

    /// Pending follow-ups for a job, highest priority first, then FIFO.
    pub async fn pending_follow_ups_for_job(
        &self,
        job_id: &str,
    ) -> Result<Vec<FollowUpInstruction>, DatabaseError> {
        let followups = sqlx::query_as::<_, FollowUpInstruction>(
            r"
            SELECT * FROM follow_up_instructions
            WHERE job_id = ? AND status = 'pending'
            ORDER BY priority DESC, created_at ASC, id ASC
            ",
        )
        .bind(job_id)
        .fetch_all(self.pool())
        .await?;

        Ok(followups)
    }

    /// Mark a follow-up applied or rejected.
    pub async fn mark_follow_up(
        &self,
        id: i64,
        status: super::models::InstructionStatus,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            UPDATE follow_up_instructions SET status = ?, applied_at = ?
            WHERE id = ? AND status = 'pending'
            ",
        )
        .bind(status.as_str())
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Attach card-level follow-ups to a newly started job for that card.
    pub async fn adopt_follow_ups(&self, card_id: &str, job_id: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            UPDATE follow_up_instructions SET job_id = ?
            WHERE card_id = ? AND job_id IS NULL AND status = 'pending'
            ",
        )
        .bind(job_id)
        .bind(card_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}
