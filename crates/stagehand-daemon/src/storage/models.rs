//! Database models for the Stagehand daemon.

use serde::{Deserialize, Serialize};

/// Job record from the database: one leased pipeline execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub project_id: String,
    pub card_id: Option<String>,
    pub job_type: String,
    pub state: String,
    pub phase: String,
    pub worker_id: Option<String>,
    /// Unix milliseconds; `None` when not leased.
    pub lease_until: Option<i64>,
    pub attempts: i64,
    pub payload: String,
    pub result: Option<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    /// Parsed job state; `None` when the row carries an unknown value.
    pub fn job_state(&self) -> Option<JobState> {
        JobState::parse(&self.state)
    }

    pub fn job_phase(&self) -> Option<JobPhase> {
        JobPhase::parse(&self.phase)
    }
}

/// Worktree record: isolated workspace bound to one (card, job) pair.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Worktree {
    pub id: String,
    pub project_id: String,
    pub card_id: String,
    pub job_id: String,
    pub path: String,
    pub repo_path: String,
    pub branch: String,
    pub base_ref: String,
    pub status: String,
    pub locked_by: Option<String>,
    /// Unix milliseconds; `None` when unlocked.
    pub lock_expires_at: Option<i64>,
    pub cleanup_requested_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Worktree {
    pub fn worktree_status(&self) -> Option<WorktreeStatus> {
        WorktreeStatus::parse(&self.status)
    }
}

/// Plan approval gate record for a job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlanApproval {
    pub id: i64,
    pub job_id: String,
    pub plan: String,
    pub planning_mode: String,
    pub status: String,
    pub reviewer_notes: Option<String>,
    pub created_at: i64,
    pub decided_at: Option<i64>,
}

impl PlanApproval {
    pub fn approval_status(&self) -> Option<ApprovalStatus> {
        ApprovalStatus::parse(&self.status)
    }
}

/// Directed dependency edge between cards.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CardDependency {
    pub id: i64,
    pub card_id: String,
    pub depends_on_card_id: String,
    pub required_status: String,
    /// JSON array of status names.
    pub blocking_statuses: String,
    pub is_active: i64,
    pub created_at: i64,
}

impl CardDependency {
    /// Statuses the dependent card may not enter while this edge is unmet.
    pub fn blocking(&self) -> Vec<String> {
        serde_json::from_str(&self.blocking_statuses).unwrap_or_default()
    }
}

/// Queued instruction folded into a running or resumed pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowUpInstruction {
    pub id: i64,
    pub job_id: Option<String>,
    pub card_id: Option<String>,
    pub instruction_type: String,
    pub content: String,
    pub priority: i64,
    pub status: String,
    pub created_at: i64,
    pub applied_at: Option<i64>,
}

/// Job state enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Blocked,
    Canceled,
}

impl JobState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Terminal states are immutable thereafter.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline phase enum; the persisted `phase` column is the continuation
/// point for the re-entrant driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Decompose,
    Plan,
    ApprovalGate,
    Execute,
    Verify,
    Publish,
    Done,
}

impl JobPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Decompose => "decompose",
            Self::Plan => "plan",
            Self::ApprovalGate => "approval_gate",
            Self::Execute => "execute",
            Self::Verify => "verify",
            Self::Publish => "publish",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "decompose" => Some(Self::Decompose),
            "plan" => Some(Self::Plan),
            "approval_gate" => Some(Self::ApprovalGate),
            "execute" => Some(Self::Execute),
            "verify" => Some(Self::Verify),
            "publish" => Some(Self::Publish),
            "done" => Some(Self::Done),
            _ => None,
        }
    }

    /// The phase following this one in the pipeline.
    pub const fn next(self) -> Self {
        match self {
            Self::Decompose => Self::Plan,
            Self::Plan => Self::ApprovalGate,
            Self::ApprovalGate => Self::Execute,
            Self::Execute => Self::Verify,
            Self::Verify => Self::Publish,
            Self::Publish | Self::Done => Self::Done,
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Worktree lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorktreeStatus {
    Creating,
    Ready,
    Locked,
    Cleaning,
    Removed,
    Error,
}

impl WorktreeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Locked => "locked",
            Self::Cleaning => "cleaning",
            Self::Removed => "removed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(Self::Creating),
            "ready" => Some(Self::Ready),
            "locked" => Some(Self::Locked),
            "cleaning" => Some(Self::Cleaning),
            "removed" => Some(Self::Removed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorktreeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Plan approval gate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
}

impl ApprovalStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Follow-up instruction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionStatus {
    Pending,
    Applied,
    Rejected,
}

impl InstructionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for InstructionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn job_state_roundtrip() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Blocked,
            JobState::Canceled,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert!(JobState::parse("bogus").is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Canceled.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Blocked.is_terminal());
    }

    #[test]
    fn phase_order() {
        assert_eq!(JobPhase::Decompose.next(), JobPhase::Plan);
        assert_eq!(JobPhase::Plan.next(), JobPhase::ApprovalGate);
        assert_eq!(JobPhase::ApprovalGate.next(), JobPhase::Execute);
        assert_eq!(JobPhase::Execute.next(), JobPhase::Verify);
        assert_eq!(JobPhase::Verify.next(), JobPhase::Publish);
        assert_eq!(JobPhase::Publish.next(), JobPhase::Done);
        assert_eq!(JobPhase::Done.next(), JobPhase::Done);
    }

    #[test]
    fn blocking_statuses_parse() {
        let dep = CardDependency {
            id: 1,
            card_id: "a".into(),
            depends_on_card_id: "b".into(),
            required_status: "done".into(),
            blocking_statuses: r#"["in_progress","done"]"#.into(),
            is_active: 1,
            created_at: 0,
        };
        assert_eq!(dep.blocking(), vec!["in_progress", "done"]);
    }

    #[test]
    fn blocking_statuses_malformed_is_empty() {
        let dep = CardDependency {
            id: 1,
            card_id: "a".into(),
            depends_on_card_id: "b".into(),
            required_status: "done".into(),
            blocking_statuses: "not json".into(),
            is_active: 1,
            created_at: 0,
        };
        assert!(dep.blocking().is_empty());
    }
}
