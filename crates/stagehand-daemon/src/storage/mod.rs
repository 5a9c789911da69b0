//! SQLite storage layer for the Stagehand daemon.

mod db;
mod models;
mod queries;
mod queries_cards;
mod queries_worktrees;

pub use db::{Database, DatabaseError};
pub use models::{
    ApprovalStatus, CardDependency, FollowUpInstruction, InstructionStatus, Job, JobPhase,
    JobState, PlanApproval, Worktree, WorktreeStatus,
};
