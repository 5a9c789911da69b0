//! Git worktree lifecycle: acquisition, locking, and reclaim.

mod manager;

pub use manager::{WorktreeConfig, WorktreeError, WorktreeManager};
