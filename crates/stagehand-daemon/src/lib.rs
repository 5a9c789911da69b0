//! Stagehand Daemon Library
//!
//! Core functionality for the Stagehand daemon:
//! - Lease-protocol job queue over SQLite
//! - Phase pipeline driving agent subprocesses per card
//! - Git worktree lifecycle per (card, job)
//! - Card dependency graph with transition gating
//! - Worker pool with lease renewal and maintenance sweeps

pub mod events;
pub mod graph;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod worker;
pub mod worktree;
