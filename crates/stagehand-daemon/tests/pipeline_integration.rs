#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end integration test for the card pipeline.
//!
//! Exercises the full path through the public surfaces: enqueue a job,
//! claim it, drive it to the approval gate, approve the plan, finish
//! execute/verify/publish in a real git worktree, and reclaim the
//! checkout after the job is terminal.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use stagehand_daemon::events::{EventBus, PipelineEvent};
use stagehand_daemon::graph::DependencyGraph;
use stagehand_daemon::pipeline::{
    AgentError, AgentRequest, AgentRunner, DriveOutcome, LoggingRemote, NeverDecompose,
    PipelineConfig, PipelineDriver,
};
use stagehand_daemon::queue::{JobQueue, QueueConfig};
use stagehand_daemon::storage::{Database, WorktreeStatus};
use stagehand_daemon::worktree::{WorktreeConfig, WorktreeManager};

/// Agent stand-in: plans on request, writes a file during execute.
struct FileWritingAgent;

#[async_trait]
impl AgentRunner for FileWritingAgent {
    async fn run(&self, request: AgentRequest) -> Result<String, AgentError> {
        if request.prompt.contains("implementation plan") {
            Ok(r#"{"plan": "1. add the feature\n2. cover it with a test"}"#.to_string())
        } else {
            std::fs::write(request.working_dir.join("feature.txt"), "done")
                .map_err(AgentError::Io)?;
            Ok("feature implemented".to_string())
        }
    }
}

fn git(dir: &Path, args: &[&str]) {
    let out = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

struct Harness {
    db: Database,
    queue: JobQueue,
    worktrees: WorktreeManager,
    driver: PipelineDriver,
    events: EventBus,
    _worktree_root: tempfile::TempDir,
    repo: tempfile::TempDir,
}

async fn harness() -> Harness {
    let db = Database::open_in_memory().await.unwrap();
    let events = EventBus::new();
    let queue = JobQueue::new(db.clone(), events.clone(), QueueConfig::default());
    let worktree_root = tempfile::tempdir().unwrap();
    let worktrees = WorktreeManager::new(
        db.clone(),
        WorktreeConfig {
            root: worktree_root.path().to_path_buf(),
            lock_ttl: Duration::from_millis(50),
        },
    );

    let repo = tempfile::tempdir().unwrap();
    git(repo.path(), &["init"]);
    git(repo.path(), &["config", "user.email", "test@test"]);
    git(repo.path(), &["config", "user.name", "test"]);
    git(repo.path(), &["commit", "--allow-empty", "-m", "init"]);

    let driver = PipelineDriver::new(
        db.clone(),
        queue.clone(),
        DependencyGraph::new(db.clone()),
        worktrees.clone(),
        Arc::new(FileWritingAgent),
        Arc::new(LoggingRemote::new("example.com".to_string())),
        Arc::new(NeverDecompose),
        events.clone(),
        PipelineConfig::default(),
    );

    Harness {
        db,
        queue,
        worktrees,
        driver,
        events,
        _worktree_root: worktree_root,
        repo,
    }
}

#[tokio::test]
async fn full_pipeline_with_approval_and_reclaim() {
    let h = harness().await;
    let mut rx = h.events.subscribe();

    // Enqueue a worker-run job for a card with a verify command.
    let payload = json!({
        "card": {"description": "add the feature", "checklist_items": 2},
        "repo_path": h.repo.path().to_str().unwrap(),
        "base_ref": "HEAD",
        "verify_commands": ["test -f feature.txt"],
    });
    let job = h
        .queue
        .enqueue("proj-1", Some("card-42"), "worker-run", &payload)
        .await
        .unwrap();

    // Claim and drive: the pipeline parks at the approval gate.
    let claimed = h.queue.claim("worker-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    let outcome = h.driver.drive(&job.id, "worker-1").await.unwrap();
    assert_eq!(outcome, DriveOutcome::AwaitingApproval);

    let approval = h.db.latest_approval_for_job(&job.id).await.unwrap().unwrap();
    assert_eq!(approval.status, "pending");
    assert!(approval.plan.contains("add the feature"));

    // Approve; the job becomes claimable again and runs to completion.
    h.driver.approve_plan(&job.id, Some("lgtm")).await.unwrap();
    h.queue.claim("worker-1").await.unwrap().unwrap();
    let outcome = h.driver.drive(&job.id, "worker-1").await.unwrap();
    assert_eq!(outcome, DriveOutcome::Completed);

    let done = h.db.get_job(&job.id).await.unwrap();
    assert_eq!(done.state, "succeeded");
    assert_eq!(done.phase, "done");
    let result = done.result.unwrap();
    assert!(result.contains("change_request_url"));

    // The agent's work landed in a real worktree on a card branch.
    let worktree = &h
        .db
        .list_worktrees_by_status(WorktreeStatus::Ready)
        .await
        .unwrap()[0];
    assert!(worktree.branch.starts_with("stagehand/card-42-"));
    assert!(Path::new(&worktree.path).join("feature.txt").exists());
    // Released after success: lock cleared, checkout still on disk.
    assert!(worktree.locked_by.is_none());

    // Reclaim sweep: the owning job is terminal and the lock is gone,
    // so the checkout is removed.
    let removed = h.worktrees.reclaim().await.unwrap();
    assert_eq!(removed, 1);
    assert!(!Path::new(&worktree.path).exists());

    // The event stream saw the whole lifecycle in order.
    let mut saw_approval_request = false;
    let mut saw_success = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            PipelineEvent::ApprovalRequested { job_id, .. } => {
                assert_eq!(job_id, job.id);
                saw_approval_request = true;
            }
            PipelineEvent::JobSucceeded { job_id } => {
                assert!(saw_approval_request, "approval must precede success");
                assert_eq!(job_id, job.id);
                saw_success = true;
            }
            _ => {}
        }
    }
    assert!(saw_success);
}

#[tokio::test]
async fn lease_expiry_requeues_and_second_worker_finishes() {
    let h = harness().await;
    let queue = JobQueue::new(
        h.db.clone(),
        h.events.clone(),
        QueueConfig {
            lease_ttl: Duration::from_millis(30),
            ..QueueConfig::default()
        },
    );

    let payload = json!({
        "card": {"description": "small fix"},
        "repo_path": h.repo.path().to_str().unwrap(),
        "base_ref": "HEAD",
        "planning_mode": "skip",
    });
    let job = queue
        .enqueue("proj-1", Some("card-7"), "worker-run", &payload)
        .await
        .unwrap();

    // Worker 1 claims and then disappears without driving.
    queue.claim("worker-1").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    // The sweep returns the job to the queue; worker 2 finishes it.
    let (requeued, timed_out) = queue.sweep().await.unwrap();
    assert_eq!((requeued, timed_out), (1, 0));

    let reclaimed = queue.claim("worker-2").await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job.id);
    let outcome = h.driver.drive(&job.id, "worker-2").await.unwrap();
    assert_eq!(outcome, DriveOutcome::Completed);
}

#[tokio::test]
async fn rejected_plan_never_touches_the_repository() {
    let h = harness().await;

    let payload = json!({
        "card": {"description": "risky change"},
        "repo_path": h.repo.path().to_str().unwrap(),
        "base_ref": "HEAD",
    });
    let job = h
        .queue
        .enqueue("proj-1", Some("card-9"), "worker-run", &payload)
        .await
        .unwrap();

    h.queue.claim("worker-1").await.unwrap().unwrap();
    assert_eq!(
        h.driver.drive(&job.id, "worker-1").await.unwrap(),
        DriveOutcome::AwaitingApproval
    );
    h.driver.reject_plan(&job.id, Some("not now")).await.unwrap();

    let done = h.db.get_job(&job.id).await.unwrap();
    assert_eq!(done.state, "failed");
    assert!(done.last_error.unwrap().contains("not now"));

    // No worktree was ever created for the card.
    assert_eq!(h.db.count_worktrees_for_card("card-9").await.unwrap(), 0);
}
