//! Re-entrant pipeline driver.
//!
//! `drive(job_id, worker_id)` loads the job, reads its persisted phase,
//! and advances through decompose -> plan -> approval_gate -> execute ->
//! verify -> publish until it suspends (approval pending, dependency
//! blocked) or reaches a terminal state. The phase column is the only
//! continuation state; the driver is safe to re-invoke with just the job
//! id, guarded by the queue lease.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stagehand_core::sync::{KeyedLimiter, RetryError, RetryPolicy, TokenBucket, retry_with_backoff};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::events::{EventBus, PipelineEvent};
use crate::graph::{DependencyGraph, GraphError};
use crate::pipeline::policy::{CardFacts, DecomposePolicy};
use crate::pipeline::runner::{
    AgentError, AgentRequest, AgentRunner, ChangeRequest, RemoteError, RemoteRepository,
};
use crate::queue::{JobQueue, QueueError};
use crate::storage::{
    ApprovalStatus, Database, DatabaseError, InstructionStatus, Job, JobPhase, JobState,
};
use crate::worktree::{WorktreeError, WorktreeManager};

/// Errors from the pipeline driver.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Worktree error: {0}")]
    Worktree(#[from] WorktreeError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Job {0} has no approval record at the gate")]
    MissingApproval(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid job state: {0}")]
    InvalidState(String),
}

/// Where a drive call ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    /// The job reached `succeeded`.
    Completed,
    /// Suspended at the approval gate; resumes on a decision.
    AwaitingApproval,
    /// Suspended on unmet dependencies; lists the blocking cards.
    DependencyBlocked(Vec<String>),
    /// The job failed (terminally or pending a requeue).
    Failed(String),
    /// The job was cancelled.
    Canceled,
}

/// Driver tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Per-agent-invocation timeout.
    pub agent_timeout: Duration,
    /// Backoff policy for transient in-phase failures.
    pub retry: RetryPolicy,
    /// Publish rate limit per remote host: bucket capacity and refill/sec.
    pub publish_capacity: u32,
    pub publish_refill_per_sec: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
            publish_capacity: 5,
            publish_refill_per_sec: 0.5,
        }
    }
}

/// Job payload fields the driver reads and writes. Unknown fields from the
/// host pass through untouched via `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct JobPayload {
    #[serde(default)]
    card: CardFacts,
    #[serde(default)]
    repo_path: Option<String>,
    #[serde(default = "default_base_ref")]
    base_ref: String,
    #[serde(default)]
    planning_mode: Option<String>,
    #[serde(default)]
    verify_commands: Vec<String>,
    #[serde(default)]
    subtasks: Option<Vec<String>>,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    worktree_id: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

fn default_base_ref() -> String {
    "main".to_string()
}

/// Per-job cooperative cancel flags.
#[derive(Clone, Default)]
struct CancelFlags {
    inner: Arc<StdMutex<HashMap<String, watch::Sender<bool>>>>,
}

impl CancelFlags {
    fn register(&self, job_id: &str) -> watch::Receiver<bool> {
        let mut map = match self.inner.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(job_id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    fn request(&self, job_id: &str) {
        let map = match self.inner.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(tx) = map.get(job_id) {
            let _ = tx.send(true);
        }
    }

    fn clear(&self, job_id: &str) {
        let mut map = match self.inner.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.remove(job_id);
    }

    fn is_set(rx: &watch::Receiver<bool>) -> bool {
        *rx.borrow()
    }
}

/// The pipeline driver.
pub struct PipelineDriver {
    db: Database,
    queue: JobQueue,
    graph: DependencyGraph,
    worktrees: WorktreeManager,
    runner: Arc<dyn AgentRunner>,
    remote: Arc<dyn RemoteRepository>,
    policy: Arc<dyn DecomposePolicy>,
    events: EventBus,
    config: PipelineConfig,
    publish_limiter: KeyedLimiter<TokenBucket>,
    cancels: CancelFlags,
}

impl PipelineDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        queue: JobQueue,
        graph: DependencyGraph,
        worktrees: WorktreeManager,
        runner: Arc<dyn AgentRunner>,
        remote: Arc<dyn RemoteRepository>,
        policy: Arc<dyn DecomposePolicy>,
        events: EventBus,
        config: PipelineConfig,
    ) -> Self {
        let capacity = config.publish_capacity;
        let refill = config.publish_refill_per_sec;
        Self {
            db,
            queue,
            graph,
            worktrees,
            runner,
            remote,
            policy,
            events,
            config,
            publish_limiter: KeyedLimiter::new(move || TokenBucket::new(capacity, refill)),
            cancels: CancelFlags::default(),
        }
    }

    /// Advance a claimed job as far as it will go.
    pub async fn drive(&self, job_id: &str, worker_id: &str) -> Result<DriveOutcome, PipelineError> {
        let cancel_rx = self.cancels.register(job_id);
        let outcome = self.drive_inner(job_id, worker_id, &cancel_rx).await;
        self.cancels.clear(job_id);
        outcome
    }

    async fn drive_inner(
        &self,
        job_id: &str,
        worker_id: &str,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<DriveOutcome, PipelineError> {
        loop {
            let job = self.db.get_job(job_id).await?;

            match job.job_state() {
                Some(JobState::Running) => {}
                Some(JobState::Succeeded) => return Ok(DriveOutcome::Completed),
                Some(JobState::Canceled) => return Ok(DriveOutcome::Canceled),
                Some(JobState::Failed) => {
                    return Ok(DriveOutcome::Failed(
                        job.last_error.unwrap_or_else(|| "failed".to_string()),
                    ));
                }
                _ => {
                    return Err(PipelineError::InvalidState(format!(
                        "job {job_id} is {} and cannot be driven",
                        job.state
                    )));
                }
            }

            // Cooperative cancellation between phases.
            if CancelFlags::is_set(cancel_rx) {
                return self.finish_cancel(&job, worker_id).await;
            }

            let phase = job.job_phase().ok_or_else(|| {
                PipelineError::InvalidState(format!("job {job_id} has unknown phase {}", job.phase))
            })?;

            self.events.publish(PipelineEvent::PhaseStarted {
                job_id: job_id.to_string(),
                phase: phase.to_string(),
            });
            debug!(job_id, phase = %phase, worker_id, "Entering phase");

            let step = match phase {
                JobPhase::Decompose => self.phase_decompose(&job, cancel_rx).await,
                JobPhase::Plan => self.phase_plan(&job, cancel_rx).await,
                JobPhase::ApprovalGate => self.phase_approval_gate(&job).await,
                JobPhase::Execute => self.phase_execute(&job, worker_id, cancel_rx).await,
                JobPhase::Verify => self.phase_verify(&job, worker_id, cancel_rx).await,
                JobPhase::Publish => self.phase_publish(&job, worker_id, cancel_rx).await,
                JobPhase::Done => return self.finish_success(&job, worker_id).await,
            };

            match step? {
                PhaseStep::Advance => {
                    self.db.set_job_phase(job_id, phase.next()).await?;
                    self.events.publish(PipelineEvent::PhaseCompleted {
                        job_id: job_id.to_string(),
                        phase: phase.to_string(),
                    });
                }
                PhaseStep::Suspend(outcome) => return Ok(outcome),
                PhaseStep::Fail { error, retryable } => {
                    return self.finish_failure(&job, worker_id, &error, retryable).await;
                }
                PhaseStep::Cancelled => return self.finish_cancel(&job, worker_id).await,
            }
        }
    }

    // =========================================================================
    // Phases
    // =========================================================================

    async fn phase_decompose(
        &self,
        job: &Job,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<PhaseStep, PipelineError> {
        let mut payload = parse_payload(&job.payload);

        if !self.policy.should_decompose(&payload.card) {
            debug!(job_id = %job.id, "Card under decomposition threshold, skipping");
            return Ok(PhaseStep::Advance);
        }

        let prompt = format!(
            "Split the following card into independent subtasks.\n\
             Respond with JSON: {{\"subtasks\": [\"...\", ...]}}\n\n\
             Card {}:\n{}",
            job.card_id.as_deref().unwrap_or(&job.id),
            payload.card.description
        );

        let transcript = match self.run_agent(&prompt, None, cancel_rx).await {
            Ok(t) => t,
            Err(step) => return Ok(step),
        };

        #[derive(Deserialize)]
        struct DecomposeOutput {
            subtasks: Vec<String>,
        }
        let Ok(parsed) = serde_json::from_str::<DecomposeOutput>(transcript.trim()) else {
            return Ok(PhaseStep::Fail {
                error: "failed during decompose: output is not {\"subtasks\": [...]}".into(),
                retryable: false,
            });
        };

        info!(job_id = %job.id, subtasks = parsed.subtasks.len(), "Card decomposed");
        payload.subtasks = Some(parsed.subtasks);
        self.save_payload(&job.id, &payload).await?;
        Ok(PhaseStep::Advance)
    }

    async fn phase_plan(
        &self,
        job: &Job,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<PhaseStep, PipelineError> {
        let mut payload = parse_payload(&job.payload);

        let prompt = format!(
            "Produce an implementation plan for the following card.\n\
             Respond with JSON: {{\"plan\": \"...\"}}\n\n\
             Card {}:\n{}{}",
            job.card_id.as_deref().unwrap_or(&job.id),
            payload.card.description,
            payload
                .subtasks
                .as_ref()
                .map(|s| format!("\n\nSubtasks:\n- {}", s.join("\n- ")))
                .unwrap_or_default()
        );

        let transcript = match self.run_agent(&prompt, None, cancel_rx).await {
            Ok(t) => t,
            Err(step) => return Ok(step),
        };

        #[derive(Deserialize)]
        struct PlanOutput {
            plan: String,
        }
        let Ok(parsed) = serde_json::from_str::<PlanOutput>(transcript.trim()) else {
            return Ok(PhaseStep::Fail {
                error: "failed during plan: output is not {\"plan\": \"...\"}".into(),
                retryable: false,
            });
        };

        payload.plan = Some(parsed.plan.clone());
        self.save_payload(&job.id, &payload).await?;

        let planning_mode = payload.planning_mode.as_deref().unwrap_or("required");
        let approval = self
            .db
            .create_plan_approval(&job.id, &parsed.plan, planning_mode)
            .await?;

        if planning_mode == "skip" {
            // Gate auto-skipped; the approval row still records the plan.
            self.db
                .decide_approval(approval.id, ApprovalStatus::Skipped, None)
                .await?;
            info!(job_id = %job.id, approval_id = approval.id, "Plan approval skipped by policy");
        } else {
            info!(job_id = %job.id, approval_id = approval.id, "Plan ready for approval");
            self.events.publish(PipelineEvent::ApprovalRequested {
                job_id: job.id.clone(),
                approval_id: approval.id,
            });
        }

        Ok(PhaseStep::Advance)
    }

    async fn phase_approval_gate(&self, job: &Job) -> Result<PhaseStep, PipelineError> {
        let approval = self
            .db
            .latest_approval_for_job(&job.id)
            .await?
            .ok_or_else(|| PipelineError::MissingApproval(job.id.clone()))?;

        match approval.approval_status() {
            Some(ApprovalStatus::Approved | ApprovalStatus::Skipped) => Ok(PhaseStep::Advance),
            Some(ApprovalStatus::Rejected) => {
                let error = match approval.reviewer_notes {
                    Some(notes) => format!("plan rejected: {notes}"),
                    None => "plan rejected".to_string(),
                };
                Ok(PhaseStep::Fail {
                    error,
                    retryable: false,
                })
            }
            Some(ApprovalStatus::Pending) => {
                self.queue.block(&job.id, "approval pending").await?;
                Ok(PhaseStep::Suspend(DriveOutcome::AwaitingApproval))
            }
            None => Err(PipelineError::MissingApproval(job.id.clone())),
        }
    }

    async fn phase_execute(
        &self,
        job: &Job,
        worker_id: &str,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<PhaseStep, PipelineError> {
        let Some(card_id) = job.card_id.as_deref() else {
            return Ok(PhaseStep::Fail {
                error: "failed during execute: job has no card".into(),
                retryable: false,
            });
        };

        // Dependency gate: execute changes the card's visible status.
        let decision = self.graph.can_transition(card_id, "in_progress").await?;
        if !decision.allowed {
            warn!(
                job_id = %job.id,
                card_id,
                blocking = ?decision.blocking_card_ids,
                "Execute blocked by unmet dependencies"
            );
            self.queue
                .block(&job.id, "blocked by unmet dependencies")
                .await?;
            return Ok(PhaseStep::Suspend(DriveOutcome::DependencyBlocked(
                decision.blocking_card_ids,
            )));
        }

        let mut payload = parse_payload(&job.payload);
        let worktree = match self.bind_worktree(job, &mut payload, worker_id).await {
            Ok(wt) => wt,
            Err(e) => {
                return Ok(PhaseStep::Fail {
                    error: format!("failed during execute: {e}"),
                    retryable: false,
                });
            }
        };

        // Fold queued follow-ups into the prompt.
        self.db.adopt_follow_ups(card_id, &job.id).await?;
        let follow_ups = self.db.pending_follow_ups_for_job(&job.id).await?;
        let mut prompt = format!(
            "Implement the following card in the current repository checkout.\n\n\
             Card {card_id}:\n{}",
            payload.card.description
        );
        if let Some(plan) = &payload.plan {
            prompt.push_str(&format!("\n\nApproved plan:\n{plan}"));
        }
        if !follow_ups.is_empty() {
            prompt.push_str("\n\nAdditional instructions:");
            for fu in &follow_ups {
                prompt.push_str(&format!("\n- [{}] {}", fu.instruction_type, fu.content));
            }
        }

        let result = self
            .run_agent(&prompt, Some(Path::new(&worktree.path)), cancel_rx)
            .await;

        match result {
            Ok(_) => {
                for fu in &follow_ups {
                    self.db.mark_follow_up(fu.id, InstructionStatus::Applied).await?;
                }
                Ok(PhaseStep::Advance)
            }
            Err(step) => {
                if matches!(step, PhaseStep::Fail { .. }) {
                    for fu in &follow_ups {
                        self.db.mark_follow_up(fu.id, InstructionStatus::Rejected).await?;
                    }
                }
                Ok(step)
            }
        }
    }

    async fn phase_verify(
        &self,
        job: &Job,
        worker_id: &str,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<PhaseStep, PipelineError> {
        let mut payload = parse_payload(&job.payload);
        if payload.verify_commands.is_empty() {
            return Ok(PhaseStep::Advance);
        }

        let worktree = match self.bind_worktree(job, &mut payload, worker_id).await {
            Ok(wt) => wt,
            Err(e) => {
                return Ok(PhaseStep::Fail {
                    error: format!("failed during verify: {e}"),
                    retryable: false,
                });
            }
        };
        let dir = PathBuf::from(&worktree.path);

        for command in payload.verify_commands.clone() {
            let result = retry_with_backoff(
                &self.config.retry,
                |_e: &String| true,
                Some(cancel_rx.clone()),
                |attempt| {
                    let command = command.clone();
                    let dir = dir.clone();
                    async move {
                        debug!(command = %command, attempt, "Running verify command");
                        run_shell(&command, &dir).await
                    }
                },
            )
            .await;

            match result {
                Ok(()) => {}
                Err(RetryError::Cancelled) => return Ok(PhaseStep::Cancelled),
                Err(RetryError::Operation(e)) => {
                    return Ok(PhaseStep::Fail {
                        error: format!("failed during verify: {e}"),
                        retryable: true,
                    });
                }
            }
        }

        Ok(PhaseStep::Advance)
    }

    async fn phase_publish(
        &self,
        job: &Job,
        worker_id: &str,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<PhaseStep, PipelineError> {
        let mut payload = parse_payload(&job.payload);
        let worktree = match self.bind_worktree(job, &mut payload, worker_id).await {
            Ok(wt) => wt,
            Err(e) => {
                return Ok(PhaseStep::Fail {
                    error: format!("failed during publish: {e}"),
                    retryable: false,
                });
            }
        };

        // One token bucket per remote host.
        let bucket = self.publish_limiter.limiter(self.remote.host());
        loop {
            if CancelFlags::is_set(cancel_rx) {
                return Ok(PhaseStep::Cancelled);
            }
            let decision = bucket.try_consume(1);
            if decision.allowed {
                break;
            }
            let wait = decision.retry_after.unwrap_or(Duration::from_millis(100));
            debug!(job_id = %job.id, wait_ms = wait.as_millis(), "Publish rate limited, waiting");
            tokio::time::sleep(wait).await;
        }

        let card_id = job.card_id.clone().unwrap_or_else(|| job.id.clone());
        let request = ChangeRequest {
            card_id: card_id.clone(),
            branch: worktree.branch.clone(),
            base_ref: worktree.base_ref.clone(),
            title: format!("Card {card_id}"),
            body: payload.plan.clone().unwrap_or_default(),
        };

        let result = retry_with_backoff(
            &self.config.retry,
            |_e: &RemoteError| true,
            Some(cancel_rx.clone()),
            |_attempt| {
                let request = request.clone();
                async move { self.remote.create_or_update_change_request(request).await }
            },
        )
        .await;

        match result {
            Ok(outcome) => {
                info!(job_id = %job.id, url = %outcome.url, "Change request published");
                payload
                    .extra
                    .insert("change_request_url".into(), outcome.url.into());
                self.save_payload(&job.id, &payload).await?;
                Ok(PhaseStep::Advance)
            }
            Err(RetryError::Cancelled) => Ok(PhaseStep::Cancelled),
            Err(RetryError::Operation(e)) => Ok(PhaseStep::Fail {
                error: format!("failed during publish: {e}"),
                retryable: true,
            }),
        }
    }

    // =========================================================================
    // Terminal transitions
    // =========================================================================

    async fn finish_success(&self, job: &Job, worker_id: &str) -> Result<DriveOutcome, PipelineError> {
        let payload = parse_payload(&job.payload);
        self.release_worktree(&payload, worker_id).await;

        let result = serde_json::json!({
            "plan": payload.plan,
            "change_request_url": payload.extra.get("change_request_url"),
        });
        match self.queue.complete(&job.id, &result).await {
            Ok(_) => Ok(DriveOutcome::Completed),
            // Raced with a cancel; the terminal state already stands.
            Err(QueueError::Terminal(_)) => Ok(DriveOutcome::Canceled),
            Err(e) => Err(e.into()),
        }
    }

    async fn finish_failure(
        &self,
        job: &Job,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<DriveOutcome, PipelineError> {
        let payload = parse_payload(&job.payload);
        self.release_worktree(&payload, worker_id).await;

        match self.queue.fail(&job.id, error, retryable).await {
            Ok(_) => Ok(DriveOutcome::Failed(error.to_string())),
            Err(QueueError::Terminal(_)) => Ok(DriveOutcome::Canceled),
            Err(e) => Err(e.into()),
        }
    }

    async fn finish_cancel(&self, job: &Job, worker_id: &str) -> Result<DriveOutcome, PipelineError> {
        let payload = parse_payload(&job.payload);
        self.release_worktree(&payload, worker_id).await;

        match self.queue.cancel(&job.id).await {
            Ok(_) | Err(QueueError::Terminal(_)) => Ok(DriveOutcome::Canceled),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Control surface
    // =========================================================================

    /// Approve the pending plan for a job. Idempotent: a repeat call
    /// returns the recorded outcome without re-deciding.
    pub async fn approve_plan(
        &self,
        job_id: &str,
        reviewer_notes: Option<&str>,
    ) -> Result<ApprovalStatus, PipelineError> {
        self.decide(job_id, ApprovalStatus::Approved, reviewer_notes, true)
            .await
    }

    /// Reject the pending plan; the job fails without entering execute.
    pub async fn reject_plan(
        &self,
        job_id: &str,
        reviewer_notes: Option<&str>,
    ) -> Result<ApprovalStatus, PipelineError> {
        let status = self
            .decide(job_id, ApprovalStatus::Rejected, reviewer_notes, false)
            .await?;
        if status == ApprovalStatus::Rejected {
            let error = match reviewer_notes {
                Some(notes) => format!("plan rejected: {notes}"),
                None => "plan rejected".to_string(),
            };
            match self.queue.fail(job_id, &error, false).await {
                Ok(_) | Err(QueueError::Terminal(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(status)
    }

    /// Skip the approval gate for a job.
    pub async fn skip_approval(&self, job_id: &str) -> Result<ApprovalStatus, PipelineError> {
        self.decide(job_id, ApprovalStatus::Skipped, None, true).await
    }

    async fn decide(
        &self,
        job_id: &str,
        status: ApprovalStatus,
        reviewer_notes: Option<&str>,
        resume: bool,
    ) -> Result<ApprovalStatus, PipelineError> {
        let approval = self
            .db
            .latest_approval_for_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::MissingApproval(job_id.to_string()))?;

        let Some(decided) = self
            .db
            .decide_approval(approval.id, status, reviewer_notes)
            .await?
        else {
            // Already decided: report the recorded outcome.
            let recorded = approval.approval_status().ok_or_else(|| {
                PipelineError::InvalidState(format!("approval {} has unknown status", approval.id))
            })?;
            debug!(job_id, status = %recorded, "Approval already decided, no-op");
            return Ok(recorded);
        };

        info!(job_id, approval_id = decided.id, status = %status, "Plan approval decided");
        self.events.publish(PipelineEvent::ApprovalDecided {
            job_id: job_id.to_string(),
            approval_id: decided.id,
            status: status.to_string(),
        });

        if resume {
            // Wake the job if it is parked at the gate.
            match self.queue.unblock(job_id).await {
                Ok(_) | Err(QueueError::Terminal(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(status)
    }

    /// Cancel a job. Signals any in-flight agent process, cancels the
    /// queue record, and optionally rolls the worktree back to its base
    /// ref before releasing it.
    pub async fn cancel_job(&self, job_id: &str, rollback: bool) -> Result<(), PipelineError> {
        self.cancels.request(job_id);

        let job = self.db.get_job(job_id).await?;
        match self.queue.cancel(job_id).await {
            Ok(_) | Err(QueueError::Terminal(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let payload = parse_payload(&job.payload);
        if let Some(worktree_id) = &payload.worktree_id {
            if let Ok(wt) = self.worktrees.get(worktree_id).await {
                if rollback && Path::new(&wt.path).exists() {
                    if let Err(e) = run_shell(
                        &format!("git reset --hard {}", wt.base_ref),
                        Path::new(&wt.path),
                    )
                    .await
                    {
                        warn!(job_id, worktree_id, error = %e, "Rollback failed");
                    }
                }
                if let Some(holder) = &wt.locked_by {
                    let _ = self.worktrees.release(worktree_id, holder).await;
                }
                let _ = self.worktrees.request_cleanup(worktree_id).await;
            }
        }

        info!(job_id, rollback, "Job cancelled");
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Run the agent, classifying transient failures through the retry
    /// policy. Returns the phase step to take on failure.
    async fn run_agent(
        &self,
        prompt: &str,
        working_dir: Option<&Path>,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<String, PhaseStep> {
        let dir = working_dir.map_or_else(std::env::temp_dir, Path::to_path_buf);

        let result = retry_with_backoff(
            &self.config.retry,
            AgentError::is_transient,
            Some(cancel_rx.clone()),
            |_attempt| {
                let request = AgentRequest {
                    prompt: prompt.to_string(),
                    working_dir: dir.clone(),
                    timeout: self.config.agent_timeout,
                    cancel: Some(cancel_rx.clone()),
                };
                async move { self.runner.run(request).await }
            },
        )
        .await;

        match result {
            Ok(transcript) => Ok(transcript),
            Err(RetryError::Cancelled) | Err(RetryError::Operation(AgentError::Cancelled)) => {
                Err(PhaseStep::Cancelled)
            }
            Err(RetryError::Operation(e)) => {
                let retryable = e.is_transient();
                Err(PhaseStep::Fail {
                    error: format!("agent run failed: {e}"),
                    retryable,
                })
            }
        }
    }

    /// Acquire (or re-lock) the job's worktree and persist the binding.
    async fn bind_worktree(
        &self,
        job: &Job,
        payload: &mut JobPayload,
        worker_id: &str,
    ) -> Result<crate::storage::Worktree, PipelineError> {
        if let Some(id) = payload.worktree_id.clone() {
            match self.worktrees.renew_lock(&id, worker_id).await {
                Ok(wt) => return Ok(wt),
                // Lock stolen or record gone; fall through to acquire.
                Err(WorktreeError::Locked(_)) => payload.worktree_id = None,
                Err(e) => return Err(e.into()),
            }
        }

        let card_id = job
            .card_id
            .as_deref()
            .ok_or_else(|| PipelineError::InvalidState(format!("job {} has no card", job.id)))?;
        let repo_path = payload
            .repo_path
            .clone()
            .ok_or_else(|| PipelineError::InvalidState(format!("job {} has no repo_path", job.id)))?;

        let wt = self
            .worktrees
            .acquire(
                &job.project_id,
                card_id,
                &job.id,
                Path::new(&repo_path),
                &payload.base_ref,
                worker_id,
            )
            .await?;

        payload.worktree_id = Some(wt.id.clone());
        self.save_payload(&job.id, payload).await?;
        Ok(wt)
    }

    /// Unlock the job's worktree if this worker holds it. The checkout
    /// itself stays until the reclaim sweep runs post-terminal.
    async fn release_worktree(&self, payload: &JobPayload, worker_id: &str) {
        if let Some(id) = &payload.worktree_id {
            match self.worktrees.release(id, worker_id).await {
                Ok(()) | Err(WorktreeError::Locked(_)) => {}
                Err(e) => warn!(worktree_id = %id, error = %e, "Worktree release failed"),
            }
        }
    }

    async fn save_payload(&self, job_id: &str, payload: &JobPayload) -> Result<(), PipelineError> {
        let json = serde_json::to_string(payload)
            .map_err(|e| PipelineError::InvalidState(format!("payload serialization: {e}")))?;
        self.db.set_job_payload(job_id, &json).await?;
        Ok(())
    }
}

/// What a phase decided.
enum PhaseStep {
    Advance,
    Suspend(DriveOutcome),
    Fail { error: String, retryable: bool },
    Cancelled,
}

fn parse_payload(raw: &str) -> JobPayload {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Run a shell command, mapping non-zero exit to a descriptive error.
async fn run_shell(command: &str, dir: &Path) -> Result<(), String> {
    let output = tokio::process::Command::new("sh")
        .args(["-c", command])
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| format!("`{command}` could not be spawned: {e}"))?;

    if output.status.success() {
        Ok(())
    } else {
        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!("`{command}` exited {code}: {}", stderr.trim()))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::pipeline::policy::NeverDecompose;
    use crate::pipeline::runner::LoggingRemote;
    use crate::queue::QueueConfig;
    use crate::worktree::WorktreeConfig;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted runner: pops the next canned transcript per call.
    struct ScriptedRunner {
        outputs: Mutex<Vec<Result<String, AgentError>>>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<Result<String, AgentError>>) -> Self {
            Self {
                outputs: Mutex::new(outputs),
            }
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        async fn run(&self, _request: AgentRequest) -> Result<String, AgentError> {
            let mut outputs = self.outputs.lock().unwrap();
            if outputs.is_empty() {
                Ok(String::new())
            } else {
                outputs.remove(0)
            }
        }
    }

    struct Fixture {
        driver: PipelineDriver,
        queue: JobQueue,
        db: Database,
        _root: tempfile::TempDir,
        repo: tempfile::TempDir,
    }

    async fn fixture(outputs: Vec<Result<String, AgentError>>) -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let events = EventBus::new();
        let queue = JobQueue::new(db.clone(), events.clone(), QueueConfig::default());
        let graph = DependencyGraph::new(db.clone());
        let root = tempfile::tempdir().unwrap();
        let worktrees = WorktreeManager::new(
            db.clone(),
            WorktreeConfig {
                root: root.path().to_path_buf(),
                lock_ttl: Duration::from_secs(60),
            },
        );
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());

        let config = PipelineConfig {
            retry: RetryPolicy {
                max_retries: 0,
                ..RetryPolicy::default()
            },
            ..PipelineConfig::default()
        };
        let driver = PipelineDriver::new(
            db.clone(),
            queue.clone(),
            graph,
            worktrees,
            Arc::new(ScriptedRunner::new(outputs)),
            Arc::new(LoggingRemote::new("example.com".into())),
            Arc::new(NeverDecompose),
            events,
            config,
        );

        Fixture {
            driver,
            queue,
            db,
            _root: root,
            repo,
        }
    }

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test"],
            vec!["config", "user.name", "test"],
            vec!["commit", "--allow-empty", "-m", "init"],
        ] {
            let out = std::process::Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .unwrap();
            assert!(out.status.success());
        }
    }

    async fn enqueue_and_claim(fix: &Fixture, card: &str) -> Job {
        let payload = json!({
            "card": {"description": "implement the widget", "checklist_items": 1},
            "repo_path": fix.repo.path().to_str().unwrap(),
            "base_ref": "HEAD",
        });
        let job = fix
            .queue
            .enqueue("proj", Some(card), "worker-run", &payload)
            .await
            .unwrap();
        fix.queue.claim("w-1").await.unwrap().unwrap();
        job
    }

    #[tokio::test]
    async fn pipeline_suspends_at_approval_gate() {
        let fix = fixture(vec![Ok(r#"{"plan": "1. do it"}"#.to_string())]).await;
        let job = enqueue_and_claim(&fix, "card-1").await;

        let outcome = fix.driver.drive(&job.id, "w-1").await.unwrap();
        assert_eq!(outcome, DriveOutcome::AwaitingApproval);

        let row = fix.db.get_job(&job.id).await.unwrap();
        assert_eq!(row.state, "blocked");
        assert_eq!(row.phase, "approval_gate");

        let approval = fix.db.latest_approval_for_job(&job.id).await.unwrap().unwrap();
        assert_eq!(approval.status, "pending");
        assert_eq!(approval.plan, "1. do it");
    }

    #[tokio::test]
    async fn approve_resumes_to_success() {
        let fix = fixture(vec![
            Ok(r#"{"plan": "1. do it"}"#.to_string()),
            Ok("done".to_string()),
        ])
        .await;
        let job = enqueue_and_claim(&fix, "card-1").await;

        fix.driver.drive(&job.id, "w-1").await.unwrap();
        let status = fix.driver.approve_plan(&job.id, Some("lgtm")).await.unwrap();
        assert_eq!(status, ApprovalStatus::Approved);

        // Duplicate approval is a no-op reporting the recorded outcome.
        let again = fix.driver.approve_plan(&job.id, None).await.unwrap();
        assert_eq!(again, ApprovalStatus::Approved);

        fix.queue.claim("w-1").await.unwrap().unwrap();
        let outcome = fix.driver.drive(&job.id, "w-1").await.unwrap();
        assert_eq!(outcome, DriveOutcome::Completed);

        let row = fix.db.get_job(&job.id).await.unwrap();
        assert_eq!(row.state, "succeeded");
        assert_eq!(row.phase, "done");
    }

    #[tokio::test]
    async fn reject_fails_without_entering_execute() {
        let fix = fixture(vec![Ok(r#"{"plan": "1. do it"}"#.to_string())]).await;
        let job = enqueue_and_claim(&fix, "card-1").await;

        fix.driver.drive(&job.id, "w-1").await.unwrap();
        let status = fix.driver.reject_plan(&job.id, Some("too vague")).await.unwrap();
        assert_eq!(status, ApprovalStatus::Rejected);

        let row = fix.db.get_job(&job.id).await.unwrap();
        assert_eq!(row.state, "failed");
        assert!(row.last_error.unwrap().contains("too vague"));
        // Never advanced past the gate.
        assert_eq!(row.phase, "approval_gate");
    }

    #[tokio::test]
    async fn skip_mode_bypasses_gate() {
        let fix = fixture(vec![
            Ok(r#"{"plan": "1. do it"}"#.to_string()),
            Ok("done".to_string()),
        ])
        .await;
        let payload = json!({
            "card": {"description": "widget"},
            "repo_path": fix.repo.path().to_str().unwrap(),
            "base_ref": "HEAD",
            "planning_mode": "skip",
        });
        let job = fix
            .queue
            .enqueue("proj", Some("card-1"), "worker-run", &payload)
            .await
            .unwrap();
        fix.queue.claim("w-1").await.unwrap().unwrap();

        let outcome = fix.driver.drive(&job.id, "w-1").await.unwrap();
        assert_eq!(outcome, DriveOutcome::Completed);

        let approval = fix.db.latest_approval_for_job(&job.id).await.unwrap().unwrap();
        assert_eq!(approval.status, "skipped");
    }

    #[tokio::test]
    async fn malformed_plan_output_is_permanent_failure() {
        let fix = fixture(vec![Ok("sure, here's a plan!".to_string())]).await;
        let job = enqueue_and_claim(&fix, "card-1").await;

        let outcome = fix.driver.drive(&job.id, "w-1").await.unwrap();
        assert!(matches!(outcome, DriveOutcome::Failed(_)));

        let row = fix.db.get_job(&job.id).await.unwrap();
        assert_eq!(row.state, "failed");
        assert!(row.last_error.unwrap().contains("failed during plan"));
    }

    #[tokio::test]
    async fn unmet_dependency_blocks_execute() {
        let fix = fixture(vec![
            Ok(r#"{"plan": "1. do it"}"#.to_string()),
        ])
        .await;
        let graph = DependencyGraph::new(fix.db.clone());
        graph
            .add_dependency("card-1", "card-0", "done", &["in_progress"])
            .await
            .unwrap();

        let job = enqueue_and_claim(&fix, "card-1").await;
        fix.driver.drive(&job.id, "w-1").await.unwrap();
        fix.driver.skip_approval(&job.id).await.unwrap();

        fix.queue.claim("w-1").await.unwrap().unwrap();
        let outcome = fix.driver.drive(&job.id, "w-1").await.unwrap();
        assert_eq!(
            outcome,
            DriveOutcome::DependencyBlocked(vec!["card-0".to_string()])
        );
        assert_eq!(fix.db.get_job(&job.id).await.unwrap().state, "blocked");

        // Dependency satisfied: the job resumes and completes.
        fix.db.set_card_status("card-0", "done").await.unwrap();
        fix.queue.unblock(&job.id).await.unwrap();
        fix.queue.claim("w-1").await.unwrap().unwrap();
        let outcome = fix.driver.drive(&job.id, "w-1").await.unwrap();
        assert_eq!(outcome, DriveOutcome::Completed);
    }

    #[tokio::test]
    async fn verify_failure_names_phase_and_command() {
        let fix = fixture(vec![
            Ok(r#"{"plan": "1. do it"}"#.to_string()),
            Ok("done".to_string()),
        ])
        .await;
        let payload = json!({
            "card": {"description": "widget"},
            "repo_path": fix.repo.path().to_str().unwrap(),
            "base_ref": "HEAD",
            "planning_mode": "skip",
            "verify_commands": ["false"],
        });
        let job = fix
            .queue
            .enqueue("proj", Some("card-1"), "worker-run", &payload)
            .await
            .unwrap();
        fix.queue.claim("w-1").await.unwrap().unwrap();

        let outcome = fix.driver.drive(&job.id, "w-1").await.unwrap();
        assert!(matches!(outcome, DriveOutcome::Failed(_)));

        // Retryable: requeued, not yet terminal.
        let row = fix.db.get_job(&job.id).await.unwrap();
        assert_eq!(row.state, "queued");
        assert!(row.last_error.unwrap().contains("failed during verify: `false` exited 1"));
    }

    #[tokio::test]
    async fn execute_folds_follow_ups_and_marks_applied() {
        struct CapturingRunner {
            prompts: Mutex<Vec<String>>,
        }
        #[async_trait]
        impl AgentRunner for CapturingRunner {
            async fn run(&self, request: AgentRequest) -> Result<String, AgentError> {
                self.prompts.lock().unwrap().push(request.prompt.clone());
                if request.prompt.contains("implementation plan") {
                    Ok(r#"{"plan": "1. do it"}"#.to_string())
                } else {
                    Ok("done".to_string())
                }
            }
        }

        let fix = fixture(vec![]).await;
        let runner = Arc::new(CapturingRunner {
            prompts: Mutex::new(Vec::new()),
        });
        let driver = PipelineDriver {
            runner: Arc::clone(&runner) as Arc<dyn AgentRunner>,
            ..fix.driver
        };

        fix.db
            .create_follow_up(None, Some("card-1"), "correction", "use the new API", 5)
            .await
            .unwrap();

        let payload = json!({
            "card": {"description": "widget"},
            "repo_path": fix.repo.path().to_str().unwrap(),
            "base_ref": "HEAD",
            "planning_mode": "skip",
        });
        let job = fix
            .queue
            .enqueue("proj", Some("card-1"), "worker-run", &payload)
            .await
            .unwrap();
        fix.queue.claim("w-1").await.unwrap().unwrap();

        let outcome = driver.drive(&job.id, "w-1").await.unwrap();
        assert_eq!(outcome, DriveOutcome::Completed);

        let prompts = runner.prompts.lock().unwrap();
        let execute_prompt = prompts.iter().find(|p| p.contains("Implement")).unwrap();
        assert!(execute_prompt.contains("use the new API"));
        drop(prompts);

        assert!(fix
            .db
            .pending_follow_ups_for_job(&job.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn cancel_job_releases_and_flags_cleanup() {
        let fix = fixture(vec![Ok(r#"{"plan": "1. do it"}"#.to_string())]).await;
        let job = enqueue_and_claim(&fix, "card-1").await;

        fix.driver.drive(&job.id, "w-1").await.unwrap();
        fix.driver.cancel_job(&job.id, false).await.unwrap();

        let row = fix.db.get_job(&job.id).await.unwrap();
        assert_eq!(row.state, "canceled");

        // Approving after cancel decides the approval but cannot revive
        // the job.
        fix.driver.approve_plan(&job.id, None).await.unwrap();
        assert_eq!(fix.db.get_job(&job.id).await.unwrap().state, "canceled");
    }
}
