//! Job queue with lease-based claiming.
//!
//! Workers claim jobs through a single atomic UPDATE, hold a renewable
//! lease while running them, and lose the job back to the queue when the
//! lease expires. Terminal states are immutable.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{EventBus, PipelineEvent};
use crate::storage::{Database, DatabaseError, Job, JobState};

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid job: {0}")]
    Invalid(String),

    #[error("Lease lost for job {job_id} (worker {worker_id})")]
    LeaseLost { job_id: String, worker_id: String },

    #[error("Job {0} is in a terminal state")]
    Terminal(String),
}

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Lease duration granted on claim and renewal.
    pub lease_ttl: Duration,
    /// Attempts after which a job fails permanently.
    pub max_attempts: i64,
    /// Wall-clock ceiling from enqueue to terminal state.
    pub pipeline_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            max_attempts: 3,
            pipeline_timeout: Duration::from_secs(4 * 3600),
        }
    }
}

/// Point-in-time queue health report.
#[derive(Debug, Clone)]
pub struct QueueHealth {
    pub queued: i64,
    pub running: i64,
    pub oldest_queued_age_secs: Option<i64>,
}

/// Lease-protocol job queue backed by the database.
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    events: EventBus,
    config: QueueConfig,
}

impl JobQueue {
    pub const fn new(db: Database, events: EventBus, config: QueueConfig) -> Self {
        Self { db, events, config }
    }

    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue a new job.
    pub async fn enqueue(
        &self,
        project_id: &str,
        card_id: Option<&str>,
        job_type: &str,
        payload: &serde_json::Value,
    ) -> Result<Job, QueueError> {
        if project_id.is_empty() {
            return Err(QueueError::Invalid("project id cannot be empty".into()));
        }
        if job_type.is_empty() {
            return Err(QueueError::Invalid("job type cannot be empty".into()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let payload = payload.to_string();
        let job = self
            .db
            .create_job(&id, project_id, card_id, job_type, &payload)
            .await?;

        info!(job_id = %job.id, project_id, job_type, "Job enqueued");
        self.events.publish(PipelineEvent::JobEnqueued {
            job_id: job.id.clone(),
            project_id: project_id.to_string(),
        });

        Ok(job)
    }

    /// Claim the next eligible job for a worker. Jobs that come back over
    /// the retry ceiling are failed in place and the claim moves on.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        self.claim_excluding(worker_id, &[]).await
    }

    /// Like [`claim`](Self::claim), skipping jobs whose project is in
    /// `excluded_projects` (all worker slots taken).
    pub async fn claim_excluding(
        &self,
        worker_id: &str,
        excluded_projects: &[String],
    ) -> Result<Option<Job>, QueueError> {
        let lease_ms = lease_ms(self.config.lease_ttl);

        loop {
            let Some(job) = self
                .db
                .claim_next_job(worker_id, lease_ms, excluded_projects)
                .await?
            else {
                return Ok(None);
            };

            if job.attempts > self.config.max_attempts {
                let error = match &job.last_error {
                    Some(prev) => format!("retry ceiling reached: {prev}"),
                    None => "retry ceiling reached".to_string(),
                };
                warn!(job_id = %job.id, attempts = job.attempts, "Retry ceiling reached, failing job");
                self.db
                    .finish_job(&job.id, JobState::Failed, None, Some(&error))
                    .await?;
                self.events.publish(PipelineEvent::JobFailed {
                    job_id: job.id.clone(),
                    error,
                });
                continue;
            }

            info!(job_id = %job.id, worker_id, attempt = job.attempts, "Job claimed");
            self.events.publish(PipelineEvent::JobClaimed {
                job_id: job.id.clone(),
                worker_id: worker_id.to_string(),
                attempt: job.attempts,
            });

            return Ok(Some(job));
        }
    }

    /// Renew the lease on a claimed job.
    pub async fn renew_lease(&self, job_id: &str, worker_id: &str) -> Result<Job, QueueError> {
        let lease_ms = lease_ms(self.config.lease_ttl);

        match self.db.renew_lease(job_id, worker_id, lease_ms).await? {
            Some(job) => Ok(job),
            None => {
                warn!(job_id, worker_id, "Lease renewal failed, lease lost");
                self.events.publish(PipelineEvent::LeaseLost {
                    job_id: job_id.to_string(),
                    worker_id: worker_id.to_string(),
                });
                Err(QueueError::LeaseLost {
                    job_id: job_id.to_string(),
                    worker_id: worker_id.to_string(),
                })
            }
        }
    }

    /// Mark a job succeeded with its result payload.
    pub async fn complete(&self, job_id: &str, result: &serde_json::Value) -> Result<Job, QueueError> {
        let result = result.to_string();
        let job = self
            .db
            .finish_job(job_id, JobState::Succeeded, Some(&result), None)
            .await?
            .ok_or_else(|| QueueError::Terminal(job_id.to_string()))?;

        info!(job_id, "Job succeeded");
        self.events.publish(PipelineEvent::JobSucceeded {
            job_id: job_id.to_string(),
        });
        Ok(job)
    }

    /// Record a failure. Retryable failures under the attempt ceiling go
    /// back to the queue; everything else is terminal.
    pub async fn fail(&self, job_id: &str, error: &str, retryable: bool) -> Result<Job, QueueError> {
        let job = self.db.get_job(job_id).await?;

        if retryable && job.attempts < self.config.max_attempts {
            self.db.record_job_error(job_id, error).await?;
            let requeued = self
                .db
                .requeue_job(job_id)
                .await?
                .ok_or_else(|| QueueError::Terminal(job_id.to_string()))?;
            info!(job_id, attempts = requeued.attempts, error, "Job requeued after failure");
            return Ok(requeued);
        }

        let error = if retryable {
            format!("retry ceiling reached: {error}")
        } else {
            error.to_string()
        };
        let job = self
            .db
            .finish_job(job_id, JobState::Failed, None, Some(&error))
            .await?
            .ok_or_else(|| QueueError::Terminal(job_id.to_string()))?;

        warn!(job_id, error = %error, "Job failed");
        self.events.publish(PipelineEvent::JobFailed {
            job_id: job_id.to_string(),
            error,
        });
        Ok(job)
    }

    /// Cancel a non-terminal job.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, QueueError> {
        let job = self
            .db
            .finish_job(job_id, JobState::Canceled, None, None)
            .await?
            .ok_or_else(|| QueueError::Terminal(job_id.to_string()))?;

        info!(job_id, "Job canceled");
        self.events.publish(PipelineEvent::JobCanceled {
            job_id: job_id.to_string(),
        });
        Ok(job)
    }

    /// Park a job in `blocked` (approval pending, dependency unmet).
    /// Suspension is not a failed attempt, so the claim is refunded.
    pub async fn block(&self, job_id: &str, reason: &str) -> Result<Job, QueueError> {
        let job = self
            .db
            .finish_job(job_id, JobState::Blocked, None, Some(reason))
            .await?
            .ok_or_else(|| QueueError::Terminal(job_id.to_string()))?;
        self.db.refund_job_attempt(job_id).await?;

        info!(job_id, reason, "Job blocked");
        Ok(job)
    }

    /// Move a blocked job back into the queue.
    pub async fn unblock(&self, job_id: &str) -> Result<Job, QueueError> {
        self.db
            .requeue_job(job_id)
            .await?
            .ok_or_else(|| QueueError::Terminal(job_id.to_string()))
    }

    /// Return a claimed job to the queue unworked, refunding the attempt
    /// (used when the job's project has no worker slot free).
    pub async fn release_claim(&self, job_id: &str) -> Result<Job, QueueError> {
        let job = self
            .db
            .requeue_job(job_id)
            .await?
            .ok_or_else(|| QueueError::Terminal(job_id.to_string()))?;
        self.db.refund_job_attempt(job_id).await?;

        debug!(job_id, "Claim released unworked");
        Ok(job)
    }

    /// Periodic sweep: requeue expired leases, cancel jobs over the
    /// pipeline timeout. Returns (requeued, timed out) counts.
    pub async fn sweep(&self) -> Result<(usize, usize), QueueError> {
        let requeued = self.db.requeue_expired_leases().await?;
        for job in &requeued {
            warn!(job_id = %job.id, "Lease expired, job requeued");
            if let Some(worker_id) = &job.worker_id {
                self.events.publish(PipelineEvent::LeaseLost {
                    job_id: job.id.clone(),
                    worker_id: worker_id.clone(),
                });
            }
        }

        #[allow(clippy::cast_possible_wrap)]
        let cutoff = stagehand_core::db::unix_timestamp()
            - self.config.pipeline_timeout.as_secs() as i64;
        let overdue = self.db.list_overdue_jobs(cutoff).await?;
        let mut timed_out = 0;
        for job in overdue {
            if self
                .db
                .finish_job(
                    &job.id,
                    JobState::Canceled,
                    None,
                    Some("pipeline timeout exceeded"),
                )
                .await?
                .is_some()
            {
                warn!(job_id = %job.id, "Pipeline timeout exceeded, job canceled");
                self.events.publish(PipelineEvent::JobCanceled {
                    job_id: job.id.clone(),
                });
                timed_out += 1;
            }
        }

        Ok((requeued.len(), timed_out))
    }

    /// Per-state job counts.
    pub async fn stats(&self) -> Result<HashMap<String, i64>, QueueError> {
        Ok(self.db.count_jobs_by_state().await?.into_iter().collect())
    }

    /// Queue depth and staleness summary.
    pub async fn health(&self) -> Result<QueueHealth, QueueError> {
        let counts = self.stats().await?;
        let oldest = self.db.oldest_queued_at().await?;
        let now = stagehand_core::db::unix_timestamp();

        Ok(QueueHealth {
            queued: counts.get("queued").copied().unwrap_or(0),
            running: counts.get("running").copied().unwrap_or(0),
            oldest_queued_age_secs: oldest.map(|at| (now - at).max(0)),
        })
    }
}

#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn lease_ms(ttl: Duration) -> i64 {
    ttl.as_millis() as i64
}
