//! Worker pool: claims jobs from the queue and drives them through the
//! pipeline under a per-project concurrency cap.
//!
//! Each project gets its own semaphore of `max_workers` slots, so one
//! project's in-flight jobs can never starve another project's queue. A
//! claimed job whose project has no free slot is returned to the queue
//! unworked and its project excluded for the rest of the tick.
//!
//! Each dispatched job runs in a tracked task holding its project permit.
//! A sidecar task renews the queue lease at a fraction of its TTL; if a
//! renewal is refused the job now belongs to another worker and the drive
//! is abandoned mid-flight without touching job state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use stagehand_core::sync::{KeyedLimiter, PrioritySemaphore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, PipelineEvent};
use crate::pipeline::PipelineDriver;
use crate::queue::{JobQueue, QueueError};
use crate::storage::Job;
use crate::worktree::WorktreeManager;

/// Default per-project concurrency cap when the configured value is zero.
const DEFAULT_MAX_WORKERS: usize = 4;

/// Worker pool tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrently driven jobs per project.
    pub max_workers: usize,
    /// Scheduler tick: claim attempts and maintenance sweeps.
    pub tick_interval: Duration,
    /// Lease renewal cadence; must be well under the queue lease TTL.
    pub lease_renew_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            tick_interval: Duration::from_secs(2),
            lease_renew_interval: Duration::from_secs(10),
        }
    }
}

/// Claims and drives jobs under a per-project concurrency cap.
pub struct WorkerPool {
    queue: JobQueue,
    driver: Arc<PipelineDriver>,
    worktrees: WorktreeManager,
    events: EventBus,
    config: WorkerConfig,
    /// One semaphore per project, created on first sight.
    slots: KeyedLimiter<PrioritySemaphore>,
    /// In-flight drive tasks; drained on shutdown so no agent process
    /// outlives the pool.
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    pool_id: String,
    seq: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        queue: JobQueue,
        driver: Arc<PipelineDriver>,
        worktrees: WorktreeManager,
        events: EventBus,
        config: WorkerConfig,
    ) -> Self {
        let max_workers = if config.max_workers == 0 {
            DEFAULT_MAX_WORKERS
        } else {
            config.max_workers
        };

        info!(max_workers, "Worker pool created");

        Self {
            queue,
            driver,
            worktrees,
            events,
            config: WorkerConfig {
                max_workers,
                ..config
            },
            slots: KeyedLimiter::new(move || PrioritySemaphore::new(max_workers)),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            pool_id: uuid::Uuid::new_v4().to_string(),
            seq: AtomicU64::new(0),
        }
    }

    /// Run the scheduler until `shutdown` flips, then drain in-flight
    /// drives so no agent process outlives the pool. Abandoned jobs'
    /// leases expire and the sweep requeues them.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(pool_id = %self.pool_id, "Worker pool started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(self.config.tick_interval) => {
                    self.tick().await;
                    self.maintenance().await;
                }
            }
        }
        self.drain().await;
        info!(pool_id = %self.pool_id, "Worker pool stopped");
    }

    /// One scheduler pass: claim jobs while slots and work remain. A job
    /// whose project is saturated is released back to the queue and its
    /// project skipped for the rest of this pass. Returns the number of
    /// jobs dispatched.
    pub async fn tick(&self) -> usize {
        let mut dispatched = 0;
        let mut saturated: Vec<String> = Vec::new();

        loop {
            let worker_id = format!(
                "{}-{}",
                self.pool_id,
                self.seq.fetch_add(1, Ordering::Relaxed)
            );

            match self.queue.claim_excluding(&worker_id, &saturated).await {
                Ok(Some(job)) => {
                    let Some(permit) = self.slots.limiter(&job.project_id).try_acquire() else {
                        debug!(
                            job_id = %job.id,
                            project_id = %job.project_id,
                            "Project slots full, releasing claim"
                        );
                        if let Err(e) = self.queue.release_claim(&job.id).await {
                            warn!(job_id = %job.id, error = %e, "Claim release failed");
                        }
                        saturated.push(job.project_id.clone());
                        continue;
                    };

                    dispatched += 1;
                    let queue = self.queue.clone();
                    let driver = Arc::clone(&self.driver);
                    let events = self.events.clone();
                    let renew = self.config.lease_renew_interval;
                    let handle = tokio::spawn(async move {
                        let _permit = permit;
                        run_job(&queue, &driver, &events, &job, &worker_id, renew).await;
                    });

                    let mut tasks = self.tasks.lock().await;
                    tasks.retain(|t| !t.is_finished());
                    tasks.push(handle);
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Claim failed");
                    break;
                }
            }
        }
        dispatched
    }

    /// Queue and worktree housekeeping: requeue expired leases, cancel
    /// timed-out pipelines, remove reclaimable checkouts.
    pub async fn maintenance(&self) {
        match self.queue.sweep().await {
            Ok((requeued, timed_out)) if requeued > 0 || timed_out > 0 => {
                info!(requeued, timed_out, "Queue sweep");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Queue sweep failed"),
        }
        match self.worktrees.reclaim().await {
            Ok(removed) if removed > 0 => info!(removed, "Worktree reclaim"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Worktree reclaim failed"),
        }
    }

    /// Abort and await every in-flight drive task. Aborting a drive drops
    /// its agent child (spawned with `kill_on_drop`) and its renewal
    /// sidecar, so nothing keeps running or writing after this returns.
    pub async fn drain(&self) {
        let tasks = {
            let mut tasks = self.tasks.lock().await;
            std::mem::take(&mut *tasks)
        };

        let count = tasks.len();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        if count > 0 {
            info!(count, "In-flight drives drained");
        }
    }

    /// Free worker slots for a project.
    pub fn available_slots(&self, project_id: &str) -> usize {
        self.slots.limiter(project_id).available_permits()
    }

    pub const fn max_workers(&self) -> usize {
        self.config.max_workers
    }
}

/// Drive one claimed job with a lease-renewal sidecar.
async fn run_job(
    queue: &JobQueue,
    driver: &PipelineDriver,
    events: &EventBus,
    job: &Job,
    worker_id: &str,
    renew_interval: Duration,
) {
    let (lost_tx, mut lost_rx) = watch::channel(false);
    // Abort-on-drop so the sidecar dies with this task even when the
    // drive is aborted mid-flight.
    let _renewal = AbortOnDrop(tokio::spawn(renew_lease_loop(
        queue.clone(),
        job.id.clone(),
        worker_id.to_string(),
        renew_interval,
        lost_tx,
    )));

    tokio::select! {
        outcome = driver.drive(&job.id, worker_id) => {
            match outcome {
                Ok(outcome) => {
                    debug!(job_id = %job.id, worker_id, ?outcome, "Drive finished");
                }
                Err(e) => {
                    error!(job_id = %job.id, worker_id, error = %e, "Drive errored");
                    // Infrastructure error, not a job failure; the lease
                    // expires and the sweep requeues the job.
                }
            }
        }
        _ = lost_rx.changed() => {
            warn!(job_id = %job.id, worker_id, "Lease lost, abandoning job");
            events.publish(PipelineEvent::LeaseLost {
                job_id: job.id.clone(),
                worker_id: worker_id.to_string(),
            });
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn renew_lease_loop(
    queue: JobQueue,
    job_id: String,
    worker_id: String,
    interval: Duration,
    lost_tx: watch::Sender<bool>,
) {
    loop {
        tokio::time::sleep(interval).await;
        match queue.renew_lease(&job_id, &worker_id).await {
            Ok(_) => debug!(job_id = %job_id, worker_id = %worker_id, "Lease renewed"),
            // The job left `running` (blocked, terminal) or was claimed
            // elsewhere; either way this worker must not keep renewing.
            Err(QueueError::LeaseLost { .. }) => {
                let _ = lost_tx.send(true);
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Lease renewal errored");
            }
        }
    }
}
