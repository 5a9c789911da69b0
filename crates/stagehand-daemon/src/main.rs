//! Stagehand Daemon
//!
//! The daemon claims card jobs from the SQLite-backed queue and drives
//! them through the agent pipeline inside per-card git worktrees.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use stagehand_daemon::events::EventBus;
use stagehand_daemon::graph::DependencyGraph;
use stagehand_daemon::pipeline::{
    LoggingRemote, PipelineConfig, PipelineDriver, ProcessAgentRunner, ThresholdPolicy,
};
use stagehand_daemon::queue::{JobQueue, QueueConfig};
use stagehand_daemon::storage::Database;
use stagehand_daemon::worker::{WorkerConfig, WorkerPool};
use stagehand_daemon::worktree::{WorktreeConfig, WorktreeManager};

#[derive(Parser, Debug)]
#[command(name = "stagehand-daemon")]
#[command(version, about = "Stagehand daemon - card pipeline orchestrator")]
struct Args {
    /// Database file path
    #[arg(long, env = "STAGEHAND_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Base directory for git worktrees
    #[arg(long, env = "STAGEHAND_WORKTREE_ROOT")]
    worktree_root: Option<PathBuf>,

    /// Maximum concurrently driven jobs per project
    #[arg(long, default_value_t = 4, env = "STAGEHAND_MAX_WORKERS")]
    max_workers: usize,

    /// Job lease TTL in seconds
    #[arg(long, default_value_t = 30, env = "STAGEHAND_LEASE_SECS")]
    lease_secs: u64,

    /// Lease renewal cadence in seconds; must be under the lease TTL
    #[arg(long, default_value_t = 10, env = "STAGEHAND_LEASE_RENEW_SECS")]
    lease_renew_secs: u64,

    /// Retry ceiling: claims per job before it fails terminally
    #[arg(long, default_value_t = 3, env = "STAGEHAND_MAX_ATTEMPTS")]
    max_attempts: i64,

    /// Wall-clock budget for one job's whole pipeline, in seconds
    #[arg(long, default_value_t = 14_400, env = "STAGEHAND_PIPELINE_TIMEOUT_SECS")]
    pipeline_timeout_secs: u64,

    /// Per-invocation agent timeout, in seconds
    #[arg(long, default_value_t = 600, env = "STAGEHAND_AGENT_TIMEOUT_SECS")]
    agent_timeout_secs: u64,

    /// Path to the agent CLI binary
    #[arg(long, default_value = "agent", env = "STAGEHAND_AGENT_BIN")]
    agent_bin: PathBuf,

    /// Seconds to wait for graceful agent shutdown before SIGKILL
    #[arg(long, default_value_t = 5, env = "STAGEHAND_TERMINATE_TIMEOUT")]
    terminate_timeout: u64,

    /// Scheduler tick interval in seconds
    #[arg(long, default_value_t = 2, env = "STAGEHAND_TICK_INTERVAL_SECS")]
    tick_interval_secs: u64,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn")
    #[arg(long, default_value = "info", env = "STAGEHAND_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation)
    #[arg(long, env = "STAGEHAND_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("stagehand_daemon={}", args.log_level);
    stagehand_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        max_workers = args.max_workers,
        lease_secs = args.lease_secs,
        "Starting stagehand-daemon"
    );

    let db = if let Some(path) = &args.db_path {
        info!(path = %path.display(), "Opening database");
        Database::open(path).await?
    } else {
        let default_path = default_db_path()?;
        info!(path = %default_path.display(), "Opening database (default path)");
        Database::open(&default_path).await?
    };

    let worktree_root = match args.worktree_root {
        Some(dir) => dir,
        None => default_worktree_root()?,
    };

    let events = EventBus::new();
    let queue = JobQueue::new(
        db.clone(),
        events.clone(),
        QueueConfig {
            lease_ttl: Duration::from_secs(args.lease_secs),
            max_attempts: args.max_attempts,
            pipeline_timeout: Duration::from_secs(args.pipeline_timeout_secs),
        },
    );
    let graph = DependencyGraph::new(db.clone());
    let worktrees = WorktreeManager::new(
        db.clone(),
        WorktreeConfig {
            root: worktree_root,
            lock_ttl: Duration::from_secs(args.lease_secs),
        },
    );

    let runner = ProcessAgentRunner::new(args.agent_bin)
        .with_grace_period(Duration::from_secs(args.terminate_timeout));
    let driver = Arc::new(PipelineDriver::new(
        db.clone(),
        queue.clone(),
        graph,
        worktrees.clone(),
        Arc::new(runner),
        Arc::new(LoggingRemote::new("local".to_string())),
        Arc::new(ThresholdPolicy::default()),
        events.clone(),
        PipelineConfig {
            agent_timeout: Duration::from_secs(args.agent_timeout_secs),
            ..PipelineConfig::default()
        },
    ));

    let pool = Arc::new(WorkerPool::new(
        queue,
        driver,
        worktrees,
        events,
        WorkerConfig {
            max_workers: args.max_workers,
            tick_interval: Duration::from_secs(args.tick_interval_secs),
            lease_renew_interval: Duration::from_secs(args.lease_renew_secs),
        },
    ));

    // Released in reverse registration order: in-flight drives (and their
    // agent subprocesses) are drained before the database closes.
    let registry = stagehand_core::sync::ResourceRegistry::new();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    {
        let db = db.clone();
        registry.register("database", move || async move {
            db.pool().close().await;
        });
    }
    {
        let pool = Arc::clone(&pool);
        registry.register("worker tasks", move || async move {
            pool.drain().await;
        });
    }

    let pool_handle = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run(shutdown_rx).await }
    });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = pool_handle.await;
    registry.release_all().await;

    info!("Daemon stopped");
    Ok(())
}

/// Default database path: ~/.stagehand/daemon.db
fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".stagehand").join("daemon.db"))
}

/// Default worktree base directory: ~/.stagehand/worktrees/
fn default_worktree_root() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".stagehand").join("worktrees"))
}
