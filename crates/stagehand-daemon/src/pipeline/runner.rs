//! Collaborator seams for the pipeline: the agent runner that executes
//! prompts, and the remote repository that receives published changes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Grace period after SIGTERM before SIGKILL.
const GRACE_PERIOD_SECS: u64 = 5;

/// Errors from running an agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent process failed to start: {0}")]
    Spawn(String),

    #[error("Agent exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },

    #[error("Agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether a retry could plausibly succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Io(_))
    }
}

/// One prompt execution request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    /// Cooperative cancellation; the runner terminates the process when
    /// this flips to `true`.
    pub cancel: Option<watch::Receiver<bool>>,
}

/// Executes prompts against an external coding agent.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run a prompt and return the agent's stdout transcript.
    async fn run(&self, request: AgentRequest) -> Result<String, AgentError>;
}

/// Runs the configured agent binary as a subprocess, prompt on stdin,
/// transcript on stdout. Timeout or cancellation sends SIGTERM, waits out
/// a grace period, then SIGKILLs.
pub struct ProcessAgentRunner {
    binary: PathBuf,
    grace_period: Duration,
}

impl ProcessAgentRunner {
    pub const fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            grace_period: Duration::from_secs(GRACE_PERIOD_SECS),
        }
    }

    /// Override the SIGTERM-to-SIGKILL grace period.
    #[must_use]
    pub const fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

#[async_trait]
impl AgentRunner for ProcessAgentRunner {
    async fn run(&self, request: AgentRequest) -> Result<String, AgentError> {
        debug!(
            binary = %self.binary.display(),
            working_dir = %request.working_dir.display(),
            timeout_secs = request.timeout.as_secs(),
            "Spawning agent process"
        );

        let mut child = tokio::process::Command::new(&self.binary)
            .current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Spawn(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.prompt.as_bytes()).await?;
            drop(stdin);
        }

        // Drain pipes concurrently so a chatty agent cannot fill the pipe
        // buffer and wedge against our wait.
        let stdout_task = drain_pipe(child.stdout.take());
        let stderr_task = drain_pipe(child.stderr.take());

        let status = match wait_with_cancel(&mut child, request.timeout, request.cancel).await? {
            WaitOutcome::Exited(status) => status,
            WaitOutcome::TimedOut => {
                terminate_process(&mut child, self.grace_period).await;
                return Err(AgentError::Timeout(request.timeout));
            }
            WaitOutcome::Cancelled => {
                terminate_process(&mut child, self.grace_period).await;
                return Err(AgentError::Cancelled);
            }
        };

        let transcript = stdout_task.await.unwrap_or_default();
        if !status.success() {
            let stderr = stderr_task.await.unwrap_or_default().trim().to_string();
            return Err(AgentError::Failed {
                status: status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(transcript)
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Read a child pipe to EOF in the background.
fn drain_pipe<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            use tokio::io::AsyncReadExt;
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Wait for process exit, the timeout, or cancellation, whichever first.
async fn wait_with_cancel(
    child: &mut tokio::process::Child,
    timeout: Duration,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<WaitOutcome, AgentError> {
    let sleep = tokio::time::sleep(timeout);
    tokio::pin!(sleep);

    let mut cancel = cancel;
    loop {
        if let Some(rx) = &cancel {
            if *rx.borrow() {
                return Ok(WaitOutcome::Cancelled);
            }
        }

        tokio::select! {
            status = child.wait() => {
                return Ok(WaitOutcome::Exited(status?));
            }
            () = &mut sleep => return Ok(WaitOutcome::TimedOut),
            changed = async {
                match &mut cancel {
                    Some(rx) => rx.changed().await,
                    None => std::future::pending().await,
                }
            } => {
                if changed.is_err() {
                    cancel = None;
                } else if cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
                    return Ok(WaitOutcome::Cancelled);
                }
            }
        }
    }
}

/// SIGTERM, grace period, then SIGKILL.
async fn terminate_process(child: &mut tokio::process::Child, grace_period: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            #[allow(unsafe_code, clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "Failed to send SIGTERM");
            }
        }
    }

    if tokio::time::timeout(grace_period, child.wait())
        .await
        .is_err()
    {
        warn!("Grace period expired, sending SIGKILL");
        let _ = child.kill().await;
    }
}

/// Errors from the remote repository collaborator.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote request failed: {0}")]
    Request(String),
}

/// A change request to publish.
#[derive(Debug, Clone)]
pub struct ChangeRequest {
    pub card_id: String,
    pub branch: String,
    pub base_ref: String,
    pub title: String,
    pub body: String,
}

/// Published change-request reference.
#[derive(Debug, Clone)]
pub struct ChangeRequestOutcome {
    pub url: String,
}

/// Remote repository the publish phase talks to.
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// Rate-limiter key; one bucket per host.
    fn host(&self) -> &str;

    async fn create_or_update_change_request(
        &self,
        request: ChangeRequest,
    ) -> Result<ChangeRequestOutcome, RemoteError>;
}

/// Stub remote that logs the request and fabricates a local reference.
/// Real remote API integrations live in the host, behind this trait.
pub struct LoggingRemote {
    host: String,
}

impl LoggingRemote {
    pub const fn new(host: String) -> Self {
        Self { host }
    }
}

#[async_trait]
impl RemoteRepository for LoggingRemote {
    fn host(&self) -> &str {
        &self.host
    }

    async fn create_or_update_change_request(
        &self,
        request: ChangeRequest,
    ) -> Result<ChangeRequestOutcome, RemoteError> {
        info!(
            card_id = %request.card_id,
            branch = %request.branch,
            base_ref = %request.base_ref,
            title = %request.title,
            "Change request (logging stub)"
        );
        Ok(ChangeRequestOutcome {
            url: format!("local://{}/{}", self.host, request.branch),
        })
    }
}
