//! restic process invocation
//!
//! [`CommandRunner`] owns the per repository lock: at most one restic
//! process runs against a repository at any time because restic itself
//! refuses concurrent access. Failures are classified from the captured
//! stderr and exit code so callers can decide whether to retry.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::error::{ErrorKind, ResticError};
use crate::metrics::{MetricsHandle, COMMAND_ERRORS, COMMAND_REPO_LOCKED, COMMAND_TOTAL};

/// Environment variable that carries the repository locator
pub const REPOSITORY_ENV: &str = "RESTIC_REPOSITORY";

/// How long a cancelled restic gets to release its lock before being killed
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Ordered stderr rules; the first match wins
const STDERR_RULES: &[(&str, ErrorKind)] = &[
    ("repository is already locked", ErrorKind::RepoLocked),
    ("unable to open config file", ErrorKind::ConnectionFailed),
    ("repository contains errors", ErrorKind::CheckFailed),
];

/// restic exit codes, consulted only when no stderr rule matched
const EXIT_CODE_RULES: &[(i32, ErrorKind)] = &[
    (10, ErrorKind::ConnectionFailed), // repository does not exist
    (11, ErrorKind::RepoLocked),       // failed to lock repository
];

/// Classify a failed invocation
pub fn classify(stderr: &str, exit_code: Option<i32>) -> ErrorKind {
    STDERR_RULES
        .iter()
        .find(|(pattern, _)| stderr.contains(pattern))
        .map(|(_, kind)| *kind)
        .or_else(|| {
            exit_code
                .and_then(|code| EXIT_CODE_RULES.iter().find(|(c, _)| *c == code))
                .map(|(_, kind)| *kind)
        })
        .unwrap_or(ErrorKind::Unknown)
}

/// A fully described restic invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub subcommand: String,
    pub args: Vec<String>,
    /// Added on top of the inherited process environment, later entries win
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// Arguments as passed to the binary, including `--json`
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        argv.push(self.subcommand.clone());
        argv.extend(self.args.iter().cloned());
        argv.push("--json".to_string());
        argv
    }
}

/// Raw result of a finished process
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Runs a single invocation to completion
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Returns `Err` only when the process could not be run at all
    async fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ResticError>;
}

/// Executes restic as a child process
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    binary: String,
}

impl ProcessExecutor {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ResticError> {
        let mut child = Command::new(&self.binary)
            .args(invocation.argv())
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ResticError::Unknown(format!("failed to run {}: {}", self.binary, e)))?;

        let stdout = tokio::spawn(read_stream(child.stdout.take()));
        let stderr = tokio::spawn(read_stream(child.stderr.take()));

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(ResticError::Cancelled);
            }
            status = child.wait() => status,
        }
        .map_err(|e| ResticError::Unknown(format!("failed to wait for {}: {}", self.binary, e)))?;

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();

        Ok(ProcessOutput {
            success: status.success(),
            exit_code: status.code(),
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        if let Err(e) = stream.read_to_end(&mut buf).await {
            debug!(error = %e, "failed to read restic output stream");
        }
    }
    buf
}

/// SIGTERM first so restic can remove its lock, SIGKILL after the grace period
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, error = %e, "failed to send SIGTERM to restic");
            }
        }
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!("restic did not exit after SIGTERM, killing it");
    }

    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill restic");
    }
}

/// Retry schedule for connection failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 4,
        }
    }
}

/// Serialised, classified restic invocations for one repository
pub struct CommandRunner {
    repo: String,
    locator: String,
    environment: BTreeMap<String, String>,
    executor: Arc<dyn CommandExecutor>,
    metrics: MetricsHandle,
    retry: RetryPolicy,
    lock: Mutex<()>,
}

impl CommandRunner {
    pub fn new(
        repo: impl Into<String>,
        locator: impl Into<String>,
        environment: BTreeMap<String, String>,
        executor: Arc<dyn CommandExecutor>,
        metrics: MetricsHandle,
    ) -> Self {
        Self {
            repo: repo.into(),
            locator: locator.into(),
            environment,
            executor,
            metrics,
            retry: RetryPolicy::default(),
            lock: Mutex::new(()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    fn invocation(&self, subcommand: &str, args: &[String]) -> Invocation {
        let mut env = Vec::with_capacity(self.environment.len() + 1);
        env.push((REPOSITORY_ENV.to_string(), self.locator.clone()));
        env.extend(self.environment.iter().map(|(k, v)| (k.clone(), v.clone())));

        Invocation {
            subcommand: subcommand.to_string(),
            args: args.to_vec(),
            env,
        }
    }

    /// Run one invocation under the repository lock
    pub async fn run(
        &self,
        subcommand: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ResticError> {
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResticError::Cancelled),
            guard = self.lock.lock() => guard,
        };

        let invocation = self.invocation(subcommand, args);
        debug!(repo = %self.repo, cmd = %subcommand, args = ?invocation.args, "running restic command");
        self.metrics.inc(&COMMAND_TOTAL, &[self.repo.as_str(), subcommand]);
        self.metrics.set(&COMMAND_REPO_LOCKED, &[self.repo.as_str()], 0.0);

        let output = self.executor.execute(&invocation, cancel).await;

        let output = match output {
            Ok(output) => output,
            Err(ResticError::Cancelled) => {
                debug!(repo = %self.repo, cmd = %subcommand, "restic command cancelled");
                return Err(ResticError::Cancelled);
            }
            Err(e) => {
                error!(repo = %self.repo, cmd = %subcommand, error = %e, "failed to run restic");
                self.record_failure(subcommand, ErrorKind::Unknown);
                return Err(e);
            }
        };

        if output.success {
            return Ok(output.stdout);
        }

        let kind = classify(&output.stderr, output.exit_code);
        self.record_failure(subcommand, kind);

        let stderr = output.stderr.trim();
        match kind {
            ErrorKind::RepoLocked => {
                warn!(repo = %self.repo, cmd = %subcommand, "repository is locked by another process");
            }
            ErrorKind::ConnectionFailed => {
                warn!(repo = %self.repo, cmd = %subcommand, stderr = %stderr, "restic failed to connect to the repository");
            }
            ErrorKind::CheckFailed => {
                warn!(repo = %self.repo, cmd = %subcommand, stderr = %stderr, "repository failed integrity check");
            }
            ErrorKind::Unknown => {
                error!(
                    repo = %self.repo,
                    cmd = %subcommand,
                    stderr = %stderr,
                    exit_code = ?output.exit_code,
                    "restic command exited with an unknown error"
                );
            }
        }

        Err(ResticError::from_kind(kind, stderr))
    }

    fn record_failure(&self, subcommand: &str, kind: ErrorKind) {
        if kind == ErrorKind::RepoLocked {
            self.metrics.set(&COMMAND_REPO_LOCKED, &[self.repo.as_str()], 1.0);
        }
        self.metrics
            .inc(&COMMAND_ERRORS, &[self.repo.as_str(), subcommand, kind.as_str()]);
    }

    /// Run with retries for connection failures, every other error is returned at once
    pub async fn run_with_retry(
        &self,
        subcommand: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ResticError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut delay = self.retry.initial_delay;

        for attempt in 1..=max_attempts {
            match self.run(subcommand, args, cancel).await {
                Err(ResticError::ConnectionFailed) if attempt < max_attempts => {
                    debug!(repo = %self.repo, cmd = %subcommand, attempt, after = ?delay, "retrying command");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ResticError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay *= self.retry.multiplier;
                }
                result => return result,
            }
        }

        Err(ResticError::ConnectionFailed)
    }
}
