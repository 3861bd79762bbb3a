//! Per-file invocation of the batch runner.
//!
//! The directory queue hands each claimed prompt file to a [`FileInvoker`].
//! [`ProcessInvoker`] runs `batchgen run <file>` as a child process so that a
//! crash or hang while generating one file cannot take the queue monitor
//! down with it.

use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Result of an invocation that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// The child exited with status zero.
    Succeeded { stdout: String, duration_ms: u64 },
    /// The child exited non-zero or was killed by a signal.
    Failed {
        /// Exit code, `None` when terminated by a signal.
        exit_code: Option<i32>,
        stderr: String,
        duration_ms: u64,
    },
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Errors that prevented an invocation from completing.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for child process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Invocation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Invocation cancelled by shutdown")]
    Cancelled,
}

/// Processes one claimed prompt file.
pub trait FileInvoker: Send + Sync {
    fn invoke(
        &self,
        path: &Path,
    ) -> impl Future<Output = Result<InvocationOutcome, InvokeError>> + Send;
}

/// Runs a program with the prompt file path appended to its arguments.
///
/// The child is killed when the timeout expires or the token is cancelled.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    program: PathBuf,
    args: Vec<OsString>,
    env_vars: Vec<(OsString, OsString)>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl ProcessInvoker {
    pub fn new(program: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
            timeout: None,
            cancel,
        }
    }

    /// `<current executable> run <file>`.
    pub fn current_exe(cancel: CancellationToken) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, cancel).arg("run"))
    }

    /// Append an argument placed before the file path.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for every child.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl FileInvoker for ProcessInvoker {
    async fn invoke(&self, path: &Path) -> Result<InvocationOutcome, InvokeError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(path)
            .envs(self.env_vars.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| InvokeError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        tracing::debug!(
            program = %self.program.display(),
            file = %path.display(),
            pid = ?child.id(),
            "Spawned batch run",
        );

        // Read the pipes concurrently so a chatty child cannot block on a
        // full pipe while we wait for it.
        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();
        let stdout_task = tokio::spawn(async move { read_stream(stdout_handle).await });
        let stderr_task = tokio::spawn(async move { read_stream(stderr_handle).await });

        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        let status = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                // `child` is dropped on return; kill_on_drop terminates it.
                return Err(InvokeError::Cancelled);
            }
            _ = sleep_until(deadline) => {
                return Err(InvokeError::Timeout {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                });
            }
            status = child.wait() => status.map_err(InvokeError::Wait)?,
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_bytes = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(InvocationOutcome::Succeeded {
                stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
                duration_ms,
            })
        } else {
            Ok(InvocationOutcome::Failed {
                exit_code: status.code(),
                stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
                duration_ms,
            })
        }
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Read an entire output stream into a byte buffer, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}
