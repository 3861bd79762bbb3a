//! Durable directory-backed queue of prompt files.
//!
//! A file's state is the directory that holds it:
//!
//! ```text
//! queue/ ──claim──▶ processing/ ──exit 0──▶ completed/
//!                        │
//!                        └──────any failure──▶ failed/
//! ```
//!
//! [`DirectoryQueue::run`] scans `queue/` on a fixed interval and hands each
//! file, one at a time, to a [`FileInvoker`]. Nothing is kept in memory
//! between cycles, so a restart resumes from whatever the directories hold.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::invoker::{FileInvoker, InvocationOutcome};

/// Lifecycle state of a prompt file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl QueueState {
    pub const ALL: [QueueState; 4] = [
        QueueState::Queued,
        QueueState::Processing,
        QueueState::Completed,
        QueueState::Failed,
    ];

    /// Name of the directory holding files in this state.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Queued => "queue",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Filesystem errors from queue transitions.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Failed to {op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not a queue file: {}", .0.display())]
    InvalidPath(PathBuf),
}

impl QueueError {
    fn io<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> Self + 'a {
        move |source| Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The four sibling state directories under one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLayout {
    root: PathBuf,
    queue: PathBuf,
    processing: PathBuf,
    completed: PathBuf,
    failed: PathBuf,
}

impl QueueLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            root: root.to_path_buf(),
            queue: root.join(QueueState::Queued.dir_name()),
            processing: root.join(QueueState::Processing.dir_name()),
            completed: root.join(QueueState::Completed.dir_name()),
            failed: root.join(QueueState::Failed.dir_name()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue(&self) -> &Path {
        &self.queue
    }

    pub fn processing(&self) -> &Path {
        &self.processing
    }

    pub fn completed(&self) -> &Path {
        &self.completed
    }

    pub fn failed(&self) -> &Path {
        &self.failed
    }

    pub fn dir(&self, state: QueueState) -> &Path {
        match state {
            QueueState::Queued => &self.queue,
            QueueState::Processing => &self.processing,
            QueueState::Completed => &self.completed,
            QueueState::Failed => &self.failed,
        }
    }

    /// Create all four directories if missing.
    pub async fn ensure(&self) -> Result<(), QueueError> {
        for state in QueueState::ALL {
            let dir = self.dir(state);
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(QueueError::io("create", dir))?;
        }
        Ok(())
    }

    /// Which state directory currently holds `file_name`, if any.
    pub fn state_of(&self, file_name: &str) -> Option<QueueState> {
        QueueState::ALL
            .into_iter()
            .find(|state| self.dir(*state).join(file_name).is_file())
    }
}

/// Timing and filtering knobs for the discovery loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Only files named `*.<extension>` are picked up.
    pub extension: String,
    pub scan_interval: Duration,
    /// Pause after a failed cycle.
    pub error_backoff: Duration,
    /// Minimum age of a leftover `processing` file before it is failed at
    /// startup.
    pub stale_processing_after: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            extension: "txt".into(),
            scan_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(10),
            stale_processing_after: Duration::ZERO,
        }
    }
}

/// Moves prompt files through the queue, one at a time.
pub struct DirectoryQueue<I> {
    layout: QueueLayout,
    settings: QueueSettings,
    invoker: I,
    cancel: CancellationToken,
}

impl<I: FileInvoker> DirectoryQueue<I> {
    pub fn new(
        layout: QueueLayout,
        settings: QueueSettings,
        invoker: I,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            layout,
            settings,
            invoker,
            cancel,
        }
    }

    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Monitor the queue until the token is cancelled.
    pub async fn run(&self) -> Result<(), QueueError> {
        self.layout.ensure().await?;

        match self.reconcile_stale().await {
            Ok(0) => {}
            Ok(moved) => tracing::warn!(moved, "Moved stale processing files to failed"),
            Err(e) => tracing::error!(error = %e, "Startup reconciliation failed"),
        }

        tracing::info!(
            queue = %self.layout.queue().display(),
            extension = %self.settings.extension,
            scan_interval_secs = self.settings.scan_interval.as_secs(),
            "Monitoring queue directory",
        );

        loop {
            let pause = match self.run_cycle().await {
                Ok(_) => self.settings.scan_interval,
                Err(e) => {
                    tracing::error!(error = %e, "Queue cycle failed");
                    self.settings.error_backoff
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!("Queue monitor stopped");
        Ok(())
    }

    /// Process every file currently queued. Returns how many reached a
    /// terminal state.
    ///
    /// A file whose transitions fail is logged and skipped so it cannot
    /// hold up the files after it. Only a failed scan is an error.
    pub async fn run_cycle(&self) -> Result<usize, QueueError> {
        let files = self.scan().await?;
        let mut processed = 0;
        for file in files {
            if self.cancel.is_cancelled() {
                break;
            }
            tracing::info!(file = %file.display(), "Found new prompt file");
            match self.process_file(&file).await {
                Ok(_) => processed += 1,
                Err(e) => {
                    tracing::error!(file = %file.display(), error = %e, "Prompt file skipped");
                    self.salvage(&file).await;
                }
            }
        }
        Ok(processed)
    }

    /// After a failed transition, move any `processing` copy of `queued` to
    /// `failed`.
    async fn salvage(&self, queued: &Path) {
        let Some(name) = queued.file_name() else {
            return;
        };
        let processing = self.layout.processing().join(name);
        let is_file = tokio::fs::metadata(&processing)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return;
        }
        if let Err(e) = self.finish(&processing, QueueState::Failed).await {
            tracing::error!(file = %processing.display(), error = %e, "Cannot move file to failed");
        }
    }

    /// Queued prompt files, sorted by name.
    pub async fn scan(&self) -> Result<Vec<PathBuf>, QueueError> {
        let dir = self.layout.queue();
        let suffix = format!(".{}", self.settings.extension);
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(QueueError::io("read", dir))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(QueueError::io("read", dir))?
        {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            let name = entry.file_name();
            if is_file && name.to_string_lossy().ends_with(&suffix) {
                files.push(entry.path());
            }
        }

        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    /// Move a queued file into `processing`: copy, then delete the queued file.
    pub async fn claim(&self, queued: &Path) -> Result<PathBuf, QueueError> {
        let name = queued
            .file_name()
            .ok_or_else(|| QueueError::InvalidPath(queued.to_path_buf()))?;
        let target = self.layout.processing().join(name);

        tokio::fs::copy(queued, &target)
            .await
            .map_err(QueueError::io("copy", queued))?;

        if let Err(source) = tokio::fs::remove_file(queued).await {
            // Keep the file in exactly one state: undo the copy.
            let _ = tokio::fs::remove_file(&target).await;
            return Err(QueueError::Io {
                op: "remove",
                path: queued.to_path_buf(),
                source,
            });
        }

        tracing::debug!(file = %target.display(), "Claimed prompt file");
        Ok(target)
    }

    /// Rename a `processing` file into `state`'s directory.
    pub async fn finish(&self, processing: &Path, state: QueueState) -> Result<PathBuf, QueueError> {
        let name = processing
            .file_name()
            .ok_or_else(|| QueueError::InvalidPath(processing.to_path_buf()))?;
        let target = self.layout.dir(state).join(name);
        tokio::fs::rename(processing, &target)
            .await
            .map_err(QueueError::io("move", processing))?;
        Ok(target)
    }

    /// Claim, invoke and route one queued file. Returns the terminal state.
    pub async fn process_file(&self, queued: &Path) -> Result<QueueState, QueueError> {
        let processing = self.claim(queued).await?;
        let file = processing.display().to_string();

        let state = match self.invoker.invoke(&processing).await {
            Ok(InvocationOutcome::Succeeded {
                stdout,
                duration_ms,
            }) => {
                tracing::info!(file = %file, duration_ms, "Prompt file processed");
                if !stdout.trim().is_empty() {
                    tracing::info!(file = %file, output = %stdout.trim_end(), "Run output");
                }
                QueueState::Completed
            }
            Ok(InvocationOutcome::Failed {
                exit_code,
                stderr,
                duration_ms,
            }) => {
                tracing::error!(
                    file = %file,
                    exit_code = ?exit_code,
                    duration_ms,
                    stderr = %stderr.trim_end(),
                    "Prompt file failed",
                );
                QueueState::Failed
            }
            Err(e) => {
                tracing::error!(file = %file, error = %e, "Invocation error");
                QueueState::Failed
            }
        };

        if state == QueueState::Failed && !tokio::fs::try_exists(&processing).await.unwrap_or(false) {
            tracing::warn!(file = %file, "File vanished from processing");
            return Ok(state);
        }

        self.finish(&processing, state).await?;
        Ok(state)
    }

    /// Move leftover `processing` files at least `stale_processing_after`
    /// old to `failed`. Returns how many were moved.
    pub async fn reconcile_stale(&self) -> Result<usize, QueueError> {
        let dir = self.layout.processing();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(QueueError::io("read", dir))?;

        let now = SystemTime::now();
        let mut moved = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(QueueError::io("read", dir))?
        {
            let path = entry.path();
            let metadata = entry
                .metadata()
                .await
                .map_err(QueueError::io("stat", &path))?;
            if !metadata.is_file() {
                continue;
            }

            // A modification time in the future counts as age zero.
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or(Duration::ZERO);
            if age < self.settings.stale_processing_after {
                continue;
            }

            self.finish(&path, QueueState::Failed).await?;
            tracing::warn!(
                file = %path.display(),
                age_secs = age.as_secs(),
                "Stale processing file moved to failed",
            );
            moved += 1;
        }
        Ok(moved)
    }
}
