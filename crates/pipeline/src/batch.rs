//! Batch orchestration for a single prompt file.
//!
//! [`BatchRunner`] expands every `(entry × ratio × count)` combination of a
//! parsed prompt file into one bind → submit → wait cycle. Cycles run
//! strictly one after another, separated by a configurable pause. A failing
//! cycle is counted and the run moves on; nothing is retried.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use batchgen_comfyui::job::JobClient;
use batchgen_core::library::WorkflowLibrary;
use batchgen_core::prompt_file::{parse_prompt_file, PromptEntry, RatioSpec};
use batchgen_core::types::Timestamp;
use batchgen_core::workflow::bind_prompt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Timing knobs for a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    /// How long to wait for one job before counting it as failed.
    pub job_timeout: Duration,
    /// Pause after every repetition that reached the submission step.
    pub request_delay: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(300),
            request_delay: Duration::from_secs(2),
        }
    }
}

/// Image counts for one run. `completed + failed <= total` at all times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

impl RunCounters {
    /// Images neither completed nor failed (non-zero only after cancellation).
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.completed + self.failed)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every repetition was attempted.
    Finished,
    /// Shutdown was requested before all repetitions were attempted.
    Cancelled,
    /// The prompt file could not be opened or read.
    Unreadable,
}

/// Outcome of [`BatchRunner::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub file: PathBuf,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

/// Runs prompt files against one ComfyUI instance.
pub struct BatchRunner {
    client: JobClient,
    library: WorkflowLibrary,
    settings: RunSettings,
}

impl BatchRunner {
    pub fn new(client: JobClient, library: WorkflowLibrary, settings: RunSettings) -> Self {
        Self {
            client,
            library,
            settings,
        }
    }

    pub fn client(&self) -> &JobClient {
        &self.client
    }

    fn cancel(&self) -> &CancellationToken {
        self.client.cancel_token()
    }

    /// Generate every image requested by the prompt file at `path`.
    ///
    /// Never fails: per-image errors are counted, and an unreadable file
    /// yields [`RunStatus::Unreadable`] with zero counters.
    pub async fn run(&self, path: &Path) -> RunReport {
        let span = tracing::info_span!(
            "batch_run",
            client_id = %self.client.client_id(),
            file = %path.display(),
        );
        self.run_file(path).instrument(span).await
    }

    async fn run_file(&self, path: &Path) -> RunReport {
        let started_at = chrono::Utc::now();
        let start = Instant::now();
        let mut counters = RunCounters::default();

        let parsed = match parse_prompt_file(path) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!(error = %e, "Cannot read prompt file");
                return self.finish(path, RunStatus::Unreadable, counters, started_at, start);
            }
        };

        for warning in &parsed.warnings {
            tracing::warn!(line = warning.line_num(), "{warning}");
        }

        if parsed.is_empty() {
            tracing::info!("No valid prompts found in file");
            return self.finish(path, RunStatus::Finished, counters, started_at, start);
        }

        counters.total = parsed.total_images();
        tracing::info!(
            entries = parsed.entries.len(),
            total = counters.total,
            "Starting batch",
        );

        let mut status = RunStatus::Finished;
        'entries: for entry in &parsed.entries {
            for ratio in &entry.ratios {
                for repetition in 1..=ratio.count {
                    if self.cancel().is_cancelled() {
                        status = RunStatus::Cancelled;
                        break 'entries;
                    }

                    let submitted = self.generate(entry, ratio, repetition, &mut counters).await;

                    if submitted && !self.pause().await {
                        status = RunStatus::Cancelled;
                        break 'entries;
                    }
                }
            }
        }

        self.finish(path, status, counters, started_at, start)
    }

    /// One bind → submit → wait cycle. Returns whether the submission step
    /// was reached.
    async fn generate(
        &self,
        entry: &PromptEntry,
        ratio: &RatioSpec,
        repetition: u32,
        counters: &mut RunCounters,
    ) -> bool {
        let template = match self.library.load(&ratio.kind) {
            Ok(template) => template,
            Err(e) => {
                counters.failed += 1;
                tracing::error!(
                    line = entry.line_num,
                    kind = %ratio.kind,
                    error = %e,
                    "Workflow template unavailable",
                );
                return false;
            }
        };

        let bound = match bind_prompt(&template, &entry.text) {
            Ok(bound) => bound,
            Err(e) => {
                counters.failed += 1;
                tracing::error!(
                    line = entry.line_num,
                    kind = %ratio.kind,
                    error = %e,
                    "Cannot bind prompt into workflow",
                );
                return false;
            }
        };

        tracing::info!(
            line = entry.line_num,
            kind = %ratio.kind,
            repetition,
            count = ratio.count,
            prompt = %entry.text,
            "Submitting generation",
        );

        let job = match self.client.submit(&bound).await {
            Ok(job) => job,
            Err(e) => {
                counters.failed += 1;
                tracing::error!(kind = %ratio.kind, error = %e, "Submission failed");
                return true;
            }
        };

        if self.client.wait(&job.id, self.settings.job_timeout).await {
            counters.completed += 1;
            tracing::info!(
                prompt_id = %job.id,
                completed = counters.completed,
                failed = counters.failed,
                total = counters.total,
                "Image generated",
            );
        } else {
            counters.failed += 1;
            tracing::warn!(
                prompt_id = %job.id,
                completed = counters.completed,
                failed = counters.failed,
                total = counters.total,
                "Image did not complete",
            );
        }
        true
    }

    /// Inter-request delay. Returns `false` if cancelled.
    async fn pause(&self) -> bool {
        let delay = self.settings.request_delay;
        if delay.is_zero() {
            return !self.cancel().is_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.cancel().cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn finish(
        &self,
        path: &Path,
        status: RunStatus,
        counters: RunCounters,
        started_at: Timestamp,
        start: Instant,
    ) -> RunReport {
        let elapsed = start.elapsed();
        match status {
            RunStatus::Cancelled => tracing::warn!(
                total = counters.total,
                completed = counters.completed,
                failed = counters.failed,
                remaining = counters.remaining(),
                elapsed_secs = elapsed.as_secs_f64(),
                "Batch cancelled",
            ),
            _ => tracing::info!(
                total = counters.total,
                completed = counters.completed,
                failed = counters.failed,
                elapsed_secs = elapsed.as_secs_f64(),
                "Batch finished",
            ),
        }

        RunReport {
            file: path.to_path_buf(),
            status,
            counters,
            started_at,
            finished_at: chrono::Utc::now(),
        }
    }
}
