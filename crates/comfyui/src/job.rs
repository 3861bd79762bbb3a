//! Submit-and-poll job tracking on top of [`ComfyUIApi`].
//!
//! ComfyUI exposes no completion callback over plain HTTP, so a job is
//! considered finished once its prompt id shows up as a key in
//! `GET /history/{prompt_id}`. [`JobClient::wait`] polls that resource on a
//! fixed interval until the id appears, the timeout elapses, or the
//! client's [`CancellationToken`] fires.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError};

/// Default delay between two history polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A workflow accepted by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    /// Server-assigned prompt id.
    pub id: String,
    /// Client id the workflow was submitted under.
    pub client_id: String,
}

/// Result of a single history poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    /// The prompt id is not in the history yet.
    Pending,
    /// The prompt finished; carries its history record (outputs, status).
    Done(serde_json::Value),
}

/// Why a submission did not produce a [`JobHandle`].
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Transport failure or non-2xx response.
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    /// ComfyUI accepted the request but returned no `prompt_id`.
    #[error("ComfyUI response did not contain a prompt_id")]
    MissingPromptId,
}

/// Extract the history record for `prompt_id`, if present.
pub fn history_record(history: &serde_json::Value, prompt_id: &str) -> Option<serde_json::Value> {
    history.get(prompt_id).cloned()
}

/// Submits workflows under a stable client id and tracks them to completion.
///
/// One `JobClient` is created per orchestrator process, so every workflow
/// submitted by that process carries the same client id.
#[derive(Debug, Clone)]
pub struct JobClient {
    api: ComfyUIApi,
    client_id: String,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl JobClient {
    /// Create a client with a fresh UUID v4 client id and the default poll
    /// interval.
    pub fn new(api: ComfyUIApi, cancel: CancellationToken) -> Self {
        Self {
            api,
            client_id: uuid::Uuid::new_v4().to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel,
        }
    }

    /// Override the delay between history polls.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    /// Token that interrupts [`JobClient::wait`].
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Check that the server is reachable before any batch work starts.
    pub async fn ping(&self) -> bool {
        match self.api.health_check().await {
            Ok(()) => {
                tracing::info!(api_url = %self.api.api_url(), "ComfyUI is reachable");
                true
            }
            Err(e) => {
                tracing::error!(
                    api_url = %self.api.api_url(),
                    error = %e,
                    "Cannot reach ComfyUI",
                );
                false
            }
        }
    }

    /// Queue a bound workflow.
    pub async fn submit(&self, document: &serde_json::Value) -> Result<JobHandle, SubmitError> {
        let response = self.api.submit_workflow(document, &self.client_id).await?;

        let id = response
            .prompt_id
            .filter(|id| !id.is_empty())
            .ok_or(SubmitError::MissingPromptId)?;

        tracing::debug!(
            prompt_id = %id,
            queue_number = ?response.number,
            client_id = %self.client_id,
            "Workflow queued",
        );

        Ok(JobHandle {
            id,
            client_id: self.client_id.clone(),
        })
    }

    /// Fetch the history for `job_id` once.
    pub async fn poll_once(&self, job_id: &str) -> Result<PollStatus, ComfyUIApiError> {
        let history = self.api.get_history(job_id).await?;
        Ok(match history_record(&history, job_id) {
            Some(record) => PollStatus::Done(record),
            None => PollStatus::Pending,
        })
    }

    /// Poll until `job_id` completes (`true`) or `timeout` elapses (`false`).
    ///
    /// The first poll happens immediately. Poll errors count as "not done
    /// yet" so a transient network failure cannot end the wait early.
    /// Cancellation interrupts both the sleep and an in-flight poll and
    /// returns `false`. A poll still in flight at the deadline is abandoned.
    pub async fn wait(&self, job_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let poll = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!(prompt_id = %job_id, "Wait cancelled");
                    return false;
                }
                result = tokio::time::timeout_at(deadline, self.poll_once(job_id)) => result,
            };

            match poll {
                Ok(Ok(PollStatus::Done(_))) => {
                    tracing::debug!(prompt_id = %job_id, attempt, "Job completed");
                    return true;
                }
                Ok(Ok(PollStatus::Pending)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        prompt_id = %job_id,
                        attempt,
                        error = %e,
                        "History poll failed, will retry",
                    );
                }
                Err(_elapsed) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    prompt_id = %job_id,
                    attempt,
                    timeout_secs = timeout.as_secs_f64(),
                    "Timed out waiting for job",
                );
                return false;
            }

            let pause = self.poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!(prompt_id = %job_id, "Wait cancelled");
                    return false;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn history_record_present() {
        let history = json!({ "abc": { "outputs": {}, "status": { "completed": true } } });
        let record = history_record(&history, "abc").expect("record present");
        assert_eq!(record["status"]["completed"], true);
    }

    #[test]
    fn history_record_absent_for_empty_history() {
        assert!(history_record(&json!({}), "abc").is_none());
    }

    #[test]
    fn history_record_ignores_other_ids() {
        let history = json!({ "other": {} });
        assert!(history_record(&history, "abc").is_none());
    }

    #[test]
    fn client_ids_are_unique_per_client() {
        let cancel = CancellationToken::new();
        let a = JobClient::new(ComfyUIApi::new("http://localhost:8188"), cancel.clone());
        let b = JobClient::new(ComfyUIApi::new("http://localhost:8188"), cancel);
        assert_ne!(a.client_id(), b.client_id());
        assert_eq!(a.client_id().len(), 36);
    }

    #[tokio::test]
    async fn cancelled_wait_returns_false_without_polling() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Nothing listens on port 9; a real poll would fail, not hang.
        let client = JobClient::new(ComfyUIApi::new("http://127.0.0.1:9"), cancel);
        assert!(!client.wait("abc", Duration::from_secs(60)).await);
    }

    #[test]
    fn submit_error_display() {
        assert_eq!(
            SubmitError::MissingPromptId.to_string(),
            "ComfyUI response did not contain a prompt_id"
        );
    }
}
