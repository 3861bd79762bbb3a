use std::path::PathBuf;
use std::time::Duration;

use batchgen_comfyui::api::ComfyUIApi;
use batchgen_comfyui::job::JobClient;
use tokio_util::sync::CancellationToken;

use crate::batch::RunSettings;
use crate::queue::{QueueLayout, QueueSettings};

/// Configuration errors. Each one names the offending variable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got '{value}'")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Pipeline configuration loaded from environment variables.
///
/// All fields have defaults suitable for a ComfyUI instance on the same
/// machine. CLI flags may override the server URL and directories after
/// loading.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// ComfyUI base URL (default: `http://127.0.0.1:8188`).
    pub comfyui_url: String,
    /// Directory holding `<kind>.json` workflow templates.
    pub workflows_dir: PathBuf,
    /// Root of the `queue`/`processing`/`completed`/`failed` directories.
    pub prompts_root: PathBuf,
    /// Extension of prompt files picked up from the queue, without the dot.
    pub prompt_extension: String,
    pub poll_interval: Duration,
    /// Per-job completion timeout.
    pub job_timeout: Duration,
    /// Pause between two generation requests.
    pub request_delay: Duration,
    pub scan_interval: Duration,
    /// Pause after an error in the discovery loop.
    pub error_backoff: Duration,
    /// Files left in `processing` at least this old are failed at startup.
    pub stale_processing_after: Duration,
    /// Wall-clock limit for one `batchgen run` child (`None`: unlimited).
    pub invocation_timeout: Option<Duration>,
    /// Timeout applied to every HTTP request against ComfyUI.
    pub http_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            comfyui_url: "http://127.0.0.1:8188".into(),
            workflows_dir: PathBuf::from("workflows"),
            prompts_root: PathBuf::from("prompts"),
            prompt_extension: "txt".into(),
            poll_interval: Duration::from_secs(2),
            job_timeout: Duration::from_secs(300),
            request_delay: Duration::from_secs(2),
            scan_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(10),
            stale_processing_after: Duration::ZERO,
            invocation_timeout: None,
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default                 |
    /// |---------------------------|-------------------------|
    /// | `COMFYUI_URL`             | `http://127.0.0.1:8188` |
    /// | `WORKFLOWS_DIR`           | `workflows`             |
    /// | `PROMPTS_ROOT`            | `prompts`               |
    /// | `PROMPT_EXTENSION`        | `txt`                   |
    /// | `POLL_INTERVAL_SECS`      | `2`                     |
    /// | `JOB_TIMEOUT_SECS`        | `300`                   |
    /// | `REQUEST_DELAY_SECS`      | `2`                     |
    /// | `SCAN_INTERVAL_SECS`      | `5`                     |
    /// | `ERROR_BACKOFF_SECS`      | `10`                    |
    /// | `STALE_PROCESSING_SECS`   | `0`                     |
    /// | `INVOCATION_TIMEOUT_SECS` | unset (no limit)        |
    /// | `HTTP_TIMEOUT_SECS`       | `30`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`PipelineConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let comfyui_url = var("COMFYUI_URL").unwrap_or(defaults.comfyui_url);
        if !comfyui_url.starts_with("http://") && !comfyui_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                name: "COMFYUI_URL",
                value: comfyui_url,
                expected: "an http:// or https:// URL",
            });
        }

        let prompt_extension = match var("PROMPT_EXTENSION") {
            Some(raw) => normalize_extension(&raw).ok_or(ConfigError::Invalid {
                name: "PROMPT_EXTENSION",
                value: raw,
                expected: "a non-empty file extension",
            })?,
            None => defaults.prompt_extension,
        };

        let invocation_timeout = match var("INVOCATION_TIMEOUT_SECS") {
            Some(raw) => Some(parse_secs("INVOCATION_TIMEOUT_SECS", &raw, false)?),
            None => None,
        };

        let secs = |name: &'static str, default: Duration, allow_zero: bool| match var(name) {
            Some(raw) => parse_secs(name, &raw, allow_zero),
            None => Ok(default),
        };

        Ok(Self {
            comfyui_url,
            workflows_dir: var("WORKFLOWS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.workflows_dir),
            prompts_root: var("PROMPTS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.prompts_root),
            prompt_extension,
            poll_interval: secs("POLL_INTERVAL_SECS", defaults.poll_interval, false)?,
            job_timeout: secs("JOB_TIMEOUT_SECS", defaults.job_timeout, false)?,
            request_delay: secs("REQUEST_DELAY_SECS", defaults.request_delay, true)?,
            scan_interval: secs("SCAN_INTERVAL_SECS", defaults.scan_interval, false)?,
            error_backoff: secs("ERROR_BACKOFF_SECS", defaults.error_backoff, true)?,
            stale_processing_after: secs(
                "STALE_PROCESSING_SECS",
                defaults.stale_processing_after,
                true,
            )?,
            invocation_timeout,
            http_timeout: secs("HTTP_TIMEOUT_SECS", defaults.http_timeout, false)?,
        })
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            job_timeout: self.job_timeout,
            request_delay: self.request_delay,
        }
    }

    pub fn queue_layout(&self) -> QueueLayout {
        QueueLayout::new(&self.prompts_root)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            extension: self.prompt_extension.clone(),
            scan_interval: self.scan_interval,
            error_backoff: self.error_backoff,
            stale_processing_after: self.stale_processing_after,
        }
    }

    /// Build the [`JobClient`] for this configuration. The returned client
    /// generates its own client id.
    pub fn job_client(&self, cancel: CancellationToken) -> Result<JobClient, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(self.http_timeout)
            .build()?;
        let api = ComfyUIApi::with_client(http, self.comfyui_url.as_str());
        Ok(JobClient::new(api, cancel).with_poll_interval(self.poll_interval))
    }
}

fn parse_secs(name: &'static str, raw: &str, allow_zero: bool) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::Invalid {
        name,
        value: raw.to_string(),
        expected: if allow_zero {
            "a whole number of seconds"
        } else {
            "a positive whole number of seconds"
        },
    };

    let secs: u64 = raw.trim().parse().map_err(|_| invalid())?;
    if secs == 0 && !allow_zero {
        return Err(invalid());
    }
    Ok(Duration::from_secs(secs))
}

/// `".txt"` and `"txt"` both mean `txt`.
fn normalize_extension(raw: &str) -> Option<String> {
    let ext = raw.trim().trim_start_matches('.');
    if ext.is_empty() || ext.contains(['/', '\\']) {
        return None;
    }
    Some(ext.to_string())
}
