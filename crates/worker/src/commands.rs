//! Subcommand implementations.
//!
//! Each command returns the process exit code. Fatal setup errors bubble up
//! as [`anyhow::Error`] and are mapped to exit code 1 by `main`.

use std::path::Path;

use anyhow::Context;
use batchgen_core::library::WorkflowLibrary;
use batchgen_core::workflow::inspect_workflow;
use batchgen_pipeline::batch::{BatchRunner, RunStatus};
use batchgen_pipeline::config::PipelineConfig;
use batchgen_pipeline::invoker::ProcessInvoker;
use batchgen_pipeline::queue::DirectoryQueue;
use tokio_util::sync::CancellationToken;

use crate::logging::LogFormat;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
/// Exit code of a run interrupted by SIGINT/SIGTERM.
pub const EXIT_CANCELLED: u8 = 130;

/// `batchgen run <file>`: ping the server, then process one prompt file.
pub async fn run(
    config: &PipelineConfig,
    file: &Path,
    cancel: CancellationToken,
) -> anyhow::Result<u8> {
    let client = config.job_client(cancel)?;
    if !client.ping().await {
        anyhow::bail!("ComfyUI at {} is not reachable", config.comfyui_url);
    }

    let runner = BatchRunner::new(
        client,
        WorkflowLibrary::new(&config.workflows_dir),
        config.run_settings(),
    );
    let report = runner.run(file).await;

    Ok(match report.status {
        RunStatus::Finished => EXIT_SUCCESS,
        RunStatus::Cancelled => EXIT_CANCELLED,
        RunStatus::Unreadable => EXIT_FAILURE,
    })
}

/// `batchgen watch`: monitor the queue directory until cancelled.
pub async fn watch(
    config: &PipelineConfig,
    log_format: LogFormat,
    cancel: CancellationToken,
) -> anyhow::Result<u8> {
    // Children must see the same effective configuration as the monitor,
    // including command-line overrides.
    let invoker = ProcessInvoker::current_exe(cancel.clone())
        .context("Cannot locate the batchgen executable")?
        .env("COMFYUI_URL", &config.comfyui_url)
        .env("WORKFLOWS_DIR", &config.workflows_dir)
        .env("PROMPTS_ROOT", &config.prompts_root)
        .env("BATCHGEN_LOG_FORMAT", log_format.as_str())
        .with_timeout(config.invocation_timeout);

    tracing::info!(
        comfyui_url = %config.comfyui_url,
        prompts_root = %config.prompts_root.display(),
        invocation_timeout_secs = ?config.invocation_timeout.map(|t| t.as_secs()),
        "Starting queue monitor",
    );

    let queue = DirectoryQueue::new(
        config.queue_layout(),
        config.queue_settings(),
        invoker,
        cancel,
    );
    queue.run().await.context("Queue monitor failed")?;

    Ok(EXIT_SUCCESS)
}

/// `batchgen validate [NAMES...]`: report prompt and sampler nodes of each
/// workflow template.
pub fn validate(config: &PipelineConfig, names: &[String]) -> anyhow::Result<u8> {
    let library = WorkflowLibrary::new(&config.workflows_dir);
    let kinds = if names.is_empty() {
        library.kinds().with_context(|| {
            format!(
                "Cannot list workflow templates in {}",
                config.workflows_dir.display()
            )
        })?
    } else {
        names.to_vec()
    };

    if kinds.is_empty() {
        println!(
            "No workflow templates found in {}",
            config.workflows_dir.display()
        );
        return Ok(EXIT_SUCCESS);
    }

    let mut broken = 0usize;
    for kind in &kinds {
        let report = library.load(kind).and_then(|doc| inspect_workflow(&doc));
        match report {
            Ok(report) => {
                println!(
                    "{kind}: prompt nodes [{}], sampler nodes [{}]",
                    report.prompt_nodes.join(", "),
                    report.sampler_nodes.join(", ")
                );
                if !report.has_prompt_sink() {
                    println!("  warning: no CLIPTextEncode node with a text input; prompts will be ignored");
                }
                if !report.has_sampler() {
                    println!("  warning: no KSampler node with a seed input; seeds will not vary");
                }
            }
            Err(e) => {
                broken += 1;
                println!("{kind}: {e}");
            }
        }
    }

    println!("{} template(s) checked, {broken} unusable", kinds.len());
    Ok(if broken == 0 {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}

/// `batchgen ping`: connectivity probe only.
pub async fn ping(config: &PipelineConfig, cancel: CancellationToken) -> anyhow::Result<u8> {
    let client = config.job_client(cancel)?;
    Ok(if client.ping().await {
        println!("ComfyUI at {} is reachable", config.comfyui_url);
        EXIT_SUCCESS
    } else {
        println!("ComfyUI at {} is not reachable", config.comfyui_url);
        EXIT_FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_workflows(files: &[(&str, &str)]) -> (tempfile::TempDir, PipelineConfig) {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in files {
            std::fs::write(dir.path().join(name), body).unwrap();
        }
        let config = PipelineConfig {
            workflows_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        (dir, config)
    }

    const GOOD: &str = r#"{
        "3": {"class_type": "KSampler", "inputs": {"seed": 1}},
        "6": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}}
    }"#;

    #[test]
    fn validate_accepts_good_templates() {
        let (_dir, config) = config_with_workflows(&[("square.json", GOOD)]);
        assert_eq!(validate(&config, &[]).unwrap(), EXIT_SUCCESS);
    }

    #[test]
    fn validate_fails_on_broken_template() {
        let (_dir, config) =
            config_with_workflows(&[("square.json", GOOD), ("broken.json", "{ nope")]);
        assert_eq!(validate(&config, &[]).unwrap(), EXIT_FAILURE);
    }

    #[test]
    fn validate_fails_on_missing_named_template() {
        let (_dir, config) = config_with_workflows(&[("square.json", GOOD)]);
        let names = vec!["square".to_string(), "landscape".to_string()];
        assert_eq!(validate(&config, &names).unwrap(), EXIT_FAILURE);
    }

    #[test]
    fn validate_missing_directory_is_an_error() {
        let config = PipelineConfig {
            workflows_dir: "/nonexistent/batchgen/workflows".into(),
            ..Default::default()
        };
        assert!(validate(&config, &[]).is_err());
    }

    #[tokio::test]
    async fn run_fails_fast_when_server_is_unreachable() {
        let config = PipelineConfig {
            comfyui_url: "http://127.0.0.1:9".into(),
            ..Default::default()
        };
        let err = run(&config, Path::new("a.txt"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not reachable"));
    }
}
