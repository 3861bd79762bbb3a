//! Shared fixtures for pipeline integration tests: workflow templates on
//! disk, a fast [`BatchRunner`] and a scripted [`FileInvoker`]. The fake
//! ComfyUI server lives in `batchgen-testing`.

#![allow(dead_code)]

use std::sync::Mutex;

use serde_json::{json, Value};

use batchgen_comfyui::api::ComfyUIApi;
use batchgen_comfyui::job::JobClient;
use batchgen_core::library::WorkflowLibrary;
use batchgen_pipeline::batch::{BatchRunner, RunSettings};
use batchgen_pipeline::invoker::{FileInvoker, InvocationOutcome, InvokeError};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Workflows and runners
// ---------------------------------------------------------------------------

/// A minimal text-to-image template with one encoder and one sampler.
pub fn template() -> Value {
    json!({
        "3": {
            "class_type": "KSampler",
            "inputs": { "seed": 0, "steps": 20, "model": ["4", 0] }
        },
        "4": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "sd.safetensors" } },
        "6": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": "PLACEHOLDER", "clip": ["4", 1] }
        }
    })
}

/// A temp directory holding `<kind>.json` for every kind given.
pub fn workflows(kinds: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("create workflows dir");
    for kind in kinds {
        std::fs::write(
            dir.path().join(format!("{kind}.json")),
            serde_json::to_string_pretty(&template()).expect("serialize template"),
        )
        .expect("write template");
    }
    dir
}

/// Write `content` to `name` inside `dir` and return the path.
pub fn prompt_file(dir: &std::path::Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write prompt file");
    path
}

/// Runner with fast polling and no inter-request delay.
pub fn runner(url: &str, workflows_dir: &std::path::Path, cancel: CancellationToken) -> BatchRunner {
    let client = JobClient::new(ComfyUIApi::new(url), cancel)
        .with_poll_interval(std::time::Duration::from_millis(10));
    BatchRunner::new(
        client,
        WorkflowLibrary::new(workflows_dir),
        RunSettings {
            job_timeout: std::time::Duration::from_secs(2),
            request_delay: std::time::Duration::ZERO,
        },
    )
}

// ---------------------------------------------------------------------------
// Scripted invoker
// ---------------------------------------------------------------------------

/// What [`ScriptedInvoker`] does for a given file.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    Succeed,
    Fail,
    Error,
}

/// Decides the outcome by file name and records every call.
pub struct ScriptedInvoker {
    script: fn(&str) -> Script,
    /// File names seen, with whether the file sat in `processing` when invoked.
    pub calls: Mutex<Vec<(String, bool)>>,
}

impl ScriptedInvoker {
    pub fn new(script: fn(&str) -> Script) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl FileInvoker for ScriptedInvoker {
    async fn invoke(&self, path: &std::path::Path) -> Result<InvocationOutcome, InvokeError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let in_processing = path
            .parent()
            .and_then(|p| p.file_name())
            .is_some_and(|p| p == "processing")
            && path.is_file();
        self.calls.lock().unwrap().push((name.clone(), in_processing));

        match (self.script)(&name) {
            Script::Succeed => Ok(InvocationOutcome::Succeeded {
                stdout: format!("processed {name}"),
                duration_ms: 1,
            }),
            Script::Fail => Ok(InvocationOutcome::Failed {
                exit_code: Some(1),
                stderr: "generation failed".into(),
                duration_ms: 1,
            }),
            Script::Error => Err(InvokeError::Timeout { elapsed_ms: 1 }),
        }
    }
}
