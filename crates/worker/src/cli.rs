use std::path::PathBuf;

use batchgen_pipeline::config::PipelineConfig;
use clap::{Parser, Subcommand};

use crate::logging::LogFormat;

/// Batch image generation against a ComfyUI server
#[derive(Debug, Parser)]
#[command(name = "batchgen", version, about)]
pub struct Cli {
    /// ComfyUI base URL (overrides COMFYUI_URL)
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Directory holding <kind>.json workflow templates (overrides WORKFLOWS_DIR)
    #[arg(long, global = true)]
    pub workflows_dir: Option<PathBuf>,

    /// Root of the queue/processing/completed/failed directories (overrides PROMPTS_ROOT)
    #[arg(long, global = true)]
    pub prompts_root: Option<PathBuf>,

    /// Log output format
    #[arg(
        long,
        global = true,
        env = "BATCHGEN_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Watch the queue directory and process prompt files until interrupted
    Watch,

    /// Generate every image requested by one prompt file
    Run {
        /// Prompt file to process
        file: PathBuf,
    },

    /// Check workflow templates for prompt and sampler nodes
    Validate {
        /// Workflow kinds to check (default: every template in the directory)
        names: Vec<String>,
    },

    /// Check that the ComfyUI server is reachable
    Ping,
}

impl Cli {
    /// Apply command-line overrides on top of the environment configuration.
    pub fn apply_overrides(&self, config: &mut PipelineConfig) {
        if let Some(server) = &self.server {
            config.comfyui_url = server.clone();
        }
        if let Some(dir) = &self.workflows_dir {
            config.workflows_dir = dir.clone();
        }
        if let Some(root) = &self.prompts_root {
            config.prompts_root = root.clone();
        }
    }
}
