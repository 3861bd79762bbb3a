//! `batchgen` -- batch image generation against ComfyUI.
//!
//! `batchgen watch` monitors `<PROMPTS_ROOT>/queue` and runs every prompt
//! file it finds through `batchgen run <file>` in a child process.
//!
//! Configuration comes from the environment (and `.env`); see
//! `PipelineConfig::from_env` for the full table. `--server`,
//! `--workflows-dir` and `--prompts-root` override it.

use std::process::ExitCode;

use batchgen_pipeline::config::PipelineConfig;
use batchgen_worker::cli::{Cli, Command};
use batchgen_worker::{commands, logging};
use clap::Parser;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    logging::init(cli.log_format);

    let mut config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::from(commands::EXIT_FAILURE);
        }
    };
    cli.apply_overrides(&mut config);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let result = match &cli.command {
        Command::Watch => commands::watch(&config, cli.log_format, cancel).await,
        Command::Run { file } => commands::run(&config, file, cancel).await,
        Command::Validate { names } => commands::validate(&config, names),
        Command::Ping => commands::ping(&config, cancel).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Fatal error");
            ExitCode::from(commands::EXIT_FAILURE)
        }
    }
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
