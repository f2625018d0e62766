// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use file_tailer::config::DaemonConfig;
use file_tailer::manager::PipeManager;

const CONFIG_PATH_ENV: &str = "FILE_TAILER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/file-tailer/conf/file-tailer.yaml";

#[tokio::main]
pub async fn main() -> ExitCode {
    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var(CONFIG_PATH_ENV).ok())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);

    let config = match DaemonConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            // Logging is configured from the file, so report on stderr.
            eprintln!("file-tailer: {}: {e}", config_path.display());
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("file-tailer: cannot initialize logging: {e}");
        return ExitCode::FAILURE;
    }
    info!(
        config = %config_path.display(),
        daemon_dir = %config.daemon_dir.display(),
        pipes = config.pipes.len(),
        "Starting file tailer"
    );

    let mut manager = PipeManager::from_config(&config).await;
    if let Err(e) = manager.start_all().await {
        error!("Startup failed: {e}");
        manager.stop_all().await;
        return ExitCode::FAILURE;
    }

    if let Err(e) = shutdown_signal().await {
        error!("Cannot listen for shutdown signals: {e}");
    }
    info!("Shutdown requested");
    manager.stop_all().await;

    let failed: Vec<_> = manager
        .health()
        .into_iter()
        .filter(|(_, status)| *status == file_tailer::pipe::PipeStatus::Failed)
        .map(|(name, _)| name)
        .collect();
    if failed.is_empty() {
        info!("File tailer stopped");
        ExitCode::SUCCESS
    } else {
        error!(pipes = ?failed, "File tailer stopped with failed pipes");
        ExitCode::FAILURE
    }
}

fn init_logging(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    // Dependency noise stays off regardless of level.
    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", level.to_lowercase());
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter)?)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
