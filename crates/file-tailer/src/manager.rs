// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runs every configured pipe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{DaemonConfig, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::pipe::{Pipe, PipeError, PipeStatus};
use crate::writer::{ensure_stream, RestStreamWriter};

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct PipeManager {
    pipes: Vec<Pipe>,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
}

impl PipeManager {
    #[must_use]
    pub fn new(pipes: Vec<Pipe>) -> Self {
        Self {
            pipes,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Builds one pipe per configured entry, each writing to its own REST
    /// stream. Streams are created up front when the sink allows it.
    pub async fn from_config(config: &DaemonConfig) -> Self {
        let mut pipes = Vec::with_capacity(config.pipes.len());
        for pipe in &config.pipes {
            let writer = RestStreamWriter::new(&pipe.sink);
            ensure_stream(&writer).await;
            pipes.push(Pipe::new(pipe.clone(), Arc::new(writer)));
        }
        Self::new(pipes).with_timeouts(DEFAULT_STARTUP_TIMEOUT, config.shutdown_timeout)
    }

    #[must_use]
    pub fn with_timeouts(mut self, startup: Duration, shutdown: Duration) -> Self {
        self.startup_timeout = startup;
        self.shutdown_timeout = shutdown;
        self
    }

    #[must_use]
    pub fn pipes(&self) -> &[Pipe] {
        &self.pipes
    }

    /// Starts every pipe, then waits until all of them report healthy.
    ///
    /// Pipes are started one after the other. A pipe that fails to start is
    /// logged and does not keep the others from starting. Health is then
    /// polled every 100ms until every pipe is running, the startup timeout
    /// expires, or every unhealthy pipe has settled in a terminal state.
    ///
    /// Pipes that did start keep running on failure; call
    /// [`PipeManager::stop_all`] to bring them down.
    ///
    /// # Errors
    ///
    /// Returns [`PipeError::Unhealthy`] with the names of the pipes that were
    /// not healthy when the wait ended.
    pub async fn start_all(&mut self) -> Result<(), PipeError> {
        info!(pipes = self.pipes.len(), "Starting pipes");
        for pipe in &mut self.pipes {
            if let Err(e) = pipe.start().await {
                error!(pipe = pipe.name(), "Pipe did not start: {e}");
            }
        }

        let deadline = Instant::now() + self.startup_timeout;
        loop {
            let unhealthy: Vec<&Pipe> = self.pipes.iter().filter(|p| !p.is_healthy()).collect();
            if unhealthy.is_empty() {
                info!("All pipes running");
                return Ok(());
            }
            let settled = unhealthy
                .iter()
                .all(|p| matches!(p.status(), PipeStatus::Failed | PipeStatus::Stopped));
            if settled || Instant::now() >= deadline {
                let names: Vec<String> = unhealthy.iter().map(|p| p.name().to_string()).collect();
                error!(pipes = ?names, "Pipes are not healthy");
                return Err(PipeError::Unhealthy(names));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// Stops all pipes concurrently within the shutdown timeout.
    ///
    /// Every pipe shares the same deadline and aborts its own workers once it
    /// passes, so this always runs to completion: no pipe is left
    /// `Stopping` with detached workers.
    pub async fn stop_all(&mut self) {
        info!(pipes = self.pipes.len(), "Stopping pipes");
        let timeout = self.shutdown_timeout;
        join_all(self.pipes.iter_mut().map(|pipe| pipe.stop_within(timeout))).await;

        let failed: Vec<&str> = self
            .pipes
            .iter()
            .filter(|p| p.status() == PipeStatus::Failed)
            .map(Pipe::name)
            .collect();
        if failed.is_empty() {
            info!("All pipes stopped");
        } else {
            warn!(pipes = ?failed, "Pipes stopped, some had failed");
        }
    }

    #[must_use]
    pub fn health(&self) -> BTreeMap<String, PipeStatus> {
        self.pipes
            .iter()
            .map(|p| (p.name().to_string(), p.status()))
            .collect()
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.pipes.iter().all(Pipe::is_healthy)
    }
}
