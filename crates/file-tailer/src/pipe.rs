// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One tailer, queue, uploader and metrics processor run as a single unit.
//!
//! Workers start in dependency order (metrics, tailer, uploader) and stop in
//! reverse. A worker that fails on its own marks the pipe `Failed` and
//! cancels its siblings; other pipes are unaffected.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointError, CheckpointStore, FileCheckpointStore};
use crate::config::{ConfigError, PipeConfiguration};
use crate::metrics::{MetricsProcessor, PipeMetrics};
use crate::queue;
use crate::tailer::{ReadError, Tailer};
use crate::uploader::{UploadError, Uploader, UploaderConfig};
use crate::writer::StreamWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    /// A worker exited on its own.
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot load checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("work directory {} does not exist", .0.display())]
    WorkDirMissing(PathBuf),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("pipe {0} was already started")]
    AlreadyStarted(String),
    #[error("unhealthy pipes: {}", .0.join(", "))]
    Unhealthy(Vec<String>),
}

struct Worker {
    role: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Cancels the worker and waits for it until `deadline`.
    async fn stop(mut self, pipe: &str, deadline: Instant) {
        self.cancel.cancel();
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, &mut self.handle).await {
            Ok(Ok(())) => debug!(pipe, worker = self.role, "Worker stopped"),
            Ok(Err(e)) => error!(pipe, worker = self.role, "Worker panicked: {e}"),
            Err(_) => {
                warn!(pipe, worker = self.role, "Worker did not stop in time, aborting");
                self.handle.abort();
            }
        }
    }
}

struct Workers {
    root: CancellationToken,
    metrics: Worker,
    tailer: Worker,
    uploader: Worker,
}

impl Workers {
    fn iter(&self) -> impl Iterator<Item = &Worker> {
        [&self.metrics, &self.tailer, &self.uploader].into_iter()
    }
}

pub struct Pipe {
    config: PipeConfiguration,
    writer: Arc<dyn StreamWriter>,
    checkpoints: Arc<dyn CheckpointStore>,
    metrics: Arc<PipeMetrics>,
    status: Arc<watch::Sender<PipeStatus>>,
    workers: Option<Workers>,
    started: bool,
}

impl Pipe {
    /// Checkpoints go to the configured state file.
    #[must_use]
    pub fn new(config: PipeConfiguration, writer: Arc<dyn StreamWriter>) -> Self {
        let checkpoints = Arc::new(FileCheckpointStore::new(config.state_file.clone()));
        Self::with_checkpoint_store(config, writer, checkpoints)
    }

    #[must_use]
    pub fn with_checkpoint_store(
        config: PipeConfiguration,
        writer: Arc<dyn StreamWriter>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let (status, _) = watch::channel(PipeStatus::Stopped);
        Self {
            config,
            writer,
            checkpoints,
            metrics: PipeMetrics::new(),
            status: Arc::new(status),
            workers: None,
            started: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &PipeConfiguration {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<PipeMetrics> {
        Arc::clone(&self.metrics)
    }

    #[must_use]
    pub fn status(&self) -> PipeStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<PipeStatus> {
        self.status.subscribe()
    }

    /// Running with every worker still alive.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status() == PipeStatus::Running
            && self
                .workers
                .as_ref()
                .is_some_and(|w| w.iter().all(|worker| !worker.handle.is_finished()))
    }

    /// Loads the checkpoint and spawns the pipe's workers.
    ///
    /// Workers come up in dependency order: the metrics processor first so
    /// the others can record into it, then the tailer (resuming from the
    /// loaded checkpoint, if any), then the uploader. Each runs on a child of
    /// one root cancellation token; a worker that exits with an error marks
    /// the pipe [`PipeStatus::Failed`] and cancels the root.
    ///
    /// A pipe starts once. Build a new [`Pipe`] to run the same configuration
    /// again after [`Pipe::stop`].
    ///
    /// # Errors
    ///
    /// * [`PipeError::AlreadyStarted`] - `start` was already called
    /// * [`PipeError::WorkDirMissing`] - the source directory does not exist
    /// * [`PipeError::Checkpoint`] - the state file exists but cannot be read
    ///
    /// On any error the status becomes [`PipeStatus::Failed`] and no worker
    /// is left running.
    pub async fn start(&mut self) -> Result<(), PipeError> {
        if self.started {
            return Err(PipeError::AlreadyStarted(self.config.name.clone()));
        }
        self.started = true;
        self.status.send_replace(PipeStatus::Starting);
        info!(
            pipe = %self.config.name,
            file = %self.config.source.file_path().display(),
            "Starting pipe"
        );

        match self.spawn_workers().await {
            Ok(workers) => {
                self.workers = Some(workers);
                self.status.send_if_modified(|status| {
                    let starting = *status == PipeStatus::Starting;
                    if starting {
                        *status = PipeStatus::Running;
                    }
                    starting
                });
                Ok(())
            }
            Err(e) => {
                error!(pipe = %self.config.name, "Failed to start pipe: {e}");
                self.status.send_replace(PipeStatus::Failed);
                Err(e)
            }
        }
    }

    async fn spawn_workers(&self) -> Result<Workers, PipeError> {
        let source = &self.config.source;
        let work_dir_exists = tokio::fs::metadata(&source.work_dir)
            .await
            .is_ok_and(|m| m.is_dir());
        if !work_dir_exists {
            return Err(PipeError::WorkDirMissing(source.work_dir.clone()));
        }
        let resume_from = self.checkpoints.load().await?;

        let (tx, rx) = queue::channel(self.config.queue_size);
        let root = CancellationToken::new();

        let cancel = root.child_token();
        let processor = MetricsProcessor::new(
            self.config.name.clone(),
            source.file_name.clone(),
            self.config.statistics_file.clone(),
            self.config.statistics_sleep_interval,
            Arc::clone(&self.metrics),
            cancel.clone(),
        );
        let metrics = self.spawn_worker("metrics", cancel, &root, async move {
            processor.run().await;
            Ok::<(), PipeError>(())
        });

        let cancel = root.child_token();
        let tailer = Tailer::new(
            self.config.name.clone(),
            source.clone(),
            tx,
            Arc::clone(&self.metrics),
            cancel.clone(),
            resume_from,
        );
        let tailer = self.spawn_worker("tailer", cancel, &root, tailer.run());

        let cancel = root.child_token();
        let sink = &self.config.sink;
        let uploader = Uploader::new(
            UploaderConfig {
                pipe_name: self.config.name.clone(),
                writer: Arc::clone(&self.writer),
                checkpoints: Arc::clone(&self.checkpoints),
                metrics: Arc::clone(&self.metrics),
                pack_size: sink.pack_size,
                writer_pool_size: sink.writer_pool_size,
                retry_strategy: sink.retry_strategy(),
            },
            rx,
            cancel.clone(),
        );
        let uploader = self.spawn_worker("uploader", cancel, &root, uploader.run());

        Ok(Workers {
            root,
            metrics,
            tailer,
            uploader,
        })
    }

    fn spawn_worker<F, E>(
        &self,
        role: &'static str,
        cancel: CancellationToken,
        root: &CancellationToken,
        task: F,
    ) -> Worker
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<PipeError> + Send + 'static,
    {
        let pipe = self.config.name.clone();
        let status = Arc::clone(&self.status);
        let root = root.clone();
        let handle = tokio::spawn(async move {
            match task.await {
                Ok(()) => debug!(pipe = %pipe, worker = role, "Worker exited"),
                Err(e) => {
                    let e: PipeError = e.into();
                    error!(pipe = %pipe, worker = role, "Worker failed: {e}");
                    status.send_if_modified(|s| {
                        let active = matches!(*s, PipeStatus::Starting | PipeStatus::Running);
                        if active {
                            *s = PipeStatus::Failed;
                        }
                        active
                    });
                    root.cancel();
                }
            }
        });
        Worker {
            role,
            cancel,
            handle,
        }
    }

    /// Stops within the configured stop timeout.
    pub async fn stop(&mut self) {
        self.stop_within(self.config.stop_timeout).await;
    }

    /// Stops the uploader, the tailer and the metrics processor in that order,
    /// sharing one deadline. Workers still running at the deadline are
    /// aborted. Calling it again is a no-op.
    pub async fn stop_within(&mut self, timeout: Duration) {
        let Some(workers) = self.workers.take() else {
            return;
        };
        let pipe = self.config.name.clone();
        self.status.send_if_modified(|s| {
            let failed = *s == PipeStatus::Failed;
            if !failed {
                *s = PipeStatus::Stopping;
            }
            !failed
        });
        info!(pipe = %pipe, "Stopping pipe");

        let deadline = Instant::now() + timeout;
        let Workers {
            root,
            metrics,
            tailer,
            uploader,
        } = workers;
        for worker in [uploader, tailer, metrics] {
            worker.stop(&pipe, deadline).await;
        }
        root.cancel();
        self.writer.close().await;

        self.status.send_if_modified(|s| {
            let failed = *s == PipeStatus::Failed;
            if !failed {
                *s = PipeStatus::Stopped;
            }
            !failed
        });
        info!(pipe = %pipe, status = ?self.status(), "Pipe stopped");
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.root.cancel();
            for worker in workers.iter() {
                worker.handle.abort();
            }
        }
    }
}
