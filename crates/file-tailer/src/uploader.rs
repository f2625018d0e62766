// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The writing half of a pipe.
//!
//! The uploader fills an [`EventPack`] from the queue. Once the pack is full
//! every event is written concurrently, bounded by the writer pool, each
//! with its own retries. The pack's checkpoint is saved only when every
//! event made it; a single exhausted event stops the uploader so a restart
//! replays the whole pack.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::checkpoint::CheckpointStore;
use crate::event::Event;
use crate::metrics::PipeMetrics;
use crate::pack::EventPack;
use crate::queue::{EventReceiver, QueueError};
use crate::retry::RetryStrategy;
use crate::writer::StreamWriter;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("{failed} of {total} events in the pack could not be written")]
    PackFailed { failed: usize, total: usize },
    #[error("{0} events did not fit in the pack")]
    Overflow(usize),
    #[error("upload cancelled")]
    Cancelled,
}

pub struct UploaderConfig {
    pub pipe_name: String,
    pub writer: Arc<dyn StreamWriter>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub metrics: Arc<PipeMetrics>,
    pub pack_size: usize,
    pub writer_pool_size: usize,
    pub retry_strategy: RetryStrategy,
}

pub struct Uploader {
    pipe_name: String,
    queue: EventReceiver,
    writer: Arc<dyn StreamWriter>,
    checkpoints: Arc<dyn CheckpointStore>,
    metrics: Arc<PipeMetrics>,
    pool: Arc<Semaphore>,
    pack_size: usize,
    retry_strategy: RetryStrategy,
    cancel: CancellationToken,
}

impl Uploader {
    #[must_use]
    pub fn new(config: UploaderConfig, queue: EventReceiver, cancel: CancellationToken) -> Self {
        Self {
            pipe_name: config.pipe_name,
            queue,
            writer: config.writer,
            checkpoints: config.checkpoints,
            metrics: config.metrics,
            pool: Arc::new(Semaphore::new(config.writer_pool_size.max(1))),
            pack_size: config.pack_size,
            retry_strategy: config.retry_strategy,
            cancel,
        }
    }

    /// Uploads full packs until cancelled or the tailer goes away.
    ///
    /// Events are taken from the queue into the current pack. Once it is
    /// full, every event is written concurrently through the writer pool,
    /// each retried according to the retry strategy, and the pack's highest
    /// checkpoint is saved after all of them succeeded.
    ///
    /// Events of a pack that never filled are left unacknowledged; the
    /// tailer reads them again after a restart.
    ///
    /// # Errors
    ///
    /// * [`UploadError::PackFailed`] - an event exhausted its retries, the
    ///   pack's checkpoint was not saved
    /// * [`UploadError::Overflow`] - more events were drained than the pack
    ///   can hold
    pub async fn run(mut self) -> Result<(), UploadError> {
        info!(pipe = %self.pipe_name, pack_size = self.pack_size, "Uploader started");
        let mut pack = EventPack::new(self.pack_size);
        loop {
            let event = match self.queue.take(&self.cancel).await {
                Ok(event) => event,
                Err(QueueError::Cancelled) => break,
                Err(QueueError::Closed) => {
                    debug!(pipe = %self.pipe_name, "Event queue closed");
                    break;
                }
            };

            let mut batch = vec![event];
            self.queue
                .drain_to(&mut batch, pack.remaining().saturating_sub(1));
            if let Err(rejected) = pack.add_all(batch) {
                return Err(UploadError::Overflow(rejected.len()));
            }
            if !pack.is_full() {
                continue;
            }

            match self.flush(&mut pack).await {
                Ok(()) => {}
                Err(UploadError::Cancelled) => break,
                Err(e) => {
                    error!(pipe = %self.pipe_name, "Uploader stopping: {e}");
                    return Err(e);
                }
            }
        }
        if !pack.is_empty() {
            debug!(
                pipe = %self.pipe_name,
                events = pack.len(),
                "Leaving partial pack unacknowledged"
            );
        }
        info!(pipe = %self.pipe_name, "Uploader stopped");
        Ok(())
    }

    async fn flush(&self, pack: &mut EventPack) -> Result<(), UploadError> {
        let started = Instant::now();
        self.upload_pack(pack).await?;
        if let Some(checkpoint) = pack.checkpoint() {
            self.checkpoints.save(checkpoint).await;
        }
        debug!(
            pipe = %self.pipe_name,
            events = pack.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "Uploaded pack"
        );
        pack.clear();
        Ok(())
    }

    /// Writes every event of the pack and waits for all of them.
    async fn upload_pack(&self, pack: &EventPack) -> Result<(), UploadError> {
        let total = pack.len();
        let mut pending = JoinSet::new();
        for event in pack.events() {
            let event = event.clone();
            let pipe_name = self.pipe_name.clone();
            let writer = Arc::clone(&self.writer);
            let pool = Arc::clone(&self.pool);
            let metrics = Arc::clone(&self.metrics);
            let retry_strategy = self.retry_strategy;
            pending.spawn(async move {
                write_event(
                    &pipe_name,
                    writer.as_ref(),
                    &pool,
                    retry_strategy,
                    &metrics,
                    &event,
                )
                .await
            });
        }

        let mut failed = 0;
        loop {
            let joined = tokio::select! {
                () = self.cancel.cancelled() => {
                    pending.abort_all();
                    return Err(UploadError::Cancelled);
                }
                joined = pending.join_next() => joined,
            };
            match joined {
                None => break,
                Some(Ok(true)) => {}
                Some(Ok(false)) => failed += 1,
                Some(Err(e)) => {
                    error!(pipe = %self.pipe_name, "Write task failed: {e}");
                    failed += 1;
                }
            }
        }

        if failed == 0 {
            Ok(())
        } else {
            Err(UploadError::PackFailed { failed, total })
        }
    }
}

/// Returns whether the event was delivered.
async fn write_event(
    pipe_name: &str,
    writer: &dyn StreamWriter,
    pool: &Semaphore,
    retry_strategy: RetryStrategy,
    metrics: &PipeMetrics,
    event: &Event,
) -> bool {
    let attempts = retry_strategy.attempts();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = {
            let Ok(_permit) = pool.acquire().await else {
                return false;
            };
            let started = Instant::now();
            writer
                .write(event.payload(), event.charset())
                .await
                .map(|()| started.elapsed())
        };
        match result {
            Ok(latency) => {
                metrics.on_ingest(latency);
                return true;
            }
            Err(e) if attempt >= attempts => {
                let checkpoint = event.checkpoint();
                error!(
                    pipe = %pipe_name,
                    file = checkpoint.file_name(),
                    position = checkpoint.position(),
                    attempts,
                    "Event could not be written: {e}"
                );
                return false;
            }
            Err(e) => {
                debug!(pipe = %pipe_name, attempt, "Write failed, retrying: {e}");
                if let Some(delay) = retry_strategy.delay() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
