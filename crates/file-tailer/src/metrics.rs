// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-pipe throughput counters and their periodic CSV export.
//!
//! The tailer and the uploader update [`PipeMetrics`] with plain atomic
//! operations. A single [`MetricsProcessor`] task owns the reset: on every
//! tick it swaps the counters out, appends one row to the statistics file
//! and starts a new window.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, NaiveDate};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const CSV_HEADER: &str = "Current Date,Pipe Name,File Name,Total Events Read,\
Total Events Ingested,Min Event Size,Average Event Size,Max Event Size,\
Min Write Latency,Average Write Latency,Max Write Latency";

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Running count, sum, min and max of one measurement. A min of zero means
/// nothing was recorded yet.
#[derive(Debug, Default)]
struct Stat {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Stat {
    fn record(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
        let _ = self
            .min
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current == 0 || value < current).then_some(value)
            });
    }

    fn take(&self) -> StatSnapshot {
        StatSnapshot {
            count: self.count.swap(0, Ordering::Relaxed),
            sum: self.sum.swap(0, Ordering::Relaxed),
            min: self.min.swap(0, Ordering::Relaxed),
            max: self.max.swap(0, Ordering::Relaxed),
        }
    }

    fn peek(&self) -> StatSnapshot {
        StatSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum: self.sum.load(Ordering::Relaxed),
            min: self.min.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatSnapshot {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl StatSnapshot {
    /// Mean rounded to three decimals, zero when nothing was recorded.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let avg = self.sum as f64 / self.count as f64;
        (avg * 1000.0).round() / 1000.0
    }
}

/// Counters shared by the tailer and the uploader of one pipe.
#[derive(Debug, Default)]
pub struct PipeMetrics {
    events_read: AtomicU64,
    events_ingested: AtomicU64,
    event_size: Stat,
    write_latency: Stat,
}

impl PipeMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A record of `size` bytes was read from the source file.
    pub fn on_read(&self, size: usize) {
        self.events_read.fetch_add(1, Ordering::Relaxed);
        self.event_size.record(size as u64);
    }

    /// An event was written to the stream after `latency`.
    pub fn on_ingest(&self, latency: Duration) {
        self.events_ingested.fetch_add(1, Ordering::Relaxed);
        self.write_latency
            .record(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
    }

    /// Current window without resetting it.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_read: self.events_read.load(Ordering::Relaxed),
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            event_size: self.event_size.peek(),
            write_latency: self.write_latency.peek(),
        }
    }

    /// Current window, starting a new one.
    pub fn snapshot_and_reset(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_read: self.events_read.swap(0, Ordering::Relaxed),
            events_ingested: self.events_ingested.swap(0, Ordering::Relaxed),
            event_size: self.event_size.take(),
            write_latency: self.write_latency.take(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub events_read: u64,
    pub events_ingested: u64,
    pub event_size: StatSnapshot,
    pub write_latency: StatSnapshot,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn to_csv_row(&self, now: &DateTime<Local>, pipe_name: &str, file_name: &str) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{}",
            now.format(DATE_FORMAT),
            pipe_name,
            file_name,
            self.events_read,
            self.events_ingested,
            self.event_size.min,
            self.event_size.average(),
            self.event_size.max,
            self.write_latency.min,
            self.write_latency.average(),
            self.write_latency.max,
        )
    }
}

/// Periodically appends the pipe's counters to its statistics file.
pub struct MetricsProcessor {
    pipe_name: String,
    file_name: String,
    path: PathBuf,
    interval: Duration,
    metrics: Arc<PipeMetrics>,
    cancel: CancellationToken,
    current_day: Option<NaiveDate>,
}

impl MetricsProcessor {
    #[must_use]
    pub fn new(
        pipe_name: impl Into<String>,
        file_name: impl Into<String>,
        path: impl Into<PathBuf>,
        interval: Duration,
        metrics: Arc<PipeMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pipe_name: pipe_name.into(),
            file_name: file_name.into(),
            path: path.into(),
            interval,
            metrics,
            cancel,
            current_day: None,
        }
    }

    /// Flushes on every interval until cancelled, then writes a final row.
    pub async fn run(mut self) {
        self.current_day = day_of_existing(&self.path).await;

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = interval.tick() => self.flush(Local::now()).await,
                () = self.cancel.cancelled() => {
                    self.flush(Local::now()).await;
                    break;
                }
            }
        }
        info!(pipe = %self.pipe_name, "Metrics processor stopped");
    }

    /// Appends one row for the window ending at `now`. Errors are logged.
    pub async fn flush(&mut self, now: DateTime<Local>) {
        let snapshot = self.metrics.snapshot_and_reset();
        if let Err(e) = self.append(&snapshot, now).await {
            error!(pipe = %self.pipe_name, path = %self.path.display(), "Failed to write metrics: {e}");
        }
    }

    async fn append(
        &mut self,
        snapshot: &MetricsSnapshot,
        now: DateTime<Local>,
    ) -> std::io::Result<()> {
        let today = now.date_naive();
        if let Some(day) = self.current_day.filter(|day| *day != today) {
            self.rotate(day).await?;
        }
        self.current_day = Some(today);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let is_new = tokio::fs::metadata(&self.path)
            .await
            .map_or(true, |m| m.len() == 0);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut body = String::new();
        if is_new {
            body.push_str(CSV_HEADER);
            body.push('\n');
        }
        body.push_str(&snapshot.to_csv_row(&now, &self.pipe_name, &self.file_name));
        body.push('\n');
        file.write_all(body.as_bytes()).await?;
        file.flush().await?;
        debug!(pipe = %self.pipe_name, "Flushed metrics: {snapshot:?}");
        Ok(())
    }

    async fn rotate(&self, day: NaiveDate) -> std::io::Result<()> {
        if tokio::fs::metadata(&self.path).await.is_err() {
            return Ok(());
        }
        let rotated = rotated_path(&self.path, day);
        tokio::fs::rename(&self.path, &rotated).await?;
        info!(pipe = %self.pipe_name, path = %rotated.display(), "Rotated metrics file");
        Ok(())
    }
}

/// `<path>.<YYYY-MM-DD>`
#[must_use]
pub fn rotated_path(path: &Path, day: NaiveDate) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", day.format("%Y-%m-%d")));
    PathBuf::from(name)
}

async fn day_of_existing(path: &Path) -> Option<NaiveDate> {
    let modified: SystemTime = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    Some(DateTime::<Local>::from(modified).date_naive())
}
