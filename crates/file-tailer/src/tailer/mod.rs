// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The reading half of a pipe.
//!
//! A [`Tailer`] keeps one source file open and polls it:
//!
//! ```text
//!            ┌────────────── grew ──────────────┐
//!            ▼                                  │
//!   poll ─► read complete records ─► put ───────┘
//!    │
//!    └─ idle ─► still the live file? ── yes ─► sleep
//!                     │
//!                     no ─► next sibling? ── yes ─► switch, position 0
//!                                  │
//!                                  no ─► sleep (or error if the file was deleted)
//! ```
//!
//! The open handle follows the file across renames, so a rotated file is
//! drained before the tailer moves on. Only separator-terminated records are
//! emitted; a trailing partial record is read again on the next cycle.

pub mod record;
pub mod rotation;

use std::io::{self, ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SourceConfiguration;
use crate::event::{content_hash, Checkpoint, Event};
use crate::metrics::PipeMetrics;
use crate::queue::EventSender;
use record::RecordSplitter;
use rotation::{identity, list_log_files, modified_millis, next_after, sort_key, FileIdentity, LogFilter};

const READ_CHUNK: usize = 64 * 1024;
/// Longest record whose hash is checked when resuming.
const VERIFY_WINDOW: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("work directory {} does not exist", .0.display())]
    WorkDirMissing(PathBuf),
    #[error("tracked file {} was deleted", .0.display())]
    SourceMissing(PathBuf),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("giving up after {attempts} consecutive failures: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ReadError>,
    },
}

fn io_error(path: &Path) -> impl Fn(io::Error) -> ReadError + '_ {
    move |source| ReadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The file being read and how far it has been enqueued.
struct Tracked {
    path: PathBuf,
    name: String,
    file: File,
    identity: Option<FileIdentity>,
    position: u64,
    last_modify_time: i64,
    content_hash: i32,
}

impl Tracked {
    async fn open(path: PathBuf, position: u64, content_hash: i32) -> Result<Self, ReadError> {
        let file = File::open(&path).await.map_err(io_error(&path))?;
        let meta = file.metadata().await.map_err(io_error(&path))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            file,
            identity: identity(&meta),
            position,
            last_modify_time: modified_millis(&meta),
            content_hash,
            path,
        })
    }
}

enum Cycle {
    Read,
    Switched,
    Idle,
    Stopped,
}

pub struct Tailer {
    pipe_name: String,
    source: SourceConfiguration,
    filter: LogFilter,
    queue: EventSender,
    metrics: Arc<PipeMetrics>,
    cancel: CancellationToken,
    resume_from: Option<Checkpoint>,
}

impl Tailer {
    #[must_use]
    pub fn new(
        pipe_name: impl Into<String>,
        source: SourceConfiguration,
        queue: EventSender,
        metrics: Arc<PipeMetrics>,
        cancel: CancellationToken,
        resume_from: Option<Checkpoint>,
    ) -> Self {
        let filter = LogFilter::new(source.file_name.clone(), source.rotation_pattern.clone());
        Self {
            pipe_name: pipe_name.into(),
            source,
            filter,
            queue,
            metrics,
            cancel,
            resume_from,
        }
    }

    /// Tails the configured file until cancelled.
    ///
    /// The first file is chosen from the resume checkpoint when one was
    /// given: the checkpointed file, a rotated copy of it, or any sibling
    /// written to since, provided the record ending at the checkpointed
    /// position still hashes the same. Otherwise reading starts at the
    /// beginning of the configured file, waiting for it to appear.
    ///
    /// Each cycle then reads new complete records, detects truncation and
    /// moves on to the next sibling once the tracked file has been rotated
    /// away. Idle cycles sleep for `sleep_interval`, failed ones for
    /// `failure_sleep_interval`.
    ///
    /// # Errors
    ///
    /// * [`ReadError::WorkDirMissing`] - the work directory does not exist
    /// * [`ReadError::RetriesExhausted`] - more than `failure_retry_limit`
    ///   consecutive cycles failed; a limit of zero retries forever
    pub async fn run(mut self) -> Result<(), ReadError> {
        let work_dir_exists = tokio::fs::metadata(&self.source.work_dir)
            .await
            .is_ok_and(|m| m.is_dir());
        if !work_dir_exists {
            return Err(ReadError::WorkDirMissing(self.source.work_dir.clone()));
        }
        info!(
            pipe = %self.pipe_name,
            file = %self.source.file_path().display(),
            "Tailer started"
        );

        let mut tracked: Option<Tracked> = None;
        let mut failures: u32 = 0;
        while !self.cancel.is_cancelled() {
            let cycle = if let Some(current) = tracked.as_mut() {
                self.poll(current).await
            } else {
                match self.open_initial().await {
                    Ok(Some(opened)) => {
                        tracked = Some(opened);
                        Ok(Cycle::Switched)
                    }
                    Ok(None) => Ok(Cycle::Idle),
                    Err(e) => Err(e),
                }
            };

            match cycle {
                Ok(Cycle::Read | Cycle::Switched) => failures = 0,
                Ok(Cycle::Idle) => {
                    failures = 0;
                    if !self.pause(self.source.sleep_interval).await {
                        break;
                    }
                }
                Ok(Cycle::Stopped) => break,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let limit = self.source.failure_retry_limit;
                    if limit > 0 && failures > limit {
                        error!(pipe = %self.pipe_name, "Tailer giving up: {e}");
                        return Err(ReadError::RetriesExhausted {
                            attempts: failures,
                            last: Box::new(e),
                        });
                    }
                    warn!(pipe = %self.pipe_name, attempt = failures, "Read failed: {e}");
                    if !self.pause(self.source.failure_sleep_interval).await {
                        break;
                    }
                }
            }
        }

        info!(pipe = %self.pipe_name, "Tailer stopped");
        Ok(())
    }

    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    /// Picks the first file to read: the checkpointed one when it can be
    /// found, otherwise the configured file from its start. `None` while the
    /// configured file does not exist yet.
    async fn open_initial(&mut self) -> Result<Option<Tracked>, ReadError> {
        if let Some(checkpoint) = self.resume_from.clone() {
            let resumed = self.resume(&checkpoint).await?;
            self.resume_from = None;
            if resumed.is_some() {
                return Ok(resumed);
            }
            warn!(
                pipe = %self.pipe_name,
                checkpoint = checkpoint.file_name(),
                "No file matches the checkpoint, reading the configured file from the start"
            );
        }

        let path = self.source.file_path();
        match Tracked::open(path, 0, 0).await {
            Ok(tracked) => Ok(Some(tracked)),
            Err(ReadError::Io { source, path }) if source.kind() == ErrorKind::NotFound => {
                debug!(pipe = %self.pipe_name, file = %path.display(), "Waiting for file to appear");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn resume(&self, checkpoint: &Checkpoint) -> Result<Option<Tracked>, ReadError> {
        let work_dir = &self.source.work_dir;
        let files = list_log_files(work_dir, &self.filter)
            .await
            .map_err(io_error(work_dir))?;
        let name = Path::new(checkpoint.file_name())
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(checkpoint.file_name());

        // The checkpointed file under its name, then a rotated copy that kept
        // its mtime, then anything written to since, oldest first. A renamed
        // or copied file that grew while we were down only shows up in the
        // last group.
        let last_modified = checkpoint.last_modify_time();
        let same_name = files.iter().filter(|f| f.name == name);
        let same_mtime = files
            .iter()
            .filter(|f| f.name != name && f.modified == last_modified);
        let newer = files
            .iter()
            .filter(|f| f.name != name && f.modified > last_modified);
        for candidate in same_name.chain(same_mtime).chain(newer) {
            let mut tracked = Tracked::open(candidate.path.clone(), 0, 0).await?;
            let verified = verify_position(
                &mut tracked.file,
                checkpoint.position(),
                checkpoint.content_hash(),
                self.source.record_separator,
            )
            .await
            .map_err(io_error(&candidate.path))?;
            if verified {
                info!(
                    pipe = %self.pipe_name,
                    file = %candidate.path.display(),
                    position = checkpoint.position(),
                    "Resuming from checkpoint"
                );
                tracked.position = checkpoint.position();
                tracked.content_hash = checkpoint.content_hash();
                return Ok(Some(tracked));
            }
            debug!(
                pipe = %self.pipe_name,
                file = %candidate.path.display(),
                "Checkpoint does not match file content"
            );
        }

        let current = sort_key(checkpoint.last_modify_time(), name);
        match next_after(&files, current, None) {
            Some(next) => {
                warn!(
                    pipe = %self.pipe_name,
                    file = %next.path.display(),
                    "Checkpointed file is gone or was replaced, starting at the next file"
                );
                Tracked::open(next.path.clone(), 0, 0).await.map(Some)
            }
            None => Ok(None),
        }
    }

    async fn poll(&self, tracked: &mut Tracked) -> Result<Cycle, ReadError> {
        let meta = tracked
            .file
            .metadata()
            .await
            .map_err(io_error(&tracked.path))?;
        let size = meta.len();
        let modified = modified_millis(&meta);

        if size < tracked.position {
            warn!(
                pipe = %self.pipe_name,
                file = %tracked.path.display(),
                size,
                position = tracked.position,
                "File was truncated, reading it from the start"
            );
            tracked.position = 0;
        }
        if size > tracked.position {
            match self.read_records(tracked, size, modified).await? {
                None => return Ok(Cycle::Stopped),
                Some(0) => {}
                Some(_) => return Ok(Cycle::Read),
            }
        }
        self.rotate(tracked, modified).await
    }

    /// Enqueues every complete record between the tracked position and
    /// `size`. `None` when the pipe stopped while waiting on the queue.
    ///
    /// Reading stops at `size` so that `modified`, taken from the same stat,
    /// covers every byte the emitted checkpoints point into.
    async fn read_records(
        &self,
        tracked: &mut Tracked,
        size: u64,
        modified: i64,
    ) -> Result<Option<usize>, ReadError> {
        let path = tracked.path.clone();
        let file_name = path.display().to_string();
        tracked
            .file
            .seek(SeekFrom::Start(tracked.position))
            .await
            .map_err(io_error(&path))?;

        let charset = self.source.charset;
        let mut splitter = RecordSplitter::new(self.source.record_separator);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut emitted = 0;
        let mut remaining = size.saturating_sub(tracked.position);
        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(READ_CHUNK, |r| r.min(READ_CHUNK));
            let n = tracked
                .file
                .read(&mut buf[..want])
                .await
                .map_err(io_error(&path))?;
            if n == 0 {
                break;
            }
            remaining = remaining.saturating_sub(n as u64);
            splitter.push(&buf[..n]);
            while let Some(record) = splitter.next_record() {
                let position = tracked.position + record.len() as u64 + 1;
                let hash = content_hash(&record);
                let event = Event::new(
                    Checkpoint::new(file_name.clone(), position, hash, modified),
                    charset.decode(&record),
                    charset,
                );
                self.metrics.on_read(record.len());
                if self.queue.put(event, &self.cancel).await.is_err() {
                    return Ok(None);
                }
                tracked.position = position;
                tracked.content_hash = hash;
                tracked.last_modify_time = modified;
                emitted += 1;
            }
        }
        if emitted > 0 {
            debug!(
                pipe = %self.pipe_name,
                file = %file_name,
                records = emitted,
                position = tracked.position,
                "Read records"
            );
        }
        Ok(Some(emitted))
    }

    /// Runs when the tracked file has nothing new. Moves to the next sibling
    /// once the tracked file is no longer the live one.
    async fn rotate(&self, tracked: &mut Tracked, modified: i64) -> Result<Cycle, ReadError> {
        let at_path = tokio::fs::metadata(&tracked.path).await.ok();
        let still_named = at_path
            .as_ref()
            .is_some_and(|meta| identity(meta) == tracked.identity);
        if still_named && tracked.path == self.source.file_path() {
            return Ok(Cycle::Idle);
        }

        let work_dir = &self.source.work_dir;
        let files = list_log_files(work_dir, &self.filter)
            .await
            .map_err(io_error(work_dir))?;
        let renamed_to = files
            .iter()
            .find(|f| tracked.identity.is_some() && f.identity == tracked.identity);
        let current_name = renamed_to.map_or(tracked.name.as_str(), |f| f.name.as_str());

        let Some(next) = next_after(&files, sort_key(modified, current_name), tracked.identity)
        else {
            if at_path.is_none() && renamed_to.is_none() {
                return Err(ReadError::SourceMissing(tracked.path.clone()));
            }
            return Ok(Cycle::Idle);
        };

        info!(
            pipe = %self.pipe_name,
            from = %tracked.path.display(),
            to = %next.path.display(),
            position = tracked.position,
            last_modify_time = tracked.last_modify_time,
            last_hash = tracked.content_hash,
            "Switching to next file"
        );
        *tracked = Tracked::open(next.path.clone(), 0, 0).await?;
        Ok(Cycle::Switched)
    }
}

/// Checks that the record ending at `position` hashes to `expected`.
async fn verify_position(
    file: &mut File,
    position: u64,
    expected: i32,
    separator: u8,
) -> io::Result<bool> {
    if position == 0 {
        return Ok(true);
    }
    if file.metadata().await?.len() < position {
        return Ok(false);
    }
    let window = position.min(VERIFY_WINDOW);
    let start = position - window;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; usize::try_from(window).unwrap_or(0)];
    file.read_exact(&mut buf).await?;

    let Some((&last, body)) = buf.split_last() else {
        return Ok(false);
    };
    if last != separator {
        return Ok(false);
    }
    let record = match body.iter().rposition(|&b| b == separator) {
        Some(idx) => &body[idx + 1..],
        None if start == 0 => body,
        // Longer than the window, nothing to compare against.
        None => return Ok(true),
    };
    Ok(content_hash(record) == expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{channel, EventReceiver};
    use std::io::Write;

    fn source(dir: &Path) -> SourceConfiguration {
        let mut source = SourceConfiguration::new(dir, "app.log").unwrap();
        source.sleep_interval = Duration::from_millis(20);
        source.failure_sleep_interval = Duration::from_millis(20);
        source
    }

    fn append(path: &Path, data: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(data.as_bytes()).unwrap();
    }

    async fn next_payload(rx: &mut EventReceiver) -> Event {
        let cancel = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(5), rx.take(&cancel))
            .await
            .expect("timed out waiting for event")
            .unwrap()
    }

    fn spawn(
        source: SourceConfiguration,
        resume_from: Option<Checkpoint>,
    ) -> (
        EventReceiver,
        CancellationToken,
        tokio::task::JoinHandle<Result<(), ReadError>>,
    ) {
        let (tx, rx) = channel(16);
        let cancel = CancellationToken::new();
        let tailer = Tailer::new(
            "test",
            source,
            tx,
            Arc::new(PipeMetrics::default()),
            cancel.clone(),
            resume_from,
        );
        (rx, cancel, tokio::spawn(tailer.run()))
    }

    #[tokio::test]
    async fn emits_only_terminated_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "first\nsec");

        let (mut rx, cancel, handle) = spawn(source(dir.path()), None);
        let first = next_payload(&mut rx).await;
        assert_eq!(first.payload(), "first");
        assert_eq!(first.checkpoint().position(), 6);
        assert_eq!(first.checkpoint().content_hash(), content_hash(b"first"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.is_empty(), "partial record must not be emitted");

        append(&path, "ond\n");
        let second = next_payload(&mut rx).await;
        assert_eq!(second.payload(), "second");
        assert_eq!(second.checkpoint().position(), 13);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn waits_for_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rx, cancel, handle) = spawn(source(dir.path()), None);

        tokio::time::sleep(Duration::from_millis(60)).await;
        append(&dir.path().join("app.log"), "late\n");
        assert_eq!(next_payload(&mut rx).await.payload(), "late");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn resumes_after_verified_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "one\ntwo\nthree\n");
        let checkpoint = Checkpoint::new(path.display().to_string(), 8, content_hash(b"two"), 0);

        let (mut rx, cancel, handle) = spawn(source(dir.path()), Some(checkpoint));
        let event = next_payload(&mut rx).await;
        assert_eq!(event.payload(), "three");
        assert_eq!(event.checkpoint().position(), 14);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn restarts_file_when_checkpoint_hash_differs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "xyz\nabc\n");
        let checkpoint = Checkpoint::new(path.display().to_string(), 4, content_hash(b"old"), 0);

        let (mut rx, cancel, handle) = spawn(source(dir.path()), Some(checkpoint));
        assert_eq!(next_payload(&mut rx).await.payload(), "xyz");
        assert_eq!(next_payload(&mut rx).await.payload(), "abc");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn resumes_in_rotated_file_that_grew_after_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "one\ntwo\n");
        let checkpoint = Checkpoint::new(path.display().to_string(), 8, content_hash(b"two"), 1);

        append(&path, "three\n");
        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        append(&path, "four\n");

        let (mut rx, cancel, handle) = spawn(source(dir.path()), Some(checkpoint));
        let event = next_payload(&mut rx).await;
        assert_eq!(event.payload(), "three");
        assert!(event.checkpoint().file_name().ends_with("app.log.1"));
        assert_eq!(event.checkpoint().position(), 14);
        assert_eq!(next_payload(&mut rx).await.payload(), "four");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reads_no_further_than_the_stat_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "first\nsecond\n");

        let (tx, mut rx) = channel(16);
        let tailer = Tailer::new(
            "test",
            source(dir.path()),
            tx,
            Arc::new(PipeMetrics::default()),
            CancellationToken::new(),
            None,
        );
        let mut tracked = Tracked::open(path.clone(), 0, 0).await.unwrap();
        let emitted = tailer.read_records(&mut tracked, 6, 42).await.unwrap();

        assert_eq!(emitted, Some(1));
        assert_eq!(tracked.position, 6);
        assert_eq!(rx.len(), 1);
        let event = next_payload(&mut rx).await;
        assert_eq!(event.payload(), "first");
        assert_eq!(event.checkpoint().last_modify_time(), 42);
    }

    #[tokio::test]
    async fn missing_work_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (_rx, _cancel, handle) = spawn(source(&dir.path().join("missing")), None);
        assert!(matches!(
            handle.await.unwrap(),
            Err(ReadError::WorkDirMissing(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deleted_file_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "only\n");
        let mut config = source(dir.path());
        config.failure_retry_limit = 2;

        let (mut rx, _cancel, handle) = spawn(config, None);
        assert_eq!(next_payload(&mut rx).await.payload(), "only");
        std::fs::remove_file(&path).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        match result {
            Err(ReadError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ReadError::SourceMissing(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn verify_position_checks_last_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"alpha\nbeta\n").unwrap();
        let mut file = File::open(&path).await.unwrap();

        assert!(verify_position(&mut file, 0, 0, b'\n').await.unwrap());
        assert!(verify_position(&mut file, 6, content_hash(b"alpha"), b'\n').await.unwrap());
        assert!(verify_position(&mut file, 11, content_hash(b"beta"), b'\n').await.unwrap());
        assert!(!verify_position(&mut file, 11, content_hash(b"alpha"), b'\n').await.unwrap());
        assert!(!verify_position(&mut file, 5, content_hash(b"alph"), b'\n').await.unwrap());
        assert!(!verify_position(&mut file, 50, 0, b'\n').await.unwrap());
    }
}
