// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use file_tailer::charset::Charset;
use file_tailer::checkpoint::{CheckpointError, CheckpointStore, FileCheckpointStore};
use file_tailer::config::{PipeConfiguration, SinkConfiguration, SourceConfiguration};
use file_tailer::event::Checkpoint;
use file_tailer::writer::{StreamWriter, WriteError};

/// Records delivered payloads. Payloads listed in `rejected` always fail.
#[derive(Default)]
pub struct RecordingWriter {
    delivered: Mutex<Vec<String>>,
    rejected: Mutex<HashSet<String>>,
}

impl RecordingWriter {
    pub fn rejecting(payload: &str) -> Self {
        let writer = Self::default();
        writer.rejected.lock().unwrap().insert(payload.to_string());
        writer
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamWriter for RecordingWriter {
    async fn write(&self, payload: &str, _charset: Charset) -> Result<(), WriteError> {
        if self.rejected.lock().unwrap().contains(payload) {
            return Err(WriteError::Closed);
        }
        self.delivered.lock().unwrap().push(payload.to_string());
        Ok(())
    }

    async fn close(&self) {}
}

/// A file store that also remembers every save.
pub struct RecordingStore {
    inner: FileCheckpointStore,
    saves: Mutex<Vec<Checkpoint>>,
}

impl RecordingStore {
    pub fn new(path: &Path) -> Self {
        Self {
            inner: FileCheckpointStore::new(path),
            saves: Mutex::new(Vec::new()),
        }
    }

    pub fn saves(&self) -> Vec<Checkpoint> {
        self.saves.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckpointStore for RecordingStore {
    async fn save(&self, checkpoint: &Checkpoint) {
        self.inner.save(checkpoint).await;
        self.saves.lock().unwrap().push(checkpoint.clone());
    }

    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        self.inner.load().await
    }
}

/// A pipe reading `app.log` in `work_dir` with short intervals.
pub fn pipe_config(work_dir: &Path, state_dir: &Path) -> PipeConfiguration {
    let mut source = SourceConfiguration::new(work_dir, "app.log").unwrap();
    source.sleep_interval = Duration::from_millis(20);
    source.failure_sleep_interval = Duration::from_millis(20);
    let mut sink = SinkConfiguration::new("events", "localhost", 1);
    sink.failure_retry_limit = 1;
    sink.failure_sleep_interval = Duration::ZERO;
    let mut config = PipeConfiguration::new("it", state_dir, source, sink);
    config.stop_timeout = Duration::from_secs(2);
    config
}

pub fn append(path: &Path, data: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(data.as_bytes()).unwrap();
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
