// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{append, pipe_config, wait_until, RecordingStore, RecordingWriter};
use file_tailer::checkpoint::{CheckpointStore, FileCheckpointStore};
use file_tailer::metrics::PipeMetrics;
use file_tailer::pipe::{Pipe, PipeStatus};
use file_tailer::queue;
use file_tailer::tailer::Tailer;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn delivers_lines_in_order_with_a_checkpoint_per_pack() {
    let logs = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let mut config = pipe_config(logs.path(), state.path());
    config.queue_size = 1;
    config.sink.pack_size = 1;
    config.source.sleep_interval = Duration::from_millis(200);

    let writer = Arc::new(RecordingWriter::default());
    let store = Arc::new(RecordingStore::new(&config.state_file));
    let mut pipe = Pipe::with_checkpoint_store(config, writer.clone(), store.clone());
    pipe.start().await.unwrap();

    let log = logs.path().join("app.log");
    for line in ["a", "b", "c"] {
        append(&log, &format!("{line}\n"));
    }
    wait_until("three checkpoints", || store.saves().len() == 3).await;
    pipe.stop().await;

    assert_eq!(writer.delivered(), ["a", "b", "c"]);
    let positions: Vec<u64> = store.saves().iter().map(|c| c.position()).collect();
    assert_eq!(positions, [2, 4, 6]);
    assert_eq!(pipe.status(), PipeStatus::Stopped);
}

#[tokio::test]
async fn restart_resumes_after_last_checkpoint() {
    let logs = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let config = pipe_config(logs.path(), state.path());
    let log = logs.path().join("app.log");
    append(&log, "a\nb\nc\n");

    let first = Arc::new(RecordingWriter::default());
    let store = Arc::new(RecordingStore::new(&config.state_file));
    let mut pipe = Pipe::with_checkpoint_store(config.clone(), first.clone(), store.clone());
    pipe.start().await.unwrap();
    wait_until("three checkpoints", || store.saves().len() == 3).await;
    pipe.stop().await;
    assert_eq!(first.delivered(), ["a", "b", "c"]);

    append(&log, "d\n");
    let second = Arc::new(RecordingWriter::default());
    let mut pipe = Pipe::new(config.clone(), second.clone());
    pipe.start().await.unwrap();
    wait_until("redelivery", || !second.delivered().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipe.stop().await;

    assert_eq!(second.delivered(), ["d"]);
    let saved = FileCheckpointStore::new(&config.state_file)
        .load()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.position(), 8);
}

#[tokio::test]
async fn failed_pack_is_redelivered_after_restart() {
    let logs = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let mut config = pipe_config(logs.path(), state.path());
    config.sink.pack_size = 2;
    append(&logs.path().join("app.log"), "a\nb\n");

    let mut pipe = Pipe::new(config.clone(), Arc::new(RecordingWriter::rejecting("b")));
    let mut status = pipe.status_receiver();
    pipe.start().await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s == PipeStatus::Failed),
    )
    .await
    .unwrap()
    .unwrap();
    pipe.stop().await;
    assert_eq!(pipe.status(), PipeStatus::Failed);
    assert!(FileCheckpointStore::new(&config.state_file)
        .load()
        .await
        .unwrap()
        .is_none());

    let writer = Arc::new(RecordingWriter::default());
    let mut pipe = Pipe::new(config, writer.clone());
    pipe.start().await.unwrap();
    wait_until("whole pack", || writer.delivered().len() == 2).await;
    pipe.stop().await;

    let mut delivered = writer.delivered();
    delivered.sort();
    assert_eq!(delivered, ["a", "b"]);
}

#[cfg(unix)]
#[tokio::test]
async fn follows_rename_rotation() {
    let logs = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let log = logs.path().join("app.log");
    append(&log, "a1\na2\n");

    let writer = Arc::new(RecordingWriter::default());
    let mut pipe = Pipe::new(pipe_config(logs.path(), state.path()), writer.clone());
    pipe.start().await.unwrap();
    wait_until("first lines", || writer.delivered().len() == 2).await;

    append(&log, "a3\n");
    std::fs::rename(&log, logs.path().join("app.log.1")).unwrap();
    append(&log, "b1\n");

    wait_until("rotated lines", || writer.delivered().len() == 4).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipe.stop().await;

    assert_eq!(writer.delivered(), ["a1", "a2", "a3", "b1"]);
}

#[cfg(unix)]
#[tokio::test]
async fn resumes_in_renamed_file_after_restart() {
    let logs = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let config = pipe_config(logs.path(), state.path());
    let log = logs.path().join("app.log");
    append(&log, "a1\na2\n");

    let first = Arc::new(RecordingWriter::default());
    let store = Arc::new(RecordingStore::new(&config.state_file));
    let mut pipe = Pipe::with_checkpoint_store(config.clone(), first.clone(), store.clone());
    pipe.start().await.unwrap();
    wait_until("checkpoints", || store.saves().len() == 2).await;
    pipe.stop().await;

    std::fs::rename(&log, logs.path().join("app.log.1")).unwrap();
    append(&log, "b1\n");

    let second = Arc::new(RecordingWriter::default());
    let mut pipe = Pipe::new(config, second.clone());
    pipe.start().await.unwrap();
    wait_until("new file", || !second.delivered().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipe.stop().await;

    assert_eq!(second.delivered(), ["b1"]);
}

/// Stops a pipe after `a1` and `a2` are checkpointed, lets `rotate` act on
/// the log while it is down, then returns what a restarted pipe delivers.
async fn delivered_after_offline_rotation(rotate: impl FnOnce(&std::path::Path)) -> Vec<String> {
    let logs = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let config = pipe_config(logs.path(), state.path());
    append(&logs.path().join("app.log"), "a1\na2\n");

    let first = Arc::new(RecordingWriter::default());
    let store = Arc::new(RecordingStore::new(&config.state_file));
    let mut pipe = Pipe::with_checkpoint_store(config.clone(), first.clone(), store.clone());
    pipe.start().await.unwrap();
    wait_until("checkpoints", || store.saves().len() == 2).await;
    pipe.stop().await;

    // Keeps the rotated file's mtime clear of the checkpointed one.
    tokio::time::sleep(Duration::from_millis(50)).await;
    rotate(logs.path());

    let second = Arc::new(RecordingWriter::default());
    let mut pipe = Pipe::new(config, second.clone());
    pipe.start().await.unwrap();
    wait_until("redelivery", || second.delivered().len() >= 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipe.stop().await;
    second.delivered()
}

#[cfg(unix)]
#[tokio::test]
async fn restart_after_rename_ships_only_the_unacknowledged_tail() {
    let delivered = delivered_after_offline_rotation(|dir| {
        let log = dir.join("app.log");
        append(&log, "a3\n");
        std::fs::rename(&log, dir.join("app.log.1")).unwrap();
        append(&log, "b1\n");
    })
    .await;
    assert_eq!(delivered, ["a3", "b1"]);
}

#[tokio::test]
async fn restart_after_copy_truncate_ships_only_the_unacknowledged_tail() {
    let delivered = delivered_after_offline_rotation(|dir| {
        let log = dir.join("app.log");
        append(&log, "a3\n");
        std::fs::copy(&log, dir.join("app.log.1")).unwrap();
        std::fs::File::create(&log).unwrap();
        append(&log, "b1\n");
    })
    .await;
    assert_eq!(delivered, ["a3", "b1"]);
}

#[tokio::test]
async fn copy_truncate_ships_new_lines_once() {
    let logs = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let log = logs.path().join("app.log");
    append(&log, "old-line-1\nold-line-2\n");

    let writer = Arc::new(RecordingWriter::default());
    let mut pipe = Pipe::new(pipe_config(logs.path(), state.path()), writer.clone());
    pipe.start().await.unwrap();
    wait_until("old lines", || writer.delivered().len() == 2).await;

    std::fs::copy(&log, logs.path().join("app.log.1")).unwrap();
    std::fs::File::create(&log).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    append(&log, "new\n");

    wait_until("new line", || writer.delivered().len() == 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipe.stop().await;

    assert_eq!(writer.delivered(), ["old-line-1", "old-line-2", "new"]);
}

#[tokio::test]
async fn full_queue_blocks_the_tailer() {
    let logs = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let source = pipe_config(logs.path(), state.path()).source;
    for i in 0..10 {
        append(&logs.path().join("app.log"), &format!("line-{i}\n"));
    }

    let capacity = 3;
    let (tx, rx) = queue::channel(capacity);
    let metrics = PipeMetrics::new();
    let cancel = CancellationToken::new();
    let tailer = Tailer::new("bp", source, tx, metrics.clone(), cancel.clone(), None);
    let handle = tokio::spawn(tailer.run());

    wait_until("blocked put", || metrics.snapshot().events_read == capacity as u64 + 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(metrics.snapshot().events_read, capacity as u64 + 1);
    assert_eq!(rx.len(), capacity);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
