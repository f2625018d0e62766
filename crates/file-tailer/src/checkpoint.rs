// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistence of the last fully uploaded position of a pipe.
//!
//! The store is a best-effort durability aid: failed saves are logged and
//! swallowed, the next successful save catches up. Only `load` reports
//! errors, because an unreadable checkpoint must stop the pipe from starting.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::event::Checkpoint;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to access checkpoint file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable storage for the position a pipe has fully uploaded.
///
/// The uploader saves after every acknowledged pack and the pipe loads once
/// on start. Implementations must make `save` atomic: a crash mid-save
/// leaves either the previous or the new checkpoint, never a torn one.
///
/// # Example
///
/// ```rust,ignore
/// let store = FileCheckpointStore::new("/var/run/file-tailer/state_dir/pipes/web/state");
/// store.save(&Checkpoint::new("/var/log/app.log", 128, hash, mtime)).await;
/// assert_eq!(store.load().await?.map(|c| c.position()), Some(128));
/// ```
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persists `checkpoint`, replacing any previous value. Empty checkpoints
    /// are ignored and failures are only logged.
    async fn save(&self, checkpoint: &Checkpoint);

    /// Returns the last saved checkpoint, `None` when nothing was ever saved.
    ///
    /// # Errors
    ///
    /// * [`CheckpointError::Io`] - the state file exists but cannot be read
    /// * [`CheckpointError::Corrupt`] - the state file is not a checkpoint
    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError>;
}

/// Stores the checkpoint as a single JSON document.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes to a sibling temporary file and renames it over the target so a
    /// crash never leaves a torn record behind.
    pub async fn try_save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let body = serde_json::to_vec(checkpoint).map_err(|source| CheckpointError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
        file.write_all(&body).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) {
        if checkpoint.is_empty() {
            debug!("Skipping save of empty checkpoint");
            return;
        }
        match self.try_save(checkpoint).await {
            Ok(()) => debug!(
                file = checkpoint.file_name(),
                position = checkpoint.position(),
                "Saved checkpoint"
            ),
            Err(e) => error!("Failed to save checkpoint: {e}"),
        }
    }

    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let body = match tokio::fs::read(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let checkpoint: Checkpoint =
            serde_json::from_slice(&body).map_err(|source| CheckpointError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        Ok((!checkpoint.is_empty()).then_some(checkpoint))
    }
}
