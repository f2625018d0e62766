// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use crate::charset::Charset;

/// How far a source file has been read.
///
/// `position` is the byte offset just past the separator of the last record
/// and `content_hash` identifies that record, so a resumed reader can verify
/// it is looking at the same file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    file_name: String,
    position: u64,
    #[serde(rename = "hash")]
    content_hash: i32,
    last_modify_time: i64,
}

impl Checkpoint {
    #[must_use]
    pub fn new(
        file_name: impl Into<String>,
        position: u64,
        content_hash: i32,
        last_modify_time: i64,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            position,
            content_hash,
            last_modify_time,
        }
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[must_use]
    pub fn content_hash(&self) -> i32 {
        self.content_hash
    }

    /// Modification time of the source file in epoch milliseconds.
    #[must_use]
    pub fn last_modify_time(&self) -> i64 {
        self.last_modify_time
    }

    /// A checkpoint that names no file carries no progress.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.file_name.is_empty()
    }

    /// Key that orders checkpoints along one file lineage.
    #[must_use]
    pub fn ordering_key(&self) -> (i64, u64) {
        (self.last_modify_time, self.position)
    }
}

/// One record read from a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    checkpoint: Checkpoint,
    payload: String,
    charset: Charset,
}

impl Event {
    #[must_use]
    pub fn new(checkpoint: Checkpoint, payload: String, charset: Charset) -> Self {
        Self {
            checkpoint,
            payload,
            charset,
        }
    }

    #[must_use]
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    #[must_use]
    pub fn charset(&self) -> Charset {
        self.charset
    }
}

/// FNV-1a over the raw record bytes, folded to 32 bits.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn content_hash(record: &[u8]) -> i32 {
    let mut hasher = FnvHasher::default();
    hasher.write(record);
    let hash = hasher.finish();
    ((hash >> 32) ^ hash) as u32 as i32
}
