// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Discovery and ordering of a source file and its rotated siblings.

use std::cmp::Reverse;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use regex::Regex;

/// Identifies a file independently of its name, so a renamed file is still
/// recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
#[must_use]
pub fn identity(meta: &Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some(FileIdentity {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
#[must_use]
pub fn identity(_meta: &Metadata) -> Option<FileIdentity> {
    None
}

/// Modification time in epoch milliseconds, 0 when unavailable.
#[must_use]
pub fn modified_millis(meta: &Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| i64::try_from(d.as_millis()).ok())
        .unwrap_or(0)
}

/// Accepts the base file and everything rotation tools derive from it.
#[derive(Debug, Clone)]
pub struct LogFilter {
    base: String,
    pattern: Regex,
}

impl LogFilter {
    #[must_use]
    pub fn new(base: impl Into<String>, pattern: Regex) -> Self {
        Self {
            base: base.into(),
            pattern,
        }
    }

    #[must_use]
    pub fn accepts(&self, name: &str) -> bool {
        name.contains(&self.base) || self.pattern.is_match(name)
    }
}

/// Oldest first. On equal mtimes longer names come first, so the live file
/// sorts after the rotated copies it shares a timestamp with.
pub type SortKey<'a> = (i64, Reverse<usize>, Reverse<&'a str>);

#[must_use]
pub fn sort_key(modified: i64, name: &str) -> SortKey<'_> {
    (modified, Reverse(name.len()), Reverse(name))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    pub name: String,
    pub modified: i64,
    pub identity: Option<FileIdentity>,
}

impl LogFile {
    #[must_use]
    pub fn sort_key(&self) -> SortKey<'_> {
        sort_key(self.modified, &self.name)
    }
}

/// Regular files in `dir` accepted by `filter`, in reading order.
pub async fn list_log_files(dir: &Path, filter: &LogFilter) -> io::Result<Vec<LogFile>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !filter.accepts(&name) {
            continue;
        }
        let path = entry.path();
        // The file may vanish between listing and stat.
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        files.push(LogFile {
            path,
            name,
            modified: modified_millis(&meta),
            identity: identity(&meta),
        });
    }
    files.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    Ok(files)
}

/// The first file that sorts after `current`, skipping the file currently
/// held open.
#[must_use]
pub fn next_after<'a>(
    files: &'a [LogFile],
    current: SortKey<'_>,
    current_identity: Option<FileIdentity>,
) -> Option<&'a LogFile> {
    files.iter().find(|f| {
        let same_file = current_identity.is_some() && f.identity == current_identity;
        !same_file && f.sort_key() > current
    })
}
