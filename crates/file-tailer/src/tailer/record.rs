// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Splits a byte stream into separator-terminated records.
///
/// Bytes after the last separator stay buffered: a record is only released
/// once its terminator has been seen.
#[derive(Debug)]
pub struct RecordSplitter {
    separator: u8,
    buffer: Vec<u8>,
    start: usize,
}

impl RecordSplitter {
    #[must_use]
    pub fn new(separator: u8) -> Self {
        Self {
            separator,
            buffer: Vec::new(),
            start: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.start > 0 {
            self.buffer.drain(..self.start);
            self.start = 0;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete record, without its separator.
    pub fn next_record(&mut self) -> Option<Vec<u8>> {
        let pending = &self.buffer[self.start..];
        let end = pending.iter().position(|&b| b == self.separator)?;
        let record = pending[..end].to_vec();
        self.start += end + 1;
        Some(record)
    }

    /// Bytes received after the last separator.
    #[must_use]
    pub fn partial_len(&self) -> usize {
        self.buffer.len() - self.start
    }
}
