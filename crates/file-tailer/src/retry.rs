// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// How many times an event write is attempted and how long to wait between
/// attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Number of attempts, retried back to back.
    Immediate(u64),
    /// Number of attempts and the delay between them in milliseconds.
    LinearBackoff(u64, u64),
}

impl RetryStrategy {
    /// Total attempts, never less than one.
    #[must_use]
    pub fn attempts(self) -> u64 {
        match self {
            RetryStrategy::Immediate(attempts) | RetryStrategy::LinearBackoff(attempts, _) => {
                attempts.max(1)
            }
        }
    }

    #[must_use]
    pub fn delay(self) -> Option<Duration> {
        match self {
            RetryStrategy::Immediate(_) => None,
            RetryStrategy::LinearBackoff(_, 0) => None,
            RetryStrategy::LinearBackoff(_, ms) => Some(Duration::from_millis(ms)),
        }
    }

    /// Builds the strategy from the sink's retry settings. A zero interval
    /// retries immediately.
    #[must_use]
    pub fn from_settings(attempts: u32, interval: Duration) -> Self {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        if ms == 0 {
            RetryStrategy::Immediate(u64::from(attempts))
        } else {
            RetryStrategy::LinearBackoff(u64::from(attempts), ms)
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::LinearBackoff(3, 1000)
    }
}
