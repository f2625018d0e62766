// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO between the tailer and the uploader.
//!
//! A full queue suspends [`EventSender::put`], which is what throttles the
//! tailer when the uploader falls behind. Both blocking operations give up
//! as soon as the pipe's cancellation token fires.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue operation cancelled")]
    Cancelled,
    #[error("queue closed")]
    Closed,
}

#[must_use]
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, EventReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    /// Waits for room in the queue, then enqueues `event`.
    pub async fn put(&self, event: Event, cancel: &CancellationToken) -> Result<(), QueueError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(QueueError::Cancelled),
            sent = self.tx.send(event) => sent.map_err(|_| QueueError::Closed),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<Event>,
}

impl EventReceiver {
    /// Waits for the next event. Returns [`QueueError::Closed`] once every
    /// sender is gone and the queue is drained.
    pub async fn take(&mut self, cancel: &CancellationToken) -> Result<Event, QueueError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(QueueError::Cancelled),
            event = self.rx.recv() => event.ok_or(QueueError::Closed),
        }
    }

    /// Moves up to `max` already queued events into `out` without waiting.
    pub fn drain_to(&mut self, out: &mut Vec<Event>, max: usize) -> usize {
        let mut moved = 0;
        while moved < max {
            match self.rx.try_recv() {
                Ok(event) => {
                    out.push(event);
                    moved += 1;
                }
                Err(_) => break,
            }
        }
        moved
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.rx.max_capacity()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
