// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::event::{Checkpoint, Event};

/// Bounded batch of events uploaded and checkpointed as a unit.
#[derive(Debug)]
pub struct EventPack {
    capacity: usize,
    events: Vec<Event>,
}

impl EventPack {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Vec::with_capacity(capacity),
        }
    }

    /// Returns the event back when the pack is already full.
    pub fn add(&mut self, event: Event) -> Result<(), Event> {
        if self.is_full() {
            return Err(event);
        }
        self.events.push(event);
        Ok(())
    }

    /// Adds every event or none of them.
    pub fn add_all(&mut self, events: Vec<Event>) -> Result<(), Vec<Event>> {
        if events.len() > self.remaining() {
            return Err(events);
        }
        self.events.extend(events);
        Ok(())
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.events.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.events.len() >= self.capacity
    }

    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// The furthest checkpoint in the pack by `(last_modify_time, position)`.
    #[must_use]
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.events
            .iter()
            .map(Event::checkpoint)
            .max_by_key(|c| c.ordering_key())
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
