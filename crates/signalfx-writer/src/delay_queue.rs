// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO of items that become due a constant delay after being pushed.
//!
//! Because the delay is the same for every item, enqueue order is also due-time order,
//! so a plain deque is enough and the head is always the next item to become due.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delayed<T> {
    pub item: T,
    pub time_to_send: Instant,
}

#[derive(Debug)]
pub struct DelayQueue<T> {
    entries: VecDeque<Delayed<T>>,
    delay: Duration,
    capacity: usize,
}

impl<T> DelayQueue<T> {
    #[must_use]
    pub fn new(delay: Duration, capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            delay,
            capacity,
        }
    }

    /// Appends `item`, due at `now + delay`. Gives the item back when the queue is full.
    pub fn push(&mut self, item: T, now: Instant) -> Result<(), T> {
        if self.entries.len() >= self.capacity {
            return Err(item);
        }
        let time_to_send = now + self.delay;
        debug_assert!(self
            .entries
            .back()
            .map_or(true, |last| last.time_to_send <= time_to_send));
        self.entries.push_back(Delayed { item, time_to_send });
        Ok(())
    }

    /// Removes the head only if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Delayed<T>> {
        if self.entries.front()?.time_to_send <= now {
            self.entries.pop_front()
        } else {
            None
        }
    }

    #[must_use]
    pub fn next_due(&self) -> Option<Instant> {
        self.entries.front().map(|entry| entry.time_to_send)
    }
}
