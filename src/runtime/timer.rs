//! Inactivity timeouts.
//!
//! A min-heap of `(deadline, slot, serial)` entries. Entries are never
//! removed eagerly: when a connection closes or its deadline moves, the old
//! entry stays in the heap and is discarded (or rescheduled) when it reaches
//! the top. The serial guards against a slab slot being reused by a newer
//! connection before the stale entry surfaces.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerEntry {
    pub deadline: Instant,
    pub conn_id: usize,
    pub serial: u64,
}

#[derive(Debug, Default)]
pub struct TimeoutQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, conn_id: usize, serial: u64) {
        self.heap.push(Reverse(TimerEntry {
            deadline,
            conn_id,
            serial,
        }));
    }

    /// Earliest scheduled deadline, stale entries included.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Poll timeout until the next deadline; `None` blocks indefinitely.
    pub fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Pop every entry whose deadline is at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut expired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            expired.push(*entry);
            self.heap.pop();
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
