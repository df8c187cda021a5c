use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use crate::model::Tick;

/// Bounded FIFO of recent ticks for one symbol.
#[derive(Debug)]
pub struct TickBuffer {
    capacity: usize,
    ticks: VecDeque<Tick>,
}

impl TickBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ticks: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Append, returning the oldest tick if it had to make room.
    pub fn push(&mut self, tick: Tick) -> Option<Tick> {
        let evicted = if self.ticks.len() >= self.capacity {
            self.ticks.pop_front()
        } else {
            None
        };
        self.ticks.push_back(tick);
        evicted
    }

    /// Remove every tick stamped before `cutoff`, keeping arrival order.
    pub fn drain_older_than(&mut self, cutoff: DateTime<Utc>) -> Vec<Tick> {
        if !self.ticks.iter().any(|t| t.timestamp < cutoff) {
            return Vec::new();
        }

        let (expired, kept): (VecDeque<Tick>, VecDeque<Tick>) = self
            .ticks
            .drain(..)
            .partition(|t| t.timestamp < cutoff);
        self.ticks = kept;
        expired.into()
    }

    /// Up to `n` most recent ticks, oldest first.
    pub fn latest(&self, n: usize) -> Vec<Tick> {
        let skip = self.ticks.len().saturating_sub(n);
        self.ticks.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
