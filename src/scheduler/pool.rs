use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::monitor::SystemState;
use super::task::Priority;
use crate::core::config::PoolSizes;

struct PoolSlots {
    limits: [AtomicUsize; 5],
    running: [AtomicUsize; 5],
}

/// Per-priority concurrency caps that shrink under load.
pub struct PriorityPools {
    base: RwLock<PoolSizes>,
    slots: Arc<PoolSlots>,
}

/// Held while a task runs; frees its slot on drop.
pub struct PoolPermit {
    slots: Arc<PoolSlots>,
    index: usize,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.slots.running[self.index].fetch_sub(1, Ordering::AcqRel);
    }
}

fn base_limit(base: &PoolSizes, priority: Priority) -> usize {
    match priority {
        Priority::Critical => base.critical,
        Priority::High => base.high,
        Priority::Medium => base.medium,
        Priority::Low => base.low,
        Priority::Deferred => base.deferred,
    }
    .max(1)
}

impl PriorityPools {
    pub fn new(base: PoolSizes) -> Self {
        let limits = Priority::ALL.map(|p| AtomicUsize::new(base_limit(&base, p)));
        Self {
            base: RwLock::new(base),
            slots: Arc::new(PoolSlots {
                limits,
                running: Default::default(),
            }),
        }
    }

    pub fn try_acquire(&self, priority: Priority) -> Option<PoolPermit> {
        let index = priority.index();
        let limit = self.slots.limits[index].load(Ordering::Acquire);
        self.slots.running[index]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
                (running < limit).then_some(running + 1)
            })
            .ok()
            .map(|_| PoolPermit {
                slots: Arc::clone(&self.slots),
                index,
            })
    }

    /// Resize every pool for `state`. Running tasks keep their slots.
    pub fn resize_for(&self, state: SystemState) {
        let sizes = self.base.read().clone();
        for priority in Priority::ALL {
            let base = base_limit(&sizes, priority);
            let limit = match (state, priority) {
                (SystemState::Normal, _) => base,
                (_, Priority::Critical) => base,
                (SystemState::Critical, _) => 1,
                (SystemState::HighLoad | SystemState::Recovery, Priority::High) => base,
                (SystemState::HighLoad | SystemState::Recovery, _) => (base / 2).max(1),
            };
            self.slots.limits[priority.index()].store(limit, Ordering::Release);
        }
    }

    /// New base sizes, applied at the next [`PriorityPools::resize_for`].
    pub fn set_base(&self, base: PoolSizes) {
        *self.base.write() = base;
    }

    pub fn limit(&self, priority: Priority) -> usize {
        self.slots.limits[priority.index()].load(Ordering::Acquire)
    }

    pub fn running(&self, priority: Priority) -> usize {
        self.slots.running[priority.index()].load(Ordering::Acquire)
    }
}
