use std::collections::HashMap;

use super::probe::ResourceSnapshot;
use super::task::{Priority, ResourceClass, TaskKind};
use crate::core::config::SchedulerConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeferCondition {
    CpuAbove(f64),
    MemoryAbove(f64),
    DiskAbove(f64),
}

impl DeferCondition {
    pub fn holds(&self, snapshot: &ResourceSnapshot) -> bool {
        match *self {
            DeferCondition::CpuAbove(limit) => snapshot.cpu_percent >= limit,
            DeferCondition::MemoryAbove(limit) => snapshot.memory_percent >= limit,
            DeferCondition::DiskAbove(limit) => snapshot.disk_percent >= limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlEntry {
    pub priority: Priority,
    pub resource_class: ResourceClass,
    /// Share of the resource class budget while running.
    pub allocation: f64,
    pub defer_when: Vec<DeferCondition>,
}

/// Static task kind → priority / resource allocation / defer-conditions table.
#[derive(Debug, Clone)]
pub struct ControlMatrix {
    entries: HashMap<TaskKind, ControlEntry>,
    fallback: ControlEntry,
}

impl ControlMatrix {
    pub fn standard(cfg: &SchedulerConfig) -> Self {
        let mut entries = HashMap::new();

        // compression frees memory, so it keeps running in Critical
        entries.insert(
            TaskKind::Compression,
            ControlEntry {
                priority: Priority::Critical,
                resource_class: ResourceClass::Memory,
                allocation: 0.2,
                defer_when: vec![],
            },
        );
        entries.insert(
            TaskKind::CandleFlush,
            ControlEntry {
                priority: Priority::High,
                resource_class: ResourceClass::Cpu,
                allocation: 0.1,
                defer_when: vec![],
            },
        );
        entries.insert(
            TaskKind::Fusion,
            ControlEntry {
                priority: Priority::High,
                resource_class: ResourceClass::Cpu,
                allocation: 0.2,
                defer_when: vec![],
            },
        );
        entries.insert(
            TaskKind::Calibration,
            ControlEntry {
                priority: Priority::Medium,
                resource_class: ResourceClass::Cpu,
                allocation: 0.3,
                defer_when: vec![DeferCondition::MemoryAbove(cfg.memory_critical)],
            },
        );
        entries.insert(
            TaskKind::DurablePurge,
            ControlEntry {
                priority: Priority::Low,
                resource_class: ResourceClass::Io,
                allocation: 0.5,
                defer_when: vec![DeferCondition::CpuAbove(cfg.cpu_high)],
            },
        );
        entries.insert(
            TaskKind::StatusReport,
            ControlEntry {
                priority: Priority::Deferred,
                resource_class: ResourceClass::Cpu,
                allocation: 0.05,
                defer_when: vec![DeferCondition::CpuAbove(cfg.cpu_high)],
            },
        );

        Self {
            entries,
            fallback: ControlEntry {
                priority: Priority::Low,
                resource_class: ResourceClass::Cpu,
                allocation: 0.1,
                defer_when: vec![DeferCondition::CpuAbove(cfg.cpu_high)],
            },
        }
    }

    pub fn entry(&self, kind: TaskKind) -> &ControlEntry {
        self.entries.get(&kind).unwrap_or(&self.fallback)
    }

    pub fn set_entry(&mut self, kind: TaskKind, entry: ControlEntry) {
        self.entries.insert(kind, entry);
    }

    /// First defer-condition the snapshot satisfies for `kind`, if any.
    pub fn blocking_condition(
        &self,
        kind: TaskKind,
        snapshot: &ResourceSnapshot,
    ) -> Option<DeferCondition> {
        self.entry(kind)
            .defer_when
            .iter()
            .copied()
            .find(|c| c.holds(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defer_conditions() {
        let matrix = ControlMatrix::standard(&SchedulerConfig::default());
        let busy = ResourceSnapshot {
            cpu_percent: 90.0,
            ..ResourceSnapshot::idle()
        };
        assert_eq!(
            matrix.blocking_condition(TaskKind::DurablePurge, &busy),
            Some(DeferCondition::CpuAbove(85.0))
        );
        assert_eq!(matrix.blocking_condition(TaskKind::Fusion, &busy), None);
        assert_eq!(
            matrix.blocking_condition(TaskKind::DurablePurge, &ResourceSnapshot::idle()),
            None
        );
    }

    #[test]
    fn test_unknown_kind_uses_fallback() {
        let matrix = ControlMatrix::standard(&SchedulerConfig::default());
        assert_eq!(matrix.entry(TaskKind::Custom("adhoc")).priority, Priority::Low);
        assert_eq!(matrix.entry(TaskKind::Compression).priority, Priority::Critical);
    }
}
