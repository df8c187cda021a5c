use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use super::probe::ResourceSnapshot;
use crate::core::config::SchedulerConfig;

/// System-wide load state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SystemState {
    Normal,
    HighLoad,
    Critical,
    Recovery,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Normal => "NORMAL",
            SystemState::HighLoad => "HIGH_LOAD",
            SystemState::Critical => "CRITICAL",
            SystemState::Recovery => "RECOVERY",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            SystemState::Normal => "🟢",
            SystemState::HighLoad => "🟠",
            SystemState::Critical => "🔴",
            SystemState::Recovery => "🔵",
        }
    }

    /// Gauge encoding for the counters registry.
    pub fn level(&self) -> i64 {
        match self {
            SystemState::Normal => 0,
            SystemState::HighLoad => 1,
            SystemState::Critical => 2,
            SystemState::Recovery => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: SystemState,
    pub to: SystemState,
}

/// Debounced load classifier.
///
/// Escalation to Critical is immediate; HighLoad needs `sustained_samples`
/// consecutive high readings. Every step down waits out the cooldown since
/// the previous transition.
#[derive(Debug)]
pub struct ResourceMonitor {
    config: SchedulerConfig,
    state: SystemState,
    high_streak: u32,
    last_transition: Option<DateTime<Utc>>,
    latest: Option<ResourceSnapshot>,
}

impl ResourceMonitor {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: SystemState::Normal,
            high_streak: 0,
            last_transition: None,
            latest: None,
        }
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn latest(&self) -> Option<&ResourceSnapshot> {
        self.latest.as_ref()
    }

    pub fn update_config(&mut self, config: SchedulerConfig) {
        self.config = config;
    }

    fn is_critical(&self, s: &ResourceSnapshot) -> bool {
        s.cpu_percent >= self.config.cpu_critical
            || s.memory_percent >= self.config.memory_critical
            || s.disk_percent >= self.config.disk_critical
    }

    fn is_high(&self, s: &ResourceSnapshot) -> bool {
        s.cpu_percent >= self.config.cpu_high
            || s.memory_percent >= self.config.memory_high
            || s.disk_percent >= self.config.disk_high
    }

    pub fn observe(&mut self, snapshot: ResourceSnapshot) -> Option<StateTransition> {
        let now = snapshot.timestamp;
        let critical = self.is_critical(&snapshot);
        let high = critical || self.is_high(&snapshot);
        self.latest = Some(snapshot);

        if high {
            self.high_streak = self.high_streak.saturating_add(1);
        } else {
            self.high_streak = 0;
        }
        let sustained = self.high_streak >= self.config.sustained_samples.max(1);

        let cooldown = ChronoDuration::seconds(self.config.transition_cooldown_seconds as i64);
        let cooled = self
            .last_transition
            .map(|at| now - at >= cooldown)
            .unwrap_or(true);

        let next = match self.state {
            SystemState::Normal if critical => SystemState::Critical,
            SystemState::Normal if sustained => SystemState::HighLoad,
            SystemState::HighLoad if critical => SystemState::Critical,
            SystemState::HighLoad if !high && cooled => SystemState::Normal,
            SystemState::Critical if !critical && cooled => SystemState::Recovery,
            SystemState::Recovery if critical => SystemState::Critical,
            SystemState::Recovery if sustained => SystemState::HighLoad,
            SystemState::Recovery if !high && cooled => SystemState::Normal,
            current => current,
        };

        if next == self.state {
            return None;
        }

        let transition = StateTransition {
            from: self.state,
            to: next,
        };
        self.state = next;
        self.last_transition = Some(now);
        Some(transition)
    }
}
