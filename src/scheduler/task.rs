use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::core::error::FusionResult;

/// Dispatch priority; lower level runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Priority {
    Critical = 1,
    High = 2,
    Medium = 3,
    Low = 4,
    Deferred = 5,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Deferred,
    ];

    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub(crate) fn index(&self) -> usize {
        (*self as usize) - 1
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
            Priority::Deferred => "DEFERRED",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Priority::Critical => "🔴",
            Priority::High => "🟠",
            Priority::Medium => "🟡",
            Priority::Low => "🟢",
            Priority::Deferred => "⚪",
        }
    }
}

/// Periodic work the core schedules. Each kind runs at most once at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskKind {
    Calibration,
    CandleFlush,
    Fusion,
    Compression,
    DurablePurge,
    StatusReport,
    Custom(&'static str),
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Calibration => "calibration",
            TaskKind::CandleFlush => "candle_flush",
            TaskKind::Fusion => "fusion",
            TaskKind::Compression => "compression",
            TaskKind::DurablePurge => "durable_purge",
            TaskKind::StatusReport => "status_report",
            TaskKind::Custom(name) => *name,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceClass {
    Cpu,
    Memory,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Queued,
    Running,
    Deferred,
    Completed,
    Failed,
}

/// Re-runnable unit of work; retries call it again.
pub type TaskJob = Arc<dyn Fn() -> BoxFuture<'static, FusionResult<()>> + Send + Sync>;

#[derive(Clone)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub kind: TaskKind,
    pub priority: Priority,
    pub resource_class: ResourceClass,
    pub allocation: f64,
    pub estimated_duration: Duration,
    pub deadline: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub deferrals: u32,
    pub state: TaskState,
    pub job: TaskJob,
}

impl ScheduledTask {
    pub fn new(
        kind: TaskKind,
        priority: Priority,
        resource_class: ResourceClass,
        job: TaskJob,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            priority,
            resource_class,
            allocation: 0.0,
            estimated_duration: Duration::from_secs(1),
            deadline: None,
            retry_count: 0,
            deferrals: 0,
            state: TaskState::Queued,
            job,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_estimate(mut self, estimated: Duration) -> Self {
        self.estimated_duration = estimated;
        self
    }

    pub fn with_allocation(mut self, allocation: f64) -> Self {
        self.allocation = allocation;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|d| now > d).unwrap_or(false)
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("resource_class", &self.resource_class)
            .field("deadline", &self.deadline)
            .field("retry_count", &self.retry_count)
            .field("state", &self.state)
            .finish()
    }
}

/// Wrap an async closure as a [`TaskJob`].
pub fn job<F, Fut>(f: F) -> TaskJob
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = FusionResult<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}
