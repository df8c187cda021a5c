// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RESOURCE SCHEDULER - PRIORITY-GATED BACKGROUND WORK
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//
// Every periodic job in the core passes through here:
// 1. submit() queues it by priority (one pending or running copy per kind)
// 2. the dispatcher admits tasks against the system state, the control
//    matrix defer-conditions, the per-class budget and the priority pools
// 3. blocked tasks stay queued until admitted or past their deadline
// 4. recoverable failures are retried up to max_retries
//
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::control_matrix::ControlMatrix;
use super::monitor::{ResourceMonitor, StateTransition, SystemState};
use super::pool::{PoolPermit, PriorityPools};
use super::probe::{ResourceProbe, ResourceSnapshot};
use super::task::{Priority, ResourceClass, ScheduledTask, TaskJob, TaskKind, TaskState};
use crate::core::clock::SharedClock;
use crate::core::config::SchedulerConfig;
use crate::core::counters::{self, Counters};
use crate::core::error::{FusionError, FusionResult};
use crate::core::health::HealthChecker;
use crate::core::periodic::PeriodicTask;

/// Whether `priority` may run at all in `state`.
pub fn is_eligible(state: SystemState, priority: Priority) -> bool {
    match state {
        SystemState::Normal => true,
        SystemState::HighLoad => priority <= Priority::High,
        SystemState::Recovery => priority <= Priority::Medium,
        SystemState::Critical => priority == Priority::Critical,
    }
}

fn class_budget(state: SystemState) -> f64 {
    match state {
        SystemState::Normal => 1.0,
        SystemState::HighLoad | SystemState::Recovery => 0.75,
        SystemState::Critical => 0.5,
    }
}

struct QueuedTask {
    seq: u64,
    task: ScheduledTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // max-heap: most urgent priority first, then oldest submission
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .task
            .priority
            .cmp(&self.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued(Uuid),
    /// A task of the same kind is already queued or running.
    AlreadyPending,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub deferred: usize,
    pub expired: usize,
}

pub struct ResourceScheduler {
    config: RwLock<SchedulerConfig>,
    clock: SharedClock,
    counters: Arc<Counters>,
    health: Option<HealthChecker>,
    matrix: RwLock<ControlMatrix>,
    probe: Arc<dyn ResourceProbe>,
    monitor: Mutex<ResourceMonitor>,
    pools: PriorityPools,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    seq: AtomicU64,
    in_flight: Mutex<HashSet<TaskKind>>,
    class_load: Mutex<HashMap<ResourceClass, f64>>,
    /// Terminal state of the most recent run of each kind.
    outcomes: Mutex<HashMap<TaskKind, TaskState>>,
    tracker: TaskTracker,
    wake: Arc<Notify>,
    accepting: AtomicBool,
    loops: Mutex<Vec<PeriodicTask>>,
}

impl ResourceScheduler {
    pub fn new(
        config: SchedulerConfig,
        clock: SharedClock,
        counters: Arc<Counters>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        tracing::info!("🎯 Resource scheduler initialized");
        tracing::info!(
            "   • CPU high/critical: {:.0}%/{:.0}% | Memory: {:.0}%/{:.0}% | Disk: {:.0}%/{:.0}%",
            config.cpu_high,
            config.cpu_critical,
            config.memory_high,
            config.memory_critical,
            config.disk_high,
            config.disk_critical
        );
        tracing::info!(
            "   • Pools C/H/M/L/D: {}/{}/{}/{}/{} | Cooldown: {}s",
            config.pools.critical,
            config.pools.high,
            config.pools.medium,
            config.pools.low,
            config.pools.deferred,
            config.transition_cooldown_seconds
        );

        Self {
            matrix: RwLock::new(ControlMatrix::standard(&config)),
            monitor: Mutex::new(ResourceMonitor::new(config.clone())),
            pools: PriorityPools::new(config.pools.clone()),
            config: RwLock::new(config),
            clock,
            counters,
            health: None,
            probe,
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            in_flight: Mutex::new(HashSet::new()),
            class_load: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            wake: Arc::new(Notify::new()),
            accepting: AtomicBool::new(true),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Report each task kind's outcome as a health component.
    pub fn with_health(mut self, health: HealthChecker) -> Self {
        self.health = Some(health);
        self
    }

    /// Build a task for `kind` from the control matrix.
    pub fn task_for(&self, kind: TaskKind, job: TaskJob) -> ScheduledTask {
        let matrix = self.matrix.read();
        let entry = matrix.entry(kind);
        ScheduledTask::new(kind, entry.priority, entry.resource_class, job)
            .with_allocation(entry.allocation)
    }

    pub fn submit(&self, task: ScheduledTask) -> FusionResult<SubmitOutcome> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(FusionError::Shutdown);
        }

        let pending = self.in_flight.lock().contains(&task.kind)
            || self.queue.lock().iter().any(|q| q.task.kind == task.kind);
        if pending {
            self.counters.incr(counters::TASKS_OVERLAP_SKIPPED);
            tracing::debug!("⏭️  {} already pending, skipping this cycle", task.kind);
            return Ok(SubmitOutcome::AlreadyPending);
        }

        let id = task.id;
        self.counters.incr(counters::TASKS_SUBMITTED);
        self.enqueue(task);
        Ok(SubmitOutcome::Queued(id))
    }

    pub fn submit_kind(&self, kind: TaskKind, job: TaskJob) -> FusionResult<SubmitOutcome> {
        self.submit(self.task_for(kind, job))
    }

    fn enqueue(&self, mut task: ScheduledTask) {
        if task.state != TaskState::Deferred {
            task.state = TaskState::Queued;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let depth = {
            let mut queue = self.queue.lock();
            queue.push(QueuedTask { seq, task });
            queue.len()
        };
        self.counters.set_level("queue_depth", depth as i64);
        self.wake.notify_one();
    }

    /// Take one resource reading and advance the state machine.
    pub fn sample(&self) -> Option<StateTransition> {
        let snapshot = match self.probe.sample() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.counters.incr(counters::RESOURCE_SAMPLE_FAILURES);
                tracing::warn!("⚠️  Resource sample failed, keeping last state: {}", e);
                return None;
            }
        };

        self.counters
            .set_level("cpu_percent", snapshot.cpu_percent.round() as i64);
        self.counters
            .set_level("memory_percent", snapshot.memory_percent.round() as i64);
        self.counters
            .set_level("disk_percent", snapshot.disk_percent.round() as i64);

        let transition = self.monitor.lock().observe(snapshot)?;
        self.pools.resize_for(transition.to);
        self.counters.incr(counters::STATE_TRANSITIONS);
        self.counters.set_level("system_state", transition.to.level());

        match transition.to {
            SystemState::Critical | SystemState::HighLoad => tracing::warn!(
                "{} System state {} → {}",
                transition.to.emoji(),
                transition.from.as_str(),
                transition.to.as_str()
            ),
            SystemState::Recovery | SystemState::Normal => tracing::info!(
                "{} System state {} → {}",
                transition.to.emoji(),
                transition.from.as_str(),
                transition.to.as_str()
            ),
        }

        self.wake.notify_one();
        Some(transition)
    }

    /// One pass over the queue: launch what is admissible, requeue the rest.
    pub fn dispatch_once(self: &Arc<Self>) -> DispatchReport {
        let now = self.clock.now();
        let (state, snapshot) = {
            let monitor = self.monitor.lock();
            (monitor.state(), monitor.latest().cloned())
        };

        let mut pending = Vec::new();
        {
            let mut queue = self.queue.lock();
            while let Some(queued) = queue.pop() {
                pending.push(queued);
            }
        }

        let mut report = DispatchReport::default();
        let mut requeue = Vec::new();

        for mut queued in pending {
            if queued.task.is_expired(now) {
                report.expired += 1;
                self.counters.incr(counters::TASKS_DEADLINE_EXPIRED);
                tracing::warn!(
                    "⌛ {} missed its deadline after {} deferrals, dropped",
                    queued.task.kind,
                    queued.task.deferrals
                );
                continue;
            }

            match self.admit(&queued.task, state, snapshot.as_ref()) {
                Ok(permit) => {
                    report.dispatched += 1;
                    self.launch(queued.task, permit);
                }
                Err(reason) => {
                    report.deferred += 1;
                    queued.task.state = TaskState::Deferred;
                    queued.task.deferrals += 1;
                    self.counters.incr(counters::TASKS_DEFERRED);
                    if queued.task.deferrals == 1 {
                        tracing::debug!(
                            "⏳ {} {} deferred: {}",
                            queued.task.priority.emoji(),
                            queued.task.kind,
                            reason
                        );
                    }
                    requeue.push(queued);
                }
            }
        }

        let depth = {
            let mut queue = self.queue.lock();
            queue.extend(requeue);
            queue.len()
        };
        self.counters.set_level("queue_depth", depth as i64);

        report
    }

    fn admit(
        &self,
        task: &ScheduledTask,
        state: SystemState,
        snapshot: Option<&ResourceSnapshot>,
    ) -> Result<PoolPermit, String> {
        if !is_eligible(state, task.priority) {
            return Err(format!("{} state", state.as_str()));
        }

        if let Some(snapshot) = snapshot {
            if let Some(condition) = self.matrix.read().blocking_condition(task.kind, snapshot) {
                return Err(format!("{:?}", condition));
            }
        }

        let mut in_flight = self.in_flight.lock();
        if in_flight.contains(&task.kind) {
            return Err("previous run still in flight".into());
        }

        let mut class_load = self.class_load.lock();
        let load = class_load.get(&task.resource_class).copied().unwrap_or(0.0);
        if task.priority != Priority::Critical
            && load + task.allocation > class_budget(state) + f64::EPSILON
        {
            return Err(format!("{:?} budget exhausted", task.resource_class));
        }

        let permit = self
            .pools
            .try_acquire(task.priority)
            .ok_or_else(|| format!("{} pool full", task.priority.as_str()))?;

        in_flight.insert(task.kind);
        *class_load.entry(task.resource_class).or_insert(0.0) += task.allocation;
        Ok(permit)
    }

    fn release(&self, task: &ScheduledTask) {
        self.in_flight.lock().remove(&task.kind);
        let mut class_load = self.class_load.lock();
        if let Some(load) = class_load.get_mut(&task.resource_class) {
            *load = (*load - task.allocation).max(0.0);
        }
    }

    fn launch(self: &Arc<Self>, mut task: ScheduledTask, permit: PoolPermit) {
        task.state = TaskState::Running;
        let this = Arc::clone(self);

        self.tracker.spawn(async move {
            let started = Instant::now();
            let outcome = AssertUnwindSafe((task.job)()).catch_unwind().await;
            drop(permit);
            this.release(&task);

            match outcome {
                Ok(Ok(())) => {
                    task.state = TaskState::Completed;
                    this.record_outcome(&task);
                    this.counters.incr(counters::TASKS_COMPLETED);
                    tracing::trace!("✅ {} finished in {:?}", task.kind, started.elapsed());
                    if let Some(health) = &this.health {
                        health.record_success(task.kind.as_str()).await;
                    }
                }
                Ok(Err(e)) => this.handle_failure(task, e).await,
                Err(_) => {
                    task.state = TaskState::Failed;
                    this.record_outcome(&task);
                    this.counters.incr(counters::TASKS_FAILED);
                    tracing::error!("💥 {} panicked", task.kind);
                    if let Some(health) = &this.health {
                        health.record_failure(task.kind.as_str(), "panicked").await;
                    }
                }
            }

            // a finished task may unblock queued ones
            this.wake.notify_one();
        });
    }

    async fn handle_failure(&self, mut task: ScheduledTask, error: FusionError) {
        let max_retries = self.config.read().max_retries;

        match error {
            FusionError::InsufficientData { .. } => {
                task.state = TaskState::Completed;
                self.record_outcome(&task);
                self.counters.incr(counters::TASKS_COMPLETED);
                tracing::debug!("⏭️  {} skipped: {}", task.kind, error);
            }
            FusionError::ResourceExhaustion(ref reason) => {
                self.counters.incr(counters::TASKS_DEFERRED);
                tracing::debug!("⏳ {} out of resources ({}), requeued", task.kind, reason);
                task.state = TaskState::Deferred;
                self.requeue(task);
            }
            ref e if e.is_recoverable() && task.retry_count < max_retries => {
                task.retry_count += 1;
                self.counters.incr(counters::TASKS_RETRIED);
                tracing::warn!(
                    "🔁 {} failed ({}), retry {}/{}",
                    task.kind,
                    e,
                    task.retry_count,
                    max_retries
                );
                self.requeue(task);
            }
            e if e.is_recoverable() => {
                let exhausted = FusionError::TaskRetryExhausted {
                    task: task.kind.to_string(),
                    attempts: task.retry_count + 1,
                    last_error: e.to_string(),
                };
                task.state = TaskState::Failed;
                self.record_outcome(&task);
                self.counters.incr(counters::TASKS_RETRY_EXHAUSTED);
                self.counters.incr(counters::TASKS_FAILED);
                tracing::error!("❌ {}", exhausted);
                if let Some(health) = &self.health {
                    health
                        .record_failure(task.kind.as_str(), &exhausted.to_string())
                        .await;
                }
            }
            e => {
                task.state = TaskState::Failed;
                self.record_outcome(&task);
                self.counters.incr(counters::TASKS_FAILED);
                tracing::error!("❌ {} failed: {}", task.kind, e);
                if let Some(health) = &self.health {
                    health.record_failure(task.kind.as_str(), &e.to_string()).await;
                }
            }
        }
    }

    fn record_outcome(&self, task: &ScheduledTask) {
        self.outcomes.lock().insert(task.kind, task.state);
    }

    fn requeue(&self, task: ScheduledTask) {
        if self.accepting.load(Ordering::Acquire) {
            self.enqueue(task);
        } else {
            tracing::debug!("{} not requeued, shutting down", task.kind);
        }
    }

    /// Start the resource sampler and the dispatch loop.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let (sample_every, dispatch_every) = {
            let cfg = self.config.read();
            (
                Duration::from_secs(cfg.sample_interval_seconds.max(1)),
                Duration::from_millis(cfg.dispatch_interval_millis.max(1)),
            )
        };

        self.sample();

        let sampler = {
            let this = Arc::clone(self);
            PeriodicTask::spawn("resource-sampler", sample_every, parent, move || {
                let this = Arc::clone(&this);
                async move {
                    this.sample();
                }
            })
        };

        let dispatcher = {
            let this = Arc::clone(self);
            PeriodicTask::spawn_with_trigger(
                "dispatcher",
                dispatch_every,
                Arc::clone(&self.wake),
                parent,
                move || {
                    let this = Arc::clone(&this);
                    async move {
                        this.dispatch_once();
                    }
                },
            )
        };

        self.loops.lock().extend([sampler, dispatcher]);
        tracing::info!("🚀 Scheduler loops started");
    }

    /// Stop intake, stop the loops, then wait for running tasks.
    ///
    /// Returns `false` if running tasks outlived the shutdown timeout.
    pub async fn shutdown(&self) -> bool {
        self.accepting.store(false, Ordering::Release);
        let timeout = self.config.read().shutdown_timeout();

        let loops: Vec<PeriodicTask> = std::mem::take(&mut *self.loops.lock());
        for task in loops {
            task.shutdown(timeout).await;
        }

        let abandoned = {
            let mut queue = self.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        if abandoned > 0 {
            tracing::info!("🧺 {} queued tasks dropped at shutdown", abandoned);
        }

        self.tracker.close();
        let finished = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        if !finished {
            tracing::warn!("⚠️  Running tasks did not finish within {:?}", timeout);
        }
        finished
    }

    pub fn state(&self) -> SystemState {
        self.monitor.lock().state()
    }

    pub fn snapshot(&self) -> Option<ResourceSnapshot> {
        self.monitor.lock().latest().cloned()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn running(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn last_outcome(&self, kind: TaskKind) -> Option<TaskState> {
        self.outcomes.lock().get(&kind).copied()
    }

    pub fn pools(&self) -> &PriorityPools {
        &self.pools
    }

    /// Thresholds apply to the next sample; pool sizes at the next state change.
    pub fn update_config(&self, config: SchedulerConfig) {
        self.monitor.lock().update_config(config.clone());
        *self.matrix.write() = ControlMatrix::standard(&config);
        self.pools.set_base(config.pools.clone());
        *self.config.write() = config;
        tracing::info!("🔧 Scheduler thresholds reloaded");
    }
}
