use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;

pub const TICKS_ACCEPTED: &str = "ticks_accepted";
pub const TICKS_INVALID: &str = "ticks_invalid";
pub const SUBSCRIBER_PANICS: &str = "subscriber_panics";
pub const CALIBRATION_UPDATED: &str = "calibration_updated";
pub const CALIBRATION_SKIPPED_INSUFFICIENT: &str = "calibration_skipped_insufficient";
pub const CALIBRATION_SKIPPED_UNCHANGED: &str = "calibration_skipped_unchanged";
pub const CALIBRATION_SKIPPED_BUSY: &str = "calibration_skipped_busy";
pub const CALIBRATION_REJECTED_OFFSET: &str = "calibration_rejected_offset";
pub const DRIFT_DETECTED: &str = "drift_detected";
pub const FUSION_EMITTED: &str = "fusion_emitted";
pub const FUSION_SKIPPED_SINGLE_SOURCE: &str = "fusion_skipped_single_source";
pub const FUSION_ALREADY_FUSED: &str = "fusion_already_fused";
pub const CANDLES_BUILT: &str = "candles_built";
pub const SPIKE_STARTED: &str = "spike_started";
pub const SPIKE_ENDED: &str = "spike_ended";
pub const COMPRESSION_RUNS: &str = "compression_runs";
pub const TICKS_EVICTED: &str = "ticks_evicted";
pub const TICKS_OVERFLOWED: &str = "ticks_overflowed";
pub const ARCHIVE_FAILURES: &str = "archive_failures";
pub const ARCHIVE_DROPPED: &str = "archive_dropped";
pub const TICKS_ARCHIVED: &str = "ticks_archived";
pub const DURABLE_PURGED: &str = "durable_purged";
pub const TASKS_SUBMITTED: &str = "tasks_submitted";
pub const TASKS_DEFERRED: &str = "tasks_deferred";
pub const TASKS_COMPLETED: &str = "tasks_completed";
pub const TASKS_FAILED: &str = "tasks_failed";
pub const TASKS_RETRIED: &str = "tasks_retried";
pub const TASKS_RETRY_EXHAUSTED: &str = "tasks_retry_exhausted";
pub const TASKS_DEADLINE_EXPIRED: &str = "tasks_deadline_expired";
pub const TASKS_OVERLAP_SKIPPED: &str = "tasks_overlap_skipped";
pub const STATE_TRANSITIONS: &str = "state_transitions";
pub const RESOURCE_SAMPLE_FAILURES: &str = "resource_sample_failures";

/// Named event counters and gauges for every skip, defer and drop in the core.
///
/// Backed by a private prometheus registry so the same numbers can be
/// rendered in exposition format or read back as a plain map.
pub struct Counters {
    registry: Registry,
    events: IntCounterVec,
    levels: IntGaugeVec,
}

impl Counters {
    pub fn new() -> Self {
        let registry = Registry::new();
        let events = IntCounterVec::new(
            Opts::new("fusion_events_total", "Pipeline events by name"),
            &["event"],
        )
        .expect("static counter definition is valid");
        let levels = IntGaugeVec::new(
            Opts::new("fusion_levels", "Pipeline levels by name"),
            &["level"],
        )
        .expect("static gauge definition is valid");

        if let Err(e) = registry.register(Box::new(events.clone())) {
            tracing::warn!("Failed to register event counters: {}", e);
        }
        if let Err(e) = registry.register(Box::new(levels.clone())) {
            tracing::warn!("Failed to register level gauges: {}", e);
        }

        Self {
            registry,
            events,
            levels,
        }
    }

    pub fn incr(&self, event: &str) {
        self.events.with_label_values(&[event]).inc();
    }

    pub fn add(&self, event: &str, n: u64) {
        if n > 0 {
            self.events.with_label_values(&[event]).inc_by(n);
        }
    }

    pub fn get(&self, event: &str) -> u64 {
        self.events.with_label_values(&[event]).get()
    }

    pub fn set_level(&self, level: &str, value: i64) {
        self.levels.with_label_values(&[level]).set(value);
    }

    pub fn level(&self, level: &str) -> i64 {
        self.levels.with_label_values(&[level]).get()
    }

    /// All counters that have fired at least once.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for family in self.events.collect() {
            for metric in family.get_metric() {
                if let Some(label) = metric.get_label().first() {
                    out.insert(
                        label.get_value().to_string(),
                        metric.get_counter().get_value() as u64,
                    );
                }
            }
        }
        out
    }

    /// Prometheus text exposition of every counter and gauge.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}
