#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use dual_feed_fusion::core::{Clock, FusionResult, ManualClock, Settings};
use dual_feed_fusion::retention::NullArchive;
use dual_feed_fusion::scheduler::{ResourceProbe, ResourceSnapshot};
use dual_feed_fusion::FusionSystem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
}

/// Probe reporting a settable CPU load, stamped with the test clock.
pub struct FixedLoadProbe {
    cpu_bits: AtomicU64,
    clock: Arc<ManualClock>,
}

impl FixedLoadProbe {
    pub fn new(cpu_percent: f64, clock: Arc<ManualClock>) -> Self {
        Self {
            cpu_bits: AtomicU64::new(cpu_percent.to_bits()),
            clock,
        }
    }

    pub fn set_cpu(&self, cpu_percent: f64) {
        self.cpu_bits.store(cpu_percent.to_bits(), Ordering::SeqCst);
    }
}

impl ResourceProbe for FixedLoadProbe {
    fn sample(&self) -> FusionResult<ResourceSnapshot> {
        Ok(ResourceSnapshot {
            cpu_percent: f64::from_bits(self.cpu_bits.load(Ordering::SeqCst)),
            memory_percent: 30.0,
            disk_percent: 40.0,
            timestamp: self.clock.now(),
            ..ResourceSnapshot::idle()
        })
    }
}

pub fn system_with(settings: Settings) -> (Arc<FusionSystem>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let probe = Arc::new(FixedLoadProbe::new(10.0, clock.clone()));
    let system = FusionSystem::build(settings, clock.clone(), probe, Arc::new(NullArchive))
        .expect("default settings are valid");
    (system, clock)
}
