use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Disks, Networks, System};

use crate::core::clock::SharedClock;
use crate::core::error::{FusionError, FusionResult};

/// Host utilisation at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub thread_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn idle() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            disk_percent: 0.0,
            net_rx_bytes: 0,
            net_tx_bytes: 0,
            thread_count: 0,
            timestamp: DateTime::<Utc>::default(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> FusionResult<ResourceSnapshot>;
}

struct SysinfoState {
    system: System,
    disks: Disks,
    networks: Networks,
}

/// Host probe backed by `sysinfo`.
///
/// CPU usage is measured between consecutive calls, so the first sample
/// after construction reads low.
pub struct SysinfoProbe {
    state: Mutex<SysinfoState>,
    clock: SharedClock,
}

impl SysinfoProbe {
    pub fn new(clock: SharedClock) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        Self {
            state: Mutex::new(SysinfoState {
                system,
                disks: Disks::new_with_refreshed_list(),
                networks: Networks::new_with_refreshed_list(),
            }),
            clock,
        }
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self) -> FusionResult<ResourceSnapshot> {
        let mut state = self.state.lock();
        state.system.refresh_cpu();
        state.system.refresh_memory();
        state.disks.refresh();
        state.networks.refresh();

        let total_memory = state.system.total_memory();
        if total_memory == 0 {
            return Err(FusionError::ResourceExhaustion(
                "host reported zero total memory".into(),
            ));
        }
        let memory_percent = state.system.used_memory() as f64 / total_memory as f64 * 100.0;

        // fullest mounted disk decides
        let disk_percent = state
            .disks
            .list()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let used = d.total_space().saturating_sub(d.available_space());
                used as f64 / d.total_space() as f64 * 100.0
            })
            .fold(0.0, f64::max);

        let (net_rx_bytes, net_tx_bytes) = state
            .networks
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.received(), tx + data.transmitted())
            });

        let thread_count = tokio::runtime::Handle::try_current()
            .map(|h| h.metrics().num_workers())
            .unwrap_or(1);

        Ok(ResourceSnapshot {
            cpu_percent: state.system.global_cpu_info().cpu_usage() as f64,
            memory_percent,
            disk_percent,
            net_rx_bytes,
            net_tx_bytes,
            thread_count,
            timestamp: self.clock.now(),
        })
    }
}
