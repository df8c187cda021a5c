use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Rolling window length for latency percentiles.
const LATENCY_WINDOW: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Stage {
    Validation,
    Storage,
    Sampling,
    OffsetApply,
    FanOut,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Validation,
        Stage::Storage,
        Stage::Sampling,
        Stage::OffsetApply,
        Stage::FanOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validation => "validation",
            Stage::Storage => "storage",
            Stage::Sampling => "sampling",
            Stage::OffsetApply => "offset_apply",
            Stage::FanOut => "fan_out",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingStatistics {
    pub per_stage: BTreeMap<String, LatencySummary>,
    pub end_to_end: LatencySummary,
    pub ticks_processed: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct LatencyWindow {
    micros: VecDeque<u64>,
}

impl LatencyWindow {
    fn record(&mut self, elapsed: Duration) {
        if self.micros.len() >= LATENCY_WINDOW {
            self.micros.pop_front();
        }
        self.micros.push_back(elapsed.as_micros() as u64);
    }

    fn summary(&self) -> LatencySummary {
        if self.micros.is_empty() {
            return LatencySummary::default();
        }
        let mut sorted: Vec<u64> = self.micros.iter().copied().collect();
        sorted.sort_unstable();

        let n = sorted.len();
        let at = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];

        LatencySummary {
            samples: n,
            mean_us: sorted.iter().sum::<u64>() as f64 / n as f64,
            p50_us: sorted[n / 2],
            p95_us: at(0.95),
            p99_us: at(0.99),
        }
    }
}

/// Per-stage and end-to-end ingest latency.
#[derive(Debug)]
pub struct PipelineMetrics {
    stages: [Mutex<LatencyWindow>; 5],
    end_to_end: Mutex<LatencyWindow>,
    ticks_processed: AtomicU64,
    start_time: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            stages: Default::default(),
            end_to_end: Mutex::new(LatencyWindow::default()),
            ticks_processed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_stage(&self, stage: Stage, elapsed: Duration) {
        self.stages[stage.index()].lock().record(elapsed);
    }

    pub fn record_end_to_end(&self, elapsed: Duration) {
        self.end_to_end.lock().record(elapsed);
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticks_processed(&self) -> u64 {
        self.ticks_processed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TimingStatistics {
        let per_stage = Stage::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), self.stages[s.index()].lock().summary()))
            .collect();

        TimingStatistics {
            per_stage,
            end_to_end: self.end_to_end.lock().summary(),
            ticks_processed: self.ticks_processed(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn print_report(&self) {
        let stats = self.snapshot();
        let stage = |s: Stage| stats.per_stage.get(s.as_str()).cloned().unwrap_or_default();

        tracing::info!(
            "
╔══════════════════════════════════════════════════════════════════════╗
║                 TICK PIPELINE TIMING                                 ║
╚══════════════════════════════════════════════════════════════════════╝

📊 Throughput:
   • Ticks processed:    {}
   • Uptime:             {} seconds

⚡ End-to-end latency:
   • P50:                {} µs
   • P95:                {} µs
   • P99:                {} µs

🔧 Stage P95:
   • Validation:         {} µs
   • Storage:            {} µs
   • Sampling:           {} µs
   • Offset apply:       {} µs
   • Fan-out:            {} µs

━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
",
            stats.ticks_processed,
            stats.uptime_secs,
            stats.end_to_end.p50_us,
            stats.end_to_end.p95_us,
            stats.end_to_end.p99_us,
            stage(Stage::Validation).p95_us,
            stage(Stage::Storage).p95_us,
            stage(Stage::Sampling).p95_us,
            stage(Stage::OffsetApply).p95_us,
            stage(Stage::FanOut).p95_us,
        );
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_summary() {
        let metrics = PipelineMetrics::new();
        let stats = metrics.snapshot();
        assert_eq!(stats.ticks_processed, 0);
        assert_eq!(stats.end_to_end, LatencySummary::default());
        assert_eq!(stats.per_stage.len(), 5);
    }

    #[test]
    fn test_percentiles() {
        let metrics = PipelineMetrics::new();
        for us in 1..=100 {
            metrics.record_end_to_end(Duration::from_micros(us));
        }
        let stats = metrics.snapshot();
        assert_eq!(stats.ticks_processed, 100);
        assert_eq!(stats.end_to_end.p50_us, 51);
        assert_eq!(stats.end_to_end.p95_us, 96);
        assert_eq!(stats.end_to_end.p99_us, 100);
        assert!((stats.end_to_end.mean_us - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_window_is_bounded() {
        let metrics = PipelineMetrics::new();
        for _ in 0..(LATENCY_WINDOW + 10) {
            metrics.record_stage(Stage::FanOut, Duration::from_micros(3));
        }
        let stats = metrics.snapshot();
        assert_eq!(stats.per_stage["fan_out"].samples, LATENCY_WINDOW);
    }
}
