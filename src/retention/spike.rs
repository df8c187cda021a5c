use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub enum SpikeTransition {
    Started { rate: f64 },
    Ended { rate: f64, lasted: ChronoDuration },
}

/// Sliding-window ingestion rate with edge-triggered spike state.
///
/// Counts are bucketed per second so memory stays proportional to the
/// window length, not to the tick rate.
#[derive(Debug)]
pub struct SpikeDetector {
    window_seconds: i64,
    threshold: f64,
    buckets: VecDeque<(i64, u64)>,
    total: u64,
    spike_since: Option<DateTime<Utc>>,
}

impl SpikeDetector {
    pub fn new(threshold_per_second: f64, window_seconds: u64) -> Self {
        Self {
            window_seconds: window_seconds.max(1) as i64,
            threshold: threshold_per_second,
            buckets: VecDeque::new(),
            total: 0,
            spike_since: None,
        }
    }

    pub fn record(&mut self, now: DateTime<Utc>) -> Option<SpikeTransition> {
        let second = now.timestamp();
        match self.buckets.back_mut() {
            Some((last, count)) if *last >= second => *count += 1,
            _ => self.buckets.push_back((second, 1)),
        }
        self.total += 1;
        self.evaluate(now)
    }

    /// Re-check the rate without a new tick, so a spike can end after feeds go quiet.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Option<SpikeTransition> {
        let oldest_kept = now.timestamp() - self.window_seconds;
        while let Some(&(second, count)) = self.buckets.front() {
            if second <= oldest_kept {
                self.buckets.pop_front();
                self.total -= count;
            } else {
                break;
            }
        }

        let rate = self.rate();
        match (self.spike_since, rate > self.threshold) {
            (None, true) => {
                self.spike_since = Some(now);
                Some(SpikeTransition::Started { rate })
            }
            (Some(since), false) => {
                self.spike_since = None;
                Some(SpikeTransition::Ended {
                    rate,
                    lasted: now - since,
                })
            }
            _ => None,
        }
    }

    pub fn rate(&self) -> f64 {
        self.total as f64 / self.window_seconds as f64
    }

    pub fn is_spiking(&self) -> bool {
        self.spike_since.is_some()
    }

    pub fn reconfigure(&mut self, threshold_per_second: f64, window_seconds: u64) {
        self.threshold = threshold_per_second;
        self.window_seconds = window_seconds.max(1) as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    #[test]
    fn test_spike_fires_once_per_burst() {
        let mut detector = SpikeDetector::new(10.0, 10);
        let mut started = 0;
        for i in 0..300 {
            if let Some(SpikeTransition::Started { .. }) = detector.record(at(i / 100)) {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        assert!(detector.is_spiking());
    }

    #[test]
    fn test_spike_ends_after_quiet_window() {
        let mut detector = SpikeDetector::new(10.0, 10);
        for _ in 0..150 {
            detector.record(at(0));
        }
        assert!(detector.evaluate(at(5)).is_none());

        match detector.evaluate(at(11)) {
            Some(SpikeTransition::Ended { lasted, .. }) => {
                assert_eq!(lasted, ChronoDuration::seconds(11))
            }
            other => panic!("expected spike end, got {:?}", other),
        }

        // a fresh burst is a new spike
        let mut restarted = 0;
        for _ in 0..150 {
            if detector.record(at(20)).is_some() {
                restarted += 1;
            }
        }
        assert_eq!(restarted, 1);
    }

    #[test]
    fn test_rate_below_threshold_never_spikes() {
        let mut detector = SpikeDetector::new(10.0, 10);
        for i in 0..500 {
            assert!(detector.record(at(i)).is_none());
        }
        assert!(!detector.is_spiking());
    }
}
