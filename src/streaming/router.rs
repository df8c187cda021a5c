// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TICK INGESTION ROUTER - SINGLE ENTRY POINT FOR BOTH FEEDS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//
// ingest() runs synchronously on the adapter's task:
// 1. validate (invalid ticks are counted and dropped, never raised)
// 2. raw tick → retention buffer
// 3. raw mid → calibrator sample window
// 4. current offset applied to the adjusted feed
// 5. subscribers called in registration order
//
// Each stage is timed; a panicking subscriber is isolated and counted.
//
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::metrics::{PipelineMetrics, Stage, TimingStatistics};
use crate::calibration::OffsetCalibrator;
use crate::core::clock::SharedClock;
use crate::core::counters::{self, Counters};
use crate::core::error::ValidationError;
use crate::fusion::CandleFusionEngine;
use crate::model::{FeedSource, FusedCandle, Tick};
use crate::retention::RetentionManager;

pub type TickCallback = Arc<dyn Fn(&Tick) + Send + Sync>;
pub type FusedCallback = Arc<dyn Fn(&FusedCandle) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Accepted,
    Invalid(ValidationError),
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Accepted)
    }
}

pub struct TickIngestionRouter {
    retention: Arc<RetentionManager>,
    calibrator: Arc<OffsetCalibrator>,
    fusion: Arc<CandleFusionEngine>,
    clock: SharedClock,
    counters: Arc<Counters>,
    metrics: PipelineMetrics,
    subscribers: RwLock<Arc<Vec<(SubscriptionId, TickCallback)>>>,
    next_subscription: AtomicU64,
    latest: DashMap<String, Mutex<VecDeque<Tick>>>,
    latest_limit: AtomicUsize,
    last_seen: DashMap<FeedSource, DateTime<Utc>>,
}

impl TickIngestionRouter {
    pub fn new(
        retention: Arc<RetentionManager>,
        calibrator: Arc<OffsetCalibrator>,
        fusion: Arc<CandleFusionEngine>,
        clock: SharedClock,
        counters: Arc<Counters>,
        latest_limit: usize,
    ) -> Self {
        Self {
            retention,
            calibrator,
            fusion,
            clock,
            counters,
            metrics: PipelineMetrics::new(),
            subscribers: RwLock::new(Arc::new(Vec::new())),
            next_subscription: AtomicU64::new(1),
            latest: DashMap::new(),
            latest_limit: AtomicUsize::new(latest_limit.max(1)),
            last_seen: DashMap::new(),
        }
    }

    /// Feed-adapter entry point. Never fails; invalid ticks come back as a value.
    pub fn ingest(&self, tick: Tick) -> IngestOutcome {
        let started = Instant::now();

        let stage = Instant::now();
        let valid = tick.validate();
        self.metrics.record_stage(Stage::Validation, stage.elapsed());
        if let Err(e) = valid {
            return self.reject(&tick.symbol, e);
        }

        let stage = Instant::now();
        self.retention.store(tick.clone());
        self.metrics.record_stage(Stage::Storage, stage.elapsed());

        let stage = Instant::now();
        self.calibrator
            .add_sample(&tick.symbol, tick.source, tick.timestamp, tick.mid());
        self.metrics.record_stage(Stage::Sampling, stage.elapsed());

        let stage = Instant::now();
        let offset = if tick.source == self.calibrator.adjusted_source() {
            self.calibrator.get_offset(&tick.symbol)
        } else {
            0.0
        };
        let adjusted = tick.with_offset(offset);
        self.remember(&adjusted);
        self.metrics.record_stage(Stage::OffsetApply, stage.elapsed());

        let stage = Instant::now();
        self.fan_out(&adjusted);
        self.metrics.record_stage(Stage::FanOut, stage.elapsed());

        self.counters.incr(counters::TICKS_ACCEPTED);
        self.metrics.record_end_to_end(started.elapsed());
        IngestOutcome::Accepted
    }

    /// Adapter form of [`TickIngestionRouter::ingest`] taking a raw source id.
    pub fn ingest_quote(
        &self,
        symbol: &str,
        source_id: &str,
        timestamp: DateTime<Utc>,
        bid: f64,
        ask: f64,
        volume: f64,
    ) -> IngestOutcome {
        match source_id.parse::<FeedSource>() {
            Ok(source) => self.ingest(Tick::new(symbol, source, timestamp, bid, ask, volume)),
            Err(e) => self.reject(symbol, e),
        }
    }

    fn reject(&self, symbol: &str, error: ValidationError) -> IngestOutcome {
        self.counters.incr(counters::TICKS_INVALID);
        tracing::debug!("🚫 Dropped tick for '{}': {}", symbol, error);
        IngestOutcome::Invalid(error)
    }

    fn remember(&self, adjusted: &Tick) {
        self.last_seen.insert(adjusted.source, self.clock.now());

        let limit = self.latest_limit.load(Ordering::Relaxed);
        let entry = self
            .latest
            .entry(adjusted.symbol.clone())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut ticks = entry.lock();
        ticks.push_back(adjusted.clone());
        while ticks.len() > limit {
            ticks.pop_front();
        }
    }

    fn fan_out(&self, tick: &Tick) {
        let subscribers = Arc::clone(&*self.subscribers.read());
        for (id, callback) in subscribers.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(tick))).is_err() {
                self.counters.incr(counters::SUBSCRIBER_PANICS);
                tracing::warn!("💥 Subscriber {:?} panicked on {} tick", id, tick.symbol);
            }
        }
    }

    pub fn subscribe(&self, callback: TickCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self.subscribers.write();
        let mut next = Vec::with_capacity(subscribers.len() + 1);
        next.extend(subscribers.iter().cloned());
        next.push((id, callback));
        *subscribers = Arc::new(next);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        let next: Vec<_> = subscribers
            .iter()
            .filter(|(sid, _)| *sid != id)
            .cloned()
            .collect();
        let removed = next.len() != before;
        *subscribers = Arc::new(next);
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Up to `limit` most recent offset-adjusted ticks, oldest first.
    pub fn get_latest_ticks(&self, symbol: &str, limit: usize) -> Vec<Tick> {
        self.latest
            .get(symbol)
            .map(|ticks| {
                let ticks = ticks.lock();
                let skip = ticks.len().saturating_sub(limit);
                ticks.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn set_latest_limit(&self, limit: usize) {
        self.latest_limit.store(limit.max(1), Ordering::Relaxed);
    }

    pub fn last_seen(&self, source: FeedSource) -> Option<DateTime<Utc>> {
        self.last_seen.get(&source).map(|t| *t)
    }

    /// Sources silent for longer than `max_age`, including never-seen ones.
    pub fn stale_sources(&self, max_age: ChronoDuration) -> Vec<FeedSource> {
        let now = self.clock.now();
        FeedSource::ALL
            .iter()
            .copied()
            .filter(|source| match self.last_seen(*source) {
                Some(seen) => now - seen > max_age,
                None => true,
            })
            .collect()
    }

    pub fn timing_statistics(&self) -> TimingStatistics {
        self.metrics.snapshot()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn subscribe_fused(&self) -> broadcast::Receiver<FusedCandle> {
        self.fusion.subscribe()
    }

    pub fn get_fused_candles(&self, symbol: &str, limit: usize) -> Vec<FusedCandle> {
        self.fusion.get_fused_candles(symbol, limit)
    }

    /// Push fused candles to `callback` until `parent` is cancelled.
    pub fn on_fused_candle(
        &self,
        callback: FusedCallback,
        parent: &CancellationToken,
    ) -> JoinHandle<()> {
        let mut rx = self.fusion.subscribe();
        let cancel = parent.child_token();
        let events = Arc::clone(&self.counters);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(candle) => {
                            if catch_unwind(AssertUnwindSafe(|| callback(&candle))).is_err() {
                                events.incr(counters::SUBSCRIBER_PANICS);
                                tracing::warn!("💥 Fused-candle subscriber panicked on {}", candle.symbol);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!("⚠️  Fused-candle subscriber lagged, {} candles skipped", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}
