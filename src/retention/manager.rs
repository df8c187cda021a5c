// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RETENTION MANAGER - BOUNDED TICK MEMORY WITH A DURABLE TAIL
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//
// Hot path (store): ring-buffer append + spike window bump, no I/O.
// Background: compression ages ticks past the retention horizon out of
// memory and hands them to the archiver over a bounded queue; purge trims
// the durable tier. A full queue drops the batch, memory stays bounded.
//
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::archive::TickArchive;
use super::buffer::TickBuffer;
use super::spike::{SpikeDetector, SpikeTransition};
use crate::core::clock::SharedClock;
use crate::core::config::RetentionConfig;
use crate::core::counters::{self, Counters};
use crate::core::error::{FusionError, FusionResult};
use crate::model::Tick;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionReport {
    pub evicted: usize,
    pub queued_for_archive: usize,
    pub dropped: usize,
}

pub struct RetentionManager {
    config: RwLock<RetentionConfig>,
    clock: SharedClock,
    counters: Arc<Counters>,
    buffers: DashMap<String, Arc<Mutex<TickBuffer>>>,
    spike: Mutex<SpikeDetector>,
    compaction: Arc<Notify>,
    overflow: Mutex<Vec<Tick>>,
    archive: Arc<dyn TickArchive>,
    archive_tx: mpsc::Sender<Vec<Tick>>,
    archive_rx: Mutex<Option<mpsc::Receiver<Vec<Tick>>>>,
    compress_lock: Mutex<()>,
}

impl RetentionManager {
    pub fn new(
        config: RetentionConfig,
        clock: SharedClock,
        counters: Arc<Counters>,
        archive: Arc<dyn TickArchive>,
    ) -> Self {
        let (archive_tx, archive_rx) = mpsc::channel(config.archive_queue_batches.max(1));
        let spike = SpikeDetector::new(
            config.spike_threshold_ticks_per_second,
            config.spike_window_seconds,
        );

        tracing::info!(
            "💾 Retention ready: {} ticks/symbol, {:.1}h horizon, archive '{}'",
            config.buffer_capacity_per_symbol,
            config.retention_horizon_hours,
            archive.name()
        );

        Self {
            config: RwLock::new(config),
            clock,
            counters,
            buffers: DashMap::new(),
            spike: Mutex::new(spike),
            compaction: Arc::new(Notify::new()),
            overflow: Mutex::new(Vec::new()),
            archive,
            archive_tx,
            archive_rx: Mutex::new(Some(archive_rx)),
            compress_lock: Mutex::new(()),
        }
    }

    fn buffer(&self, symbol: &str) -> Arc<Mutex<TickBuffer>> {
        if let Some(existing) = self.buffers.get(symbol) {
            return Arc::clone(existing.value());
        }
        let capacity = self.config.read().buffer_capacity_per_symbol;
        let entry = self
            .buffers
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TickBuffer::new(capacity))));
        Arc::clone(entry.value())
    }

    /// Append a raw tick. Never touches durable storage.
    pub fn store(&self, tick: Tick) {
        let buffer = self.buffer(&tick.symbol);
        let evicted = buffer.lock().push(tick);

        if let Some(old) = evicted {
            self.counters.incr(counters::TICKS_OVERFLOWED);
            let limit = self.config.read().buffer_capacity_per_symbol;
            let mut overflow = self.overflow.lock();
            if overflow.len() < limit {
                overflow.push(old);
            } else {
                self.counters.incr(counters::ARCHIVE_DROPPED);
            }
        }

        let transition = self.spike.lock().record(self.clock.now());
        if let Some(transition) = transition {
            self.on_spike_transition(transition);
        }
    }

    fn on_spike_transition(&self, transition: SpikeTransition) {
        match transition {
            SpikeTransition::Started { rate } => {
                self.counters.incr(counters::SPIKE_STARTED);
                tracing::warn!(
                    "🌊 Ingestion spike started: {:.1} ticks/s, compressing now",
                    rate
                );
                self.compaction.notify_one();
            }
            SpikeTransition::Ended { rate, lasted } => {
                self.counters.incr(counters::SPIKE_ENDED);
                tracing::info!(
                    "🏁 Ingestion spike ended after {}s ({:.1} ticks/s)",
                    lasted.num_seconds(),
                    rate
                );
            }
        }
    }

    /// Signalled on spike onset; wire it to the compression task.
    pub fn compaction_trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.compaction)
    }

    /// Evict ticks older than the retention horizon and queue them for archival.
    pub fn compress(&self) -> CompressionReport {
        let Some(_run) = self.compress_lock.try_lock() else {
            tracing::debug!("⏸️  Compression already running, skipping");
            return CompressionReport::default();
        };

        let now = self.clock.now();
        let cutoff = now - self.config.read().retention_horizon();

        let transition = self.spike.lock().evaluate(now);
        if let Some(transition) = transition {
            self.on_spike_transition(transition);
        }

        let buffers: Vec<Arc<Mutex<TickBuffer>>> =
            self.buffers.iter().map(|e| Arc::clone(e.value())).collect();

        let mut batch: Vec<Tick> = std::mem::take(&mut *self.overflow.lock());
        let mut evicted = 0;
        for buffer in buffers {
            let expired = buffer.lock().drain_older_than(cutoff);
            evicted += expired.len();
            batch.extend(expired);
        }

        self.counters.incr(counters::COMPRESSION_RUNS);
        if batch.is_empty() {
            tracing::trace!("🧹 Compression: nothing past the horizon");
            return CompressionReport::default();
        }
        self.counters.add(counters::TICKS_EVICTED, evicted as u64);

        let queued = batch.len();
        let report = match self.archive_tx.try_send(batch) {
            Ok(()) => CompressionReport {
                evicted,
                queued_for_archive: queued,
                dropped: 0,
            },
            Err(e) => {
                self.counters.add(counters::ARCHIVE_DROPPED, queued as u64);
                tracing::warn!(
                    "⚠️  Archive queue unavailable ({}), dropping {} ticks",
                    match e {
                        mpsc::error::TrySendError::Full(_) => "full",
                        mpsc::error::TrySendError::Closed(_) => "closed",
                    },
                    queued
                );
                CompressionReport {
                    evicted,
                    queued_for_archive: 0,
                    dropped: queued,
                }
            }
        };

        tracing::debug!(
            "🧹 Compression evicted {} ticks, {} queued for archive",
            report.evicted,
            report.queued_for_archive
        );
        report
    }

    /// Remove durable rows older than the durable horizon.
    pub async fn purge_durable(&self) -> FusionResult<u64> {
        let cutoff = self.clock.now() - self.config.read().durable_horizon();
        match self.archive.purge_before(cutoff).await {
            Ok(purged) => {
                self.counters.add(counters::DURABLE_PURGED, purged);
                if purged > 0 {
                    tracing::info!("🗑️  Purged {} archived ticks before {}", purged, cutoff);
                }
                Ok(purged)
            }
            Err(e) => {
                self.counters.incr(counters::ARCHIVE_FAILURES);
                tracing::warn!("⚠️  Durable purge failed: {}", e);
                Err(FusionError::DurableIo(e.to_string()))
            }
        }
    }

    /// Start the background writer draining the archive queue.
    ///
    /// Only the first call spawns; the queue has a single consumer.
    pub fn spawn_archiver(&self, parent: &CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self.archive_rx.lock().take()?;
        let archive = Arc::clone(&self.archive);
        let counters = Arc::clone(&self.counters);
        let cancel = parent.child_token();

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = rx.recv() => match batch {
                        Some(batch) => write_batch(archive.as_ref(), &counters, batch).await,
                        None => break,
                    },
                }
            }

            // flush whatever compression already handed over
            rx.close();
            while let Ok(batch) = rx.try_recv() {
                write_batch(archive.as_ref(), &counters, batch).await;
            }
            tracing::debug!("⏹️  Archiver stopped");
        }))
    }

    pub fn latest_ticks(&self, symbol: &str, limit: usize) -> Vec<Tick> {
        self.buffers
            .get(symbol)
            .map(|b| b.lock().latest(limit))
            .unwrap_or_default()
    }

    pub fn buffer_len(&self, symbol: &str) -> usize {
        self.buffers.get(symbol).map(|b| b.lock().len()).unwrap_or(0)
    }

    pub fn total_buffered(&self) -> usize {
        self.buffers.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_spiking(&self) -> bool {
        self.spike.lock().is_spiking()
    }

    /// Spike and horizon parameters apply at once; capacity applies to new buffers.
    pub fn update_config(&self, config: RetentionConfig) {
        self.spike.lock().reconfigure(
            config.spike_threshold_ticks_per_second,
            config.spike_window_seconds,
        );
        *self.config.write() = config;
        tracing::info!("🔧 Retention parameters reloaded");
    }
}

async fn write_batch(archive: &dyn TickArchive, counters: &Counters, batch: Vec<Tick>) {
    let size = batch.len();
    match archive.archive(batch).await {
        Ok(written) => counters.add(counters::TICKS_ARCHIVED, written),
        Err(e) => {
            counters.incr(counters::ARCHIVE_FAILURES);
            tracing::warn!("⚠️  Archiving {} ticks failed: {}", size, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::model::FeedSource;
    use crate::retention::archive::{MockTickArchive, NullArchive};
    use chrono::{TimeZone, Utc};

    fn start() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn manager_with(
        config: RetentionConfig,
        archive: Arc<dyn TickArchive>,
    ) -> (RetentionManager, Arc<ManualClock>, Arc<Counters>) {
        let clock = Arc::new(ManualClock::new(start()));
        let counters = Arc::new(Counters::new());
        let manager = RetentionManager::new(config, clock.clone(), counters.clone(), archive);
        (manager, clock, counters)
    }

    fn tick_at(clock: &ManualClock, price: f64) -> Tick {
        use crate::core::clock::Clock;
        Tick::new("EURUSD", FeedSource::Broker, clock.now(), price, price + 0.0001, 1.0)
    }

    #[test]
    fn test_capacity_bound() {
        let (manager, clock, counters) = manager_with(
            RetentionConfig {
                buffer_capacity_per_symbol: 5,
                ..Default::default()
            },
            Arc::new(NullArchive),
        );
        for i in 0..8 {
            manager.store(tick_at(&clock, 1.0 + i as f64));
        }
        assert_eq!(manager.buffer_len("EURUSD"), 5);
        assert_eq!(counters.get(counters::TICKS_OVERFLOWED), 3);
        let bids: Vec<f64> = manager.latest_ticks("EURUSD", 10).iter().map(|t| t.bid).collect();
        assert_eq!(bids, vec![4.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_compress_is_noop_when_nothing_expired() {
        let (manager, clock, _) = manager_with(RetentionConfig::default(), Arc::new(NullArchive));
        manager.store(tick_at(&clock, 1.1));
        assert_eq!(manager.compress(), CompressionReport::default());
        assert_eq!(manager.buffer_len("EURUSD"), 1);
    }

    #[test]
    fn test_compress_evicts_past_horizon() {
        let (manager, clock, counters) =
            manager_with(RetentionConfig::default(), Arc::new(NullArchive));
        manager.store(tick_at(&clock, 1.1));
        clock.advance_secs(3000);
        manager.store(tick_at(&clock, 1.2));
        clock.advance_secs(1000);

        let report = manager.compress();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.queued_for_archive, 1);
        assert_eq!(manager.buffer_len("EURUSD"), 1);
        assert_eq!(counters.get(counters::TICKS_EVICTED), 1);
    }

    #[test]
    fn test_spike_triggers_compaction_once() {
        let (manager, clock, counters) = manager_with(
            RetentionConfig {
                spike_threshold_ticks_per_second: 10.0,
                spike_window_seconds: 10,
                ..Default::default()
            },
            Arc::new(NullArchive),
        );
        for _ in 0..500 {
            manager.store(tick_at(&clock, 1.1));
        }
        assert!(manager.is_spiking());
        assert_eq!(counters.get(counters::SPIKE_STARTED), 1);

        clock.advance_secs(20);
        manager.compress();
        assert!(!manager.is_spiking());
        assert_eq!(counters.get(counters::SPIKE_ENDED), 1);
    }

    #[tokio::test]
    async fn test_archive_failure_never_blocks_eviction() {
        let mut archive = MockTickArchive::new();
        archive
            .expect_archive()
            .returning(|_| Err(FusionError::DurableIo("disk full".into())));
        archive.expect_name().return_const("mock");

        let (manager, clock, counters) =
            manager_with(RetentionConfig::default(), Arc::new(archive));
        let cancel = CancellationToken::new();
        let handle = manager.spawn_archiver(&cancel).unwrap();

        manager.store(tick_at(&clock, 1.1));
        clock.advance_secs(7200);
        let report = manager.compress();
        assert_eq!(report.evicted, 1);
        assert_eq!(manager.buffer_len("EURUSD"), 0);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(counters.get(counters::ARCHIVE_FAILURES), 1);
    }

    #[tokio::test]
    async fn test_purge_failure_is_recoverable() {
        let mut archive = MockTickArchive::new();
        archive
            .expect_purge_before()
            .returning(|_| Err(FusionError::DurableIo("locked".into())));
        archive.expect_name().return_const("mock");

        let (manager, _, counters) = manager_with(RetentionConfig::default(), Arc::new(archive));
        let err = manager.purge_durable().await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(counters.get(counters::ARCHIVE_FAILURES), 1);
    }
}
