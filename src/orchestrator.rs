// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FUSION SYSTEM - COMPOSITION ROOT
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//
// Wires router → retention / calibrator / candle builder → fusion engine,
// and hands every periodic maintenance cycle to the resource scheduler:
//
//   calibration     Medium   every calibration_interval
//   candle flush    High     every window / 10 (1..=30s)
//   fusion          High     same cadence as flush
//   compression     Critical every compression_interval, or on a spike
//   durable purge   Low      every purge_interval
//   status report   Deferred every minute
//
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use chrono::Duration as ChronoDuration;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::calibration::OffsetCalibrator;
use crate::core::clock::SharedClock;
use crate::core::config::Settings;
use crate::core::counters::Counters;
use crate::core::error::FusionResult;
use crate::core::health::{HealthChecker, HealthStatus};
use crate::core::periodic::PeriodicTask;
use crate::fusion::{CandleBuilder, CandleFusionEngine};
use crate::model::{FeedSource, OffsetRecord, Tick};
use crate::retention::{RetentionManager, TickArchive};
use crate::scheduler::{
    job, ResourceProbe, ResourceScheduler, ResourceSnapshot, SystemState, TaskJob, TaskKind,
};
use crate::streaming::{IngestOutcome, TickIngestionRouter, TimingStatistics};

const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// A feed silent for longer than this is reported as degraded.
const FEED_STALE_AFTER_SECS: i64 = 120;

/// Point-in-time view for operators.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub counters: BTreeMap<String, u64>,
    pub offsets: BTreeMap<String, OffsetRecord>,
    pub system_state: SystemState,
    pub resources: Option<ResourceSnapshot>,
    pub timing: TimingStatistics,
    pub health: HealthStatus,
    pub queued_tasks: usize,
    pub buffered_ticks: usize,
    pub spiking: bool,
    pub stale_sources: Vec<FeedSource>,
}

pub struct FusionSystem {
    settings: RwLock<Settings>,
    clock: SharedClock,
    counters: Arc<Counters>,
    health: HealthChecker,
    router: Arc<TickIngestionRouter>,
    calibrator: Arc<OffsetCalibrator>,
    fusion: Arc<CandleFusionEngine>,
    builder: Arc<CandleBuilder>,
    retention: Arc<RetentionManager>,
    scheduler: Arc<ResourceScheduler>,
    cancel: CancellationToken,
    loops: Mutex<Vec<PeriodicTask>>,
    archiver: Mutex<Option<JoinHandle<()>>>,
}

impl FusionSystem {
    pub fn build(
        settings: Settings,
        clock: SharedClock,
        probe: Arc<dyn ResourceProbe>,
        archive: Arc<dyn TickArchive>,
    ) -> FusionResult<Arc<Self>> {
        settings.validate()?;

        let counters = Arc::new(Counters::new());
        let health = HealthChecker::new(Arc::clone(&clock));

        let retention = Arc::new(RetentionManager::new(
            settings.retention.clone(),
            Arc::clone(&clock),
            Arc::clone(&counters),
            archive,
        ));
        let calibrator = Arc::new(OffsetCalibrator::new(
            settings.calibration.clone(),
            Arc::clone(&clock),
            Arc::clone(&counters),
        ));
        let fusion = Arc::new(CandleFusionEngine::new(
            settings.fusion.clone(),
            Arc::clone(&counters),
        ));
        let builder = Arc::new(CandleBuilder::new(
            settings.fusion.clone(),
            Arc::clone(&fusion),
            Some(Arc::clone(&calibrator)),
            Arc::clone(&counters),
        ));
        let router = Arc::new(TickIngestionRouter::new(
            Arc::clone(&retention),
            Arc::clone(&calibrator),
            Arc::clone(&fusion),
            Arc::clone(&clock),
            Arc::clone(&counters),
            settings.fusion.latest_ticks_per_symbol,
        ));
        let scheduler = Arc::new(
            ResourceScheduler::new(
                settings.scheduler.clone(),
                Arc::clone(&clock),
                Arc::clone(&counters),
                probe,
            )
            .with_health(health.clone()),
        );

        // first subscriber: adjusted ticks feed the per-source candles
        let candles = Arc::clone(&builder);
        router.subscribe(Arc::new(move |tick: &Tick| candles.on_tick(tick)));

        tracing::info!(
            "🧩 Fusion system assembled: reference={} adjusted={} window={}s",
            calibrator.reference_source(),
            calibrator.adjusted_source(),
            settings.fusion.window_seconds
        );

        Ok(Arc::new(Self {
            settings: RwLock::new(settings),
            clock,
            counters,
            health,
            router,
            calibrator,
            fusion,
            builder,
            retention,
            scheduler,
            cancel: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
            archiver: Mutex::new(None),
        }))
    }

    /// Start the archiver, the scheduler and every maintenance loop.
    pub fn start(&self) {
        let settings = self.settings.read().clone();

        *self.archiver.lock() = self.retention.spawn_archiver(&self.cancel);
        self.scheduler.start(&self.cancel);

        let flush_every =
            Duration::from_secs((settings.fusion.window_seconds / 10).clamp(1, 30));

        let calibration = {
            let calibrator = Arc::clone(&self.calibrator);
            job(move || {
                let calibrator = Arc::clone(&calibrator);
                async move {
                    calibrator.calibrate();
                    Ok(())
                }
            })
        };

        let candle_flush = {
            let builder = Arc::clone(&self.builder);
            let clock = Arc::clone(&self.clock);
            job(move || {
                let builder = Arc::clone(&builder);
                let now = clock.now();
                async move {
                    let closed = builder.flush(now);
                    if closed > 0 {
                        tracing::debug!("🕯️  Flushed {} candles", closed);
                    }
                    Ok(())
                }
            })
        };

        let fusion = {
            let engine = Arc::clone(&self.fusion);
            job(move || {
                let engine = Arc::clone(&engine);
                async move {
                    engine.fuse_all();
                    Ok(())
                }
            })
        };

        let compression = {
            let retention = Arc::clone(&self.retention);
            job(move || {
                let retention = Arc::clone(&retention);
                async move {
                    retention.compress();
                    Ok(())
                }
            })
        };

        let purge = {
            let retention = Arc::clone(&self.retention);
            job(move || {
                let retention = Arc::clone(&retention);
                async move { retention.purge_durable().await.map(|_| ()) }
            })
        };

        let status = {
            let router = Arc::clone(&self.router);
            let scheduler = Arc::clone(&self.scheduler);
            let health = self.health.clone();
            job(move || {
                let router = Arc::clone(&router);
                let scheduler = Arc::clone(&scheduler);
                let health = health.clone();
                async move {
                    report_feed_health(&router, &health).await;
                    tracing::info!(
                        "{} State {} | queued {} | running {}",
                        scheduler.state().emoji(),
                        scheduler.state().as_str(),
                        scheduler.queue_len(),
                        scheduler.running()
                    );
                    router.metrics().print_report();
                    Ok(())
                }
            })
        };

        let mut loops = vec![
            self.schedule_every(
                "calibration",
                Duration::from_secs(settings.calibration.calibration_interval_seconds),
                TaskKind::Calibration,
                calibration,
                None,
            ),
            self.schedule_every("candle-flush", flush_every, TaskKind::CandleFlush, candle_flush, None),
            self.schedule_every("fusion", flush_every, TaskKind::Fusion, fusion, None),
            self.schedule_every(
                "compression",
                Duration::from_secs(settings.retention.compression_interval_seconds),
                TaskKind::Compression,
                compression,
                Some(self.retention.compaction_trigger()),
            ),
            self.schedule_every(
                "durable-purge",
                Duration::from_secs(settings.retention.purge_interval_seconds),
                TaskKind::DurablePurge,
                purge,
                None,
            ),
            self.schedule_every(
                "status-report",
                STATUS_REPORT_INTERVAL,
                TaskKind::StatusReport,
                status,
                None,
            ),
        ];

        self.loops.lock().append(&mut loops);
        tracing::info!("🚀 Fusion system started");
    }

    /// A loop that submits `kind` each period. The submitted task expires
    /// if it is still queued two periods later.
    fn schedule_every(
        &self,
        name: &'static str,
        period: Duration,
        kind: TaskKind,
        work: TaskJob,
        trigger: Option<Arc<Notify>>,
    ) -> PeriodicTask {
        let scheduler = Arc::clone(&self.scheduler);
        let clock = Arc::clone(&self.clock);
        let ttl = ChronoDuration::from_std(period * 2).unwrap_or_else(|_| ChronoDuration::hours(1));

        let cycle = move || {
            let task = scheduler
                .task_for(kind, Arc::clone(&work))
                .with_deadline(clock.now() + ttl);
            if let Err(e) = scheduler.submit(task) {
                tracing::debug!("{} not submitted: {}", kind, e);
            }
            async {}
        };

        match trigger {
            Some(trigger) => PeriodicTask::spawn_with_trigger(name, period, trigger, &self.cancel, cycle),
            None => PeriodicTask::spawn(name, period, &self.cancel, cycle),
        }
    }

    /// Stop the loops, drain the scheduler, then let the archiver flush.
    ///
    /// Returns `false` if anything outlived the shutdown timeout.
    pub async fn shutdown(&self) -> bool {
        tracing::info!("🛑 Fusion system shutting down...");
        let timeout = self.settings.read().scheduler.shutdown_timeout();

        let loops: Vec<PeriodicTask> = std::mem::take(&mut *self.loops.lock());
        let mut clean = true;
        for task in loops {
            clean &= task.shutdown(timeout).await;
        }

        clean &= self.scheduler.shutdown().await;

        self.cancel.cancel();
        let archiver = self.archiver.lock().take();
        if let Some(handle) = archiver {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("❌ Archiver task failed: {}", e);
                    clean = false;
                }
                Err(_) => {
                    tracing::warn!("⚠️  Archiver did not drain within {:?}", timeout);
                    clean = false;
                }
            }
        }

        if clean {
            tracing::info!("✅ Shutdown complete");
        }
        clean
    }

    /// Validate and apply new parameters.
    ///
    /// Loop periods and buffer capacities for existing symbols keep their
    /// startup values.
    pub fn apply_settings(&self, settings: Settings) -> FusionResult<()> {
        settings.validate()?;

        self.calibrator.update_config(settings.calibration.clone());
        self.retention.update_config(settings.retention.clone());
        self.fusion.update_config(settings.fusion.clone());
        self.builder.update_config(settings.fusion.clone());
        self.router
            .set_latest_limit(settings.fusion.latest_ticks_per_symbol);
        self.scheduler.update_config(settings.scheduler.clone());

        *self.settings.write() = settings;
        tracing::info!("🔄 Settings applied");
        Ok(())
    }

    pub fn ingest(&self, tick: Tick) -> IngestOutcome {
        self.router.ingest(tick)
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        let offsets = self
            .calibrator
            .offsets()
            .iter()
            .map(|(symbol, record)| (symbol.clone(), record.clone()))
            .collect();

        Diagnostics {
            counters: self.counters.snapshot(),
            offsets,
            system_state: self.scheduler.state(),
            resources: self.scheduler.snapshot(),
            timing: self.router.timing_statistics(),
            health: self.health.get_status().await,
            queued_tasks: self.scheduler.queue_len(),
            buffered_ticks: self.retention.total_buffered(),
            spiking: self.retention.is_spiking(),
            stale_sources: self
                .router
                .stale_sources(ChronoDuration::seconds(FEED_STALE_AFTER_SECS)),
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn router(&self) -> &Arc<TickIngestionRouter> {
        &self.router
    }

    pub fn calibrator(&self) -> &Arc<OffsetCalibrator> {
        &self.calibrator
    }

    pub fn fusion(&self) -> &Arc<CandleFusionEngine> {
        &self.fusion
    }

    pub fn candle_builder(&self) -> &Arc<CandleBuilder> {
        &self.builder
    }

    pub fn retention(&self) -> &Arc<RetentionManager> {
        &self.retention
    }

    pub fn scheduler(&self) -> &Arc<ResourceScheduler> {
        &self.scheduler
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    /// Parent token of every background task the system owns.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

async fn report_feed_health(router: &TickIngestionRouter, health: &HealthChecker) {
    let stale = router.stale_sources(ChronoDuration::seconds(FEED_STALE_AFTER_SECS));
    for source in FeedSource::ALL {
        let component = format!("feed:{}", source);
        if stale.contains(&source) {
            let detail = match router.last_seen(source) {
                Some(at) => format!("no ticks since {}", at),
                None => "no ticks received".to_string(),
            };
            tracing::warn!("📡 {} feed stale: {}", source, detail);
            health.record_failure(&component, &detail).await;
        } else {
            health.record_success(&component).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::{Clock, ManualClock};
    use crate::core::counters;
    use crate::retention::NullArchive;
    use crate::scheduler::probe::MockResourceProbe;
    use chrono::{TimeZone, Utc};

    fn idle_probe(clock: Arc<ManualClock>) -> Arc<dyn ResourceProbe> {
        let mut probe = MockResourceProbe::new();
        probe.expect_sample().returning(move || {
            Ok(ResourceSnapshot {
                cpu_percent: 10.0,
                memory_percent: 20.0,
                timestamp: clock.now(),
                ..ResourceSnapshot::idle()
            })
        });
        Arc::new(probe)
    }

    fn system() -> (Arc<FusionSystem>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap(),
        ));
        let system = FusionSystem::build(
            Settings::default(),
            clock.clone(),
            idle_probe(clock.clone()),
            Arc::new(NullArchive),
        )
        .unwrap();
        (system, clock)
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut settings = Settings::default();
        settings.fusion.window_seconds = 0;
        let result = FusionSystem::build(
            settings,
            clock.clone(),
            idle_probe(clock),
            Arc::new(NullArchive),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_ticks_reach_candle_builder_and_fusion() {
        let (system, clock) = system();
        let t0 = clock.now();
        for (offset, price) in [(0, 1.1000), (60, 1.1010), (301, 1.1020)] {
            for source in FeedSource::ALL {
                let tick = Tick::new(
                    "EURUSD",
                    source,
                    t0 + ChronoDuration::seconds(offset),
                    price,
                    price + 0.0002,
                    10.0,
                );
                assert!(system.ingest(tick).is_accepted());
            }
        }
        assert_eq!(system.counters().get(counters::CANDLES_BUILT), 2);

        let fused = system.fusion().fuse("EURUSD");
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].sources_used.len(), 2);
    }

    #[test]
    fn test_apply_settings_validates_first() {
        let (system, _clock) = system();
        let mut bad = Settings::default();
        bad.scheduler.cpu_high = 99.0;
        assert!(system.apply_settings(bad).is_err());
        assert_eq!(system.settings().scheduler.cpu_high, 85.0);

        let mut good = Settings::default();
        good.calibration.max_offset = 10.0;
        system.apply_settings(good).unwrap();
        assert_eq!(system.settings().calibration.max_offset, 10.0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (system, _clock) = system();
        system.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(system.shutdown().await);
        assert!(system.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_diagnostics_reports_stale_feeds() {
        let (system, clock) = system();
        let tick = Tick::new("EURUSD", FeedSource::Broker, clock.now(), 1.1, 1.1002, 1.0);
        system.ingest(tick);

        let diagnostics = system.diagnostics().await;
        assert_eq!(diagnostics.stale_sources, vec![FeedSource::Exchange]);
        assert_eq!(diagnostics.counters.get("ticks_accepted"), Some(&1));
        assert_eq!(diagnostics.buffered_ticks, 1);
        assert_eq!(diagnostics.system_state, SystemState::Normal);
    }
}
