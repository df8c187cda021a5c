// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// OFFSET CALIBRATOR - CROSS-FEED PRICE ALIGNMENT
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//
// Keeps a rolling window of raw mid prices from both feeds per symbol and
// periodically estimates the additive correction that brings the adjusted
// feed in line with the reference feed:
// 1. Pair each reference sample with the nearest adjusted sample in time
// 2. Weight pairs by time proximity, ATR-scaled agreement with the median
//    pair diff and higher-timeframe structure agreement
// 3. Publish the weighted offset with a variance-based confidence
// 4. Track offset drift by regression over recent calibrations (log only)
//
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::indicators;
use crate::core::config::CalibrationConfig;
use crate::core::counters::{self, Counters};
use crate::core::error::{FusionError, FusionResult};
use crate::core::SharedClock;
use crate::model::{CalibrationSample, FeedSource, OffsetRecord, StructureLabel};

const CONFIDENCE_EPSILON: f64 = 1e-9;
/// Fewer calibrations than this give no drift estimate.
const MIN_DRIFT_POINTS: usize = 3;

/// Per-symbol offsets, replaced wholesale by the calibration run.
///
/// Readers clone an `Arc` and never wait on a calibration in progress.
#[derive(Default)]
pub struct OffsetTable {
    current: RwLock<Arc<HashMap<String, OffsetRecord>>>,
}

impl OffsetTable {
    pub fn load(&self) -> Arc<HashMap<String, OffsetRecord>> {
        self.current.read().clone()
    }

    pub fn get(&self, symbol: &str) -> Option<OffsetRecord> {
        self.load().get(symbol).cloned()
    }

    fn publish(&self, updates: Vec<OffsetRecord>) {
        if updates.is_empty() {
            return;
        }
        let mut next = (*self.load()).clone();
        for record in updates {
            next.insert(record.symbol.clone(), record);
        }
        *self.current.write() = Arc::new(next);
    }
}

/// Result of estimating one symbol's offset from its sample window.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetEstimate {
    pub offset: f64,
    pub confidence: f64,
    pub pairs_aligned: usize,
    pub pairs_used: usize,
    pub atr: f64,
}

#[derive(Debug, Clone, Copy)]
struct AlignedPair {
    timestamp: DateTime<Utc>,
    dt_secs: f64,
    reference: f64,
    adjusted: f64,
}

#[derive(Debug, Default)]
struct SymbolWindow {
    reference: VecDeque<CalibrationSample>,
    adjusted: VecDeque<CalibrationSample>,
    generation: u64,
    calibrated_generation: Option<u64>,
    history: VecDeque<(DateTime<Utc>, f64)>,
    structure: HashMap<FeedSource, StructureLabel>,
}

impl SymbolWindow {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        let before = self.reference.len() + self.adjusted.len();
        self.reference.retain(|s| s.timestamp >= cutoff);
        self.adjusted.retain(|s| s.timestamp >= cutoff);
        if self.reference.len() + self.adjusted.len() != before {
            self.generation += 1;
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CalibrationReport {
    pub updated: Vec<String>,
    pub skipped_insufficient: Vec<String>,
    pub skipped_unchanged: usize,
    pub rejected: Vec<String>,
    /// Another run was already in progress; nothing was done.
    pub busy: bool,
}

pub struct OffsetCalibrator {
    config: RwLock<CalibrationConfig>,
    clock: SharedClock,
    counters: Arc<Counters>,
    windows: DashMap<String, Arc<Mutex<SymbolWindow>>>,
    offsets: OffsetTable,
    run_lock: Mutex<()>,
}

impl OffsetCalibrator {
    pub fn new(config: CalibrationConfig, clock: SharedClock, counters: Arc<Counters>) -> Self {
        tracing::info!("🎯 OFFSET CALIBRATOR INITIALIZED");
        tracing::info!(
            "   • Reference: {} | Align: {}s | Min samples: {} | Max offset: {}",
            config.reference_source,
            config.time_alignment_window_seconds,
            config.min_samples_for_calibration,
            config.max_offset
        );

        Self {
            config: RwLock::new(config),
            clock,
            counters,
            windows: DashMap::new(),
            offsets: OffsetTable::default(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn reference_source(&self) -> FeedSource {
        self.config.read().reference_source
    }

    /// The feed whose quotes receive the offset.
    pub fn adjusted_source(&self) -> FeedSource {
        self.reference_source().other()
    }

    fn window(&self, symbol: &str) -> Arc<Mutex<SymbolWindow>> {
        if let Some(existing) = self.windows.get(symbol) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .windows
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SymbolWindow::default())));
        Arc::clone(entry.value())
    }

    pub fn add_sample(
        &self,
        symbol: &str,
        source: FeedSource,
        timestamp: DateTime<Utc>,
        price: f64,
    ) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }

        let (reference, cap, horizon) = {
            let cfg = self.config.read();
            (
                cfg.reference_source,
                cfg.max_samples_per_symbol,
                cfg.sample_window_seconds,
            )
        };
        let cutoff = self.clock.now() - ChronoDuration::seconds(horizon as i64);

        let window = self.window(symbol);
        let mut w = window.lock();
        w.prune(cutoff);

        if timestamp < cutoff {
            return;
        }

        let sample = CalibrationSample {
            symbol: symbol.to_string(),
            source,
            timestamp,
            price,
        };
        let series = if source == reference {
            &mut w.reference
        } else {
            &mut w.adjusted
        };
        series.push_back(sample);
        while series.len() > cap {
            series.pop_front();
        }
        w.generation += 1;
    }

    /// Latest higher-timeframe structure label seen for one source.
    pub fn update_structure(&self, symbol: &str, source: FeedSource, label: StructureLabel) {
        let window = self.window(symbol);
        let mut w = window.lock();
        if w.structure.insert(source, label) != Some(label) {
            w.generation += 1;
        }
    }

    pub fn sample_counts(&self, symbol: &str) -> (usize, usize) {
        self.windows
            .get(symbol)
            .map(|w| {
                let w = w.lock();
                (w.reference.len(), w.adjusted.len())
            })
            .unwrap_or((0, 0))
    }

    /// Recompute offsets for every symbol with enough aligned samples.
    pub fn calibrate(&self) -> CalibrationReport {
        let Some(_run) = self.run_lock.try_lock() else {
            self.counters.incr(counters::CALIBRATION_SKIPPED_BUSY);
            tracing::debug!("⏸️  Calibration already running, skipping");
            return CalibrationReport {
                busy: true,
                ..Default::default()
            };
        };

        let cfg = self.config.read().clone();
        let now = self.clock.now();
        let cutoff = now - ChronoDuration::seconds(cfg.sample_window_seconds as i64);
        let symbols: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();

        let mut report = CalibrationReport::default();
        let mut updates = Vec::new();

        for symbol in symbols {
            let Some(window) = self.windows.get(&symbol).map(|w| Arc::clone(w.value())) else {
                continue;
            };

            let (reference, adjusted, bonus, generation) = {
                let mut w = window.lock();
                w.prune(cutoff);
                if w.calibrated_generation == Some(w.generation) {
                    report.skipped_unchanged += 1;
                    self.counters.incr(counters::CALIBRATION_SKIPPED_UNCHANGED);
                    continue;
                }
                (
                    w.reference.iter().cloned().collect::<Vec<_>>(),
                    w.adjusted.iter().cloned().collect::<Vec<_>>(),
                    structure_bonus(&w.structure, cfg.m5_structure_weight),
                    w.generation,
                )
            };

            let outcome = estimate_offset(&symbol, &reference, &adjusted, bonus, &cfg);

            let mut w = window.lock();
            w.calibrated_generation = Some(generation);

            match outcome {
                Ok(estimate) => {
                    w.history.push_back((now, estimate.offset));
                    while w.history.len() > cfg.drift_history {
                        w.history.pop_front();
                    }
                    let drift_rate = drift_slope(&w.history).unwrap_or(0.0);
                    drop(w);

                    if drift_rate.abs() > cfg.drift_threshold {
                        self.counters.incr(counters::DRIFT_DETECTED);
                        tracing::warn!(
                            "📉 Offset drift on {}: {:+.6}/s over last {} calibrations (threshold {})",
                            symbol,
                            drift_rate,
                            cfg.drift_history,
                            cfg.drift_threshold
                        );
                    }

                    tracing::debug!(
                        "🎯 {} offset {:+.5} (confidence {:.2}, {}/{} pairs, ATR {:.5})",
                        symbol,
                        estimate.offset,
                        estimate.confidence,
                        estimate.pairs_used,
                        estimate.pairs_aligned,
                        estimate.atr
                    );

                    self.counters.incr(counters::CALIBRATION_UPDATED);
                    updates.push(OffsetRecord {
                        symbol: symbol.clone(),
                        offset: estimate.offset,
                        confidence: estimate.confidence,
                        last_calibration: now,
                        sample_count: estimate.pairs_used,
                        drift_rate,
                    });
                    report.updated.push(symbol);
                }
                Err(FusionError::OffsetRejected {
                    offset, max_offset, ..
                }) => {
                    drop(w);
                    self.counters.incr(counters::CALIBRATION_REJECTED_OFFSET);
                    tracing::warn!(
                        "🚫 Rejected offset {:+.5} for {} (limit ±{}), keeping previous",
                        offset,
                        symbol,
                        max_offset
                    );
                    report.rejected.push(symbol);
                }
                Err(e) => {
                    drop(w);
                    self.counters.incr(counters::CALIBRATION_SKIPPED_INSUFFICIENT);
                    tracing::debug!("⏭️  Calibration skipped: {}", e);
                    report.skipped_insufficient.push(symbol);
                }
            }
        }

        if !report.updated.is_empty() {
            tracing::info!(
                "✅ Calibration run: {} updated, {} insufficient, {} rejected, {} unchanged",
                report.updated.len(),
                report.skipped_insufficient.len(),
                report.rejected.len(),
                report.skipped_unchanged
            );
        }

        self.offsets.publish(updates);
        report
    }

    pub fn get_offset(&self, symbol: &str) -> f64 {
        self.offsets.get(symbol).map(|r| r.offset).unwrap_or(0.0)
    }

    pub fn get_offset_record(&self, symbol: &str) -> Option<OffsetRecord> {
        self.offsets.get(symbol)
    }

    pub fn offsets(&self) -> Arc<HashMap<String, OffsetRecord>> {
        self.offsets.load()
    }

    pub fn drift_history(&self, symbol: &str) -> Vec<(DateTime<Utc>, f64)> {
        self.windows
            .get(symbol)
            .map(|w| w.lock().history.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Swap in new parameters; every symbol is recalibrated on the next run.
    pub fn update_config(&self, config: CalibrationConfig) {
        *self.config.write() = config;
        for entry in self.windows.iter() {
            entry.value().lock().calibrated_generation = None;
        }
        tracing::info!("🔧 Calibration parameters reloaded");
    }
}

/// Bonus applied when both feeds agree on the latest higher-timeframe structure.
fn structure_bonus(labels: &HashMap<FeedSource, StructureLabel>, weight: f64) -> f64 {
    match (
        labels.get(&FeedSource::Broker),
        labels.get(&FeedSource::Exchange),
    ) {
        (Some(a), Some(b)) if a == b => {
            if *a == StructureLabel::Neutral {
                weight / 2.0
            } else {
                weight
            }
        }
        _ => 0.0,
    }
}

fn drift_slope(history: &VecDeque<(DateTime<Utc>, f64)>) -> Option<f64> {
    if history.len() < MIN_DRIFT_POINTS {
        return None;
    }
    let origin = history.front()?.0;
    let points: Vec<(f64, f64)> = history
        .iter()
        .map(|(ts, offset)| ((*ts - origin).num_milliseconds() as f64 / 1000.0, *offset))
        .collect();
    indicators::linear_regression_slope(&points)
}

fn align(
    reference: &[CalibrationSample],
    adjusted: &[CalibrationSample],
    window_secs: f64,
) -> Vec<AlignedPair> {
    let mut adjusted: Vec<&CalibrationSample> = adjusted.iter().collect();
    adjusted.sort_by_key(|s| s.timestamp);
    let mut reference: Vec<&CalibrationSample> = reference.iter().collect();
    reference.sort_by_key(|s| s.timestamp);

    let mut pairs = Vec::with_capacity(reference.len());
    for r in reference {
        let idx = adjusted.partition_point(|a| a.timestamp < r.timestamp);
        let candidates = [idx.checked_sub(1), Some(idx)];

        let nearest = candidates
            .iter()
            .flatten()
            .filter_map(|&i| adjusted.get(i))
            .map(|a| {
                let dt = (a.timestamp - r.timestamp).num_milliseconds().abs() as f64 / 1000.0;
                (a, dt)
            })
            .min_by(|x, y| x.1.total_cmp(&y.1));

        if let Some((a, dt)) = nearest {
            if dt <= window_secs {
                pairs.push(AlignedPair {
                    timestamp: r.timestamp,
                    dt_secs: dt,
                    reference: r.price,
                    adjusted: a.price,
                });
            }
        }
    }
    pairs
}

/// Estimate the correction to add to the adjusted feed for one symbol.
pub fn estimate_offset(
    symbol: &str,
    reference: &[CalibrationSample],
    adjusted: &[CalibrationSample],
    structure_bonus: f64,
    cfg: &CalibrationConfig,
) -> FusionResult<OffsetEstimate> {
    let min = cfg.min_samples_for_calibration;
    if reference.len() < min || adjusted.len() < min {
        return Err(FusionError::insufficient(
            symbol,
            format!(
                "{} reference / {} adjusted samples, need {}",
                reference.len(),
                adjusted.len(),
                min
            ),
        ));
    }

    let window_secs = cfg.time_alignment_window_seconds as f64;
    let pairs = align(reference, adjusted, window_secs);
    if pairs.len() < min {
        return Err(FusionError::insufficient(
            symbol,
            format!("{} aligned pairs, need {}", pairs.len(), min),
        ));
    }

    let reference_series: Vec<f64> = pairs.iter().map(|p| p.reference).collect();
    let atr = indicators::atr(&reference_series, cfg.atr_period).unwrap_or(0.0);
    let atr_band = atr * cfg.atr_threshold_multiplier;

    // Price agreement is measured against the typical pair diff so that a
    // genuine offset wider than the ATR band still carries weight.
    let raw_diffs: Vec<f64> = pairs.iter().map(|p| p.adjusted - p.reference).collect();
    let centre = indicators::median(&raw_diffs).unwrap_or(0.0);

    let mut diffs = Vec::with_capacity(pairs.len());
    let mut weights = Vec::with_capacity(pairs.len());
    for (pair, &diff) in pairs.iter().zip(&raw_diffs) {
        let time_weight = (1.0 - pair.dt_secs / window_secs).max(0.0);
        let price_weight = if atr_band > 0.0 {
            (1.0 - (diff - centre).abs() / atr_band).max(0.0)
        } else {
            1.0
        };
        let weight = time_weight * price_weight * (1.0 + structure_bonus);
        if weight >= cfg.min_pair_weight {
            diffs.push(diff);
            weights.push(weight);
        }
    }

    if diffs.is_empty() {
        return Err(FusionError::insufficient(
            symbol,
            format!("all {} aligned pairs below weight floor", pairs.len()),
        ));
    }

    let weighted_diff = indicators::weighted_mean(&diffs, &weights)
        .ok_or_else(|| FusionError::insufficient(symbol, "zero total pair weight"))?;
    let offset = -weighted_diff;

    let spread = indicators::variance(&diffs).unwrap_or(0.0);
    let atr_compliance = if atr_band <= 0.0 || offset.abs() <= atr_band {
        1.0
    } else {
        0.5
    };
    let confidence = ((1.0 - spread / (offset.abs() + CONFIDENCE_EPSILON)) * atr_compliance)
        .clamp(0.0, 1.0);

    if offset.abs() > cfg.max_offset {
        return Err(FusionError::OffsetRejected {
            symbol: symbol.to_string(),
            offset,
            max_offset: cfg.max_offset,
        });
    }

    tracing::trace!(
        "{}: latest aligned pair at {}",
        symbol,
        pairs.last().map(|p| p.timestamp.to_rfc3339()).unwrap_or_default()
    );

    Ok(OffsetEstimate {
        offset,
        confidence,
        pairs_aligned: pairs.len(),
        pairs_used: diffs.len(),
        atr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::{Clock, ManualClock};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
    }

    fn sample(source: FeedSource, secs: i64, price: f64) -> CalibrationSample {
        CalibrationSample {
            symbol: "XAUUSD".to_string(),
            source,
            timestamp: t0() + ChronoDuration::seconds(secs),
            price,
        }
    }

    fn calibrator() -> (Arc<ManualClock>, OffsetCalibrator) {
        let clock = Arc::new(ManualClock::new(t0()));
        let cal = OffsetCalibrator::new(
            CalibrationConfig::default(),
            clock.clone(),
            Arc::new(Counters::new()),
        );
        (clock, cal)
    }

    #[test]
    fn test_estimate_constant_spread() {
        let cfg = CalibrationConfig::default();
        let reference: Vec<_> = (0..5)
            .map(|i| sample(FeedSource::Broker, i * 10, 2000.10))
            .collect();
        let adjusted: Vec<_> = (0..5)
            .map(|i| sample(FeedSource::Exchange, i * 10 + 2, 2000.60))
            .collect();

        let est = estimate_offset("XAUUSD", &reference, &adjusted, 0.0, &cfg).unwrap();
        assert!((est.offset + 0.5).abs() < 1e-9);
        assert!((est.confidence - 1.0).abs() < 1e-6);
        assert_eq!(est.pairs_used, 5);
        assert_eq!(est.atr, 0.0);
    }

    #[test]
    fn test_unmatched_samples_are_discarded() {
        let cfg = CalibrationConfig::default();
        let reference: Vec<_> = (0..3)
            .map(|i| sample(FeedSource::Broker, i * 100, 100.0))
            .collect();
        let adjusted: Vec<_> = (0..3)
            .map(|i| sample(FeedSource::Exchange, i * 100 + 45, 101.0))
            .collect();

        let err = estimate_offset("XAUUSD", &reference, &adjusted, 0.0, &cfg).unwrap_err();
        assert!(matches!(err, FusionError::InsufficientData { .. }));
    }

    #[test]
    fn test_rejects_offset_above_max() {
        let cfg = CalibrationConfig {
            max_offset: 1.0,
            ..Default::default()
        };
        let reference: Vec<_> = (0..3).map(|i| sample(FeedSource::Broker, i, 100.0)).collect();
        let adjusted: Vec<_> = (0..3).map(|i| sample(FeedSource::Exchange, i, 105.0)).collect();

        let err = estimate_offset("XAUUSD", &reference, &adjusted, 0.0, &cfg).unwrap_err();
        assert!(matches!(err, FusionError::OffsetRejected { .. }));
    }

    #[test]
    fn test_confidence_drops_with_noisy_pairs() {
        let cfg = CalibrationConfig::default();
        let reference: Vec<_> = (0..6).map(|i| sample(FeedSource::Broker, i * 5, 100.0)).collect();
        let adjusted: Vec<_> = (0..6)
            .map(|i| {
                let noise = if i % 2 == 0 { 0.4 } else { -0.2 };
                sample(FeedSource::Exchange, i * 5, 100.5 + noise)
            })
            .collect();

        let est = estimate_offset("XAUUSD", &reference, &adjusted, 0.0, &cfg).unwrap();
        assert!(est.confidence < 1.0);
        assert!((0.0..=1.0).contains(&est.confidence));
    }

    #[test]
    fn test_offset_within_atr_band_keeps_full_confidence() {
        let cfg = CalibrationConfig {
            atr_threshold_multiplier: 100.0,
            ..Default::default()
        };
        // 20 reference points moving 0.01 per step: ATR = 0.01, band = 1.0
        let reference: Vec<_> = (0..20)
            .map(|i| sample(FeedSource::Broker, i * 5, 100.0 + 0.01 * i as f64))
            .collect();
        let adjusted: Vec<_> = (0..20)
            .map(|i| sample(FeedSource::Exchange, i * 5, 100.2 + 0.01 * i as f64))
            .collect();

        let est = estimate_offset("XAUUSD", &reference, &adjusted, 0.0, &cfg).unwrap();
        assert!((est.atr - 0.01).abs() < 1e-9);
        assert!((est.offset + 0.2).abs() < 1e-6);
        assert!(est.offset.abs() <= est.atr * cfg.atr_threshold_multiplier);
        assert!(est.confidence > 0.99);
    }

    #[test]
    fn test_offset_beyond_atr_band_is_kept_at_half_confidence() {
        let cfg = CalibrationConfig::default();
        // calm market: ATR 0.01, band 0.02, steady 0.50 gap between the feeds
        let reference: Vec<_> = (0..20)
            .map(|i| sample(FeedSource::Broker, i * 5, 2000.0 + 0.01 * i as f64))
            .collect();
        let adjusted: Vec<_> = (0..20)
            .map(|i| sample(FeedSource::Exchange, i * 5, 2000.5 + 0.01 * i as f64))
            .collect();

        let est = estimate_offset("XAUUSD", &reference, &adjusted, 0.0, &cfg).unwrap();
        assert!((est.atr - 0.01).abs() < 1e-6);
        assert!((est.offset + 0.5).abs() < 1e-6);
        assert_eq!(est.pairs_used, 20);
        assert!(est.offset.abs() > est.atr * cfg.atr_threshold_multiplier);
        assert!((est.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_pair_far_from_typical_gap_is_dropped() {
        let cfg = CalibrationConfig::default();
        let reference: Vec<_> = (0..20)
            .map(|i| sample(FeedSource::Broker, i * 5, 100.0 + 0.01 * i as f64))
            .collect();
        let adjusted: Vec<_> = (0..20)
            .map(|i| {
                let gap = if i == 10 { 0.9 } else { 0.5 };
                sample(FeedSource::Exchange, i * 5, 100.0 + gap + 0.01 * i as f64)
            })
            .collect();

        let est = estimate_offset("XAUUSD", &reference, &adjusted, 0.0, &cfg).unwrap();
        assert_eq!(est.pairs_aligned, 20);
        assert_eq!(est.pairs_used, 19);
        assert!((est.offset + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_calibrate_publishes_and_is_idempotent() {
        let (clock, cal) = calibrator();
        for i in 0..3 {
            cal.add_sample("XAUUSD", FeedSource::Broker, t0() + ChronoDuration::seconds(i), 2000.10);
            cal.add_sample(
                "XAUUSD",
                FeedSource::Exchange,
                t0() + ChronoDuration::seconds(i + 2),
                2000.60,
            );
        }
        clock.advance_secs(10);

        let report = cal.calibrate();
        assert_eq!(report.updated, vec!["XAUUSD".to_string()]);
        let first = cal.get_offset_record("XAUUSD").unwrap();
        assert!((first.offset + 0.5).abs() < 1e-9);

        clock.advance_secs(60);
        let again = cal.calibrate();
        assert!(again.updated.is_empty());
        assert_eq!(again.skipped_unchanged, 1);
        assert_eq!(cal.get_offset_record("XAUUSD").unwrap(), first);
    }

    #[test]
    fn test_insufficient_keeps_prior_record() {
        let (clock, cal) = calibrator();
        for i in 0..3 {
            cal.add_sample("XAUUSD", FeedSource::Broker, t0() + ChronoDuration::seconds(i), 100.0);
            cal.add_sample("XAUUSD", FeedSource::Exchange, t0() + ChronoDuration::seconds(i), 100.3);
        }
        cal.calibrate();
        let prior = cal.get_offset_record("XAUUSD").unwrap();

        // an hour later the old samples age out and one new pair is not enough
        clock.advance_secs(3700);
        cal.add_sample("XAUUSD", FeedSource::Broker, clock.now(), 101.0);
        cal.add_sample("XAUUSD", FeedSource::Exchange, clock.now(), 102.0);
        let report = cal.calibrate();

        assert_eq!(report.skipped_insufficient, vec!["XAUUSD".to_string()]);
        assert_eq!(cal.get_offset_record("XAUUSD").unwrap(), prior);
        assert_eq!(cal.sample_counts("XAUUSD"), (1, 1));
    }

    #[test]
    fn test_symbols_calibrate_independently() {
        let (_clock, cal) = calibrator();
        for i in 0..3 {
            let ts = t0() + ChronoDuration::seconds(i);
            cal.add_sample("EURUSD", FeedSource::Broker, ts, 1.1000);
            cal.add_sample("EURUSD", FeedSource::Exchange, ts, 1.1002);
            cal.add_sample("GBPUSD", FeedSource::Broker, ts, 1.2500);
        }
        let report = cal.calibrate();
        assert_eq!(report.updated, vec!["EURUSD".to_string()]);
        assert_eq!(report.skipped_insufficient, vec!["GBPUSD".to_string()]);
        assert!((cal.get_offset("EURUSD") + 0.0002).abs() < 1e-9);
        assert_eq!(cal.get_offset("GBPUSD"), 0.0);
    }

    #[test]
    fn test_drift_rate_from_history() {
        let (clock, cal) = calibrator();
        for round in 0..4 {
            let base = clock.now();
            for i in 0..3 {
                let ts = base + ChronoDuration::seconds(i);
                cal.add_sample("XAUUSD", FeedSource::Broker, ts, 100.0);
                cal.add_sample("XAUUSD", FeedSource::Exchange, ts, 100.0 + 0.1 * round as f64 + 0.1);
            }
            cal.calibrate();
            clock.advance_secs(3601);
        }
        let record = cal.get_offset_record("XAUUSD").unwrap();
        assert!(record.drift_rate < 0.0);
        assert_eq!(cal.drift_history("XAUUSD").len(), 4);
    }

    #[test]
    fn test_drift_is_counted_but_offset_follows_latest_estimate() {
        let clock = Arc::new(ManualClock::new(t0()));
        let events = Arc::new(Counters::new());
        let cfg = CalibrationConfig {
            sample_window_seconds: 5,
            ..Default::default()
        };
        let cal = OffsetCalibrator::new(cfg, clock.clone(), events.clone());

        // the gap widens 0.1 every 10s: drift of -0.01/s against a 0.001 threshold
        for round in 0..4 {
            let base = clock.now();
            for i in 0..3 {
                let ts = base + ChronoDuration::seconds(i);
                cal.add_sample("XAUUSD", FeedSource::Broker, ts, 100.0);
                cal.add_sample("XAUUSD", FeedSource::Exchange, ts, 100.1 + 0.1 * round as f64);
            }
            let report = cal.calibrate();
            assert_eq!(report.updated, vec!["XAUUSD".to_string()]);

            let record = cal.get_offset_record("XAUUSD").unwrap();
            assert!((record.offset + 0.1 * (round + 1) as f64).abs() < 1e-9);
            clock.advance_secs(10);
        }

        // first two calibrations have too little history for a slope
        assert_eq!(events.get(counters::DRIFT_DETECTED), 2);
        let record = cal.get_offset_record("XAUUSD").unwrap();
        assert!((record.drift_rate + 0.01).abs() < 1e-9);
        assert!((record.offset + 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_steady_offset_reports_no_drift() {
        let (clock, cal) = calibrator();
        for _ in 0..4 {
            let base = clock.now();
            for i in 0..3 {
                let ts = base + ChronoDuration::seconds(i);
                cal.add_sample("XAUUSD", FeedSource::Broker, ts, 100.0);
                cal.add_sample("XAUUSD", FeedSource::Exchange, ts, 100.3);
            }
            cal.calibrate();
            clock.advance_secs(3601);
        }
        assert_eq!(cal.counters.get(counters::DRIFT_DETECTED), 0);
        assert!(cal.get_offset_record("XAUUSD").unwrap().drift_rate.abs() < 1e-12);
    }

    #[test]
    fn test_structure_bonus() {
        let mut labels = HashMap::new();
        assert_eq!(structure_bonus(&labels, 0.2), 0.0);
        labels.insert(FeedSource::Broker, StructureLabel::Bullish);
        labels.insert(FeedSource::Exchange, StructureLabel::Bullish);
        assert_eq!(structure_bonus(&labels, 0.2), 0.2);
        labels.insert(FeedSource::Exchange, StructureLabel::Neutral);
        assert_eq!(structure_bonus(&labels, 0.2), 0.0);
    }
}
