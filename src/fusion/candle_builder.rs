use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use super::engine::CandleFusionEngine;
use crate::calibration::OffsetCalibrator;
use crate::core::config::FusionConfig;
use crate::core::counters::{self, Counters};
use crate::model::{window_start, FeedSource, SourceCandle, StructureLabel, Tick};

/// Range/open at which the price component of the volatility score saturates.
const FULL_SCALE_RANGE: f64 = 0.01;
/// Smoothing for the per-series reference volume.
const VOLUME_EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone)]
struct PartialCandle {
    window_start: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl PartialCandle {
    fn open_at(window_start: DateTime<Utc>, price: f64, volume: f64) -> Self {
        Self {
            window_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    fn update(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }
}

#[derive(Debug, Default)]
struct Series {
    partial: Option<PartialCandle>,
    volume_ema: Option<f64>,
}

/// Volatility score in [0, 1] from a candle's relative range and its volume
/// against the series' running reference volume.
pub fn volatility_score(
    open: f64,
    range: f64,
    volume: f64,
    reference_volume: Option<f64>,
    price_weight: f64,
    volume_weight: f64,
) -> f64 {
    let price_component = if open > 0.0 {
        (range / open / FULL_SCALE_RANGE).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let volume_component = match reference_volume {
        None => 0.5,
        Some(reference) if reference > 0.0 => (volume / (2.0 * reference)).clamp(0.0, 1.0),
        Some(_) => {
            if volume > 0.0 {
                1.0
            } else {
                0.0
            }
        }
    };

    (price_weight * price_component + volume_weight * volume_component).clamp(0.0, 1.0)
}

/// Aggregates adjusted ticks into one candle per (symbol, source, window).
///
/// A window closes when a later tick for the same series arrives or when
/// [`CandleBuilder::flush`] passes its end. Closed candles go to the fusion
/// engine and, if attached, to the calibrator's structure tracker.
pub struct CandleBuilder {
    config: RwLock<FusionConfig>,
    series: DashMap<(String, FeedSource), Series>,
    engine: Arc<CandleFusionEngine>,
    calibrator: Option<Arc<OffsetCalibrator>>,
    counters: Arc<Counters>,
}

impl CandleBuilder {
    pub fn new(
        config: FusionConfig,
        engine: Arc<CandleFusionEngine>,
        calibrator: Option<Arc<OffsetCalibrator>>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            series: DashMap::new(),
            engine,
            calibrator,
            counters,
        }
    }

    pub fn on_tick(&self, tick: &Tick) {
        let price = tick.mid();
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        let window = self.config.read().window_seconds;
        let ws = window_start(tick.timestamp, window);

        let closed = {
            let mut series = self
                .series
                .entry((tick.symbol.clone(), tick.source))
                .or_default();
            match series.partial.as_mut() {
                None => {
                    series.partial = Some(PartialCandle::open_at(ws, price, tick.volume));
                    None
                }
                Some(partial) if partial.window_start == ws => {
                    partial.update(price, tick.volume);
                    None
                }
                Some(partial) if partial.window_start < ws => {
                    let done = std::mem::replace(
                        partial,
                        PartialCandle::open_at(ws, price, tick.volume),
                    );
                    Some(self.finish(&tick.symbol, tick.source, &mut series, done))
                }
                Some(_) => {
                    tracing::trace!(
                        "{} {} tick at {} predates the open window, skipped",
                        tick.symbol,
                        tick.source,
                        tick.timestamp
                    );
                    None
                }
            }
        };

        if let Some(candle) = closed {
            self.emit(candle);
        }
    }

    /// Close every window whose end is at or before `now`.
    pub fn flush(&self, now: DateTime<Utc>) -> usize {
        let window = ChronoDuration::seconds(self.config.read().window_seconds as i64);
        let mut closed = Vec::new();

        for mut entry in self.series.iter_mut() {
            let due = entry
                .partial
                .as_ref()
                .map(|p| p.window_start + window <= now)
                .unwrap_or(false);
            if !due {
                continue;
            }
            let (symbol, source) = entry.key().clone();
            if let Some(done) = entry.partial.take() {
                closed.push(self.finish(&symbol, source, entry.value_mut(), done));
            }
        }

        let count = closed.len();
        for candle in closed {
            self.emit(candle);
        }
        count
    }

    pub fn update_config(&self, config: FusionConfig) {
        *self.config.write() = config;
    }

    fn finish(
        &self,
        symbol: &str,
        source: FeedSource,
        series: &mut Series,
        done: PartialCandle,
    ) -> SourceCandle {
        let cfg = self.config.read();
        let range = done.high - done.low;
        let score = volatility_score(
            done.open,
            range,
            done.volume,
            series.volume_ema,
            cfg.price_weight,
            cfg.volume_weight,
        );

        series.volume_ema = Some(match series.volume_ema {
            Some(ema) => ema + VOLUME_EMA_ALPHA * (done.volume - ema),
            None => done.volume,
        });

        SourceCandle {
            symbol: symbol.to_string(),
            source,
            window_start: done.window_start,
            open: done.open,
            high: done.high,
            low: done.low,
            close: done.close,
            volume: done.volume,
            volatility_score: score,
            structure: StructureLabel::from_ohlc(done.open, done.high, done.low, done.close),
        }
    }

    fn emit(&self, candle: SourceCandle) {
        self.counters.incr(counters::CANDLES_BUILT);
        tracing::trace!(
            "🕯️  {} {} closed {} O{:.5} C{:.5} vol {:.3}",
            candle.symbol,
            candle.source,
            candle.window_start,
            candle.open,
            candle.close,
            candle.volatility_score
        );
        if let Some(calibrator) = &self.calibrator {
            calibrator.update_structure(&candle.symbol, candle.source, candle.structure);
        }
        self.engine.add_candle(candle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tick(source: FeedSource, secs: i64, mid: f64, volume: f64) -> Tick {
        let base = Utc.with_ymd_and_hms(2024, 2, 5, 14, 0, 0).unwrap();
        Tick::new(
            "EURUSD",
            source,
            base + ChronoDuration::seconds(secs),
            mid - 0.00005,
            mid + 0.00005,
            volume,
        )
    }

    fn builder() -> (CandleBuilder, Arc<CandleFusionEngine>, Arc<Counters>) {
        let counters = Arc::new(Counters::new());
        let engine = Arc::new(CandleFusionEngine::new(
            FusionConfig::default(),
            counters.clone(),
        ));
        let builder = CandleBuilder::new(
            FusionConfig::default(),
            engine.clone(),
            None,
            counters.clone(),
        );
        (builder, engine, counters)
    }

    #[test]
    fn test_volatility_score_bounds() {
        assert_eq!(volatility_score(100.0, 0.0, 0.0, None, 0.6, 0.4), 0.2);
        assert!((volatility_score(100.0, 5.0, 10.0, Some(1.0), 0.6, 0.4) - 1.0).abs() < 1e-12);
        assert!((volatility_score(100.0, 0.5, 1.0, Some(1.0), 0.6, 0.4) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_window_closes_on_next_window_tick() {
        let (builder, engine, counters) = builder();
        builder.on_tick(&tick(FeedSource::Broker, 0, 1.1000, 1.0));
        builder.on_tick(&tick(FeedSource::Broker, 60, 1.1010, 1.0));
        builder.on_tick(&tick(FeedSource::Broker, 120, 1.0995, 1.0));
        builder.on_tick(&tick(FeedSource::Broker, 240, 1.1005, 1.0));
        assert_eq!(counters.get(counters::CANDLES_BUILT), 0);

        builder.on_tick(&tick(FeedSource::Broker, 300, 1.1006, 1.0));
        assert_eq!(counters.get(counters::CANDLES_BUILT), 1);
        assert_eq!(engine.pending_windows("EURUSD"), 1);
    }

    #[test]
    fn test_flush_feeds_fusion() {
        let (builder, engine, _) = builder();
        for (secs, mid) in [(0, 1.1000), (100, 1.1010), (200, 1.0995), (290, 1.1005)] {
            builder.on_tick(&tick(FeedSource::Broker, secs, mid, 1.0));
        }
        for (secs, mid) in [(1, 1.1002), (101, 1.1012), (201, 1.0994), (291, 1.1006)] {
            builder.on_tick(&tick(FeedSource::Exchange, secs, mid, 1.0));
        }

        let flushed = builder.flush(Utc.with_ymd_and_hms(2024, 2, 5, 14, 5, 0).unwrap());
        assert_eq!(flushed, 2);

        let fused = engine.fuse("EURUSD");
        assert_eq!(fused.len(), 1);
        assert!((fused[0].fused_close - 1.10053).abs() < 1e-9);
        assert!((fused[0].high - 1.1012).abs() < 1e-9);
        assert!((fused[0].low - 1.0994).abs() < 1e-9);
        assert_eq!(fused[0].structure_majority, StructureLabel::Bullish);
    }

    #[test]
    fn test_flush_leaves_open_windows() {
        let (builder, _, _) = builder();
        builder.on_tick(&tick(FeedSource::Broker, 10, 1.1, 1.0));
        let mid_window = Utc.with_ymd_and_hms(2024, 2, 5, 14, 2, 0).unwrap();
        assert_eq!(builder.flush(mid_window), 0);
    }
}
