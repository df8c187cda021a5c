mod common;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{system_with, t0};
use dual_feed_fusion::core::counters;
use dual_feed_fusion::core::{Clock, Settings, ValidationError};
use dual_feed_fusion::model::{FeedSource, SourceCandle, StructureLabel, Tick};
use dual_feed_fusion::streaming::IngestOutcome;

fn at(secs: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::seconds(secs)
}

fn quote(symbol: &str, source: FeedSource, secs: i64, bid: f64, ask: f64) -> Tick {
    Tick::new(symbol, source, at(secs), bid, ask, 1.0)
}

#[test]
fn xauusd_exchange_feed_is_shifted_onto_broker_prices() {
    let (system, clock) = system_with(Settings::default());

    for i in 0..3 {
        let base = i * 10;
        let broker = quote("XAUUSD", FeedSource::Broker, base, 2000.00, 2000.20);
        let exchange = quote("XAUUSD", FeedSource::Exchange, base + 2, 2000.50, 2000.70);
        assert!(system.ingest(broker).is_accepted());
        assert!(system.ingest(exchange).is_accepted());
    }

    clock.set(at(25));
    let report = system.calibrator().calibrate();
    assert_eq!(report.updated, vec!["XAUUSD".to_string()]);

    let record = system.calibrator().get_offset_record("XAUUSD").unwrap();
    assert!((record.offset + 0.50).abs() < 1e-9, "offset {}", record.offset);
    assert!(record.confidence > 0.0 && record.confidence <= 1.0);

    let raw = quote("XAUUSD", FeedSource::Exchange, 26, 2000.50, 2000.70);
    assert!(system.ingest(raw).is_accepted());

    let latest = system.router().get_latest_ticks("XAUUSD", 1);
    assert_eq!(latest.len(), 1);
    assert!((latest[0].mid() - 2000.10).abs() < 1e-9);
    assert!((latest[0].applied_offset + 0.50).abs() < 1e-9);

    // retention keeps the raw, unshifted price
    let stored = system.retention().latest_ticks("XAUUSD", 1);
    assert!((stored[0].mid() - 2000.60).abs() < 1e-9);
}

#[test]
fn broker_ticks_are_never_shifted() {
    let (system, clock) = system_with(Settings::default());
    for i in 0..3 {
        system.ingest(quote("XAUUSD", FeedSource::Broker, i * 10, 2000.00, 2000.20));
        system.ingest(quote("XAUUSD", FeedSource::Exchange, i * 10 + 2, 2000.50, 2000.70));
    }
    clock.set(at(25));
    system.calibrator().calibrate();

    system.ingest(quote("XAUUSD", FeedSource::Broker, 26, 2000.00, 2000.20));
    let latest = system.router().get_latest_ticks("XAUUSD", 1);
    assert_eq!(latest[0].source, FeedSource::Broker);
    assert_eq!(latest[0].applied_offset, 0.0);
}

#[test]
fn zero_bid_is_dropped_and_counted() {
    let (system, _clock) = system_with(Settings::default());

    let outcome = system.ingest(quote("EURUSD", FeedSource::Broker, 0, 0.0, 1.1002));
    assert_eq!(
        outcome,
        IngestOutcome::Invalid(ValidationError::NonPositiveBid(0.0))
    );
    assert_eq!(system.counters().get(counters::TICKS_INVALID), 1);
    assert_eq!(system.counters().get(counters::TICKS_ACCEPTED), 0);
    assert_eq!(system.retention().buffer_len("EURUSD"), 0);
    assert!(system.router().get_latest_ticks("EURUSD", 10).is_empty());
}

#[test]
fn buffer_holds_capacity_most_recent_in_order() {
    let mut settings = Settings::default();
    settings.retention.buffer_capacity_per_symbol = 5;
    let (system, _clock) = system_with(settings);

    for i in 0..8 {
        let bid = 1.1000 + i as f64 * 0.0001;
        system.ingest(quote("EURUSD", FeedSource::Broker, i, bid, bid + 0.0002));
    }

    let kept = system.retention().latest_ticks("EURUSD", 100);
    assert_eq!(kept.len(), 5);
    let seconds: Vec<i64> = kept.iter().map(|t| (t.timestamp - t0()).num_seconds()).collect();
    assert_eq!(seconds, vec![3, 4, 5, 6, 7]);
    assert_eq!(system.counters().get(counters::TICKS_OVERFLOWED), 3);
}

#[test]
fn spike_is_reported_once_per_burst() {
    let mut settings = Settings::default();
    settings.retention.spike_threshold_ticks_per_second = 1.0;
    settings.retention.spike_window_seconds = 10;
    let (system, clock) = system_with(settings);

    for _ in 0..40 {
        let now = (clock.now() - t0()).num_seconds();
        system.ingest(quote("BTCUSDT", FeedSource::Exchange, now, 64000.0, 64001.0));
    }
    assert!(system.retention().is_spiking());
    assert_eq!(system.counters().get(counters::SPIKE_STARTED), 1);

    clock.advance_secs(30);
    system.retention().compress();
    assert!(!system.retention().is_spiking());
    assert_eq!(system.counters().get(counters::SPIKE_ENDED), 1);
    assert_eq!(system.counters().get(counters::SPIKE_STARTED), 1);
}

fn fx_candle(source: FeedSource, ohlc: (f64, f64, f64, f64), volume: f64, score: f64) -> SourceCandle {
    SourceCandle {
        symbol: "EURUSD".to_string(),
        source,
        window_start: t0(),
        open: ohlc.0,
        high: ohlc.1,
        low: ohlc.2,
        close: ohlc.3,
        volume,
        volatility_score: score,
        structure: StructureLabel::from_ohlc(ohlc.0, ohlc.1, ohlc.2, ohlc.3),
    }
}

#[test]
fn fx_window_fuses_with_broker_as_primary() {
    let (system, _clock) = system_with(Settings::default());
    let engine = system.fusion();

    engine.add_candle(fx_candle(
        FeedSource::Exchange,
        (1.1002, 1.1012, 1.0994, 1.1006),
        80.0,
        0.5,
    ));
    engine.add_candle(fx_candle(
        FeedSource::Broker,
        (1.1000, 1.1010, 1.0995, 1.1005),
        120.0,
        0.4,
    ));

    let fused = engine.fuse("EURUSD");
    assert_eq!(fused.len(), 1);
    let candle = &fused[0];
    assert_eq!(candle.primary_source, FeedSource::Broker);
    assert!((candle.fused_close - 1.10053).abs() < 1e-9);
    assert_eq!(candle.high, 1.1012);
    assert_eq!(candle.low, 1.0994);

    // the window is closed now; a late candle changes nothing
    engine.add_candle(fx_candle(
        FeedSource::Broker,
        (1.2000, 1.2010, 1.1995, 1.2005),
        1.0,
        0.1,
    ));
    assert!(engine.fuse("EURUSD").is_empty());
    assert_eq!(engine.get_fused_candles("EURUSD", 10), fused);
}

#[test]
fn fusion_is_deterministic_across_instances() {
    let run = || {
        let (system, _clock) = system_with(Settings::default());
        system.fusion().add_candle(fx_candle(
            FeedSource::Broker,
            (1.1000, 1.1010, 1.0995, 1.1005),
            120.0,
            0.4,
        ));
        system.fusion().add_candle(fx_candle(
            FeedSource::Exchange,
            (1.1002, 1.1012, 1.0994, 1.1006),
            80.0,
            0.5,
        ));
        serde_json::to_vec(&system.fusion().fuse("EURUSD")).unwrap()
    };
    assert_eq!(run(), run());
}
