use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::tick::FeedSource;

/// Coarse trend label derived from a candle's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructureLabel {
    Bullish,
    Bearish,
    Neutral,
}

impl StructureLabel {
    /// Body smaller than 10% of the range reads as indecision.
    pub fn from_ohlc(open: f64, high: f64, low: f64, close: f64) -> Self {
        let range = high - low;
        let body = close - open;
        if range <= 0.0 || body.abs() < range * 0.1 {
            StructureLabel::Neutral
        } else if body > 0.0 {
            StructureLabel::Bullish
        } else {
            StructureLabel::Bearish
        }
    }
}

/// One source's aggregate for one fusion window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCandle {
    pub symbol: String,
    pub source: FeedSource,
    pub window_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub volatility_score: f64,
    pub structure: StructureLabel,
}

impl SourceCandle {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// Canonical candle merged from both sources for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedCandle {
    pub symbol: String,
    pub window_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub fused_close: f64,
    pub volatility_score: f64,
    pub structure_majority: StructureLabel,
    pub primary_source: FeedSource,
    pub sources_used: Vec<FeedSource>,
}

/// Floor `ts` to the start of its `window_seconds` bucket.
pub fn window_start(ts: DateTime<Utc>, window_seconds: u64) -> DateTime<Utc> {
    let window = window_seconds.max(1) as i64;
    let secs = ts.timestamp();
    let floored = secs - secs.rem_euclid(window);
    Utc.timestamp_opt(floored, 0).single().unwrap_or(ts)
}
