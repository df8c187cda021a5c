use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::error::ValidationError;

/// The two independently operated price feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedSource {
    /// Dealer/broker quote stream (FX, metals, CFDs).
    Broker,
    /// Exchange order-book stream.
    Exchange,
}

impl FeedSource {
    pub const ALL: [FeedSource; 2] = [FeedSource::Broker, FeedSource::Exchange];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedSource::Broker => "broker",
            FeedSource::Exchange => "exchange",
        }
    }

    pub fn other(&self) -> FeedSource {
        match self {
            FeedSource::Broker => FeedSource::Exchange,
            FeedSource::Exchange => FeedSource::Broker,
        }
    }
}

impl fmt::Display for FeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedSource {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "broker" | "mt5" | "dealer" => Ok(FeedSource::Broker),
            "exchange" | "binance" | "venue" => Ok(FeedSource::Exchange),
            other => Err(ValidationError::UnknownSource(other.to_string())),
        }
    }
}

/// A normalized quote as delivered by a feed adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub source: FeedSource,
    pub timestamp: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    pub volume: f64,
    /// Correction already added to bid/ask; zero for raw ticks.
    pub applied_offset: f64,
}

impl Tick {
    pub fn new(
        symbol: impl Into<String>,
        source: FeedSource,
        timestamp: DateTime<Utc>,
        bid: f64,
        ask: f64,
        volume: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            source,
            timestamp,
            bid,
            ask,
            volume,
            applied_offset: 0.0,
        }
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.symbol.trim().is_empty() {
            return Err(ValidationError::EmptySymbol);
        }
        if self.timestamp.timestamp_millis() <= 0 {
            return Err(ValidationError::MissingTimestamp);
        }
        if !self.bid.is_finite() || !self.ask.is_finite() || !self.volume.is_finite() {
            return Err(ValidationError::NonFinite);
        }
        if self.bid <= 0.0 {
            return Err(ValidationError::NonPositiveBid(self.bid));
        }
        if self.ask <= 0.0 {
            return Err(ValidationError::NonPositiveAsk(self.ask));
        }
        if self.volume < 0.0 {
            return Err(ValidationError::NegativeVolume(self.volume));
        }
        Ok(())
    }

    /// Copy of this tick shifted by `offset`; the raw tick is never mutated.
    pub fn with_offset(&self, offset: f64) -> Tick {
        Tick {
            bid: self.bid + offset,
            ask: self.ask + offset,
            applied_offset: offset,
            ..self.clone()
        }
    }
}

/// One raw mid-price observation kept for offset calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub symbol: String,
    pub source: FeedSource,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

/// The current correction for one symbol.
///
/// `offset` is added to quotes of the adjusted (non-reference) source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetRecord {
    pub symbol: String,
    pub offset: f64,
    pub confidence: f64,
    pub last_calibration: DateTime<Utc>,
    pub sample_count: usize,
    /// Offset change per second from the recent calibration history.
    pub drift_rate: f64,
}
