use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::model::FeedSource;

const FX_CURRENCIES: &[&str] = &[
    "EUR", "USD", "GBP", "JPY", "CHF", "AUD", "NZD", "CAD", "SEK", "NOK", "SGD", "HKD", "ZAR",
    "MXN", "TRY", "PLN",
];
const METALS: &[&str] = &["XAU", "XAG", "XPT", "XPD"];
const CRYPTO_BASES: &[&str] = &[
    "BTC", "ETH", "SOL", "XRP", "ADA", "DOGE", "BNB", "LTC", "DOT", "AVAX", "LINK", "MATIC",
];
const CRYPTO_QUOTES: &[&str] = &["USDT", "USDC", "BUSD", "FDUSD"];
const INDICES: &[&str] = &[
    "US30", "US500", "SPX500", "NAS100", "USTEC", "GER40", "DE40", "UK100", "JP225", "HK50",
];

/// Mean range/price above which an unknown symbol is treated as high volatility.
const HIGH_VOLATILITY_RANGE: f64 = 0.005;
const MIN_LEARNING_OBSERVATIONS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Fx,
    Metal,
    Index,
    Crypto,
    HighVolatility,
    Unknown,
}

impl AssetClass {
    /// Which feed leads the blend for this class.
    pub fn primary_source(&self) -> FeedSource {
        match self {
            AssetClass::Crypto | AssetClass::HighVolatility => FeedSource::Exchange,
            AssetClass::Fx | AssetClass::Metal | AssetClass::Index | AssetClass::Unknown => {
                FeedSource::Broker
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Observation {
    samples: u32,
    mean_range_ratio: f64,
}

/// Static symbol rules with a learned fallback for symbols no rule matches.
#[derive(Default)]
pub struct AssetClassifier {
    overrides: DashMap<String, AssetClass>,
    learned: DashMap<String, Observation>,
}

impl AssetClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a symbol to a class regardless of rules or observations.
    pub fn set_override(&self, symbol: &str, class: AssetClass) {
        self.overrides.insert(normalize(symbol), class);
    }

    pub fn classify(&self, symbol: &str) -> AssetClass {
        let symbol = normalize(symbol);
        if let Some(class) = self.overrides.get(&symbol) {
            return *class;
        }

        let class = static_class(&symbol);
        if class != AssetClass::Unknown {
            return class;
        }

        match self.learned.get(&symbol) {
            Some(obs)
                if obs.samples >= MIN_LEARNING_OBSERVATIONS
                    && obs.mean_range_ratio > HIGH_VOLATILITY_RANGE =>
            {
                AssetClass::HighVolatility
            }
            _ => AssetClass::Unknown,
        }
    }

    /// Feed one completed candle's range/price into the learned mapping.
    pub fn observe(&self, symbol: &str, range_ratio: f64) {
        if !range_ratio.is_finite() || range_ratio < 0.0 {
            return;
        }
        let mut obs = self.learned.entry(normalize(symbol)).or_default();
        obs.samples = obs.samples.saturating_add(1);
        obs.mean_range_ratio += (range_ratio - obs.mean_range_ratio) / obs.samples as f64;
    }
}

fn normalize(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase()
}

fn static_class(symbol: &str) -> AssetClass {
    if METALS.iter().any(|m| symbol.starts_with(m)) {
        return AssetClass::Metal;
    }
    if INDICES.iter().any(|i| symbol.starts_with(i)) {
        return AssetClass::Index;
    }
    if CRYPTO_QUOTES.iter().any(|q| symbol.ends_with(q))
        || CRYPTO_BASES.iter().any(|b| symbol.starts_with(b))
    {
        return AssetClass::Crypto;
    }
    if symbol.len() == 6 && symbol.is_char_boundary(3) {
        let (base, quote) = symbol.split_at(3);
        if FX_CURRENCIES.contains(&base) && FX_CURRENCIES.contains(&quote) {
            return AssetClass::Fx;
        }
    }
    AssetClass::Unknown
}
