// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CANDLE FUSION ENGINE - ONE CANONICAL CANDLE PER WINDOW
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//
// Collects per-source candles by window and, once both feeds have reported
// a window, blends them:
// 1. Asset class picks the primary feed (broker for FX, exchange for crypto)
// 2. Close and volatility score are a primary-weighted blend
// 3. High/low take the cross-source envelope, volume sums
// 4. Structure follows the primary unless the feeds disagree, in which case
//    the more volatile (then more active) feed decides
//
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::asset_class::{AssetClass, AssetClassifier};
use crate::core::config::FusionConfig;
use crate::core::counters::{self, Counters};
use crate::model::{FeedSource, FusedCandle, SourceCandle, StructureLabel};

#[derive(Debug, Default)]
struct SymbolCandles {
    pending: BTreeMap<DateTime<Utc>, HashMap<FeedSource, SourceCandle>>,
    fused_windows: BTreeSet<DateTime<Utc>>,
    history: VecDeque<FusedCandle>,
    /// Newest window that has left `history`; nothing at or before it fuses again.
    evicted_through: Option<DateTime<Utc>>,
}

impl SymbolCandles {
    fn was_fused(&self, window_start: DateTime<Utc>) -> bool {
        self.fused_windows.contains(&window_start)
            || self
                .evicted_through
                .map(|mark| window_start <= mark)
                .unwrap_or(false)
    }
}

pub struct CandleFusionEngine {
    config: RwLock<FusionConfig>,
    classifier: AssetClassifier,
    counters: Arc<Counters>,
    symbols: DashMap<String, Arc<Mutex<SymbolCandles>>>,
    fused_tx: broadcast::Sender<FusedCandle>,
    fuse_lock: Mutex<()>,
}

impl CandleFusionEngine {
    pub fn new(config: FusionConfig, counters: Arc<Counters>) -> Self {
        let (fused_tx, _) = broadcast::channel(config.broadcast_capacity);

        tracing::info!(
            "🔀 Candle fusion engine ready: {}s windows, primary weight {:.2}",
            config.window_seconds,
            config.primary_weight
        );

        Self {
            config: RwLock::new(config),
            classifier: AssetClassifier::new(),
            counters,
            symbols: DashMap::new(),
            fused_tx,
            fuse_lock: Mutex::new(()),
        }
    }

    pub fn classifier(&self) -> &AssetClassifier {
        &self.classifier
    }

    pub fn window_seconds(&self) -> u64 {
        self.config.read().window_seconds
    }

    fn symbol_state(&self, symbol: &str) -> Arc<Mutex<SymbolCandles>> {
        if let Some(existing) = self.symbols.get(symbol) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .symbols
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SymbolCandles::default())));
        Arc::clone(entry.value())
    }

    /// Record one source's completed window.
    pub fn add_candle(&self, candle: SourceCandle) {
        if candle.open > 0.0 {
            self.classifier
                .observe(&candle.symbol, candle.range() / candle.open);
        }

        let state = self.symbol_state(&candle.symbol);
        let mut s = state.lock();

        if s.was_fused(candle.window_start) {
            self.counters.incr(counters::FUSION_ALREADY_FUSED);
            tracing::trace!(
                "{} {} window {} already fused, ignoring",
                candle.symbol,
                candle.source,
                candle.window_start
            );
            return;
        }

        s.pending
            .entry(candle.window_start)
            .or_default()
            .insert(candle.source, candle);
    }

    /// Fuse every window of `symbol` that both feeds have reported.
    pub fn fuse(&self, symbol: &str) -> Vec<FusedCandle> {
        let Some(state) = self.symbols.get(symbol).map(|s| Arc::clone(s.value())) else {
            return Vec::new();
        };
        let cfg = self.config.read().clone();
        let class = self.classifier.classify(symbol);

        let mut emitted = Vec::new();
        {
            let mut s = state.lock();

            let ready: Vec<DateTime<Utc>> = s
                .pending
                .iter()
                .filter(|(_, sources)| sources.len() >= 2)
                .map(|(ws, _)| *ws)
                .collect();

            for ws in ready {
                let Some(sources) = s.pending.remove(&ws) else {
                    continue;
                };
                let Some(fused) = fuse_sources(&sources, class, cfg.primary_weight) else {
                    continue;
                };

                s.fused_windows.insert(ws);
                // late windows slot in behind newer ones to keep pull order
                let at = s.history.partition_point(|c| c.window_start < ws);
                s.history.insert(at, fused.clone());
                while s.history.len() > cfg.max_fused_per_symbol {
                    if let Some(old) = s.history.pop_front() {
                        s.fused_windows.remove(&old.window_start);
                        s.evicted_through = s.evicted_through.max(Some(old.window_start));
                    }
                }
                emitted.push(fused);
            }

            let newest = s
                .pending
                .keys()
                .next_back()
                .copied()
                .into_iter()
                .chain(s.fused_windows.last().copied())
                .max();
            if let Some(newest) = newest {
                let horizon = ChronoDuration::seconds(
                    (cfg.window_seconds * cfg.pending_window_limit as u64) as i64,
                );
                let cutoff = newest - horizon;
                let expired: Vec<DateTime<Utc>> =
                    s.pending.range(..cutoff).map(|(ws, _)| *ws).collect();
                for ws in expired {
                    s.pending.remove(&ws);
                    self.counters.incr(counters::FUSION_SKIPPED_SINGLE_SOURCE);
                    tracing::debug!(
                        "⏭️  {} window {} never saw a second source, dropped",
                        symbol,
                        ws
                    );
                }
            }
        }

        for fused in &emitted {
            self.counters.incr(counters::FUSION_EMITTED);
            tracing::debug!(
                "🕯️  {} fused {} close {:.5} (primary {}, vol {:.3}, {:?})",
                fused.symbol,
                fused.window_start,
                fused.fused_close,
                fused.primary_source,
                fused.volatility_score,
                fused.structure_majority
            );
            // no receivers is not an error
            let _ = self.fused_tx.send(fused.clone());
        }

        emitted
    }

    /// Fuse every known symbol; one symbol's state never blocks another.
    pub fn fuse_all(&self) -> Vec<FusedCandle> {
        let Some(_run) = self.fuse_lock.try_lock() else {
            tracing::debug!("⏸️  Fusion already running, skipping");
            return Vec::new();
        };

        let symbols: Vec<String> = self.symbols.iter().map(|e| e.key().clone()).collect();
        let mut all = Vec::new();
        for symbol in symbols {
            all.extend(self.fuse(&symbol));
        }
        all
    }

    pub fn get_fused_candles(&self, symbol: &str, limit: usize) -> Vec<FusedCandle> {
        self.symbols
            .get(symbol)
            .map(|s| {
                let s = s.lock();
                let skip = s.history.len().saturating_sub(limit);
                s.history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn pending_windows(&self, symbol: &str) -> usize {
        self.symbols
            .get(symbol)
            .map(|s| s.lock().pending.len())
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FusedCandle> {
        self.fused_tx.subscribe()
    }

    pub fn update_config(&self, config: FusionConfig) {
        *self.config.write() = config;
        tracing::info!("🔧 Fusion parameters reloaded");
    }
}

fn fuse_sources(
    sources: &HashMap<FeedSource, SourceCandle>,
    class: AssetClass,
    primary_weight: f64,
) -> Option<FusedCandle> {
    let primary_source = class.primary_source();
    let primary = sources.get(&primary_source)?;
    let secondary = sources.get(&primary_source.other())?;
    Some(fuse_pair(primary, secondary, primary_weight))
}

/// Blend two same-window candles. Pure: identical inputs give identical output.
pub fn fuse_pair(primary: &SourceCandle, secondary: &SourceCandle, primary_weight: f64) -> FusedCandle {
    let secondary_weight = 1.0 - primary_weight;

    let structure_majority = if primary.structure == secondary.structure {
        primary.structure
    } else {
        majority_label(primary, secondary)
    };

    FusedCandle {
        symbol: primary.symbol.clone(),
        window_start: primary.window_start,
        open: primary.open,
        high: primary.high.max(secondary.high),
        low: primary.low.min(secondary.low),
        close: primary.close,
        volume: primary.volume + secondary.volume,
        fused_close: primary.close * primary_weight + secondary.close * secondary_weight,
        volatility_score: primary.volatility_score * primary_weight
            + secondary.volatility_score * secondary_weight,
        structure_majority,
        primary_source: primary.source,
        sources_used: vec![primary.source, secondary.source],
    }
}

fn majority_label(primary: &SourceCandle, secondary: &SourceCandle) -> StructureLabel {
    use std::cmp::Ordering;

    match primary.volatility_score.total_cmp(&secondary.volatility_score) {
        Ordering::Greater => primary.structure,
        Ordering::Less => secondary.structure,
        Ordering::Equal => {
            if secondary.volume > primary.volume {
                secondary.structure
            } else {
                primary.structure
            }
        }
    }
}
