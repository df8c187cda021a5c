pub mod asset_class;
pub mod candle_builder;
pub mod engine;

pub use asset_class::{AssetClass, AssetClassifier};
pub use candle_builder::{volatility_score, CandleBuilder};
pub use engine::{fuse_pair, CandleFusionEngine};
