pub mod candle;
pub mod tick;

pub use candle::{window_start, FusedCandle, SourceCandle, StructureLabel};
pub use tick::{CalibrationSample, FeedSource, OffsetRecord, Tick};
