pub mod archive;
pub mod buffer;
pub mod manager;
pub mod spike;

pub use archive::{NullArchive, SqliteTickArchive, TickArchive};
pub use buffer::TickBuffer;
pub use manager::{CompressionReport, RetentionManager};
pub use spike::{SpikeDetector, SpikeTransition};
