pub mod metrics;
pub mod router;

pub use metrics::{LatencySummary, PipelineMetrics, Stage, TimingStatistics};
pub use router::{FusedCallback, IngestOutcome, SubscriptionId, TickCallback, TickIngestionRouter};
