pub mod clock;
pub mod config;
pub mod counters;
pub mod error;
pub mod health;
pub mod logging;
pub mod periodic;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Settings;
pub use counters::Counters;
pub use error::{FusionError, FusionResult, ValidationError};
pub use health::{HealthChecker, HealthStatus};
pub use periodic::PeriodicTask;
