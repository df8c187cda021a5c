use thiserror::Error;

/// Reasons a tick is refused at the ingest boundary.
///
/// These are values, not failures: the router counts them and moves on.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("empty symbol")]
    EmptySymbol,
    #[error("unknown source '{0}'")]
    UnknownSource(String),
    #[error("missing timestamp")]
    MissingTimestamp,
    #[error("non-positive bid {0}")]
    NonPositiveBid(f64),
    #[error("non-positive ask {0}")]
    NonPositiveAsk(f64),
    #[error("non-finite price field")]
    NonFinite,
    #[error("negative volume {0}")]
    NegativeVolume(f64),
}

#[derive(Debug, Error)]
pub enum FusionError {
    #[error("invalid tick: {0}")]
    Validation(#[from] ValidationError),

    #[error("insufficient data for {symbol}: {detail}")]
    InsufficientData { symbol: String, detail: String },

    #[error("resources exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("durable storage failure: {0}")]
    DurableIo(String),

    #[error("task '{task}' gave up after {attempts} attempts: {last_error}")]
    TaskRetryExhausted {
        task: String,
        attempts: u32,
        last_error: String,
    },

    #[error("offset {offset:.5} for {symbol} exceeds limit {max_offset}")]
    OffsetRejected {
        symbol: String,
        offset: f64,
        max_offset: f64,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("shutting down")]
    Shutdown,
}

impl FusionError {
    pub fn insufficient(symbol: &str, detail: impl Into<String>) -> Self {
        FusionError::InsufficientData {
            symbol: symbol.to_string(),
            detail: detail.into(),
        }
    }

    /// Whether a scheduled task failing with this error should be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FusionError::ResourceExhaustion(_)
                | FusionError::DurableIo(_)
                | FusionError::InsufficientData { .. }
        )
    }
}

impl From<sqlx::Error> for FusionError {
    fn from(e: sqlx::Error) -> Self {
        FusionError::DurableIo(e.to_string())
    }
}

impl From<config::ConfigError> for FusionError {
    fn from(e: config::ConfigError) -> Self {
        FusionError::Config(e.to_string())
    }
}

pub type FusionResult<T> = std::result::Result<T, FusionError>;
