use serde::Deserialize;
use std::env;
use std::time::Duration;

use super::error::{FusionError, FusionResult};
use crate::model::FeedSource;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub calibration: CalibrationConfig,
    pub retention: RetentionConfig,
    pub fusion: FusionConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CalibrationConfig {
    pub calibration_interval_seconds: u64,
    pub atr_threshold_multiplier: f64,
    pub max_offset: f64,
    /// Offset change per second above which drift is reported.
    pub drift_threshold: f64,
    pub m5_structure_weight: f64,
    pub min_samples_for_calibration: usize,
    pub time_alignment_window_seconds: u64,
    pub sample_window_seconds: u64,
    pub max_samples_per_symbol: usize,
    pub atr_period: usize,
    pub drift_history: usize,
    pub min_pair_weight: f64,
    pub reference_source: FeedSource,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            calibration_interval_seconds: 60,
            atr_threshold_multiplier: 2.0,
            max_offset: 50.0,
            drift_threshold: 0.001,
            m5_structure_weight: 0.2,
            min_samples_for_calibration: 3,
            time_alignment_window_seconds: 30,
            sample_window_seconds: 3600,
            max_samples_per_symbol: 5000,
            atr_period: 14,
            drift_history: 10,
            min_pair_weight: 0.1,
            reference_source: FeedSource::Broker,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    pub buffer_capacity_per_symbol: usize,
    pub retention_horizon_hours: f64,
    pub durable_horizon_hours: f64,
    pub spike_threshold_ticks_per_second: f64,
    pub spike_window_seconds: u64,
    pub compression_interval_seconds: u64,
    pub purge_interval_seconds: u64,
    pub archive_queue_batches: usize,
    /// SQLite file for the durable tier; in-memory only when unset.
    pub archive_path: Option<String>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity_per_symbol: 10_000,
            retention_horizon_hours: 1.0,
            durable_horizon_hours: 168.0,
            spike_threshold_ticks_per_second: 100.0,
            spike_window_seconds: 60,
            compression_interval_seconds: 300,
            purge_interval_seconds: 3600,
            archive_queue_batches: 256,
            archive_path: None,
        }
    }
}

impl RetentionConfig {
    pub fn retention_horizon(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.retention_horizon_hours * 3_600_000.0) as i64)
    }

    pub fn durable_horizon(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.durable_horizon_hours * 3_600_000.0) as i64)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    pub window_seconds: u64,
    pub primary_weight: f64,
    pub price_weight: f64,
    pub volume_weight: f64,
    pub max_fused_per_symbol: usize,
    pub latest_ticks_per_symbol: usize,
    /// Pending single-source windows older than this many windows are dropped.
    pub pending_window_limit: usize,
    pub broadcast_capacity: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            window_seconds: 300,
            primary_weight: 0.7,
            price_weight: 0.6,
            volume_weight: 0.4,
            max_fused_per_symbol: 1000,
            latest_ticks_per_symbol: 500,
            pending_window_limit: 12,
            broadcast_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub sample_interval_seconds: u64,
    pub dispatch_interval_millis: u64,
    pub cpu_high: f64,
    pub cpu_critical: f64,
    pub memory_high: f64,
    pub memory_critical: f64,
    pub disk_high: f64,
    pub disk_critical: f64,
    pub sustained_samples: u32,
    pub transition_cooldown_seconds: u64,
    pub max_retries: u32,
    pub shutdown_timeout_seconds: u64,
    pub pools: PoolSizes,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sample_interval_seconds: 5,
            dispatch_interval_millis: 100,
            cpu_high: 85.0,
            cpu_critical: 98.0,
            memory_high: 85.0,
            memory_critical: 95.0,
            disk_high: 90.0,
            disk_critical: 97.0,
            sustained_samples: 3,
            transition_cooldown_seconds: 30,
            max_retries: 3,
            shutdown_timeout_seconds: 10,
            pools: PoolSizes::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolSizes {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub deferred: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            critical: 4,
            high: 4,
            medium: 2,
            low: 1,
            deferred: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load from `fusion.toml` (or `$FUSION_CONFIG`) overlaid with
    /// `FUSION__SECTION__KEY` environment variables.
    pub fn load() -> FusionResult<Self> {
        dotenv::dotenv().ok();

        let path = env::var("FUSION_CONFIG").unwrap_or_else(|_| "fusion".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> FusionResult<Self> {
        let settings: Settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("FUSION")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> FusionResult<()> {
        let c = &self.calibration;
        ensure(c.calibration_interval_seconds > 0, "calibration_interval_seconds must be > 0")?;
        ensure(positive(c.atr_threshold_multiplier), "atr_threshold_multiplier must be > 0")?;
        ensure(positive(c.max_offset), "max_offset must be > 0")?;
        ensure(positive(c.drift_threshold), "drift_threshold must be > 0")?;
        ensure(unit(c.m5_structure_weight), "m5_structure_weight must be within [0, 1]")?;
        ensure(c.min_samples_for_calibration >= 1, "min_samples_for_calibration must be >= 1")?;
        ensure(c.time_alignment_window_seconds > 0, "time_alignment_window_seconds must be > 0")?;
        ensure(
            c.sample_window_seconds >= c.time_alignment_window_seconds,
            "sample_window_seconds must cover the alignment window",
        )?;
        ensure(
            c.max_samples_per_symbol >= c.min_samples_for_calibration,
            "max_samples_per_symbol must be >= min_samples_for_calibration",
        )?;
        ensure(c.atr_period >= 2, "atr_period must be >= 2")?;
        ensure(c.drift_history >= 2, "drift_history must be >= 2")?;
        ensure(unit(c.min_pair_weight), "min_pair_weight must be within [0, 1]")?;

        let r = &self.retention;
        ensure(r.buffer_capacity_per_symbol > 0, "buffer_capacity_per_symbol must be > 0")?;
        ensure(positive(r.retention_horizon_hours), "retention_horizon_hours must be > 0")?;
        ensure(
            r.durable_horizon_hours >= r.retention_horizon_hours,
            "durable_horizon_hours must be >= retention_horizon_hours",
        )?;
        ensure(
            positive(r.spike_threshold_ticks_per_second),
            "spike_threshold_ticks_per_second must be > 0",
        )?;
        ensure(r.spike_window_seconds > 0, "spike_window_seconds must be > 0")?;
        ensure(r.compression_interval_seconds > 0, "compression_interval_seconds must be > 0")?;
        ensure(r.purge_interval_seconds > 0, "purge_interval_seconds must be > 0")?;
        ensure(r.archive_queue_batches > 0, "archive_queue_batches must be > 0")?;

        let f = &self.fusion;
        ensure(f.window_seconds > 0, "fusion window_seconds must be > 0")?;
        ensure(
            f.primary_weight >= 0.5 && f.primary_weight <= 1.0,
            "primary_weight must be within [0.5, 1]",
        )?;
        ensure(unit(f.price_weight), "price_weight must be within [0, 1]")?;
        ensure(unit(f.volume_weight), "volume_weight must be within [0, 1]")?;
        ensure(
            (f.price_weight + f.volume_weight - 1.0).abs() < 1e-9,
            "price_weight + volume_weight must equal 1",
        )?;
        ensure(f.max_fused_per_symbol > 0, "max_fused_per_symbol must be > 0")?;
        ensure(f.latest_ticks_per_symbol > 0, "latest_ticks_per_symbol must be > 0")?;
        ensure(f.pending_window_limit > 0, "pending_window_limit must be > 0")?;
        ensure(f.broadcast_capacity > 0, "broadcast_capacity must be > 0")?;

        let s = &self.scheduler;
        ensure(s.sample_interval_seconds > 0, "sample_interval_seconds must be > 0")?;
        ensure(s.dispatch_interval_millis > 0, "dispatch_interval_millis must be > 0")?;
        threshold_pair("cpu", s.cpu_high, s.cpu_critical)?;
        threshold_pair("memory", s.memory_high, s.memory_critical)?;
        threshold_pair("disk", s.disk_high, s.disk_critical)?;
        ensure(s.sustained_samples >= 1, "sustained_samples must be >= 1")?;
        ensure(s.pools.critical >= 1, "critical pool must have at least one worker")?;
        ensure(s.shutdown_timeout_seconds > 0, "shutdown_timeout_seconds must be > 0")?;

        Ok(())
    }
}

fn ensure(condition: bool, message: &str) -> FusionResult<()> {
    if condition {
        Ok(())
    } else {
        Err(FusionError::Config(message.to_string()))
    }
}

fn positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

fn unit(v: f64) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

fn threshold_pair(name: &str, high: f64, critical: f64) -> FusionResult<()> {
    if !(high > 0.0 && high <= 100.0 && critical > 0.0 && critical <= 100.0) {
        return Err(FusionError::Config(format!(
            "{} thresholds must be within (0, 100]",
            name
        )));
    }
    if high >= critical {
        return Err(FusionError::Config(format!(
            "{} high threshold {} must be below critical {}",
            name, high, critical
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.calibration.min_samples_for_calibration, 3);
        assert_eq!(settings.calibration.time_alignment_window_seconds, 30);
        assert_eq!(settings.scheduler.cpu_high, 85.0);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut settings = Settings::default();
        settings.scheduler.cpu_high = 99.0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("cpu high threshold"));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let mut settings = Settings::default();
        settings.retention.buffer_capacity_per_symbol = 0;
        assert!(matches!(settings.validate(), Err(FusionError::Config(_))));
    }

    #[test]
    fn test_rejects_unbalanced_volatility_weights() {
        let mut settings = Settings::default();
        settings.fusion.price_weight = 0.9;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let settings = Settings::load_from("definitely-missing-fusion-config").unwrap();
        assert_eq!(settings.retention.spike_window_seconds, 60);
    }
}
