//! Dual-feed tick fusion core.
//!
//! Two price feeds for the same instruments (a broker feed and an exchange
//! feed) are ingested through one router, calibrated against each other,
//! aggregated into per-source candles and fused into one candle series,
//! while a resource-aware scheduler keeps the maintenance work within the
//! host's budget.

pub mod calibration;
pub mod core;
pub mod fusion;
pub mod model;
pub mod orchestrator;
pub mod retention;
pub mod scheduler;
pub mod streaming;

pub use crate::core::{FusionError, FusionResult, Settings};
pub use orchestrator::{Diagnostics, FusionSystem};
