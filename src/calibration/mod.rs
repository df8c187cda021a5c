pub mod calibrator;
pub mod indicators;

pub use calibrator::{estimate_offset, CalibrationReport, OffsetCalibrator, OffsetEstimate, OffsetTable};
