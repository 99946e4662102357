//! Battery estimation with per-device learning

mod calibration;
mod cascade;
mod chemistry;
mod persistence;

pub use calibration::{LearnLimits, LearnOutcome, LearnedCurve};
pub use cascade::{EstimationLevel, PowerEstimate, PowerEstimator, PowerSample, RawFormat};
pub use chemistry::{interpolate_percent, Chemistry, DischargeCurve};
pub use persistence::{load_calibration, CalibrationKey, CalibrationStore, JsonCalibrationStore, PersistedCalibration};
