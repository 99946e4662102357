//! Battery percentage estimation cascade
//!
//! Levels, tried in order on every evaluation:
//!
//! 1. learned per-device curve (raw -> voltage), once confident enough
//! 2. voltage plus load current through the chemistry's resistance model
//! 3. voltage on the chemistry's default discharge curve
//! 4. device-reported raw percentage with format detection
//! 5. static placeholder
//!
//! Missing power data never makes a device unavailable; level 5 always
//! produces a value.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::calibration::{LearnLimits, LearnOutcome, LearnedCurve};
use super::chemistry::Chemistry;
use super::persistence::PersistedCalibration;
use crate::settings::PowerSettings;

/// Cascade level that produced an estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationLevel {
    LearnedCurve,
    PhysicsModel,
    VoltageCurve,
    RawPercent,
    Placeholder,
}

impl EstimationLevel {
    /// 1-based level number, as persisted
    pub fn number(&self) -> u8 {
        match self {
            EstimationLevel::LearnedCurve => 1,
            EstimationLevel::PhysicsModel => 2,
            EstimationLevel::VoltageCurve => 3,
            EstimationLevel::RawPercent => 4,
            EstimationLevel::Placeholder => 5,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(EstimationLevel::LearnedCurve),
            2 => Some(EstimationLevel::PhysicsModel),
            3 => Some(EstimationLevel::VoltageCurve),
            4 => Some(EstimationLevel::RawPercent),
            5 => Some(EstimationLevel::Placeholder),
            _ => None,
        }
    }

    /// Levels 4 and 5 carry no voltage information
    pub fn is_low_confidence(&self) -> bool {
        *self >= EstimationLevel::RawPercent
    }
}

/// Encoding of a device-reported raw percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RawFormat {
    /// 0-100
    Direct,
    /// 0-200 in half-percent steps
    HalfStep,
    /// 0-255
    Byte,
}

impl RawFormat {
    /// Detect the format from the largest raw value seen this session
    pub fn detect(session_max: f64) -> Self {
        if session_max <= 100.0 {
            RawFormat::Direct
        } else if session_max <= 200.0 {
            RawFormat::HalfStep
        } else {
            RawFormat::Byte
        }
    }

    pub fn to_percent(&self, raw: f64) -> f64 {
        match self {
            RawFormat::Direct => raw,
            RawFormat::HalfStep => raw / 2.0,
            RawFormat::Byte => raw * 100.0 / 255.0,
        }
    }
}

/// One power reading update. Any subset of fields may be present.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerSample {
    pub raw: Option<f64>,
    /// Volts
    pub voltage: Option<f64>,
    /// Milliamps
    pub current_ma: Option<f64>,
}

impl PowerSample {
    pub fn raw(raw: f64) -> Self {
        Self {
            raw: Some(raw),
            ..Default::default()
        }
    }

    pub fn voltage(volts: f64) -> Self {
        Self {
            voltage: Some(volts),
            ..Default::default()
        }
    }

    pub fn current(milliamps: f64) -> Self {
        Self {
            current_ma: Some(milliamps),
            ..Default::default()
        }
    }

    pub fn with_voltage(mut self, volts: f64) -> Self {
        self.voltage = Some(volts);
        self
    }

    pub fn with_current(mut self, milliamps: f64) -> Self {
        self.current_ma = Some(milliamps);
        self
    }

    pub fn with_raw(mut self, raw: f64) -> Self {
        self.raw = Some(raw);
        self
    }
}

/// Result of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerEstimate {
    /// 0-100, one decimal
    pub percent: f64,
    pub level: EstimationLevel,
    pub confidence: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_format: Option<RawFormat>,
}

impl PowerEstimate {
    pub fn is_low(&self, threshold_percent: f64) -> bool {
        self.percent < threshold_percent
    }
}

fn round_percent(value: f64) -> f64 {
    (value.clamp(0.0, 100.0) * 10.0).round() / 10.0
}

/// Per-device power estimator
#[derive(Debug, Clone)]
pub struct PowerEstimator {
    chemistry: Chemistry,
    settings: PowerSettings,
    curve: LearnedCurve,
    last_raw: Option<f64>,
    last_voltage: Option<f64>,
    last_current: Option<f64>,
    session_max_raw: f64,
    last_learned: Option<(f64, f64)>,
    last_level: Option<EstimationLevel>,
    skip_learned: bool,
    dirty: bool,
}

impl PowerEstimator {
    pub fn new(chemistry: Chemistry, settings: &PowerSettings) -> Self {
        Self {
            chemistry,
            settings: settings.clone(),
            curve: LearnedCurve::new(),
            last_raw: None,
            last_voltage: None,
            last_current: None,
            session_max_raw: 0.0,
            last_learned: None,
            last_level: None,
            skip_learned: false,
            dirty: false,
        }
    }

    /// Restore learned state from a persisted record. A declared chemistry
    /// takes precedence over the persisted one.
    pub fn restore(&mut self, record: &PersistedCalibration) {
        self.curve = LearnedCurve::from_samples(&record.raw_samples, record.confidence);
        if self.chemistry == Chemistry::Unknown {
            self.chemistry = record.chemistry;
        }
        self.last_level = record.last_level.and_then(EstimationLevel::from_number);
        debug!(
            points = self.curve.points().len(),
            confidence = self.curve.confidence(),
            chemistry = %self.chemistry,
            "Restored power calibration"
        );
    }

    pub fn chemistry(&self) -> Chemistry {
        self.chemistry
    }

    pub fn curve(&self) -> &LearnedCurve {
        &self.curve
    }

    pub fn last_level(&self) -> Option<EstimationLevel> {
        self.last_level
    }

    /// Feed a sample, learn from it, and re-evaluate the cascade
    pub fn update(&mut self, sample: PowerSample) -> PowerEstimate {
        if let Some(raw) = sample.raw.filter(|r| r.is_finite() && *r >= 0.0) {
            self.last_raw = Some(raw);
            self.session_max_raw = self.session_max_raw.max(raw);
        }
        if let Some(volts) = sample.voltage.filter(|v| v.is_finite() && *v > 0.0) {
            self.last_voltage = Some(volts);
        }
        if let Some(ma) = sample.current_ma.filter(|c| c.is_finite()) {
            self.last_current = Some(ma);
        }

        if sample.raw.is_some() || sample.voltage.is_some() {
            self.learn();
        }

        self.estimate()
    }

    /// Evaluate the cascade against the latest readings
    pub fn estimate(&mut self) -> PowerEstimate {
        let skip_learned = std::mem::take(&mut self.skip_learned);
        let curve = self.chemistry.discharge_curve();

        let learned = if skip_learned || self.curve.confidence() < self.settings.confidence_threshold {
            None
        } else {
            self.last_raw
                .and_then(|raw| self.curve.voltage_at(raw))
                .and_then(|volts| self.chemistry.percent_at(volts))
        };

        let (percent, level, raw_format) = if let Some(p) = learned {
            (p, EstimationLevel::LearnedCurve, None)
        } else if let (Some(v), Some(ma), Some(_)) = (self.last_voltage, self.last_current, curve) {
            let open_circuit = v + ma / 1000.0 * self.chemistry.internal_resistance_ohms();
            (
                self.chemistry.percent_at(open_circuit).unwrap_or(0.0),
                EstimationLevel::PhysicsModel,
                None,
            )
        } else if let (Some(v), Some(_)) = (self.last_voltage, curve) {
            (self.chemistry.percent_at(v).unwrap_or(0.0), EstimationLevel::VoltageCurve, None)
        } else if let Some(raw) = self.last_raw {
            let format = RawFormat::detect(self.session_max_raw);
            (format.to_percent(raw), EstimationLevel::RawPercent, Some(format))
        } else {
            (self.settings.placeholder_percent, EstimationLevel::Placeholder, None)
        };

        let estimate = PowerEstimate {
            percent: round_percent(percent),
            level,
            confidence: self.curve.confidence(),
            raw_format,
        };

        if level.is_low_confidence() && self.last_level != Some(level) {
            info!(
                level = level.number(),
                percent = estimate.percent,
                chemistry = %self.chemistry,
                "Low-confidence battery estimate"
            );
        }
        self.last_level = Some(level);

        estimate
    }

    /// A calibration write failed: skip the learned curve for the next evaluation
    pub fn persistence_failed(&mut self) {
        self.skip_learned = true;
    }

    /// Snapshot to persist, if learning changed anything since the last call
    pub fn take_dirty(&mut self) -> Option<PersistedCalibration> {
        if std::mem::take(&mut self.dirty) {
            Some(self.to_persisted())
        } else {
            None
        }
    }

    pub fn to_persisted(&self) -> PersistedCalibration {
        PersistedCalibration {
            raw_samples: self.curve.points().to_vec(),
            chemistry: self.chemistry,
            confidence: self.curve.confidence(),
            last_level: self.last_level.map(|l| l.number()),
        }
    }

    fn learn(&mut self) {
        let (Some(raw), Some(volts)) = (self.last_raw, self.last_voltage) else {
            return;
        };
        if self.last_learned == Some((raw, volts)) {
            return;
        }
        self.last_learned = Some((raw, volts));

        let limits = LearnLimits {
            tolerance_volts: self.settings.tolerance_volts,
            max_points: self.settings.max_curve_points,
            max_rejected: self.settings.max_rejected_samples,
        };
        match self.curve.learn(raw, volts, &limits) {
            LearnOutcome::Seeded | LearnOutcome::Consistent => self.dirty = true,
            LearnOutcome::Rejected => {
                debug!(raw, volts, "Power sample inconsistent with learned curve");
            }
        }
    }
}
