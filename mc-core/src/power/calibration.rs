//! Learned raw-reading to voltage curve
//!
//! Each device reports its own raw battery value. Pairing those raw values
//! with measured voltages over time gives a per-device mapping that is more
//! trustworthy than the raw value on its own, once enough consistent samples
//! agree.

use std::collections::VecDeque;

use crate::constants::power::MIN_SEED_POINTS;

/// Outcome of feeding one (raw, voltage) sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnOutcome {
    /// Curve still being seeded; no confidence change
    Seeded,
    /// Sample agreed with the curve; confidence bumped
    Consistent,
    /// Sample disagreed; kept in the rejected buffer
    Rejected,
}

/// Limits applied while learning
#[derive(Debug, Clone, Copy)]
pub struct LearnLimits {
    pub tolerance_volts: f64,
    pub max_points: usize,
    pub max_rejected: usize,
}

/// Per-device (raw, reference voltage) curve
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearnedCurve {
    /// Sorted by raw, ascending, unique raw values
    points: Vec<(f64, f64)>,
    confidence: u32,
    rejected: VecDeque<(f64, f64)>,
}

impl LearnedCurve {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted samples. Points are re-sorted and duplicates merged.
    pub fn from_samples(samples: &[(f64, f64)], confidence: u32) -> Self {
        let mut curve = Self {
            points: Vec::with_capacity(samples.len()),
            confidence,
            rejected: VecDeque::new(),
        };
        for &(raw, volts) in samples {
            if raw.is_finite() && volts.is_finite() {
                curve.merge(raw, volts, usize::MAX);
            }
        }
        curve
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    pub fn confidence(&self) -> u32 {
        self.confidence
    }

    pub fn rejected(&self) -> impl Iterator<Item = &(f64, f64)> {
        self.rejected.iter()
    }

    pub fn is_seeded(&self) -> bool {
        self.points.len() >= MIN_SEED_POINTS
    }

    /// Voltage the curve predicts for `raw`. Outside the learned range the
    /// nearest endpoint's voltage is used.
    pub fn voltage_at(&self, raw: f64) -> Option<f64> {
        let first = self.points.first()?;
        let last = self.points.last()?;

        if raw <= first.0 {
            return Some(first.1);
        }
        if raw >= last.0 {
            return Some(last.1);
        }

        for window in self.points.windows(2) {
            let (lo_raw, lo_v) = window[0];
            let (hi_raw, hi_v) = window[1];
            if raw >= lo_raw && raw <= hi_raw {
                let t = (raw - lo_raw) / (hi_raw - lo_raw);
                return Some(lo_v + t * (hi_v - lo_v));
            }
        }

        Some(last.1)
    }

    /// Feed one sample
    pub fn learn(&mut self, raw: f64, volts: f64, limits: &LearnLimits) -> LearnOutcome {
        if !self.is_seeded() {
            self.merge(raw, volts, limits.max_points);
            return LearnOutcome::Seeded;
        }

        let predicted = self.voltage_at(raw).unwrap_or(volts);
        if (predicted - volts).abs() <= limits.tolerance_volts {
            self.merge(raw, volts, limits.max_points);
            self.confidence = self.confidence.saturating_add(1);
            LearnOutcome::Consistent
        } else {
            if limits.max_rejected > 0 {
                while self.rejected.len() >= limits.max_rejected {
                    self.rejected.pop_front();
                }
                self.rejected.push_back((raw, volts));
            }
            LearnOutcome::Rejected
        }
    }

    /// Insert a point in raw order. An existing point with the same raw value
    /// is averaged; when the curve is full the nearest point absorbs the sample.
    fn merge(&mut self, raw: f64, volts: f64, max_points: usize) {
        let pos = self.points.partition_point(|p| p.0 < raw);

        if let Some(existing) = self.points.get_mut(pos) {
            if existing.0 == raw {
                existing.1 = (existing.1 + volts) / 2.0;
                return;
            }
        }

        if self.points.len() < max_points.max(MIN_SEED_POINTS) {
            self.points.insert(pos, (raw, volts));
            return;
        }

        let nearest = [pos.checked_sub(1), Some(pos)]
            .into_iter()
            .flatten()
            .filter(|&i| i < self.points.len())
            .min_by(|&a, &b| {
                let da = (self.points[a].0 - raw).abs();
                let db = (self.points[b].0 - raw).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            });
        if let Some(i) = nearest {
            self.points[i].1 = (self.points[i].1 + volts) / 2.0;
        }
    }
}
