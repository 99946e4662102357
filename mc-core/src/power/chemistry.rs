//! Battery chemistries and their discharge curves

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// (volts, percent) points, highest voltage first
pub type DischargeCurve = &'static [(f64, f64)];

const CR2032_CURVE: DischargeCurve = &[
    (3.30, 100.0), (3.10, 98.0), (3.00, 95.0), (2.95, 90.0), (2.90, 85.0),
    (2.85, 75.0), (2.80, 65.0), (2.75, 50.0), (2.70, 40.0), (2.60, 25.0),
    (2.50, 15.0), (2.40, 8.0), (2.30, 4.0), (2.20, 2.0), (2.00, 0.0),
];

const CR2450_CURVE: DischargeCurve = &[
    (3.30, 100.0), (3.10, 98.0), (3.00, 95.0), (2.95, 90.0), (2.90, 85.0),
    (2.85, 75.0), (2.80, 65.0), (2.75, 50.0), (2.70, 40.0), (2.60, 25.0),
    (2.50, 15.0), (2.40, 8.0), (2.30, 4.0), (2.00, 0.0),
];

const CR123A_CURVE: DischargeCurve = &[
    (3.30, 100.0), (3.15, 95.0), (3.00, 90.0), (2.90, 80.0), (2.80, 65.0),
    (2.70, 45.0), (2.60, 25.0), (2.50, 12.0), (2.40, 5.0), (2.00, 0.0),
];

const ALKALINE_CELL_CURVE: DischargeCurve = &[
    (1.65, 100.0), (1.55, 95.0), (1.50, 90.0), (1.45, 80.0), (1.40, 70.0),
    (1.35, 60.0), (1.30, 50.0), (1.25, 40.0), (1.20, 30.0), (1.15, 20.0),
    (1.10, 12.0), (1.05, 6.0), (1.00, 3.0), (0.90, 0.0),
];

const ALKALINE_2S_CURVE: DischargeCurve = &[
    (3.30, 100.0), (3.10, 95.0), (3.00, 90.0), (2.90, 80.0), (2.80, 70.0),
    (2.70, 60.0), (2.60, 50.0), (2.50, 40.0), (2.40, 30.0), (2.30, 20.0),
    (2.20, 12.0), (2.00, 5.0), (1.80, 0.0),
];

const ALKALINE_3S_CURVE: DischargeCurve = &[
    (4.95, 100.0), (4.65, 95.0), (4.50, 90.0), (4.35, 80.0), (4.20, 70.0),
    (4.05, 60.0), (3.90, 50.0), (3.75, 40.0), (3.60, 30.0), (3.45, 20.0),
    (3.30, 12.0), (3.00, 5.0), (2.70, 0.0),
];

const LI_ION_CURVE: DischargeCurve = &[
    (4.20, 100.0), (4.15, 98.0), (4.10, 95.0), (4.00, 88.0), (3.90, 78.0),
    (3.80, 65.0), (3.70, 50.0), (3.60, 35.0), (3.50, 22.0), (3.40, 12.0),
    (3.30, 5.0), (3.00, 2.0), (2.80, 0.0),
];

/// Battery chemistry / pack configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Chemistry {
    #[serde(rename = "CR2032")]
    Cr2032,
    #[serde(rename = "CR2450")]
    Cr2450,
    #[serde(rename = "CR123A")]
    Cr123a,
    #[serde(rename = "AAA")]
    Aaa,
    #[serde(rename = "AA")]
    Aa,
    #[serde(rename = "2xAAA")]
    Aaa2,
    #[serde(rename = "2xAA")]
    Aa2,
    #[serde(rename = "3xAAA")]
    Aaa3,
    #[serde(rename = "Li-ion")]
    LiIon,
    #[default]
    Unknown,
}

impl Chemistry {
    pub const ALL: [Chemistry; 10] = [
        Chemistry::Cr2032,
        Chemistry::Cr2450,
        Chemistry::Cr123a,
        Chemistry::Aaa,
        Chemistry::Aa,
        Chemistry::Aaa2,
        Chemistry::Aa2,
        Chemistry::Aaa3,
        Chemistry::LiIon,
        Chemistry::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chemistry::Cr2032 => "CR2032",
            Chemistry::Cr2450 => "CR2450",
            Chemistry::Cr123a => "CR123A",
            Chemistry::Aaa => "AAA",
            Chemistry::Aa => "AA",
            Chemistry::Aaa2 => "2xAAA",
            Chemistry::Aa2 => "2xAA",
            Chemistry::Aaa3 => "3xAAA",
            Chemistry::LiIon => "Li-ion",
            Chemistry::Unknown => "Unknown",
        }
    }

    pub fn discharge_curve(&self) -> Option<DischargeCurve> {
        match self {
            Chemistry::Cr2032 => Some(CR2032_CURVE),
            Chemistry::Cr2450 => Some(CR2450_CURVE),
            Chemistry::Cr123a => Some(CR123A_CURVE),
            Chemistry::Aaa | Chemistry::Aa => Some(ALKALINE_CELL_CURVE),
            Chemistry::Aaa2 | Chemistry::Aa2 => Some(ALKALINE_2S_CURVE),
            Chemistry::Aaa3 => Some(ALKALINE_3S_CURVE),
            Chemistry::LiIon => Some(LI_ION_CURVE),
            Chemistry::Unknown => None,
        }
    }

    /// Typical internal resistance in ohms
    pub fn internal_resistance_ohms(&self) -> f64 {
        match self {
            Chemistry::Cr2032 => 15.0,
            Chemistry::Cr2450 => 10.0,
            Chemistry::Cr123a => 0.5,
            Chemistry::Aaa => 0.25,
            Chemistry::Aa => 0.15,
            Chemistry::Aaa2 => 0.5,
            Chemistry::Aa2 => 0.3,
            Chemistry::Aaa3 => 0.75,
            Chemistry::LiIon => 0.1,
            Chemistry::Unknown => 0.0,
        }
    }

    /// Percent remaining at `volts` open-circuit, or None without a curve
    pub fn percent_at(&self, volts: f64) -> Option<f64> {
        self.discharge_curve().map(|curve| interpolate_percent(curve, volts))
    }
}

impl fmt::Display for Chemistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chemistry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Chemistry::ALL
            .iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| format!("unknown chemistry: {}", s))
    }
}

/// Linear interpolation over a descending-voltage curve.
///
/// Above the first point returns its percent, below the last point returns
/// the last percent.
pub fn interpolate_percent(curve: &[(f64, f64)], volts: f64) -> f64 {
    let (Some(first), Some(last)) = (curve.first(), curve.last()) else {
        return 0.0;
    };

    if volts >= first.0 {
        return first.1;
    }
    if volts <= last.0 {
        return last.1;
    }

    for window in curve.windows(2) {
        let (upper_v, upper_p) = window[0];
        let (lower_v, lower_p) = window[1];
        if volts <= upper_v && volts >= lower_v {
            let span = upper_v - lower_v;
            if span <= f64::EPSILON {
                return upper_p;
            }
            return lower_p + (volts - lower_v) / span * (upper_p - lower_p);
        }
    }

    last.1
}
