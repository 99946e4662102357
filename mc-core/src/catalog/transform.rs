//! Value transforms applied when a binding turns a source value into a
//! capability value

use std::collections::BTreeMap;

use mc_protocol::{AttributeValue, CapabilityValue};
use serde::{Deserialize, Serialize};

use crate::codec::{DataType, DatapointValue};

/// Source value in the shape transforms understand
#[derive(Debug, Clone, PartialEq)]
pub enum SourceValue {
    Number(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
}

impl SourceValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            SourceValue::Number(n) => Some(*n),
            SourceValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            SourceValue::Text(_) | SourceValue::Bytes(_) => None,
        }
    }
}

impl From<&DatapointValue> for SourceValue {
    fn from(value: &DatapointValue) -> Self {
        match value {
            DatapointValue::Raw(b) => SourceValue::Bytes(b.clone()),
            DatapointValue::Boolean(b) => SourceValue::Bool(*b),
            DatapointValue::String(s) => SourceValue::Text(s.clone()),
            DatapointValue::Integer32(v) => SourceValue::Number(*v as f64),
            DatapointValue::Enum(v) => SourceValue::Number(*v as f64),
            DatapointValue::Bitmap { bits, .. } => SourceValue::Number(*bits as f64),
        }
    }
}

impl From<&AttributeValue> for SourceValue {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::Bool(b) => SourceValue::Bool(*b),
            AttributeValue::Int(i) => SourceValue::Number(*i as f64),
            AttributeValue::Float(f) => SourceValue::Number(*f),
            AttributeValue::Text(s) => SourceValue::Text(s.clone()),
            AttributeValue::Bytes(b) => SourceValue::Bytes(b.clone()),
        }
    }
}

/// Transform from a source value to a capability value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    #[default]
    Identity,
    Divide {
        by: f64,
    },
    Multiply {
        by: f64,
    },
    Boolean {
        #[serde(default)]
        invert: bool,
    },
    /// Keys are the decimal enum value
    EnumMap {
        values: BTreeMap<String, String>,
    },
    BitFlag {
        bit: u8,
    },
    Threshold {
        above: f64,
    },
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Identity => "identity",
            Transform::Divide { .. } => "divide",
            Transform::Multiply { .. } => "multiply",
            Transform::Boolean { .. } => "boolean",
            Transform::EnumMap { .. } => "enum_map",
            Transform::BitFlag { .. } => "bit_flag",
            Transform::Threshold { .. } => "threshold",
        }
    }

    /// Apply the transform. Returns None when the value has the wrong shape
    /// or an enum value has no mapping.
    pub fn apply(&self, value: &SourceValue) -> Option<CapabilityValue> {
        match self {
            Transform::Identity => Some(match value {
                SourceValue::Number(n) => CapabilityValue::Number(*n),
                SourceValue::Bool(b) => CapabilityValue::Bool(*b),
                SourceValue::Text(s) => CapabilityValue::Text(s.clone()),
                SourceValue::Bytes(b) => CapabilityValue::Text(hex::encode(b)),
            }),
            Transform::Divide { by } => value.as_number().map(|n| CapabilityValue::Number(n / by)),
            Transform::Multiply { by } => value.as_number().map(|n| CapabilityValue::Number(n * by)),
            Transform::Boolean { invert } => value
                .as_number()
                .map(|n| CapabilityValue::Bool((n != 0.0) != *invert)),
            Transform::EnumMap { values } => {
                let n = value.as_number()?;
                if n < 0.0 || n.fract() != 0.0 {
                    return None;
                }
                values.get(&(n as u64).to_string()).map(|s| CapabilityValue::Text(s.clone()))
            }
            Transform::BitFlag { bit } => value
                .as_number()
                .map(|n| CapabilityValue::Bool(((n as u64) >> bit) & 1 == 1)),
            Transform::Threshold { above } => value.as_number().map(|n| CapabilityValue::Bool(n > *above)),
        }
    }

    /// Check the transform's own parameters
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Transform::Divide { by } if *by == 0.0 || !by.is_finite() => {
                Err(format!("divide transform needs a finite non-zero divisor, got {}", by))
            }
            Transform::Multiply { by } if !by.is_finite() => {
                Err(format!("multiply transform needs a finite factor, got {}", by))
            }
            Transform::BitFlag { bit } if *bit >= 32 => Err(format!("bit_flag bit {} is out of range", bit)),
            Transform::EnumMap { values } if values.is_empty() => Err("enum_map has no values".to_string()),
            Transform::Threshold { above } if !above.is_finite() => {
                Err(format!("threshold needs a finite bound, got {}", above))
            }
            _ => Ok(()),
        }
    }

    /// Whether a datapoint of `data_type` can feed this transform
    pub fn accepts(&self, data_type: DataType) -> bool {
        use DataType::*;
        match self {
            Transform::Identity => true,
            Transform::Divide { .. } | Transform::Multiply { .. } | Transform::Threshold { .. } => {
                matches!(data_type, Integer32 | Enum | Bitmap)
            }
            Transform::Boolean { .. } => matches!(data_type, Boolean | Integer32 | Enum),
            Transform::EnumMap { .. } => matches!(data_type, Enum | Integer32),
            Transform::BitFlag { .. } => matches!(data_type, Bitmap | Integer32 | Enum),
        }
    }
}
