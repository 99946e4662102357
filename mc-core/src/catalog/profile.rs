//! Device profile definitions
//!
//! A profile declares which vendor/model identities it claims, the
//! datapoints the device speaks, and how sources bind to capabilities.

use std::fmt;
use std::fs;
use std::path::Path;

use mc_error::{MeshcapError, Result};
use serde::{Deserialize, Serialize};

use super::transform::Transform;
use crate::codec::DataType;
use crate::constants::paths::MAX_FILE_SIZE;
use crate::enrollment::ZoneCategory;
use crate::power::Chemistry;

// ============================================================================
// Sources and bindings
// ============================================================================

/// Where a capability value comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingSource {
    Datapoint { dp_id: u8 },
    Attribute { cluster: u16, attribute: u16 },
}

impl fmt::Display for BindingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingSource::Datapoint { dp_id } => write!(f, "datapoint {}", dp_id),
            BindingSource::Attribute { cluster, attribute } => {
                write!(f, "attribute 0x{:04x}/0x{:04x}", cluster, attribute)
            }
        }
    }
}

/// Binding from one source to one capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingRule {
    pub source: BindingSource,
    pub capability: String,
    #[serde(default)]
    pub transform: Transform,
}

/// Declared vendor datapoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatapointDecl {
    pub dp_id: u8,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitmap_width: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DatapointDecl {
    pub fn new(dp_id: u8, data_type: DataType) -> Self {
        Self {
            dp_id,
            data_type,
            bitmap_width: None,
            name: None,
        }
    }
}

fn default_divisor() -> f64 {
    1.0
}

/// Power reading source with its scale (reading / divisor = unit value)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaledSource {
    pub source: BindingSource,
    #[serde(default = "default_divisor")]
    pub divisor: f64,
}

impl ScaledSource {
    pub fn new(source: BindingSource, divisor: f64) -> Self {
        Self { source, divisor }
    }

    pub fn scale(&self, reading: f64) -> f64 {
        reading / self.divisor
    }
}

/// Battery description; the power cascade owns the battery capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSpec {
    pub chemistry: Chemistry,
    /// Raw battery-percent reading
    #[serde(default)]
    pub percent: Option<ScaledSource>,
    /// Battery voltage in volts after scaling
    #[serde(default)]
    pub voltage: Option<ScaledSource>,
    /// Load current in milliamps after scaling
    #[serde(default)]
    pub current: Option<ScaledSource>,
}

/// Alarm zone served by the enrollment state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSpec {
    pub endpoint: u8,
    pub category: ZoneCategory,
    pub capability: String,
}

// ============================================================================
// Profile
// ============================================================================

/// Device profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub category: String,
    pub vendor_ids: Vec<String>,
    pub model_ids: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub datapoints: Vec<DatapointDecl>,
    #[serde(default)]
    pub bindings: Vec<BindingRule>,
    #[serde(default)]
    pub power: Option<PowerSpec>,
    #[serde(default)]
    pub zones: Vec<ZoneSpec>,
}

impl Profile {
    /// Profile with no bindings, used for devices no profile claims.
    /// Channels are still discovered and datapoints decoded, nothing is bound.
    pub fn observe_only(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            category: "generic".to_string(),
            vendor_ids: Vec::new(),
            model_ids: Vec::new(),
            capabilities: Vec::new(),
            datapoints: Vec::new(),
            bindings: Vec::new(),
            power: None,
            zones: Vec::new(),
        }
    }

    pub fn datapoint(&self, dp_id: u8) -> Option<&DatapointDecl> {
        self.datapoints.iter().find(|d| d.dp_id == dp_id)
    }

    pub fn bindings_for(&self, source: BindingSource) -> impl Iterator<Item = &BindingRule> {
        self.bindings.iter().filter(move |b| b.source == source)
    }

    /// Whether the power spec reads from `source`
    pub fn is_power_source(&self, source: BindingSource) -> bool {
        self.power.as_ref().map_or(false, |p| {
            [p.percent, p.voltage, p.current]
                .iter()
                .flatten()
                .any(|s| s.source == source)
        })
    }

    /// (vendor, model) pairs this profile claims. Blank ids claim nothing.
    pub fn identities(&self) -> Vec<(String, String)> {
        let trimmed = |ids: &[String]| -> Vec<String> {
            ids.iter()
                .map(|id| id.trim())
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect()
        };
        let vendors = trimmed(&self.vendor_ids);
        let models = trimmed(&self.model_ids);

        let mut out = Vec::with_capacity(vendors.len() * models.len());
        for vendor in &vendors {
            for model in &models {
                out.push((vendor.clone(), model.clone()));
            }
        }
        out
    }
}

// ============================================================================
// Catalog document
// ============================================================================

fn default_version() -> u32 {
    1
}

/// Uncompiled profile catalog as stored on disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

impl Catalog {
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| MeshcapError::catalog(format!("Failed to parse catalog: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path).map_err(|e| MeshcapError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        if metadata.len() > MAX_FILE_SIZE {
            return Err(MeshcapError::FileTooLarge {
                path: path.to_path_buf(),
                size: metadata.len(),
                max_size: MAX_FILE_SIZE,
            });
        }

        let content = fs::read_to_string(path).map_err(|e| MeshcapError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&content)
    }
}
