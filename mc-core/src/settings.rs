//! Core Settings
//!
//! Persistent settings stored as JSON in ~/.config/meshcap/settings.json.
//! Every field has a default so partial files are valid.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use mc_error::{MeshcapError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{CompileOptions, SpecificityPolicy};
use crate::constants::{discovery, enrollment, paths, power, vendor};
use crate::enrollment::{EnrollmentMethod, ZoneCategory};

/// All core settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreSettings {
    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub vendor: VendorSettings,

    #[serde(default)]
    pub enrollment: EnrollmentSettings,

    #[serde(default)]
    pub power: PowerSettings,

    #[serde(default)]
    pub catalog: CatalogSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

/// Channel discovery timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Delay after discovery before a channel is probed
    #[serde(default = "default_probe_delay")]
    pub probe_delay_ms: u64,

    /// How long a probe may take before the channel goes passive
    #[serde(default = "default_probe_window")]
    pub probe_window_ms: u64,
}

/// Time sync and datapoint query on the vendor channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorSettings {
    #[serde(default = "default_true")]
    pub time_sync: bool,

    /// Local hour (0-23) of the daily time sync
    #[serde(default = "default_time_sync_hour")]
    pub time_sync_hour: u32,

    #[serde(default = "default_true")]
    pub query_datapoints: bool,

    #[serde(default = "default_query_delay")]
    pub query_delay_ms: u64,
}

/// Alarm enrollment timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentSettings {
    #[serde(default = "default_discover_timeout")]
    pub discover_timeout_ms: u64,

    #[serde(default = "default_passive_ack")]
    pub passive_ack_ms: u64,

    #[serde(default = "default_request_response")]
    pub request_response_ms: u64,

    #[serde(default = "default_write_config")]
    pub write_config_ms: u64,

    /// Total time spent in the status-polling fallback
    #[serde(default = "default_polling")]
    pub polling_ms: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Auto-reset per zone category; missing or 0 means no auto-reset
    #[serde(default = "default_auto_reset")]
    pub auto_reset_ms: BTreeMap<ZoneCategory, u64>,

    /// Zone id assigned in enroll responses
    #[serde(default)]
    pub zone_id: u8,
}

impl EnrollmentSettings {
    pub fn method_timeout(&self, method: EnrollmentMethod) -> u64 {
        match method {
            EnrollmentMethod::PassiveAck => self.passive_ack_ms,
            EnrollmentMethod::RequestResponse => self.request_response_ms,
            EnrollmentMethod::WriteZoneConfig => self.write_config_ms,
            EnrollmentMethod::StatusPolling => self.polling_ms,
        }
    }

    pub fn auto_reset_for(&self, category: ZoneCategory) -> u64 {
        self.auto_reset_ms.get(&category).copied().unwrap_or(0)
    }
}

/// Power cascade tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSettings {
    /// Consistent samples before the learned curve is used
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: u32,

    #[serde(default = "default_tolerance")]
    pub tolerance_volts: f64,

    #[serde(default = "default_max_curve_points")]
    pub max_curve_points: usize,

    #[serde(default = "default_max_rejected")]
    pub max_rejected_samples: usize,

    /// Below this percentage `alarm_battery` is raised
    #[serde(default = "default_low_battery")]
    pub low_battery_percent: f64,

    #[serde(default = "default_placeholder")]
    pub placeholder_percent: f64,
}

/// Catalog compilation policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSettings {
    #[serde(default)]
    pub specificity: SpecificityPolicy,

    /// Fail compilation on equal-rank collisions
    #[serde(default)]
    pub strict_ties: bool,
}

impl CatalogSettings {
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            policy: self.specificity.clone(),
            strict_ties: self.strict_ties,
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Calibration directory; defaults to `<config dir>/calibration`
    #[serde(default)]
    pub calibration_dir: Option<PathBuf>,
}

fn default_probe_delay() -> u64 {
    discovery::DEFAULT_PROBE_DELAY_MS
}

fn default_probe_window() -> u64 {
    discovery::DEFAULT_PROBE_WINDOW_MS
}

fn default_true() -> bool {
    true
}

fn default_time_sync_hour() -> u32 {
    vendor::DEFAULT_TIME_SYNC_HOUR
}

fn default_query_delay() -> u64 {
    vendor::DEFAULT_QUERY_DELAY_MS
}

fn default_discover_timeout() -> u64 {
    enrollment::DEFAULT_DISCOVER_TIMEOUT_MS
}

fn default_passive_ack() -> u64 {
    enrollment::DEFAULT_PASSIVE_ACK_MS
}

fn default_request_response() -> u64 {
    enrollment::DEFAULT_REQUEST_RESPONSE_MS
}

fn default_write_config() -> u64 {
    enrollment::DEFAULT_WRITE_CONFIG_MS
}

fn default_polling() -> u64 {
    enrollment::DEFAULT_POLLING_MS
}

fn default_poll_interval() -> u64 {
    enrollment::DEFAULT_POLL_INTERVAL_MS
}

fn default_auto_reset() -> BTreeMap<ZoneCategory, u64> {
    let mut map = BTreeMap::new();
    map.insert(ZoneCategory::Motion, enrollment::DEFAULT_MOTION_RESET_MS);
    map.insert(ZoneCategory::Vibration, enrollment::DEFAULT_VIBRATION_RESET_MS);
    map
}

fn default_confidence_threshold() -> u32 {
    power::DEFAULT_CONFIDENCE_THRESHOLD
}

fn default_tolerance() -> f64 {
    power::DEFAULT_TOLERANCE_VOLTS
}

fn default_max_curve_points() -> usize {
    power::DEFAULT_MAX_CURVE_POINTS
}

fn default_max_rejected() -> usize {
    power::DEFAULT_MAX_REJECTED_SAMPLES
}

fn default_low_battery() -> f64 {
    power::DEFAULT_LOW_BATTERY_PERCENT
}

fn default_placeholder() -> f64 {
    power::DEFAULT_PLACEHOLDER_PERCENT
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            probe_delay_ms: default_probe_delay(),
            probe_window_ms: default_probe_window(),
        }
    }
}

impl Default for VendorSettings {
    fn default() -> Self {
        Self {
            time_sync: true,
            time_sync_hour: default_time_sync_hour(),
            query_datapoints: true,
            query_delay_ms: default_query_delay(),
        }
    }
}

impl Default for EnrollmentSettings {
    fn default() -> Self {
        Self {
            discover_timeout_ms: default_discover_timeout(),
            passive_ack_ms: default_passive_ack(),
            request_response_ms: default_request_response(),
            write_config_ms: default_write_config(),
            polling_ms: default_polling(),
            poll_interval_ms: default_poll_interval(),
            auto_reset_ms: default_auto_reset(),
            zone_id: 0,
        }
    }
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            tolerance_volts: default_tolerance(),
            max_curve_points: default_max_curve_points(),
            max_rejected_samples: default_max_rejected(),
            low_battery_percent: default_low_battery(),
            placeholder_percent: default_placeholder(),
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

impl CoreSettings {
    pub fn validate(&self) -> Result<()> {
        let e = &self.enrollment;
        let timeouts = [
            ("discovery.probe_window_ms", self.discovery.probe_window_ms),
            ("enrollment.discover_timeout_ms", e.discover_timeout_ms),
            ("enrollment.passive_ack_ms", e.passive_ack_ms),
            ("enrollment.request_response_ms", e.request_response_ms),
            ("enrollment.write_config_ms", e.write_config_ms),
            ("enrollment.polling_ms", e.polling_ms),
            ("enrollment.poll_interval_ms", e.poll_interval_ms),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(MeshcapError::invalid_config(field, "must be greater than zero"));
            }
        }

        if self.vendor.time_sync_hour > 23 {
            return Err(MeshcapError::invalid_config("vendor.time_sync_hour", "must be within 0-23"));
        }

        let p = &self.power;
        if !(p.tolerance_volts > 0.0) {
            return Err(MeshcapError::invalid_config("power.tolerance_volts", "must be positive"));
        }
        if p.confidence_threshold == 0 {
            return Err(MeshcapError::invalid_config("power.confidence_threshold", "must be at least 1"));
        }
        if p.max_curve_points < power::MIN_SEED_POINTS {
            return Err(MeshcapError::invalid_config(
                "power.max_curve_points",
                format!("must be at least {}", power::MIN_SEED_POINTS),
            ));
        }
        for (field, value) in [
            ("power.low_battery_percent", p.low_battery_percent),
            ("power.placeholder_percent", p.placeholder_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(MeshcapError::invalid_config(field, "must be within 0-100"));
            }
        }

        Ok(())
    }

    /// Calibration directory from settings or the default location
    pub fn calibration_dir(&self) -> Option<PathBuf> {
        self.storage
            .calibration_dir
            .clone()
            .or_else(crate::power::JsonCalibrationStore::default_dir)
    }
}

// ============================================================================
// Load / Save
// ============================================================================

/// Default settings file path
pub fn get_settings_path() -> Result<PathBuf> {
    paths::user_config_dir()
        .map(|dir| dir.join(paths::SETTINGS_FILE))
        .ok_or_else(|| MeshcapError::config("Could not determine config directory"))
}

/// Load settings from `path`, or the default location when None.
/// A missing file yields defaults.
pub fn load_settings(path: Option<&Path>) -> Result<CoreSettings> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => get_settings_path()?,
    };

    if !path.exists() {
        debug!(path = ?path, "No settings file, using defaults");
        return Ok(CoreSettings::default());
    }

    let metadata = fs::metadata(&path).map_err(|e| MeshcapError::FileRead {
        path: path.clone(),
        source: e,
    })?;
    if metadata.len() > paths::MAX_FILE_SIZE {
        return Err(MeshcapError::FileTooLarge {
            path,
            size: metadata.len(),
            max_size: paths::MAX_FILE_SIZE,
        });
    }

    let content = fs::read_to_string(&path).map_err(|e| MeshcapError::FileRead {
        path: path.clone(),
        source: e,
    })?;
    let settings: CoreSettings = serde_json::from_str(&content)
        .map_err(|e| MeshcapError::config(format!("Failed to parse settings JSON: {}", e)))?;
    settings.validate()?;

    Ok(settings)
}

/// Save settings atomically to `path`, or the default location when None
pub fn save_settings(settings: &CoreSettings, path: Option<&Path>) -> Result<()> {
    settings.validate()?;

    let path = match path {
        Some(p) => p.to_path_buf(),
        None => get_settings_path()?,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| MeshcapError::config(format!("Failed to create config directory: {}", e)))?;
    }

    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| MeshcapError::config(format!("Failed to serialize settings: {}", e)))?;

    let temp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&temp_path)
        .map_err(|e| MeshcapError::config(format!("Failed to create temp file: {}", e)))?;
    file.write_all(json.as_bytes())
        .map_err(|e| MeshcapError::config(format!("Failed to write to temp file: {}", e)))?;
    file.sync_all()
        .map_err(|e| MeshcapError::config(format!("Failed to sync temp file: {}", e)))?;
    drop(file);

    fs::rename(&temp_path, &path)
        .map_err(|e| MeshcapError::config(format!("Failed to rename temp file: {}", e)))?;

    Ok(())
}
