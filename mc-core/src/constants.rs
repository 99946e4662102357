//! Constants and configuration defaults for meshcap
//!
//! Centralizes the channel id ranges, event-name tables, codec tags and the
//! defaults every settings section falls back to.

/// Channel id ranges used by the classifier.
///
/// Ranges are consulted in declaration order: vendor datapoint first, then
/// the alternate vendor channels, then the broad manufacturer-specific range.
pub mod channels {
    use std::ops::RangeInclusive;

    /// Reserved vendor datapoint channel
    pub const VENDOR_DP: &[RangeInclusive<u16>] = &[0xEF00..=0xEF00];

    /// Alternate vendor channels (button/switch-type side channels)
    pub const ALT_VENDOR: &[RangeInclusive<u16>] = &[0xE000..=0xE001, 0xED00..=0xED00];

    /// Generic manufacturer-specific range
    pub const GENERIC_MFR: &[RangeInclusive<u16>] = &[0xFC00..=0xFFFF];

    /// Upper bound of the public/standard cluster range
    pub const STANDARD_MAX: u16 = 0x7FFF;

    /// Endpoint that carries the primary vendor channel
    pub const PRIMARY_ENDPOINT: u8 = 1;

    /// Attributes read when probing a vendor or manufacturer channel
    pub const PROBE_ATTRIBUTES: &[u16] = &[0x0000];
}

/// Local event names emitted by the stack for classified channels
pub mod events {
    /// Primary report event for vendor datapoint channels
    pub const VENDOR_DP_PRIMARY: &str = "dataReport";

    /// Primary report event for every other classified channel
    pub const ATTRIBUTE_PRIMARY: &str = "attributeReport";

    /// Names older firmware uses for vendor datapoint frames on
    /// non-primary endpoints, in priority order
    pub const VENDOR_DP_ALTERNATES: &[&str] = &["response", "reporting", "report", "datapoint"];
}

/// Standard clusters the session interprets directly
pub mod clusters {
    /// Power configuration cluster
    pub const POWER_CONFIG: u16 = 0x0001;
    /// Battery voltage attribute (units of 100 mV)
    pub const ATTR_BATTERY_VOLTAGE: u16 = 0x0020;
    /// Battery percentage remaining attribute (half-percent steps)
    pub const ATTR_BATTERY_PERCENT: u16 = 0x0021;
    /// Alarm zone cluster
    pub const IAS_ZONE: u16 = 0x0500;
}

/// Vendor datapoint codec
pub mod codec {
    /// Bytes in the frame sequence header
    pub const SEQ_LEN: usize = 2;
    /// Bytes in a datapoint header (id, type, u16 length)
    pub const DP_HEADER_LEN: usize = 4;

    pub const TYPE_RAW: u8 = 0x00;
    pub const TYPE_BOOL: u8 = 0x01;
    pub const TYPE_INT32: u8 = 0x02;
    pub const TYPE_STRING: u8 = 0x03;
    pub const TYPE_ENUM: u8 = 0x04;
    pub const TYPE_BITMAP: u8 = 0x05;

    /// Capacity of the per-device datapoint store (one slot per dp id)
    pub const MAX_STORED_DATAPOINTS: usize = 256;
}

/// Discovery timing defaults
pub mod discovery {
    /// Delay after discovery before a channel is probed
    pub const DEFAULT_PROBE_DELAY_MS: u64 = 3_000;
    /// Window a probe has to answer before the channel goes passive
    pub const DEFAULT_PROBE_WINDOW_MS: u64 = 10_000;
}

/// Vendor channel upkeep
pub mod vendor {
    /// Datapoint carrying the time sync payload (raw, 7 bytes)
    pub const TIME_SYNC_DP: u8 = 0x24;
    /// Local hour of the daily time sync
    pub const DEFAULT_TIME_SYNC_HOUR: u32 = 3;
    /// Delay after the vendor channel is known before datapoints are queried
    pub const DEFAULT_QUERY_DELAY_MS: u64 = 3_000;
}

/// Alarm enrollment defaults
pub mod enrollment {
    pub const DEFAULT_DISCOVER_TIMEOUT_MS: u64 = 5_000;
    pub const DEFAULT_PASSIVE_ACK_MS: u64 = 2_000;
    pub const DEFAULT_REQUEST_RESPONSE_MS: u64 = 5_000;
    pub const DEFAULT_WRITE_CONFIG_MS: u64 = 5_000;
    pub const DEFAULT_POLLING_MS: u64 = 30_000;
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;
    /// Auto-reset for motion zones (momentary alarms)
    pub const DEFAULT_MOTION_RESET_MS: u64 = 60_000;
    /// Auto-reset for vibration zones
    pub const DEFAULT_VIBRATION_RESET_MS: u64 = 10_000;
}

/// Power estimation defaults
pub mod power {
    /// Consistent samples needed before the learned curve is trusted
    pub const DEFAULT_CONFIDENCE_THRESHOLD: u32 = 5;
    /// Max voltage deviation for a sample to count as consistent
    pub const DEFAULT_TOLERANCE_VOLTS: f64 = 0.05;
    pub const DEFAULT_MAX_CURVE_POINTS: usize = 32;
    pub const DEFAULT_MAX_REJECTED_SAMPLES: usize = 16;
    pub const DEFAULT_LOW_BATTERY_PERCENT: f64 = 20.0;
    /// Static placeholder when no power data is available at all
    pub const DEFAULT_PLACEHOLDER_PERCENT: f64 = 100.0;
    /// Curve points required before samples are checked for consistency
    pub const MIN_SEED_POINTS: usize = 2;

    pub const CAPABILITY_PERCENT: &str = "measure_battery";
    pub const CAPABILITY_LOW: &str = "alarm_battery";
}

/// Storage paths
pub mod paths {
    use std::path::PathBuf;

    /// Environment variable overriding the configuration directory
    pub const CONFIG_DIR_ENV: &str = "MESHCAP_CONFIG_DIR";

    pub const SETTINGS_FILE: &str = "settings.json";

    pub const CALIBRATION_DIR: &str = "calibration";

    /// Largest settings or calibration file accepted
    pub const MAX_FILE_SIZE: u64 = 1024 * 1024;

    /// User configuration directory (`$MESHCAP_CONFIG_DIR` or `<config>/meshcap`)
    pub fn user_config_dir() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            if !dir.trim().is_empty() {
                return Some(PathBuf::from(dir));
            }
        }
        dirs::config_dir().map(|p| p.join("meshcap"))
    }
}
