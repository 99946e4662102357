//! Meshcap Core Library
//!
//! Runtime adaptation layer between a mesh-network stack and a home
//! automation host. Devices that speak a vendor datapoint protocol over
//! non-standard clusters are turned into typed capabilities.
//!
//! # Features
//!
//! - **Channel Discovery**: Classifies manufacturer-specific clusters and wires listeners
//! - **Datapoint Codec**: Decodes and encodes vendor datapoint frames
//! - **Profile Catalog**: Compiles device profiles into a registry with deterministic collision handling
//! - **Alarm Enrollment**: Multi-method enrollment cascade for security-zone sensors
//! - **Battery Estimation**: Five-level power cascade with learned calibration curves
//! - **Vendor Upkeep**: Daily time sync and datapoint queries on the vendor channel
//!
//! # Module Structure
//!
//! - `channel/` - Non-standard cluster classification and listeners
//! - `codec/` - Datapoint frames and the per-device datapoint store
//! - `catalog/` - Profiles, transforms, compilation and the registry
//! - `enrollment/` - Alarm zone enrollment state machine
//! - `power/` - Chemistry tables, learned curves and the estimation cascade
//! - `vendor` - Time sync and datapoint query scheduling
//! - `session` - Composes all of the above for one device
//!
//! # Example
//!
//! ```no_run
//! use mc_core::{compile, Catalog, CompileOptions};
//!
//! let catalog = Catalog::load(std::path::Path::new("profiles.json")).unwrap();
//! let registry = compile(&catalog, &CompileOptions::default()).unwrap();
//! let profile = registry.resolve("_TZE200_abc", "TS0601");
//! ```

// Grouped modules
pub mod catalog;
pub mod channel;
pub mod codec;
pub mod enrollment;
pub mod power;

// Standalone modules
pub mod constants;
pub mod session;
pub mod settings;
pub mod timers;
pub mod vendor;

pub use mc_error::{MeshcapError, Result};

pub use catalog::{
    compile, validate_profile, BindingRule, BindingSource, Catalog, CollisionReason, CollisionRecord,
    CompileOptions, DatapointDecl, IdentityKey, PowerSpec, Profile, ProfileRegistry, ScaledSource,
    SourceValue, SpecificityPolicy, Transform, ZoneSpec,
};

pub use channel::{
    Channel, ChannelCategory, ChannelClassifier, ChannelKey, ChannelMode, Handler, ListenerEntry,
    ListenerRegistry, Observation,
};

pub use codec::{
    decode_datapoint, decode_frame, decode_records, encode_command, encode_datapoint, encode_frame,
    ApplyOutcome, DataType, Datapoint, DatapointRecord, DatapointStore, DatapointValue, VendorFrame,
};

pub use enrollment::{
    AlarmState, EnrollmentMachine, EnrollmentMethod, EnrollmentOutput, EnrollmentPhase, ZoneCategory, ZoneEvent,
};

pub use power::{
    interpolate_percent, load_calibration, CalibrationKey, CalibrationStore, Chemistry, DischargeCurve,
    EstimationLevel, JsonCalibrationStore, LearnLimits, LearnOutcome, LearnedCurve, PersistedCalibration,
    PowerEstimate, PowerEstimator, PowerSample, RawFormat,
};

pub use session::{DeviceIdentity, DeviceSession, SessionOutput, TeardownReport};

pub use settings::{
    get_settings_path, load_settings, save_settings, CatalogSettings, CoreSettings, DiscoverySettings,
    EnrollmentSettings, PowerSettings, StorageSettings, VendorSettings,
};

pub use timers::{Millis, TimerSet};

pub use vendor::{millis_until_hour, time_sync_payload, VendorUpkeep, WallClock};
