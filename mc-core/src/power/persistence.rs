//! Persistent storage for learned power calibration
//!
//! One JSON file per device, named by the SHA-256 of the device key so
//! arbitrary vendor/model strings never reach the file system.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use mc_error::{MeshcapError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::chemistry::Chemistry;
use crate::constants::paths;

/// Persisted learned-curve record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCalibration {
    /// (raw reading, reference voltage) pairs
    #[serde(default)]
    pub raw_samples: Vec<(f64, f64)>,
    #[serde(default)]
    pub chemistry: Chemistry,
    #[serde(default)]
    pub confidence: u32,
    /// Cascade level last used (1-5)
    #[serde(default)]
    pub last_level: Option<u8>,
}

/// Stable key of a device's calibration record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CalibrationKey {
    pub vendor_id: String,
    pub model_id: String,
    pub instance_id: String,
}

impl CalibrationKey {
    pub fn new(vendor_id: impl Into<String>, model_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            vendor_id: vendor_id.into(),
            model_id: model_id.into(),
            instance_id: instance_id.into(),
        }
    }

    /// File name for this key: hex SHA-256 of `vendor:model:instance`
    pub fn file_name(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        format!("{}.json", hex::encode(hasher.finalize()))
    }
}

impl fmt::Display for CalibrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.vendor_id, self.model_id, self.instance_id)
    }
}

/// Storage backend for calibration records
#[cfg_attr(test, mockall::automock)]
pub trait CalibrationStore: Send + Sync {
    fn load(&self, key: &CalibrationKey) -> Result<Option<PersistedCalibration>>;
    fn save(&self, key: &CalibrationKey, record: &PersistedCalibration) -> Result<()>;
    /// Remove a record. Returns whether one existed.
    fn remove(&self, key: &CalibrationKey) -> Result<bool>;
}

/// Best-effort load: storage errors are logged and treated as "no record"
pub fn load_calibration(store: &dyn CalibrationStore, key: &CalibrationKey) -> Option<PersistedCalibration> {
    match store.load(key) {
        Ok(record) => record,
        Err(e) => {
            warn!(device = %key, error = %e, "Failed to load power calibration, starting fresh");
            None
        }
    }
}

/// JSON-file calibration store
#[derive(Debug)]
pub struct JsonCalibrationStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonCalibrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// `<config dir>/calibration`
    pub fn default_dir() -> Option<PathBuf> {
        paths::user_config_dir().map(|p| p.join(paths::CALIBRATION_DIR))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &CalibrationKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl CalibrationStore for JsonCalibrationStore {
    fn load(&self, key: &CalibrationKey) -> Result<Option<PersistedCalibration>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
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
        let record: PersistedCalibration = serde_json::from_str(&content)
            .map_err(|e| MeshcapError::persistence(format!("Corrupt calibration {}: {}", path.display(), e)))?;

        debug!(device = %key, points = record.raw_samples.len(), "Loaded power calibration");
        Ok(Some(record))
    }

    fn save(&self, key: &CalibrationKey, record: &PersistedCalibration) -> Result<()> {
        let _guard = self.write_lock.lock();

        fs::create_dir_all(&self.dir).map_err(|e| MeshcapError::FileWrite {
            path: self.dir.clone(),
            source: e,
        })?;

        let path = self.path_for(key);
        let json = serde_json::to_string_pretty(record)?;

        // Atomic write: temp file, sync, rename
        let temp_path = path.with_extension("json.tmp");
        let write_err = |e| MeshcapError::FileWrite {
            path: temp_path.clone(),
            source: e,
        };
        let mut file = fs::File::create(&temp_path).map_err(write_err)?;
        file.write_all(json.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);

        fs::rename(&temp_path, &path).map_err(|e| MeshcapError::FileWrite {
            path: path.clone(),
            source: e,
        })?;

        debug!(device = %key, path = ?path, "Saved power calibration");
        Ok(())
    }

    fn remove(&self, key: &CalibrationKey) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MeshcapError::FileWrite { path, source: e }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CalibrationKey {
        CalibrationKey::new("_TZE200_abc", "TS0601", "0x00124b0001")
    }

    fn record() -> PersistedCalibration {
        PersistedCalibration {
            raw_samples: vec![(100.0, 2.6), (200.0, 3.0)],
            chemistry: Chemistry::Cr2032,
            confidence: 4,
            last_level: Some(3),
        }
    }

    #[test]
    fn test_file_name_is_hashed() {
        let name = key().file_name();
        assert_eq!(name.len(), 64 + ".json".len());
        assert!(!name.contains("TS0601"));
        assert_eq!(name, key().file_name());
    }

    #[test]
    fn test_camel_case_schema() {
        let json = serde_json::to_value(record()).unwrap();
        assert!(json.get("rawSamples").is_some());
        assert!(json.get("lastLevel").is_some());
        assert_eq!(json["rawSamples"][0], serde_json::json!([100.0, 2.6]));
        assert_eq!(json["chemistry"], "CR2032");
    }

    #[test]
    fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCalibrationStore::new(dir.path().join("calibration"));

        assert_eq!(store.load(&key()).unwrap(), None);
        store.save(&key(), &record()).unwrap();
        assert_eq!(store.load(&key()).unwrap(), Some(record()));
        assert!(!store.path_for(&key()).with_extension("json.tmp").exists());

        assert!(store.remove(&key()).unwrap());
        assert!(!store.remove(&key()).unwrap());
        assert_eq!(store.load(&key()).unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCalibrationStore::new(dir.path());
        fs::write(store.path_for(&key()), "{not json").unwrap();
        assert!(matches!(store.load(&key()), Err(MeshcapError::Persistence(_))));
    }

    #[test]
    fn test_load_calibration_swallows_errors() {
        let mut store = MockCalibrationStore::new();
        store
            .expect_load()
            .times(1)
            .returning(|_| Err(MeshcapError::persistence("disk gone")));
        assert_eq!(load_calibration(&store, &key()), None);
    }

    #[test]
    fn test_load_calibration_passes_record() {
        let mut store = MockCalibrationStore::new();
        store.expect_load().returning(|_| Ok(Some(record())));
        assert_eq!(load_calibration(&store, &key()), Some(record()));
    }
}
