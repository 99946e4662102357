//! Unified error handling for meshcap
//!
//! This crate provides a single error type used across all meshcap components.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using MeshcapError
pub type Result<T> = std::result::Result<T, MeshcapError>;

/// Unified error type for all meshcap operations
#[derive(thiserror::Error, Debug)]
pub enum MeshcapError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("File too large: {path} ({size} bytes, max {max_size} bytes)")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        max_size: u64,
    },

    // ============================================================================
    // Configuration and Settings Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Vendor Datapoint Codec Errors
    // ============================================================================
    #[error("Truncated frame: needed {needed} bytes, {available} available")]
    TruncatedFrame {
        needed: usize,
        available: usize,
    },

    #[error("Datapoint {dp_id}: length {len} invalid for type {data_type}")]
    LengthMismatch {
        dp_id: u8,
        data_type: String,
        len: usize,
    },

    #[error("Unknown datapoint type tag 0x{0:02x}")]
    UnknownDataType(u8),

    #[error("Datapoint {dp_id} is declared as {declared}, refusing to encode {given}")]
    TypeMismatch {
        dp_id: u8,
        declared: String,
        given: String,
    },

    #[error("Datapoint {0} is not declared by the active profile")]
    UndeclaredDatapoint(u8),

    #[error("Value out of range for datapoint {dp_id}: {reason}")]
    ValueOutOfRange {
        dp_id: u8,
        reason: String,
    },

    // ============================================================================
    // Catalog Compilation Errors
    // ============================================================================
    #[error("Duplicate profile id in catalog: {0}")]
    DuplicateProfile(String),

    #[error("Profile {profile}: capability {capability} bound twice ({first} and {second})")]
    BindingConflict {
        profile: String,
        capability: String,
        first: String,
        second: String,
    },

    #[error("Ambiguous collision for ({vendor_id}, {model_id}): {candidates:?} share the same rank")]
    AmbiguousCollision {
        vendor_id: String,
        model_id: String,
        candidates: Vec<String>,
    },

    #[error("Invalid catalog: {0}")]
    InvalidCatalog(String),

    // ============================================================================
    // Persistence Errors
    // ============================================================================
    #[error("Calibration persistence failed: {0}")]
    Persistence(String),

    // ============================================================================
    // Daemon Errors
    // ============================================================================
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl MeshcapError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid config error for a named field
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid catalog error from a string
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::InvalidCatalog(msg.into())
    }

    /// Create a persistence error from a string
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Whether this error came from decoding a malformed vendor frame.
    ///
    /// Malformed frames are always recoverable: the session drops the frame and keeps running.
    pub fn is_malformed_frame(&self) -> bool {
        matches!(
            self,
            Self::TruncatedFrame { .. } | Self::LengthMismatch { .. } | Self::UnknownDataType(_)
        )
    }

    /// Whether this error must abort catalog compilation
    pub fn is_build_fatal(&self) -> bool {
        matches!(
            self,
            Self::DuplicateProfile(_)
                | Self::BindingConflict { .. }
                | Self::AmbiguousCollision { .. }
                | Self::InvalidCatalog(_)
        )
    }
}

// Allow converting from String to MeshcapError
impl From<String> for MeshcapError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to MeshcapError
impl From<&str> for MeshcapError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
