// crates/sqlite-mapping/src/error.rs
// ============================================================================
// Module: SQLite Mapping Errors
// Description: Error taxonomy shared by every mapping component.
// Purpose: Surface storage, naming, and decoding failures without payloads.
// Dependencies: rusqlite, thiserror
// ============================================================================

//! ## Overview
//! All fallible mapping operations return [`StoreError`]. Engine failures
//! inside a unit of work propagate unchanged after the unit rolls back; they
//! are never retried or swallowed. Absent keys are reported as `Ok(None)` by
//! lookups, and only [`StoreError::MissingKey`] when the caller explicitly
//! requires the key.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::config::ConfigError;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Mapping store errors.
///
/// # Invariants
/// - Error messages never embed stored value payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Database file cannot be opened, created, or recognized.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// Namespace name cannot be turned into a safe table identifier.
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),
    /// Key cannot be stored as a row key.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// Stored payload does not decode under its encoding tag.
    #[error("corrupt value: {0}")]
    CorruptValue(String),
    /// Required key is absent from its namespace.
    #[error("missing key: {0}")]
    MissingKey(String),
    /// Value could not be encoded by the opaque encoder.
    #[error("value cannot be encoded: {0}")]
    Unencodable(String),
    /// Encoded value exceeds the configured size limit.
    #[error("value too large: {actual_bytes} bytes (max {max_bytes})")]
    TooLarge {
        /// Maximum allowed bytes.
        max_bytes: usize,
        /// Actual encoded size in bytes.
        actual_bytes: usize,
    },
    /// Store configuration was rejected.
    #[error("invalid store config: {0}")]
    InvalidConfig(String),
    /// `SQLite` engine failure inside a unit of work.
    #[error("storage engine error: {0}")]
    Engine(String),
    /// The connection guardian has been closed.
    #[error("store closed: {0}")]
    Closed(String),
    /// A unit of work tried to submit another unit to its own guardian.
    #[error("unit of work re-entered the connection guardian")]
    Reentrant,
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Engine(error.to_string())
    }
}

impl From<ConfigError> for StoreError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::Io(message) => Self::StorageUnavailable(message),
            ConfigError::Parse(message) | ConfigError::Invalid(message) => {
                Self::InvalidConfig(message)
            }
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
