// crates/sqlite-mapping/src/config.rs
// ============================================================================
// Module: SQLite Mapping Configuration
// Description: Store configuration model, TOML loading, and validation.
// Purpose: Fail closed on unusable limits before any file is touched.
// Dependencies: serde, thiserror, toml
// ============================================================================

//! ## Overview
//! [`MappingStoreConfig`] describes one mapping store: the database file,
//! `SQLite` durability pragmas, the guardian queue bound, and the limits
//! applied to keys, values, and table names. Configs can be built in code
//! with [`MappingStoreConfig::for_path`] or parsed from TOML.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Path marker selecting a private in-memory database.
pub const IN_MEMORY_PATH: &str = ":memory:";
/// Maximum configuration file size in bytes.
const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Hard upper bound for `max_key_bytes`.
const MAX_KEY_BYTES_LIMIT: usize = 1024 * 1024;
/// Hard upper bound for `max_value_bytes` (`SQLite` default blob limit).
const MAX_VALUE_BYTES_LIMIT: usize = 1_000_000_000;
/// Maximum length of the table prefix.
const MAX_TABLE_PREFIX_LENGTH: usize = 32;

// ============================================================================
// SECTION: Pragmas
// ============================================================================

/// `SQLite` journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl JournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `synchronous` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

// ============================================================================
// SECTION: Config
// ============================================================================

/// Configuration for a mapping store.
///
/// # Invariants
/// - `path` is either [`IN_MEMORY_PATH`] or a file path (not a directory).
/// - `queue_capacity`, `max_key_bytes`, and `max_value_bytes` are non-zero.
/// - `table_prefix` is non-empty ASCII alphanumerics or underscores.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingStoreConfig {
    /// Path to the `SQLite` database file, or `:memory:`.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: JournalMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// Bound of the guardian queue; submitters block while it is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Maximum key length in bytes.
    #[serde(default = "default_max_key_bytes")]
    pub max_key_bytes: usize,
    /// Maximum encoded value size in bytes.
    #[serde(default = "default_max_value_bytes")]
    pub max_value_bytes: usize,
    /// Prefix prepended to every namespace table name.
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

/// Returns the default guardian queue capacity.
const fn default_queue_capacity() -> usize {
    1_024
}

/// Returns the default key length limit.
const fn default_max_key_bytes() -> usize {
    4 * 1024
}

/// Returns the default encoded value size limit.
const fn default_max_value_bytes() -> usize {
    16 * 1024 * 1024
}

/// Returns the default namespace table prefix.
fn default_table_prefix() -> String {
    "db_".to_string()
}

impl MappingStoreConfig {
    /// Builds a default configuration for the database file at `path`.
    #[must_use]
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: JournalMode::default(),
            sync_mode: SyncMode::default(),
            queue_capacity: default_queue_capacity(),
            max_key_bytes: default_max_key_bytes(),
            max_value_bytes: default_max_value_bytes(),
            table_prefix: default_table_prefix(),
        }
    }

    /// Builds a default configuration for a private in-memory database.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::for_path(IN_MEMORY_PATH)
    }

    /// Returns true when the config selects an in-memory database.
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY_PATH
    }

    /// Loads and validates a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, exceeds the size
    /// limit, fails to parse, or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::from_toml_str(content)
    }

    /// Parses and validates a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration limits.
    ///
    /// Store path checks happen when the file is opened, because they depend
    /// on the filesystem at that moment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a limit or the prefix is unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_key_bytes == 0 || self.max_key_bytes > MAX_KEY_BYTES_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_key_bytes out of range: {} (max {MAX_KEY_BYTES_LIMIT})",
                self.max_key_bytes
            )));
        }
        if self.max_value_bytes == 0 || self.max_value_bytes > MAX_VALUE_BYTES_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_value_bytes out of range: {} (max {MAX_VALUE_BYTES_LIMIT})",
                self.max_value_bytes
            )));
        }
        validate_table_prefix(&self.table_prefix)
    }
}

/// Validates the namespace table prefix.
fn validate_table_prefix(prefix: &str) -> Result<(), ConfigError> {
    if prefix.is_empty() || prefix.len() > MAX_TABLE_PREFIX_LENGTH {
        return Err(ConfigError::Invalid(format!(
            "table_prefix must be 1..={MAX_TABLE_PREFIX_LENGTH} characters"
        )));
    }
    if !prefix.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Err(ConfigError::Invalid(
            "table_prefix may only contain ascii letters, digits, and underscores".to_string(),
        ));
    }
    if prefix.to_ascii_lowercase().starts_with("sqlite_") {
        return Err(ConfigError::Invalid(
            "table_prefix must not use the reserved sqlite_ prefix".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use super::ConfigError;
    use super::JournalMode;
    use super::MappingStoreConfig;
    use super::SyncMode;

    #[test]
    fn toml_defaults_fill_omitted_fields() {
        let config = MappingStoreConfig::from_toml_str(r#"path = "data/store.sqlite""#).unwrap();
        assert_eq!(config, MappingStoreConfig::for_path("data/store.sqlite"));
        assert_eq!(config.table_prefix, "db_");
        assert_eq!(config.journal_mode, JournalMode::Wal);
    }

    #[test]
    fn toml_overrides_are_applied() {
        let config = MappingStoreConfig::from_toml_str(
            r#"
            path = ":memory:"
            journal_mode = "delete"
            sync_mode = "normal"
            queue_capacity = 8
            max_value_bytes = 4096
            table_prefix = "kv_"
            "#,
        )
        .unwrap();
        assert!(config.is_in_memory());
        assert_eq!(config.journal_mode, JournalMode::Delete);
        assert_eq!(config.sync_mode.pragma_value(), SyncMode::Normal.pragma_value());
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.max_value_bytes, 4096);
        assert_eq!(config.table_prefix, "kv_");
    }

    #[test]
    fn unknown_fields_are_parse_errors() {
        let err = MappingStoreConfig::from_toml_str("path = \"a.db\"\nread_pool_size = 4")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let mut config = MappingStoreConfig::in_memory();
        config.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unsafe_table_prefixes_are_rejected() {
        for prefix in ["", "db-", "db\"", "sqlite_x", "a b"] {
            let mut config = MappingStoreConfig::in_memory();
            config.table_prefix = prefix.to_string();
            assert!(config.validate().is_err(), "prefix {prefix:?} should be rejected");
        }
    }

    #[test]
    fn load_reads_toml_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("mapping.toml");
        std::fs::write(&path, "path = \"store.sqlite\"\nbusy_timeout_ms = 250\n").unwrap();
        let config = MappingStoreConfig::load(&path).unwrap();
        assert_eq!(config.busy_timeout_ms, 250);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let err = MappingStoreConfig::load(&temp.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
