// crates/sqlite-mapping/src/lib.rs
// ============================================================================
// Module: SQLite Mapping
// Description: Thread-safe dictionary-style namespaces backed by SQLite.
// Purpose: Persist typed key/value entries without callers writing SQL.
// Dependencies: bincode, indexmap, rusqlite, serde, serde_json, toml, tracing
// ============================================================================

//! ## Overview
//! This crate turns one `SQLite` database file into a set of persistent,
//! schema-less maps. A [`MappingStore`] hands out [`NamespaceView`]s; each
//! namespace is a two-column table created on first use, and each value is
//! stored under a tag that selects its decoder on read.
//!
//! All access is funneled through a [`ConnectionGuardian`], which owns the
//! only connection on a dedicated thread and runs units of work one at a
//! time inside their own transactions.
//!
//! ```no_run
//! use sqlite_mapping::MappingStore;
//! use sqlite_mapping::Value;
//!
//! # fn main() -> Result<(), sqlite_mapping::StoreError> {
//! let store = MappingStore::open("data/app.sqlite")?;
//! let settings = store.namespace("settings");
//! settings.set("theme", "dark")?;
//! assert_eq!(settings.get("theme")?, Some(Value::from("dark")));
//! store.close()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod codec;
pub mod config;
pub mod error;
pub mod guardian;
pub mod mapping;
pub mod namespace;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use codec::EncodedValue;
pub use codec::EncodingKind;
pub use codec::MAX_VALUE_DEPTH;
pub use codec::Value;
pub use codec::decode;
pub use codec::encode;
pub use config::ConfigError;
pub use config::JournalMode;
pub use config::MappingStoreConfig;
pub use config::SyncMode;
pub use error::StoreError;
pub use guardian::ConnectionGuardian;
pub use guardian::GuardianStats;
pub use mapping::MappingStore;
pub use mapping::MappingTxn;
pub use mapping::NamespaceEntries;
pub use mapping::NamespaceView;
pub use namespace::NamespaceManager;
pub use namespace::sanitize_namespace;
