// crates/sqlite-mapping/src/namespace.rs
// ============================================================================
// Module: Namespace Manager
// Description: Lazily provisioned key/value tables, one per namespace.
// Purpose: Row-level get/set/delete and table drop through the guardian.
// Dependencies: rusqlite, tracing
// ============================================================================

//! ## Overview
//! Each namespace maps to one table named `<prefix><namespace>` with exactly
//! two columns: `key TEXT PRIMARY KEY` and a BLOB-affinity `value` payload.
//! Every operation issues `CREATE TABLE IF NOT EXISTS` inside the same unit
//! of work as its row statements, so provisioning can never race.
//!
//! Namespace names are always emitted as quoted identifiers; keys and values
//! are always bound as parameters. `SQLite` matches identifiers without
//! regard to ASCII case, so uppercase letters are escaped (`A` becomes `^a`,
//! `^` becomes `^^`) and `Users` and `users` live in different tables.

// ============================================================================
// SECTION: Imports
// ============================================================================

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use tracing::debug;
use tracing::instrument;

use crate::codec;
use crate::codec::EncodedValue;
use crate::codec::Value;
use crate::config::MappingStoreConfig;
use crate::error::StoreError;
use crate::guardian::ConnectionGuardian;
use crate::guardian::GuardianStats;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum namespace name length in bytes.
pub const MAX_NAMESPACE_BYTES: usize = 128;

/// Escape marker for uppercase ASCII letters in table names.
const CASE_ESCAPE: char = '^';

// ============================================================================
// SECTION: Naming
// ============================================================================

/// Returns the quoted table identifier for `namespace`.
///
/// Distinct namespace names always yield identifiers that `SQLite` treats as
/// distinct, including names that differ only in ASCII case.
///
/// # Errors
///
/// Returns [`StoreError::InvalidNamespace`] when the name is empty, longer
/// than [`MAX_NAMESPACE_BYTES`], or contains a NUL character.
pub fn sanitize_namespace(prefix: &str, namespace: &str) -> Result<String, StoreError> {
    if namespace.is_empty() {
        return Err(StoreError::InvalidNamespace("namespace name must not be empty".to_string()));
    }
    if namespace.len() > MAX_NAMESPACE_BYTES {
        return Err(StoreError::InvalidNamespace(format!(
            "namespace name exceeds {MAX_NAMESPACE_BYTES} bytes"
        )));
    }
    if namespace.contains('\0') {
        return Err(StoreError::InvalidNamespace(
            "namespace name must not contain NUL".to_string(),
        ));
    }
    Ok(format!("\"{prefix}{}\"", escape_case(namespace).replace('"', "\"\"")))
}

/// Rewrites uppercase ASCII letters so the result contains none.
fn escape_case(namespace: &str) -> String {
    let mut escaped = String::with_capacity(namespace.len());
    for ch in namespace.chars() {
        if ch == CASE_ESCAPE {
            escaped.push(CASE_ESCAPE);
            escaped.push(CASE_ESCAPE);
        } else if ch.is_ascii_uppercase() {
            escaped.push(CASE_ESCAPE);
            escaped.push(ch.to_ascii_lowercase());
        } else {
            escaped.push(ch);
        }
    }
    escaped
}

/// Reverses [`escape_case`]; `None` when `escaped` is not one of its outputs.
fn unescape_case(escaped: &str) -> Option<String> {
    let mut namespace = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(ch) = chars.next() {
        match ch {
            CASE_ESCAPE => match chars.next()? {
                CASE_ESCAPE => namespace.push(CASE_ESCAPE),
                lower if lower.is_ascii_lowercase() => namespace.push(lower.to_ascii_uppercase()),
                _ => return None,
            },
            upper if upper.is_ascii_uppercase() => return None,
            other => namespace.push(other),
        }
    }
    Some(namespace)
}

/// Naming and size rules applied before any statement runs.
#[derive(Debug, Clone)]
pub(crate) struct NamespaceRules {
    /// Prefix prepended to every table name.
    table_prefix: String,
    /// Maximum key length in bytes.
    max_key_bytes: usize,
    /// Maximum encoded value size in bytes.
    max_value_bytes: usize,
}

impl NamespaceRules {
    /// Extracts the rules from a store config.
    pub(crate) fn from_config(config: &MappingStoreConfig) -> Self {
        Self {
            table_prefix: config.table_prefix.clone(),
            max_key_bytes: config.max_key_bytes,
            max_value_bytes: config.max_value_bytes,
        }
    }

    /// Returns the quoted table identifier for `namespace`.
    pub(crate) fn table(&self, namespace: &str) -> Result<String, StoreError> {
        sanitize_namespace(&self.table_prefix, namespace)
    }

    /// Validates a key and returns an owned copy.
    pub(crate) fn key(&self, key: &str) -> Result<String, StoreError> {
        if key.len() > self.max_key_bytes {
            return Err(StoreError::InvalidKey(format!(
                "key exceeds {} bytes",
                self.max_key_bytes
            )));
        }
        if key.contains('\0') {
            return Err(StoreError::InvalidKey("key must not contain NUL".to_string()));
        }
        Ok(key.to_string())
    }

    /// Encodes a value and enforces the size limit.
    pub(crate) fn encode(&self, value: &Value) -> Result<EncodedValue, StoreError> {
        let encoded = codec::encode(value)?;
        if encoded.len() > self.max_value_bytes {
            return Err(StoreError::TooLarge {
                max_bytes: self.max_value_bytes,
                actual_bytes: encoded.len(),
            });
        }
        Ok(encoded)
    }

    /// Maps a table name back to its namespace when this store created it.
    fn namespace_of(&self, table: &str) -> Option<String> {
        table
            .strip_prefix(self.table_prefix.as_str())
            .filter(|name| !name.is_empty())
            .and_then(unescape_case)
    }
}

// ============================================================================
// SECTION: Statements
// ============================================================================

/// Creates the namespace table when it does not exist.
pub(crate) fn ensure_table(conn: &Connection, table: &str) -> Result<(), StoreError> {
    conn.execute(
        &format!("CREATE TABLE IF NOT EXISTS {table} (key TEXT PRIMARY KEY NOT NULL, value BLOB)"),
        [],
    )?;
    Ok(())
}

/// Reads the encoded payload stored under `key`.
pub(crate) fn select_value(
    conn: &Connection,
    table: &str,
    key: &str,
) -> Result<Option<EncodedValue>, StoreError> {
    let mut stmt = conn.prepare_cached(&format!("SELECT value FROM {table} WHERE key = ?1"))?;
    stmt.query_row(params![key], |row| Ok(EncodedValue::from_value_ref(row.get_ref(0)?)))
        .optional()?
        .transpose()
}

/// Inserts or overwrites the row for `key`, keeping its original position.
pub(crate) fn upsert_value(
    conn: &Connection,
    table: &str,
    key: &str,
    value: &EncodedValue,
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT INTO {table} (key, value) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value"
    ))?;
    stmt.execute(params![key, value])?;
    Ok(())
}

/// Deletes the row for `key`; returns whether a row was removed.
pub(crate) fn delete_row(conn: &Connection, table: &str, key: &str) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare_cached(&format!("DELETE FROM {table} WHERE key = ?1"))?;
    Ok(stmt.execute(params![key])? > 0)
}

/// Returns whether a row exists for `key`.
pub(crate) fn row_exists(conn: &Connection, table: &str, key: &str) -> Result<bool, StoreError> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT EXISTS (SELECT 1 FROM {table} WHERE key = ?1)"))?;
    Ok(stmt.query_row(params![key], |row| row.get(0))?)
}

/// Returns every key in storage order.
pub(crate) fn select_keys(conn: &Connection, table: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare_cached(&format!("SELECT key FROM {table} ORDER BY rowid"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let keys = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(keys)
}

/// Returns every key with its encoded payload in storage order.
pub(crate) fn select_entries(
    conn: &Connection,
    table: &str,
) -> Result<Vec<(String, EncodedValue)>, StoreError> {
    let mut stmt = conn.prepare_cached(&format!("SELECT key, value FROM {table} ORDER BY rowid"))?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, EncodedValue::from_value_ref(row.get_ref(1)?)))
    })?;
    let mut entries = Vec::new();
    for row in rows {
        let (key, encoded) = row?;
        entries.push((key, encoded?));
    }
    Ok(entries)
}

/// Counts the rows in the table.
pub(crate) fn count_rows(conn: &Connection, table: &str) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    usize::try_from(count).map_err(|_| StoreError::Engine("negative row count".to_string()))
}

/// Drops the namespace table when it exists.
pub(crate) fn drop_table(conn: &Connection, table: &str) -> Result<(), StoreError> {
    conn.execute(&format!("DROP TABLE IF EXISTS {table}"), [])?;
    Ok(())
}

/// Lists table names in name order.
fn select_table_names(conn: &Connection) -> Result<Vec<String>, StoreError> {
    let mut stmt =
        conn.prepare_cached("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let names = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

// ============================================================================
// SECTION: Manager
// ============================================================================

/// Namespace operations, each executed as one guardian unit of work.
///
/// # Invariants
/// - Holds no mutable state besides the guardian it routes through.
/// - Names and keys are validated, and values encoded, before the unit is
///   submitted; payloads are decoded after it returns.
pub struct NamespaceManager {
    /// Exclusive connection owner.
    guardian: ConnectionGuardian,
    /// Naming and size rules.
    rules: NamespaceRules,
}

impl NamespaceManager {
    /// Opens the store described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the guardian cannot open the database.
    pub fn open(config: &MappingStoreConfig) -> Result<Self, StoreError> {
        let guardian = ConnectionGuardian::open(config)?;
        Ok(Self {
            guardian,
            rules: NamespaceRules::from_config(config),
        })
    }

    /// Returns the guardian every operation routes through.
    #[must_use]
    pub const fn guardian(&self) -> &ConnectionGuardian {
        &self.guardian
    }

    /// Returns the naming and size rules.
    pub(crate) const fn rules(&self) -> &NamespaceRules {
        &self.rules
    }

    /// Returns guardian unit counters.
    #[must_use]
    pub fn stats(&self) -> GuardianStats {
        self.guardian.stats()
    }

    /// Creates the namespace table when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidNamespace`] for unusable names and
    /// [`StoreError::Engine`] when the statement fails.
    #[instrument(level = "debug", skip_all, fields(namespace = %namespace))]
    pub fn ensure(&self, namespace: &str) -> Result<(), StoreError> {
        let table = self.rules.table(namespace)?;
        self.guardian.run(move |conn| ensure_table(conn, &table))
    }

    /// Looks up `key`; returns `Ok(None)` when it is absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptValue`] when the stored payload does not
    /// decode, plus the naming and engine errors of [`Self::ensure`].
    #[instrument(level = "debug", skip_all, fields(namespace = %namespace))]
    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let table = self.rules.table(namespace)?;
        let key = self.rules.key(key)?;
        let encoded = self.guardian.run(move |conn| {
            ensure_table(conn, &table)?;
            select_value(conn, &table, &key)
        })?;
        encoded.map(|encoded| codec::decode(&encoded)).transpose()
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidKey`] or [`StoreError::TooLarge`] before
    /// touching the database, plus the errors of [`Self::ensure`].
    #[instrument(level = "debug", skip_all, fields(namespace = %namespace))]
    pub fn set(&self, namespace: &str, key: &str, value: &Value) -> Result<(), StoreError> {
        let table = self.rules.table(namespace)?;
        let key = self.rules.key(key)?;
        let encoded = self.rules.encode(value)?;
        debug!(kind = encoded.kind().as_str(), bytes = encoded.len(), "storing value");
        self.guardian.run(move |conn| {
            ensure_table(conn, &table)?;
            upsert_value(conn, &table, &key, &encoded)
        })
    }

    /// Removes `key`; returns whether it was present. Absent keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns the naming and engine errors of [`Self::ensure`].
    #[instrument(level = "debug", skip_all, fields(namespace = %namespace))]
    pub fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let table = self.rules.table(namespace)?;
        let key = self.rules.key(key)?;
        self.guardian.run(move |conn| {
            ensure_table(conn, &table)?;
            delete_row(conn, &table, &key)
        })
    }

    /// Returns whether `key` is present.
    ///
    /// # Errors
    ///
    /// Returns the naming and engine errors of [`Self::ensure`].
    pub fn contains_key(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let table = self.rules.table(namespace)?;
        let key = self.rules.key(key)?;
        self.guardian.run(move |conn| {
            ensure_table(conn, &table)?;
            row_exists(conn, &table, &key)
        })
    }

    /// Returns every key in storage order.
    ///
    /// # Errors
    ///
    /// Returns the naming and engine errors of [`Self::ensure`].
    #[instrument(level = "debug", skip_all, fields(namespace = %namespace))]
    pub fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let table = self.rules.table(namespace)?;
        self.guardian.run(move |conn| {
            ensure_table(conn, &table)?;
            select_keys(conn, &table)
        })
    }

    /// Returns every entry in storage order, fetched in one unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptValue`] when any payload does not decode,
    /// plus the naming and engine errors of [`Self::ensure`].
    #[instrument(level = "debug", skip_all, fields(namespace = %namespace))]
    pub fn entries(&self, namespace: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let table = self.rules.table(namespace)?;
        let encoded = self.guardian.run(move |conn| {
            ensure_table(conn, &table)?;
            select_entries(conn, &table)
        })?;
        encoded.into_iter().map(|(key, encoded)| Ok((key, codec::decode(&encoded)?))).collect()
    }

    /// Returns the number of entries.
    ///
    /// # Errors
    ///
    /// Returns the naming and engine errors of [`Self::ensure`].
    pub fn len(&self, namespace: &str) -> Result<usize, StoreError> {
        let table = self.rules.table(namespace)?;
        self.guardian.run(move |conn| {
            ensure_table(conn, &table)?;
            count_rows(conn, &table)
        })
    }

    /// Drops the namespace table and every entry in it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidNamespace`] for unusable names and
    /// [`StoreError::Engine`] when the statement fails.
    #[instrument(level = "debug", skip_all, fields(namespace = %namespace))]
    pub fn drop_namespace(&self, namespace: &str) -> Result<(), StoreError> {
        let table = self.rules.table(namespace)?;
        self.guardian.run(move |conn| drop_table(conn, &table))
    }

    /// Lists namespaces that currently have a table, in name order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Engine`] when the catalog query fails.
    pub fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        let tables = self.guardian.run(select_table_names)?;
        Ok(tables.iter().filter_map(|table| self.rules.namespace_of(table)).collect())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
