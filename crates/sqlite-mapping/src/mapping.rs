// crates/sqlite-mapping/src/mapping.rs
// ============================================================================
// Module: Mapping Facade
// Description: Dictionary-style views over namespaces and their entries.
// Purpose: Give callers map semantics without writing SQL.
// Dependencies: rusqlite
// ============================================================================

//! ## Overview
//! [`MappingStore`] is the entry point: a cheaply cloneable handle that maps
//! namespace names to [`NamespaceView`]s. Views hold nothing but the name and
//! a borrow of the store, so they can be created and discarded freely.
//!
//! Each view operation is atomic on its own. Sequences of operations are
//! not; compose them with [`MappingStore::transaction`] when they must be.
//! Iteration reads the live table: keys are listed once and each value is
//! fetched when the iterator reaches it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;

use crate::codec;
use crate::codec::Value;
use crate::config::MappingStoreConfig;
use crate::error::StoreError;
use crate::guardian::GuardianStats;
use crate::namespace;
use crate::namespace::NamespaceManager;
use crate::namespace::NamespaceRules;

// ============================================================================
// SECTION: Store
// ============================================================================

/// Top-level mapping from namespace names to namespace views.
///
/// # Invariants
/// - Clones share one connection guardian.
/// - Closing any clone closes the store for all of them.
#[derive(Clone)]
pub struct MappingStore {
    /// Shared namespace manager.
    manager: Arc<NamespaceManager>,
}

impl MappingStore {
    /// Opens (or creates) the database file at `path` with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageUnavailable`] when the file cannot be
    /// opened or is not a `SQLite` database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_config(&MappingStoreConfig::for_path(path.as_ref()))
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageUnavailable`] when `SQLite` cannot
    /// allocate the database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_config(&MappingStoreConfig::in_memory())
    }

    /// Opens the store described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] for rejected configs and
    /// [`StoreError::StorageUnavailable`] when the database cannot be opened.
    pub fn with_config(config: &MappingStoreConfig) -> Result<Self, StoreError> {
        Ok(Self {
            manager: Arc::new(NamespaceManager::open(config)?),
        })
    }

    /// Returns a view of `name`. The namespace is created on first use.
    #[must_use]
    pub fn namespace(&self, name: &str) -> NamespaceView<'_> {
        NamespaceView {
            manager: &self.manager,
            name: name.to_string(),
        }
    }

    /// Drops namespace `name` and all of its entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidNamespace`] for unusable names and
    /// [`StoreError::Engine`] when the drop fails.
    pub fn drop_namespace(&self, name: &str) -> Result<(), StoreError> {
        self.manager.drop_namespace(name)
    }

    /// Lists namespaces that currently exist, in name order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Engine`] when the catalog query fails.
    pub fn namespaces(&self) -> Result<Vec<String>, StoreError> {
        self.manager.namespaces()
    }

    /// Runs `work` as one atomic unit of work.
    ///
    /// Every write made through the [`MappingTxn`] commits together when
    /// `work` returns `Ok` and is rolled back when it returns `Err`. Calling
    /// other store methods from inside `work` fails with
    /// [`StoreError::Reentrant`]; use the transaction handle instead.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `work` or by the guardian.
    pub fn transaction<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&MappingTxn<'_>) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let rules = self.manager.rules().clone();
        self.manager.guardian().run(move |conn| {
            work(&MappingTxn {
                conn,
                rules: &rules,
            })
        })
    }

    /// Returns guardian unit counters.
    #[must_use]
    pub fn stats(&self) -> GuardianStats {
        self.manager.stats()
    }

    /// Closes the store, draining queued work and releasing the file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Reentrant`] when called from inside a unit of
    /// work.
    pub fn close(&self) -> Result<(), StoreError> {
        self.manager.guardian().close()
    }

    /// Returns true once the store has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.manager.guardian().is_closed()
    }
}

// ============================================================================
// SECTION: Namespace View
// ============================================================================

/// Map-like view of a single namespace.
pub struct NamespaceView<'a> {
    /// Manager shared with the owning store.
    manager: &'a NamespaceManager,
    /// Namespace name as supplied by the caller.
    name: String,
}

impl<'a> NamespaceView<'a> {
    /// Returns the namespace name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value for `key`, or `None` when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptValue`] when the stored payload does not
    /// decode, and naming or engine errors otherwise.
    pub fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.manager.get(&self.name, key)
    }

    /// Returns the value for `key`, failing when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MissingKey`] when the key is absent, plus the
    /// errors of [`Self::get`].
    pub fn require(&self, key: &str) -> Result<Value, StoreError> {
        self.get(key)?.ok_or_else(|| {
            StoreError::MissingKey(format!("{key} not found in namespace {}", self.name))
        })
    }

    /// Returns the value for `key`, or `default` when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Self::get`].
    pub fn get_or(&self, key: &str, default: Value) -> Result<Value, StoreError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Returns whether `key` is present.
    ///
    /// # Errors
    ///
    /// Returns naming or engine errors.
    pub fn contains_key(&self, key: &str) -> Result<bool, StoreError> {
        self.manager.contains_key(&self.name, key)
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidKey`] or [`StoreError::TooLarge`] before
    /// any write, and engine errors otherwise.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), StoreError> {
        self.manager.set(&self.name, key, &value.into())
    }

    /// Removes `key`; returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns naming or engine errors; an absent key is not an error.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.manager.delete(&self.name, key)
    }

    /// Returns every key in storage order.
    ///
    /// # Errors
    ///
    /// Returns naming or engine errors.
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.manager.keys(&self.name)
    }

    /// Returns every entry in storage order, read in one unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptValue`] when any payload does not decode.
    pub fn entries(&self) -> Result<Vec<(String, Value)>, StoreError> {
        self.manager.entries(&self.name)
    }

    /// Returns the number of entries.
    ///
    /// # Errors
    ///
    /// Returns naming or engine errors.
    pub fn len(&self) -> Result<usize, StoreError> {
        self.manager.len(&self.name)
    }

    /// Returns true when the namespace holds no entries.
    ///
    /// # Errors
    ///
    /// Returns naming or engine errors.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Drops the namespace; it is recreated empty on next use.
    ///
    /// # Errors
    ///
    /// Returns naming or engine errors.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.manager.drop_namespace(&self.name)
    }

    /// Iterates entries against the live table.
    ///
    /// Keys are listed up front; each value is fetched when reached. Keys
    /// deleted in the meantime are skipped and keys added later are not seen.
    ///
    /// # Errors
    ///
    /// Returns naming or engine errors from listing the keys.
    pub fn iter(&self) -> Result<NamespaceEntries<'a>, StoreError> {
        Ok(NamespaceEntries {
            manager: self.manager,
            name: self.name.clone(),
            keys: self.keys()?.into_iter(),
        })
    }
}

/// Live iterator over a namespace's entries.
///
/// Yields an error item when a value fails to decode and keeps going.
pub struct NamespaceEntries<'a> {
    /// Manager shared with the owning store.
    manager: &'a NamespaceManager,
    /// Namespace being iterated.
    name: String,
    /// Keys that remain to be fetched.
    keys: std::vec::IntoIter<String>,
}

impl Iterator for NamespaceEntries<'_> {
    type Item = Result<(String, Value), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            match self.manager.get(&self.name, &key) {
                Ok(Some(value)) => return Some(Ok((key, value))),
                Ok(None) => {}
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.keys.len()))
    }
}

// ============================================================================
// SECTION: Transactions
// ============================================================================

/// Namespace operations inside one exclusive unit of work.
///
/// Borrowed for the duration of [`MappingStore::transaction`]; reads observe
/// the transaction's own earlier writes.
pub struct MappingTxn<'a> {
    /// Connection inside the open transaction.
    conn: &'a Connection,
    /// Naming and size rules of the owning store.
    rules: &'a NamespaceRules,
}

impl MappingTxn<'_> {
    /// Returns the value for `key` in `namespace`, or `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns naming, decoding, or engine errors.
    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let table = self.rules.table(namespace)?;
        let key = self.rules.key(key)?;
        namespace::ensure_table(self.conn, &table)?;
        namespace::select_value(self.conn, &table, &key)?
            .map(|encoded| codec::decode(&encoded))
            .transpose()
    }

    /// Stores `value` under `key` in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns naming, size, or engine errors.
    pub fn set(&self, namespace: &str, key: &str, value: impl Into<Value>) -> Result<(), StoreError> {
        let table = self.rules.table(namespace)?;
        let key = self.rules.key(key)?;
        let encoded = self.rules.encode(&value.into())?;
        namespace::ensure_table(self.conn, &table)?;
        namespace::upsert_value(self.conn, &table, &key, &encoded)
    }

    /// Removes `key` from `namespace`; returns whether it was present.
    ///
    /// # Errors
    ///
    /// Returns naming or engine errors.
    pub fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let table = self.rules.table(namespace)?;
        let key = self.rules.key(key)?;
        namespace::ensure_table(self.conn, &table)?;
        namespace::delete_row(self.conn, &table, &key)
    }

    /// Returns whether `key` is present in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns naming or engine errors.
    pub fn contains_key(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let table = self.rules.table(namespace)?;
        let key = self.rules.key(key)?;
        namespace::ensure_table(self.conn, &table)?;
        namespace::row_exists(self.conn, &table, &key)
    }

    /// Returns every key of `namespace` in storage order.
    ///
    /// # Errors
    ///
    /// Returns naming or engine errors.
    pub fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let table = self.rules.table(namespace)?;
        namespace::ensure_table(self.conn, &table)?;
        namespace::select_keys(self.conn, &table)
    }

    /// Drops `namespace` and its entries.
    ///
    /// # Errors
    ///
    /// Returns naming or engine errors.
    pub fn drop_namespace(&self, namespace: &str) -> Result<(), StoreError> {
        let table = self.rules.table(namespace)?;
        namespace::drop_table(self.conn, &table)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use super::MappingStore;
    use super::StoreError;
    use super::Value;

    #[test]
    fn views_are_stateless_and_share_storage() {
        let store = MappingStore::open_in_memory().unwrap();
        store.namespace("ns").set("k", "v").unwrap();
        assert_eq!(store.namespace("ns").get("k").unwrap(), Some(Value::from("v")));
        let clone = store.clone();
        assert_eq!(clone.namespace("ns").name(), "ns");
        assert_eq!(clone.namespace("ns").len().unwrap(), 1);
    }

    #[test]
    fn require_signals_missing_key() {
        let store = MappingStore::open_in_memory().unwrap();
        let view = store.namespace("ns");
        assert!(matches!(view.require("absent"), Err(StoreError::MissingKey(_))));
        assert_eq!(view.get_or("absent", Value::from(5)).unwrap(), Value::from(5));
        assert!(view.is_empty().unwrap());
    }

    #[test]
    fn iterator_skips_keys_deleted_mid_iteration() {
        let store = MappingStore::open_in_memory().unwrap();
        let view = store.namespace("ns");
        for (index, key) in ["a", "b", "c"].into_iter().enumerate() {
            view.set(key, i64::try_from(index).unwrap()).unwrap();
        }
        let mut entries = view.iter().unwrap();
        assert_eq!(entries.next().unwrap().unwrap(), ("a".to_string(), Value::from(0)));
        view.delete("b").unwrap();
        view.set("c", "changed").unwrap();
        view.set("d", 9).unwrap();
        let rest: Vec<_> = entries.map(Result::unwrap).collect();
        assert_eq!(rest, vec![("c".to_string(), Value::from("changed"))]);
    }

    #[test]
    fn failed_transaction_discards_all_writes() {
        let store = MappingStore::open_in_memory().unwrap();
        store.namespace("ns").set("kept", 1).unwrap();
        let result: Result<(), StoreError> = store.transaction(|txn| {
            txn.set("ns", "kept", 2)?;
            txn.set("other", "new", true)?;
            Err(StoreError::Engine("abort".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.namespace("ns").get("kept").unwrap(), Some(Value::from(1)));
        assert_eq!(store.namespaces().unwrap(), vec!["ns".to_string()]);
    }

    #[test]
    fn transaction_reads_its_own_writes() {
        let store = MappingStore::open_in_memory().unwrap();
        let moved = store
            .transaction(|txn| {
                txn.set("from", "item", "payload")?;
                let value = txn.get("from", "item")?;
                txn.delete("from", "item")?;
                if let Some(value) = value {
                    txn.set("to", "item", value)?;
                }
                Ok(txn.contains_key("to", "item")? && txn.keys("from")?.is_empty())
            })
            .unwrap();
        assert!(moved);
        assert_eq!(store.namespace("to").require("item").unwrap(), Value::from("payload"));
    }
}
