// crates/sqlite-mapping/tests/mapping_store.rs
// ============================================================================
// Module: Mapping Store Tests
// Description: End-to-end behavior of the SQLite-backed mapping store.
// Purpose: Validate map semantics, durability, layout, and concurrency.
// Dependencies: sqlite-mapping, rusqlite, tempfile
// ============================================================================

//! ## Overview
//! Exercises the public façade against real database files:
//! - Set/get/delete/drop round trips and upsert semantics
//! - Persisted table layout and encoding tags
//! - Corrupt payload isolation and unusable database files
//! - Concurrent writers sharing one store

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::thread;

use indexmap::IndexMap;
use rusqlite::Connection;
use sqlite_mapping::MAX_VALUE_DEPTH;
use sqlite_mapping::MappingStore;
use sqlite_mapping::MappingStoreConfig;
use sqlite_mapping::StoreError;
use sqlite_mapping::Value;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn store_in(temp: &TempDir) -> MappingStore {
    MappingStore::open(temp.path().join("store.sqlite")).expect("store open")
}

fn raw_connection(path: &Path) -> Connection {
    Connection::open(path).expect("raw sqlite open")
}

fn nested_list(depth: usize) -> Value {
    let mut value = Value::from("leaf");
    for _ in 0 .. depth {
        value = Value::List(vec![value]);
    }
    value
}

// ============================================================================
// SECTION: Map Semantics
// ============================================================================

#[test]
fn end_to_end_scenario() {
    let temp = TempDir::new().unwrap();
    let store = store_in(&temp);
    let test = store.namespace("test");

    test.set("foo", "bar").unwrap();
    assert_eq!(test.get("foo").unwrap(), Some(Value::from("bar")));

    let list = Value::List(vec![Value::from("1"), Value::from(2), Value::from(true)]);
    test.set("list", list.clone()).unwrap();
    assert_eq!(test.get("list").unwrap(), Some(list));

    test.delete("list").unwrap();
    assert_eq!(test.get("list").unwrap(), None);

    store.drop_namespace("test").unwrap();
    assert_eq!(store.namespace("test").get("foo").unwrap(), None);
}

#[test]
fn set_twice_leaves_one_entry_with_latest_value() {
    let temp = TempDir::new().unwrap();
    let store = store_in(&temp);
    let view = store.namespace("ns");
    view.set("k", 1).unwrap();
    view.set("k", "two").unwrap();
    assert_eq!(view.len().unwrap(), 1);
    assert_eq!(view.entries().unwrap(), vec![("k".to_string(), Value::from("two"))]);
}

#[test]
fn drop_removes_entries_and_set_recreates_namespace() {
    let temp = TempDir::new().unwrap();
    let store = store_in(&temp);
    let view = store.namespace("ns");
    view.set("a", 1).unwrap();
    view.set("b", 2).unwrap();
    view.clear().unwrap();
    assert!(store.namespaces().unwrap().is_empty());
    view.set("c", 3).unwrap();
    assert_eq!(view.keys().unwrap(), vec!["c".to_string()]);
}

#[test]
fn namespaces_are_isolated() {
    let temp = TempDir::new().unwrap();
    let store = store_in(&temp);
    store.namespace("left").set("k", "l").unwrap();
    store.namespace("right").set("k", "r").unwrap();
    store.drop_namespace("left").unwrap();
    assert_eq!(store.namespace("right").get("k").unwrap(), Some(Value::from("r")));
    assert_eq!(store.namespaces().unwrap(), vec!["right".to_string()]);
}

#[test]
fn invalid_names_fail_without_side_effects() {
    let temp = TempDir::new().unwrap();
    let store = store_in(&temp);
    assert!(matches!(store.namespace("").set("k", 1), Err(StoreError::InvalidNamespace(_))));
    assert!(matches!(store.namespace("ns").set("a\0b", 1), Err(StoreError::InvalidKey(_))));
    assert!(store.namespaces().unwrap().is_empty());
}

#[test]
fn namespace_names_are_case_sensitive() {
    let temp = TempDir::new().unwrap();
    let store = store_in(&temp);
    store.namespace("Users").set("k", "upper").unwrap();
    store.namespace("users").set("k", "lower").unwrap();
    assert_eq!(store.namespace("Users").get("k").unwrap(), Some(Value::from("upper")));
    assert_eq!(store.namespace("users").get("k").unwrap(), Some(Value::from("lower")));
    assert_eq!(store.namespaces().unwrap(), vec!["Users".to_string(), "users".to_string()]);

    store.drop_namespace("users").unwrap();
    assert_eq!(store.namespace("Users").get("k").unwrap(), Some(Value::from("upper")));
    assert_eq!(store.namespaces().unwrap(), vec!["Users".to_string()]);
}

#[test]
fn nesting_limit_holds_for_stored_values() {
    let temp = TempDir::new().unwrap();
    let store = store_in(&temp);
    let view = store.namespace("deep");
    let deepest = nested_list(MAX_VALUE_DEPTH);
    view.set("deepest", deepest.clone()).unwrap();
    assert_eq!(view.get("deepest").unwrap(), Some(deepest));

    let too_deep = nested_list(200);
    assert!(matches!(view.set("too_deep", too_deep), Err(StoreError::Unencodable(_))));
    assert!(!view.contains_key("too_deep").unwrap());
}

#[test]
fn oversized_values_are_rejected_before_writing() {
    let temp = TempDir::new().unwrap();
    let mut config = MappingStoreConfig::for_path(temp.path().join("store.sqlite"));
    config.max_value_bytes = 16;
    let store = MappingStore::with_config(&config).unwrap();
    let view = store.namespace("ns");
    let err = view.set("big", "x".repeat(64)).unwrap_err();
    assert!(matches!(err, StoreError::TooLarge { max_bytes: 16, .. }));
    assert!(!view.contains_key("big").unwrap());
}

// ============================================================================
// SECTION: Durability and Layout
// ============================================================================

#[test]
fn values_survive_close_and_reopen() {
    let temp = TempDir::new().unwrap();
    let mut nested = IndexMap::new();
    nested.insert("z".to_string(), Value::Float(1.5));
    nested.insert("a".to_string(), Value::List(vec![Value::Null, Value::Bool(false)]));
    let values = vec![
        ("map", Value::Map(nested)),
        ("bytes", Value::Bytes(vec![0, 1, 2, 255])),
        ("tuple", Value::Tuple(vec![Value::from(1), Value::from("x")])),
    ];
    {
        let store = store_in(&temp);
        for (key, value) in &values {
            store.namespace("durable").set(key, value.clone()).unwrap();
        }
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.namespace("durable").get("map"), Err(StoreError::Closed(_))));
    }
    let store = store_in(&temp);
    for (key, value) in values {
        assert_eq!(store.namespace("durable").require(key).unwrap(), value);
    }
}

#[test]
fn tables_have_two_columns_and_tag_by_storage_class() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("store.sqlite");
    let store = MappingStore::open(&path).unwrap();
    let view = store.namespace("layout");
    view.set("portable", "text").unwrap();
    view.set("opaque", Value::Bytes(vec![1, 2, 3])).unwrap();
    store.close().unwrap();

    let conn = raw_connection(&path);
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('db_layout')").unwrap();
    let columns: Vec<String> =
        stmt.query_map([], |row| row.get(0)).unwrap().map(Result::unwrap).collect();
    assert_eq!(columns, vec!["key".to_string(), "value".to_string()]);

    let mut stmt = conn.prepare("SELECT key, typeof(value) FROM db_layout ORDER BY rowid").unwrap();
    let classes: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(
        classes,
        vec![
            ("portable".to_string(), "text".to_string()),
            ("opaque".to_string(), "blob".to_string()),
        ]
    );
}

#[test]
fn corrupt_rows_fail_only_their_own_lookup() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("store.sqlite");
    {
        let store = MappingStore::open(&path).unwrap();
        let view = store.namespace("ns");
        view.set("good", 1).unwrap();
        view.set("bad_blob", Value::Bytes(vec![1])).unwrap();
        view.set("bad_text", "fine").unwrap();
        view.set("bad_null", "fine").unwrap();
        store.close().unwrap();
    }
    let conn = raw_connection(&path);
    conn.execute_batch(
        "UPDATE db_ns SET value = X'FFFFFFFFFFFFFFFF' WHERE key = 'bad_blob';
         UPDATE db_ns SET value = '{not json' WHERE key = 'bad_text';
         UPDATE db_ns SET value = NULL WHERE key = 'bad_null';",
    )
    .unwrap();
    drop(conn);

    let store = MappingStore::open(&path).unwrap();
    let view = store.namespace("ns");
    for key in ["bad_blob", "bad_text", "bad_null"] {
        assert!(matches!(view.get(key), Err(StoreError::CorruptValue(_))), "{key}");
    }
    assert_eq!(view.get("good").unwrap(), Some(Value::from(1)));
    let items: Vec<_> = view.iter().unwrap().collect();
    assert_eq!(items.len(), 4);
    assert_eq!(items.iter().filter(|item| item.is_err()).count(), 3);
    assert!(matches!(view.entries(), Err(StoreError::CorruptValue(_))));
}

#[test]
fn hostile_opaque_rows_are_corrupt_and_store_keeps_serving() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("store.sqlite");
    {
        let store = MappingStore::open(&path).unwrap();
        let view = store.namespace("ns");
        view.set("deep", Value::Bytes(vec![1])).unwrap();
        view.set("trailing", Value::Bytes(vec![1, 2])).unwrap();
        view.set("good", Value::Bytes(vec![3])).unwrap();
        store.close().unwrap();
    }
    let mut deep = Vec::new();
    for _ in 0 .. 200_000 {
        deep.extend_from_slice(&5_u32.to_le_bytes());
        deep.extend_from_slice(&1_u64.to_le_bytes());
    }
    let conn = raw_connection(&path);
    conn.execute("UPDATE db_ns SET value = ?1 WHERE key = 'deep'", [deep]).unwrap();
    let mut trailing: Vec<u8> =
        conn.query_row("SELECT value FROM db_ns WHERE key = 'trailing'", [], |row| row.get(0)).unwrap();
    trailing.extend_from_slice(b"garbage");
    conn.execute("UPDATE db_ns SET value = ?1 WHERE key = 'trailing'", [trailing]).unwrap();
    drop(conn);

    let store = MappingStore::open(&path).unwrap();
    let view = store.namespace("ns");
    assert!(matches!(view.get("deep"), Err(StoreError::CorruptValue(_))));
    assert!(matches!(view.get("trailing"), Err(StoreError::CorruptValue(_))));
    assert_eq!(view.get("good").unwrap(), Some(Value::Bytes(vec![3])));
}

#[test]
fn non_database_file_is_storage_unavailable() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("garbage.sqlite");
    std::fs::write(&path, vec![b'x'; 4096]).unwrap();
    assert!(matches!(MappingStore::open(&path), Err(StoreError::StorageUnavailable(_))));
}

#[test]
fn missing_parent_directories_are_created() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nested").join("deeper").join("store.sqlite");
    let store = MappingStore::open(&path).unwrap();
    store.namespace("ns").set("k", true).unwrap();
    assert!(path.exists());
}

#[test]
fn closed_store_can_be_reopened_on_same_path() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("store.sqlite");
    let first = MappingStore::open(&path).unwrap();
    first.namespace("ns").set("k", 1).unwrap();
    first.close().unwrap();
    let second = MappingStore::open(&path).unwrap();
    second.namespace("ns").set("k", 2).unwrap();
    assert_eq!(second.namespace("ns").get("k").unwrap(), Some(Value::from(2)));
}

// ============================================================================
// SECTION: Concurrency
// ============================================================================

#[test]
fn concurrent_writers_lose_no_rows() {
    const THREADS: usize = 8;
    const WRITES: usize = 50;
    let temp = TempDir::new().unwrap();
    let store = store_in(&temp);

    let mut handles = Vec::new();
    for thread_index in 0 .. THREADS {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            let view = store.namespace("shared");
            for write in 0 .. WRITES {
                let key = format!("t{thread_index}-w{write}");
                view.set(&key, Value::List(vec![Value::from(key.as_str()), Value::from(true)]))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let view = store.namespace("shared");
    assert_eq!(view.len().unwrap(), THREADS * WRITES);
    for (key, value) in view.entries().unwrap() {
        assert_eq!(value, Value::List(vec![Value::from(key.as_str()), Value::from(true)]));
    }
    let stats = store.stats();
    assert_eq!(stats.units_rolled_back, 0);
    assert!(stats.units_committed >= u64::try_from(THREADS * WRITES).unwrap());
}

#[test]
fn concurrent_transactions_compose_atomically() {
    let store = MappingStore::open_in_memory().unwrap();
    store.namespace("bank").set("balance", 0).unwrap();
    let mut handles = Vec::new();
    for _ in 0 .. 4 {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            for _ in 0 .. 25 {
                store
                    .transaction(|txn| {
                        let current =
                            txn.get("bank", "balance")?.and_then(|value| value.as_i64()).unwrap_or(0);
                        txn.set("bank", "balance", current + 1)
                    })
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(store.namespace("bank").require("balance").unwrap(), Value::from(100_i64));
}
