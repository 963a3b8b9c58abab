// crates/sqlite-mapping/src/codec.rs
// ============================================================================
// Module: Value Codec
// Description: Tagged two-tier encoding for values stored in one column.
// Purpose: Round-trip heterogeneous values through a single payload column.
// Dependencies: bincode, indexmap, rusqlite, serde, serde_json
// ============================================================================

//! ## Overview
//! Every stored value is either PORTABLE (compact JSON text) or OPAQUE
//! (`bincode` bytes of the whole [`Value`]). [`encode`] picks the portable
//! form whenever the value fits the JSON model exactly and falls back to the
//! opaque form otherwise. [`decode`] dispatches on the tag alone.
//!
//! The tag is persisted as the `SQLite` storage class of the payload: TEXT
//! rows are portable, BLOB rows are opaque. The payload column has BLOB
//! affinity, so `SQLite` never converts one class into the other.
//!
//! Opaque payloads are tied to this crate's [`Value`] layout. They are not
//! meant to be read by other implementations.
//!
//! Both encodings share one nesting bound, [`MAX_VALUE_DEPTH`]. Deeper values
//! are refused on encode, and payloads that would decode deeper are reported
//! as corrupt instead of exhausting the stack.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use bincode::Options;
use indexmap::IndexMap;
use rusqlite::ToSql;
use rusqlite::types::ToSqlOutput;
use rusqlite::types::ValueRef;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::de::DeserializeSeed;
use serde::de::EnumAccess;
use serde::de::Error as DeError;
use serde::de::MapAccess;
use serde::de::SeqAccess;
use serde::de::Unexpected;
use serde::de::VariantAccess;
use serde::de::Visitor;
use serde_json::Number;

use crate::error::StoreError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum number of nested lists, maps, and tuples in one value.
pub const MAX_VALUE_DEPTH: usize = 64;

/// Upper bound on capacity reserved from a length prefix before reading.
const PREALLOCATION_LIMIT: usize = 1024;

/// Variant names in declaration order; opaque payloads address them by index.
const VARIANTS: &[&str] =
    &["Null", "Bool", "Integer", "Float", "Text", "List", "Map", "Bytes", "Tuple"];

// ============================================================================
// SECTION: Value Model
// ============================================================================

/// A dynamically typed value stored under a key.
///
/// # Invariants
/// - `Map` keeps insertion order; portable round-trips preserve it.
/// - `Bytes`, `Tuple`, and non-finite floats are outside the portable model.
/// - Stored values nest at most [`MAX_VALUE_DEPTH`] containers deep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Integer(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Ordered sequence.
    List(Vec<Value>),
    /// String-keyed mapping in insertion order.
    Map(IndexMap<String, Value>),
    /// Raw bytes (opaque only).
    Bytes(Vec<u8>),
    /// Fixed-size heterogeneous sequence, distinct from `List` (opaque only).
    Tuple(Vec<Value>),
}

impl Value {
    /// Returns true when the value round-trips through the portable encoding.
    #[must_use]
    pub fn is_portable(&self) -> bool {
        match self {
            Self::Null | Self::Bool(_) | Self::Integer(_) | Self::Text(_) => true,
            Self::Float(value) => value.is_finite(),
            Self::List(items) => items.iter().all(Self::is_portable),
            Self::Map(entries) => entries.values().all(Self::is_portable),
            Self::Bytes(_) | Self::Tuple(_) => false,
        }
    }

    /// Returns true when at most `limit` containers are nested in the value.
    ///
    /// Recursion stops at the bound, so arbitrarily deep values are safe.
    #[must_use]
    pub fn fits_depth(&self, limit: usize) -> bool {
        match self {
            Self::List(items) | Self::Tuple(items) => {
                limit > 0 && items.iter().all(|item| item.fits_depth(limit - 1))
            }
            Self::Map(entries) => {
                limit > 0 && entries.values().all(|value| value.fits_depth(limit - 1))
            }
            Self::Null
            | Self::Bool(_)
            | Self::Integer(_)
            | Self::Float(_)
            | Self::Text(_)
            | Self::Bytes(_) => true,
        }
    }

    /// Returns the encoding kind [`encode`] selects for this value.
    #[must_use]
    pub fn encoding_kind(&self) -> EncodingKind {
        if self.is_portable() { EncodingKind::Portable } else { EncodingKind::Opaque }
    }

    /// Returns the text when the value is `Text`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the integer when the value is `Integer`.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the boolean when the value is `Bool`.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Converts a portable value into JSON, or `None` when it is not portable.
    fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(value) => serde_json::Value::Bool(*value),
            Self::Integer(value) => serde_json::Value::Number(Number::from(*value)),
            Self::Float(value) => serde_json::Value::Number(Number::from_f64(*value)?),
            Self::Text(text) => serde_json::Value::String(text.clone()),
            Self::List(items) => serde_json::Value::Array(
                items.iter().map(Self::to_json).collect::<Option<Vec<_>>>()?,
            ),
            Self::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| Some((key.clone(), value.to_json()?)))
                    .collect::<Option<serde_json::Map<_, _>>>()?,
            ),
            Self::Bytes(_) | Self::Tuple(_) => return None,
        })
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = StoreError;

    fn try_from(json: serde_json::Value) -> Result<Self, Self::Error> {
        Ok(match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(value) => Self::Bool(value),
            serde_json::Value::Number(number) => {
                if let Some(value) = number.as_i64() {
                    Self::Integer(value)
                } else if number.is_u64() {
                    return Err(StoreError::CorruptValue(
                        "portable integer exceeds the signed 64-bit range".to_string(),
                    ));
                } else {
                    let value = number.as_f64().ok_or_else(|| {
                        StoreError::CorruptValue("portable number is not a float".to_string())
                    })?;
                    Self::Float(value)
                }
            }
            serde_json::Value::String(text) => Self::Text(text),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::try_from).collect::<Result<_, _>>()?)
            }
            serde_json::Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| Ok((key, Self::try_from(value)?)))
                    .collect::<Result<_, StoreError>>()?,
            ),
        })
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(entries: IndexMap<String, Value>) -> Self {
        Self::Map(entries)
    }
}

// ============================================================================
// SECTION: Bounded Deserialization
// ============================================================================

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        ValueSeed {
            remaining: MAX_VALUE_DEPTH,
        }
        .deserialize(deserializer)
    }
}

/// Reads one [`Value`] while tracking how many more containers may nest.
#[derive(Debug, Clone, Copy)]
struct ValueSeed {
    /// Containers still allowed below this point.
    remaining: usize,
}

impl ValueSeed {
    /// Returns the seed for a container's children, failing at the bound.
    fn descend<E: DeError>(self) -> Result<Self, E> {
        self.remaining
            .checked_sub(1)
            .map(|remaining| Self {
                remaining,
            })
            .ok_or_else(|| E::custom(format!("value nesting exceeds {MAX_VALUE_DEPTH} levels")))
    }
}

impl<'de> DeserializeSeed<'de> for ValueSeed {
    type Value = Value;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_enum("Value", VARIANTS, self)
    }
}

impl<'de> Visitor<'de> for ValueSeed {
    type Value = Value;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a stored value")
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<Value, A::Error> {
        let (index, variant) = data.variant::<u32>()?;
        match index {
            0 => VariantAccess::unit_variant(variant).map(|()| Value::Null),
            1 => VariantAccess::newtype_variant(variant).map(Value::Bool),
            2 => VariantAccess::newtype_variant(variant).map(Value::Integer),
            3 => VariantAccess::newtype_variant(variant).map(Value::Float),
            4 => VariantAccess::newtype_variant(variant).map(Value::Text),
            5 => {
                let children = self.descend::<A::Error>()?;
                VariantAccess::newtype_variant_seed(variant, ItemsSeed(children)).map(Value::List)
            }
            6 => {
                let children = self.descend::<A::Error>()?;
                VariantAccess::newtype_variant_seed(variant, EntriesSeed(children)).map(Value::Map)
            }
            7 => VariantAccess::newtype_variant(variant).map(Value::Bytes),
            8 => {
                let children = self.descend::<A::Error>()?;
                VariantAccess::newtype_variant_seed(variant, ItemsSeed(children)).map(Value::Tuple)
            }
            _ => Err(DeError::invalid_value(Unexpected::Unsigned(u64::from(index)), &self)),
        }
    }
}

/// Reads the elements of a list or tuple.
struct ItemsSeed(ValueSeed);

impl<'de> DeserializeSeed<'de> for ItemsSeed {
    type Value = Vec<Value>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Vec<Value>, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for ItemsSeed {
    type Value = Vec<Value>;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a sequence of stored values")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<Value>, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(PREALLOCATION_LIMIT));
        while let Some(item) = seq.next_element_seed(self.0)? {
            items.push(item);
        }
        Ok(items)
    }
}

/// Reads the entries of a map in stored order.
struct EntriesSeed(ValueSeed);

impl<'de> DeserializeSeed<'de> for EntriesSeed {
    type Value = IndexMap<String, Value>;

    fn deserialize<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> Result<IndexMap<String, Value>, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for EntriesSeed {
    type Value = IndexMap<String, Value>;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a map of stored values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<IndexMap<String, Value>, A::Error> {
        let mut entries =
            IndexMap::with_capacity(map.size_hint().unwrap_or(0).min(PREALLOCATION_LIMIT));
        while let Some(key) = map.next_key::<String>()? {
            let value = map.next_value_seed(self.0)?;
            entries.insert(key, value);
        }
        Ok(entries)
    }
}

/// Bincode settings for opaque payloads: fixed-width integers, no trailing bytes.
fn opaque_options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding().reject_trailing_bytes()
}

// ============================================================================
// SECTION: Encoded Values
// ============================================================================

/// Encoding tag persisted with every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingKind {
    /// Compact JSON text.
    Portable,
    /// `bincode` bytes of a [`Value`].
    Opaque,
}

impl EncodingKind {
    /// Returns a stable label for the encoding kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Portable => "portable",
            Self::Opaque => "opaque",
        }
    }
}

/// A tagged payload ready to be written to, or just read from, a row.
///
/// # Invariants
/// - `Portable` payloads are UTF-8 when produced by [`encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedValue {
    /// Encoding tag.
    kind: EncodingKind,
    /// Encoded bytes.
    payload: Vec<u8>,
}

impl EncodedValue {
    /// Wraps raw payload bytes under an encoding tag.
    #[must_use]
    pub const fn new(kind: EncodingKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
        }
    }

    /// Returns the encoding tag.
    #[must_use]
    pub const fn kind(&self) -> EncodingKind {
        self.kind
    }

    /// Returns the encoded bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the encoded size in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns true when the payload is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Reads a payload cell, deriving the tag from its storage class.
    pub(crate) fn from_value_ref(cell: ValueRef<'_>) -> Result<Self, StoreError> {
        match cell {
            ValueRef::Text(text) => Ok(Self::new(EncodingKind::Portable, text.to_vec())),
            ValueRef::Blob(bytes) => Ok(Self::new(EncodingKind::Opaque, bytes.to_vec())),
            ValueRef::Null | ValueRef::Integer(_) | ValueRef::Real(_) => Err(
                StoreError::CorruptValue("payload has no text or blob storage class".to_string()),
            ),
        }
    }
}

impl ToSql for EncodedValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self.kind {
            EncodingKind::Portable => ValueRef::Text(&self.payload),
            EncodingKind::Opaque => ValueRef::Blob(&self.payload),
        }))
    }
}

// ============================================================================
// SECTION: Codec
// ============================================================================

/// Encodes a value, preferring the portable form.
///
/// # Errors
///
/// Returns [`StoreError::Unencodable`] when the value nests deeper than
/// [`MAX_VALUE_DEPTH`] or the opaque encoder fails.
pub fn encode(value: &Value) -> Result<EncodedValue, StoreError> {
    if !value.fits_depth(MAX_VALUE_DEPTH) {
        return Err(StoreError::Unencodable(format!(
            "value nesting exceeds {MAX_VALUE_DEPTH} levels"
        )));
    }
    if let Some(json) = value.to_json() {
        return Ok(EncodedValue::new(EncodingKind::Portable, json.to_string().into_bytes()));
    }
    let bytes =
        opaque_options().serialize(value).map_err(|err| StoreError::Unencodable(err.to_string()))?;
    Ok(EncodedValue::new(EncodingKind::Opaque, bytes))
}

/// Decodes a payload with the decoder its tag names.
///
/// # Errors
///
/// Returns [`StoreError::CorruptValue`] when the payload does not decode
/// under its tag, carries trailing bytes, or nests deeper than
/// [`MAX_VALUE_DEPTH`].
pub fn decode(encoded: &EncodedValue) -> Result<Value, StoreError> {
    match encoded.kind {
        EncodingKind::Portable => {
            let json: serde_json::Value = serde_json::from_slice(&encoded.payload)
                .map_err(|err| StoreError::CorruptValue(format!("portable payload: {err}")))?;
            let value = Value::try_from(json)?;
            if !value.fits_depth(MAX_VALUE_DEPTH) {
                return Err(StoreError::CorruptValue(format!(
                    "portable payload nests deeper than {MAX_VALUE_DEPTH} levels"
                )));
            }
            Ok(value)
        }
        EncodingKind::Opaque => {
            let limit = u64::try_from(encoded.payload.len()).unwrap_or(u64::MAX);
            opaque_options()
                .with_limit(limit)
                .deserialize(&encoded.payload)
                .map_err(|err| StoreError::CorruptValue(format!("opaque payload: {err}")))
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
