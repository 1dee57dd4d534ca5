//! # Domain Values for ShaleDB
//!
//! This module defines [`Value`], the structured datum stored under every key,
//! and the admission validators for keys and values.
//!
//! ## Design Philosophy: One Owned Tree
//!
//! A value is an owned tree, not a graph. That single decision carries most of
//! the store's safety story:
//!
//! - **No cycles**: a tree cannot reference itself, so encoding always
//!   terminates (the codec still enforces a depth bound as a backstop).
//! - **No callables, no symbols**: only data variants exist, so the
//!   "serializable value" rule holds by construction.
//! - **Cheap reasoning**: `Clone` is a deep copy, `PartialEq` is structural
//!   equality with IEEE semantics for numbers (`NaN != NaN`, which is exactly
//!   the strict-equality behavior `pull` wants).
//!
//! ## Rich Scalar Types
//!
//! Beyond the plain JSON shapes, values preserve: temporal instants, regexes
//! with flags, byte buffers, data views, typed numeric arrays, big integers,
//! ordered sets, ordered maps with non-string keys, and error descriptors.
//! The codec in [`crate::codec`] round-trips every one of them through a
//! self-describing text form.
//!
//! ## Invariants
//!
//! - Keys: non-empty, NFC-normalized, ≤ 256 code points, no forbidden
//!   characters (see [`validate_key`]).
//! - Stored values: never `Undefined` at the top level (see
//!   [`validate_value`]); `Undefined` still exists as a variant because it is
//!   a legitimate *encoded* value inside containers and a legitimate read
//!   result for absent keys.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Maximum key length in Unicode code points.
pub const MAX_KEY_LENGTH: usize = 256;

// =============================================================================
// Typed Array Element Kinds
// =============================================================================

/// Element kind of a [`Value::TypedArray`].
///
/// The names mirror the wire-form `arrayType` discriminants, so conversion in
/// either direction is a straight table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypedArrayKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
}

impl TypedArrayKind {
    /// Returns the wire-form name (e.g. `"Float64Array"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            TypedArrayKind::Int8 => "Int8Array",
            TypedArrayKind::Uint8 => "Uint8Array",
            TypedArrayKind::Uint8Clamped => "Uint8ClampedArray",
            TypedArrayKind::Int16 => "Int16Array",
            TypedArrayKind::Uint16 => "Uint16Array",
            TypedArrayKind::Int32 => "Int32Array",
            TypedArrayKind::Uint32 => "Uint32Array",
            TypedArrayKind::Float32 => "Float32Array",
            TypedArrayKind::Float64 => "Float64Array",
            TypedArrayKind::BigInt64 => "BigInt64Array",
            TypedArrayKind::BigUint64 => "BigUint64Array",
        }
    }

    /// Parses a wire-form name back into a kind.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Int8Array" => Some(TypedArrayKind::Int8),
            "Uint8Array" => Some(TypedArrayKind::Uint8),
            "Uint8ClampedArray" => Some(TypedArrayKind::Uint8Clamped),
            "Int16Array" => Some(TypedArrayKind::Int16),
            "Uint16Array" => Some(TypedArrayKind::Uint16),
            "Int32Array" => Some(TypedArrayKind::Int32),
            "Uint32Array" => Some(TypedArrayKind::Uint32),
            "Float32Array" => Some(TypedArrayKind::Float32),
            "Float64Array" => Some(TypedArrayKind::Float64),
            "BigInt64Array" => Some(TypedArrayKind::BigInt64),
            "BigUint64Array" => Some(TypedArrayKind::BigUint64),
        _ => None,
        }
    }

    /// True for the two kinds whose elements are 64-bit integers.
    ///
    /// Their element values travel as decimal strings on the wire to avoid
    /// precision loss in consumers that read JSON numbers as doubles.
    pub fn is_big_int(&self) -> bool {
        matches!(self, TypedArrayKind::BigInt64 | TypedArrayKind::BigUint64)
    }
}

impl fmt::Display for TypedArrayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Value
// =============================================================================

/// A structured datum stored under a key.
///
/// # Ordering of Containers
///
/// `Object`, `Map` and `Set` preserve insertion order, which is why they are
/// entry vectors rather than hash maps. Documents here are small (the cache's
/// size estimator samples at most 50 fields); linear field lookup is cheaper
/// than hashing at that scale and keeps round-trips byte-stable.
///
/// # Numbers
///
/// `Number` is an `f64`, including `NaN` and ±infinity: those three encode
/// as tagged values because plain JSON cannot express them. Integers beyond
/// 2^53 belong in `BigInt`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The null value.
    Null,
    /// Absence of a value. Valid inside containers and as a read result,
    /// rejected as a stored top-level value.
    Undefined,
    /// A boolean.
    Bool(bool),
    /// A double-precision number, including `NaN` and ±infinity.
    Number(f64),
    /// An arbitrary-precision integer in canonical decimal form
    /// (optional leading `-`, no leading zeros).
    BigInt(String),
    /// A UTF-8 string.
    String(String),
    /// A temporal instant (UTC, millisecond precision on the wire).
    Date(DateTime<Utc>),
    /// A regular expression with its source and flags.
    Regex {
        /// The pattern source, without delimiters.
        source: String,
        /// The flag characters (e.g. `"gi"`), in original order.
        flags: String,
    },
    /// A byte buffer.
    Bytes(Vec<u8>),
    /// A byte-slice view. Distinct from `Bytes` so the discriminant survives
    /// a round-trip.
    DataView(Vec<u8>),
    /// A typed numeric array.
    TypedArray {
        /// Element kind.
        kind: TypedArrayKind,
        /// Element values. For the BigInt kinds these carry exact 64-bit
        /// integers; for the float kinds, doubles.
        elements: Vec<serde_json::Number>,
    },
    /// An ordered collection of unique values.
    Set(Vec<Value>),
    /// An ordered mapping with arbitrary value keys.
    Map(Vec<(Value, Value)>),
    /// An error descriptor.
    ErrorValue {
        /// Error class name (e.g. `"TypeError"`).
        name: String,
        /// Human-readable message.
        message: String,
        /// Optional captured stack trace.
        stack: Option<String>,
    },
    /// An ordered list.
    Array(Vec<Value>),
    /// An ordered string-keyed document.
    Object(Vec<(String, Value)>),
}

impl Value {
    /// Returns a short name for the value's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Regex { .. } => "regex",
            Value::Bytes(_) => "buffer",
            Value::DataView(_) => "dataview",
            Value::TypedArray { .. } => "typedarray",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::ErrorValue { .. } => "error",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// True if this is [`Value::Undefined`].
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Returns the number if this is a `Number`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string slice if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns the element list if this is an `Array`.
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the field entries if this is an `Object`.
    pub fn as_object(&self) -> Option<&Vec<(String, Value)>> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Looks up a direct field on an `Object`.
    pub fn get_field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) => fields.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Resolves a dotted path like `"a.b.c"` against this value.
    ///
    /// Any missing field or non-object intermediate (including `Null` and
    /// `Undefined`) resolves the whole path to `None`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            current = current.get_field(segment)?;
        }
        Some(current)
    }

    /// Builds an `Object` from field entries, keeping their order.
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(instant: DateTime<Utc>) -> Self {
        Value::Date(instant)
    }
}

// =============================================================================
// Key Validation
// =============================================================================

/// True for Unicode non-characters: U+FDD0–U+FDEF and any code point whose
/// low 16 bits are 0xFFFE or 0xFFFF.
fn is_noncharacter(c: char) -> bool {
    let cp = c as u32;
    (0xFDD0..=0xFDEF).contains(&cp) || (cp & 0xFFFF) >= 0xFFFE
}

/// Validates a key against the admission rules.
///
/// Rules, in check order:
/// 1. non-empty
/// 2. at most [`MAX_KEY_LENGTH`] code points
/// 3. NFC-normalized (so byte-wise equality matches canonical equality)
/// 4. no quotes (`"` or `'`), semicolons, backslashes, forward slashes
/// 5. no control characters (U+0000–U+001F, U+007F)
/// 6. no Unicode non-characters
///
/// # Errors
///
/// [`Error::InvalidKey`] naming the violated rule.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("key must not be empty".to_string()));
    }
    if key.chars().count() > MAX_KEY_LENGTH {
        return Err(Error::InvalidKey(format!(
            "key exceeds {} code points",
            MAX_KEY_LENGTH
        )));
    }
    if !unicode_normalization::is_nfc(key) {
        return Err(Error::InvalidKey(
            "key must be NFC-normalized".to_string(),
        ));
    }
    for c in key.chars() {
        if matches!(c, '"' | '\'' | ';' | '\\' | '/') {
            return Err(Error::InvalidKey(format!(
                "key contains forbidden character {:?}",
                c
            )));
        }
        let cp = c as u32;
        if cp <= 0x1F || cp == 0x7F {
            return Err(Error::InvalidKey(format!(
                "key contains control character U+{:04X}",
                cp
            )));
        }
        if is_noncharacter(c) {
            return Err(Error::InvalidKey(format!(
                "key contains non-character U+{:04X}",
                cp
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Value Validation
// =============================================================================

/// Validates a value for storage.
///
/// Rejects `Undefined` as a stored value. Callables, symbolic tokens and
/// cyclic references (the other classes a serializable value must not
/// contain) are unrepresentable in the owned [`Value`] tree, so there is
/// nothing to check for them here; the codec's depth bound covers pathological
/// nesting.
///
/// # Errors
///
/// [`Error::InvalidValue`].
pub fn validate_value(value: &Value) -> Result<()> {
    if value.is_undefined() {
        return Err(Error::InvalidValue(
            "undefined cannot be stored as a value".to_string(),
        ));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
