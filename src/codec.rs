//! # Type-Preserving Value Codec
//!
//! This module encodes [`Value`] trees into a self-describing text form and
//! decodes them back with full type fidelity.
//!
//! ## Wire Form
//!
//! The wire form is JSON. Shapes JSON can express natively (null, booleans,
//! finite numbers, strings, arrays, string-keyed objects) encode untagged.
//! Everything else encodes as an object whose FIRST field is the reserved
//! discriminant [`TYPE_TAG`]:
//!
//! ```text
//! Date       {"$type":"Date","value":"2024-01-02T03:04:05.000Z"}
//! RegExp     {"$type":"RegExp","source":"ab+","flags":"gi"}
//! Set        {"$type":"Set","value":[1,2,3]}
//! Map        {"$type":"Map","value":[["k",1],[2,"v"]]}
//! Buffer     {"$type":"Buffer","value":"aGVsbG8="}
//! DataView   {"$type":"DataView","value":"aGVsbG8="}
//! TypedArray {"$type":"TypedArray","arrayType":"Float64Array","value":[1.5]}
//! BigInt     {"$type":"BigInt","value":"12345678901234567890"}
//! Error      {"$type":"Error","name":"TypeError","message":"...","stack":"..."}
//! NaN        {"$type":"NaN"}            (same for Infinity, -Infinity, undefined)
//! ```
//!
//! ## Lenient Decode
//!
//! `decode` is total on strings: text that does not parse as JSON comes back
//! unchanged as a string value, and a recognized tag with a malformed payload
//! falls back to the plain object shape. This keeps a single corrupt entry
//! from poisoning a whole scan: the backends rely on it.
//!
//! ## Depth Bound
//!
//! `encode` refuses trees nested deeper than [`MAX_ENCODE_DEPTH`]. Since
//! values are owned trees, cycles cannot exist; the bound is the guard that
//! plays the seen-set's role for pathological nesting.

use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::value::{TypedArrayKind, Value};

/// The reserved discriminant field naming a tagged value's type.
pub const TYPE_TAG: &str = "$type";

/// Maximum nesting depth `encode` accepts.
pub const MAX_ENCODE_DEPTH: usize = 128;

// =============================================================================
// Encoding
// =============================================================================

/// Encodes a value into its wire-form text.
///
/// # Errors
///
/// [`Error::InvalidValue`] when nesting exceeds [`MAX_ENCODE_DEPTH`].
pub fn encode(value: &Value) -> Result<String> {
    let json = to_json(value, 0)?;
    serde_json::to_string(&json)
        .map_err(|e| Error::InvalidValue(format!("value failed to serialize: {}", e)))
}

/// Converts a value into its `serde_json` representation, tagging as needed.
///
/// Exposed to the crate so the backup writer can embed values into a larger
/// document without re-parsing encoded text.
pub(crate) fn to_json(value: &Value, depth: usize) -> Result<JsonValue> {
    if depth > MAX_ENCODE_DEPTH {
        return Err(Error::InvalidValue(format!(
            "nesting exceeds the maximum depth of {}",
            MAX_ENCODE_DEPTH
        )));
    }

    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Undefined => tag("undefined"),
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Number(n) => {
            if n.is_nan() {
                tag("NaN")
            } else if n.is_infinite() {
                tag(if *n > 0.0 { "Infinity" } else { "-Infinity" })
            } else {
                // Finite doubles always convert.
                JsonValue::Number(
                    serde_json::Number::from_f64(*n).expect("finite double"),
                )
            }
        }
        Value::BigInt(digits) => tagged("BigInt", JsonValue::String(digits.clone())),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Date(instant) => tagged(
            "Date",
            JsonValue::String(instant.to_rfc3339_opts(SecondsFormat::Millis, true)),
        ),
        Value::Regex { source, flags } => {
            let mut map = serde_json::Map::new();
            map.insert(TYPE_TAG.to_string(), JsonValue::String("RegExp".to_string()));
            map.insert("source".to_string(), JsonValue::String(source.clone()));
            map.insert("flags".to_string(), JsonValue::String(flags.clone()));
            JsonValue::Object(map)
        }
        Value::Bytes(bytes) => tagged(
            "Buffer",
            JsonValue::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
        ),
        Value::DataView(bytes) => tagged(
            "DataView",
            JsonValue::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
        ),
        Value::TypedArray { kind, elements } => {
            let values: Vec<JsonValue> = if kind.is_big_int() {
                // 64-bit integer elements travel as decimal strings.
                elements
                    .iter()
                    .map(|n| JsonValue::String(n.to_string()))
                    .collect()
            } else {
                elements
                    .iter()
                    .map(|n| JsonValue::Number(n.clone()))
                    .collect()
            };
            let mut map = serde_json::Map::new();
            map.insert(
                TYPE_TAG.to_string(),
                JsonValue::String("TypedArray".to_string()),
            );
            map.insert(
                "arrayType".to_string(),
                JsonValue::String(kind.as_str().to_string()),
            );
            map.insert("value".to_string(), JsonValue::Array(values));
            JsonValue::Object(map)
        }
        Value::Set(items) => {
            let encoded: Result<Vec<JsonValue>> =
                items.iter().map(|v| to_json(v, depth + 1)).collect();
            tagged("Set", JsonValue::Array(encoded?))
        }
        Value::Map(entries) => {
            let mut pairs = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                pairs.push(JsonValue::Array(vec![
                    to_json(k, depth + 1)?,
                    to_json(v, depth + 1)?,
                ]));
            }
            tagged("Map", JsonValue::Array(pairs))
        }
        Value::ErrorValue {
            name,
            message,
            stack,
        } => {
            let mut map = serde_json::Map::new();
            map.insert(TYPE_TAG.to_string(), JsonValue::String("Error".to_string()));
            map.insert("name".to_string(), JsonValue::String(name.clone()));
            map.insert("message".to_string(), JsonValue::String(message.clone()));
            if let Some(stack) = stack {
                map.insert("stack".to_string(), JsonValue::String(stack.clone()));
            }
            JsonValue::Object(map)
        }
        Value::Array(items) => {
            let encoded: Result<Vec<JsonValue>> =
                items.iter().map(|v| to_json(v, depth + 1)).collect();
            JsonValue::Array(encoded?)
        }
        Value::Object(fields) => {
            let mut map = serde_json::Map::new();
            for (k, v) in fields {
                map.insert(k.clone(), to_json(v, depth + 1)?);
            }
            JsonValue::Object(map)
        }
    })
}

/// Builds a bare tag object like `{"$type":"NaN"}`.
fn tag(name: &str) -> JsonValue {
    let mut map = serde_json::Map::new();
    map.insert(TYPE_TAG.to_string(), JsonValue::String(name.to_string()));
    JsonValue::Object(map)
}

/// Builds a tag object with a `value` payload.
fn tagged(name: &str, payload: JsonValue) -> JsonValue {
    let mut map = serde_json::Map::new();
    map.insert(TYPE_TAG.to_string(), JsonValue::String(name.to_string()));
    map.insert("value".to_string(), payload);
    JsonValue::Object(map)
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes wire-form text back into a value.
///
/// Total on strings: any parse failure returns the original text as a
/// string value.
pub fn decode(text: &str) -> Value {
    match serde_json::from_str::<JsonValue>(text) {
        Ok(json) => from_json(&json),
        Err(_) => Value::String(text.to_string()),
    }
}

/// Converts a `serde_json` value into a [`Value`], resolving tags.
pub(crate) fn from_json(json: &JsonValue) -> Value {
    match json {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        JsonValue::String(s) => Value::String(s.clone()),
        JsonValue::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        JsonValue::Object(map) => {
            // Only an object whose FIRST field is the discriminant is tagged.
            let first_is_tag = map.iter().next().map(|(k, _)| k.as_str()) == Some(TYPE_TAG);
            if first_is_tag {
                if let Some(JsonValue::String(name)) = map.get(TYPE_TAG) {
                    if let Some(value) = decode_tagged(name, map) {
                        return value;
                    }
                }
            }
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), from_json(v)))
                    .collect(),
            )
        }
    }
}

/// Decodes a recognized tag. `None` means "not recognized or malformed" -
/// the caller falls back to the plain object shape.
fn decode_tagged(name: &str, map: &serde_json::Map<String, JsonValue>) -> Option<Value> {
    match name {
        "null" => Some(Value::Null),
        "undefined" => Some(Value::Undefined),
        "NaN" => Some(Value::Number(f64::NAN)),
        "Infinity" => Some(Value::Number(f64::INFINITY)),
        "-Infinity" => Some(Value::Number(f64::NEG_INFINITY)),
        "BigInt" => match map.get("value") {
            Some(JsonValue::String(digits)) => Some(Value::BigInt(digits.clone())),
            _ => None,
        },
        "Date" => match map.get("value") {
            Some(JsonValue::String(text)) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| Value::Date(dt.with_timezone(&Utc))),
            _ => None,
        },
        "RegExp" => {
            let source = map.get("source")?.as_str()?.to_string();
            let flags = map
                .get("flags")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string();
            Some(Value::Regex { source, flags })
        }
        "Buffer" => decode_base64(map).map(Value::Bytes),
        "DataView" => decode_base64(map).map(Value::DataView),
        "TypedArray" => {
            let kind = TypedArrayKind::from_name(map.get("arrayType")?.as_str()?)?;
            let raw = map.get("value")?.as_array()?;
            let mut elements = Vec::with_capacity(raw.len());
            for item in raw {
                elements.push(decode_typed_element(item)?);
            }
            Some(Value::TypedArray { kind, elements })
        }
        "Set" => {
            let items = map.get("value")?.as_array()?;
            Some(Value::Set(items.iter().map(from_json).collect()))
        }
        "Map" => {
            let pairs = map.get("value")?.as_array()?;
            let mut entries = Vec::with_capacity(pairs.len());
            for pair in pairs {
                let pair = pair.as_array()?;
                if pair.len() != 2 {
                    return None;
                }
                entries.push((from_json(&pair[0]), from_json(&pair[1])));
            }
            Some(Value::Map(entries))
        }
        "Error" => {
            let name = map.get("name")?.as_str()?.to_string();
            let message = map.get("message")?.as_str()?.to_string();
            let stack = map
                .get("stack")
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            Some(Value::ErrorValue {
                name,
                message,
                stack,
            })
        }
        _ => None,
    }
}

/// Reads a base64 `value` payload.
fn decode_base64(map: &serde_json::Map<String, JsonValue>) -> Option<Vec<u8>> {
    let text = map.get("value")?.as_str()?;
    base64::engine::general_purpose::STANDARD.decode(text).ok()
}

/// A typed-array element: a JSON number, or a decimal string for the
/// 64-bit integer kinds.
fn decode_typed_element(item: &JsonValue) -> Option<serde_json::Number> {
    match item {
        JsonValue::Number(n) => Some(n.clone()),
        JsonValue::String(s) => {
            if let Ok(i) = s.parse::<i64>() {
                Some(serde_json::Number::from(i))
            } else if let Ok(u) = s.parse::<u64>() {
                Some(serde_json::Number::from(u))
            } else {
                None
            }
        }
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
