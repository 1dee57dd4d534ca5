//! Type Preservation Tests
//!
//! Every recognized rich type must survive a full write → persist → reopen
//! → read cycle with its type intact, on both backends.

mod common;

use chrono::TimeZone;
use shaledb::{ShaleDb, TypedArrayKind, Value};

fn rich_values() -> Vec<(&'static str, Value)> {
    let instant = chrono::Utc
        .with_ymd_and_hms(2024, 1, 2, 3, 4, 5)
        .unwrap();
    vec![
        ("null", Value::Null),
        ("bool", Value::Bool(true)),
        ("int", Value::from(42)),
        ("float", Value::from(3.5)),
        ("infinity", Value::Number(f64::INFINITY)),
        ("neg_infinity", Value::Number(f64::NEG_INFINITY)),
        ("string", Value::from("hello")),
        ("date", Value::Date(instant)),
        (
            "regex",
            Value::Regex {
                source: "ab+".to_string(),
                flags: "gi".to_string(),
            },
        ),
        ("bytes", Value::Bytes(vec![0, 1, 2, 255])),
        ("dataview", Value::DataView(vec![9, 8, 7])),
        (
            "typed_array",
            Value::TypedArray {
                kind: TypedArrayKind::Float64,
                elements: vec![
                    serde_json::Number::from_f64(1.5).unwrap(),
                    serde_json::Number::from_f64(2.5).unwrap(),
                ],
            },
        ),
        (
            "big_typed_array",
            Value::TypedArray {
                kind: TypedArrayKind::BigInt64,
                elements: vec![serde_json::Number::from(9_007_199_254_740_993i64)],
            },
        ),
        (
            "set",
            Value::Set(vec![Value::from(1), Value::from(2), Value::from(3)]),
        ),
        (
            "map",
            Value::Map(vec![
                (Value::from("k"), Value::from(1)),
                (Value::from(2), Value::from("v")),
            ]),
        ),
        ("bigint", Value::BigInt("123456789012345678901234567890".to_string())),
        (
            "error",
            Value::ErrorValue {
                name: "TypeError".to_string(),
                message: "boom".to_string(),
                stack: Some("at main".to_string()),
            },
        ),
        (
            "nested",
            Value::object([
                ("list", Value::Array(vec![Value::from(1), Value::Null])),
                ("inner", Value::object([("d", Value::Date(instant))])),
            ]),
        ),
    ]
}

async fn assert_roundtrips(db: &ShaleDb) {
    for (key, value) in rich_values() {
        db.set(key, value.clone()).await.unwrap();
    }
    for (key, value) in rich_values() {
        assert_eq!(
            db.get(key).await.unwrap(),
            Some(value),
            "value under '{}' lost fidelity",
            key
        );
    }
}

#[tokio::test]
async fn rich_types_roundtrip_table_backend() {
    let (_dir, db) = common::open_table_db("types.db", common::unbatched()).await;
    assert_roundtrips(&db).await;
}

#[tokio::test]
async fn rich_types_roundtrip_document_backend() {
    let (_dir, db) = common::open_document_db("types.json", common::unbatched()).await;
    assert_roundtrips(&db).await;
}

/// Fidelity holds through persistence, not just through the cache: reopen
/// the file and read with a cold cache.
#[tokio::test]
async fn rich_types_survive_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("types.db");

    {
        let db = ShaleDb::open(&path, common::unbatched()).await.unwrap();
        for (key, value) in rich_values() {
            db.set(key, value).await.unwrap();
        }
        db.destroy(true).await.unwrap();
    }

    let db = ShaleDb::open(&path, common::unbatched()).await.unwrap();
    for (key, value) in rich_values() {
        assert_eq!(
            db.get(key).await.unwrap(),
            Some(value),
            "value under '{}' lost fidelity across reopen",
            key
        );
    }
}

/// NaN round-trips as NaN (it cannot be compared with equality).
#[tokio::test]
async fn nan_roundtrips() {
    let (_dir, db) = common::open_table_db("nan.db", common::plain()).await;

    db.set("nan", Value::Number(f64::NAN)).await.unwrap();
    let read = db.get("nan").await.unwrap().unwrap();
    assert!(matches!(read, Value::Number(n) if n.is_nan()));
}

/// A date read back equals the original instant (millisecond precision).
#[tokio::test]
async fn date_equality() {
    let (_dir, db) = common::open_table_db("dates.db", common::plain()).await;

    let instant = chrono::Utc
        .with_ymd_and_hms(2024, 1, 2, 3, 4, 5)
        .unwrap()
        + chrono::Duration::milliseconds(250);
    db.set("d", Value::Date(instant)).await.unwrap();

    assert_eq!(db.get("d").await.unwrap(), Some(Value::Date(instant)));
}

/// Regex source and flags both survive.
#[tokio::test]
async fn regex_source_and_flags() {
    let (_dir, db) = common::open_table_db("regex.db", common::plain()).await;

    db.set(
        "r",
        Value::Regex {
            source: "ab+".to_string(),
            flags: "gi".to_string(),
        },
    )
    .await
    .unwrap();

    let Some(Value::Regex { source, flags }) = db.get("r").await.unwrap() else {
        panic!("expected a regex back");
    };
    assert_eq!(source, "ab+");
    assert!(flags.contains('g') && flags.contains('i'));
}

/// Buffer and DataView stay distinct types with identical bytes.
#[tokio::test]
async fn buffer_dataview_distinction() {
    let (_dir, db) = common::open_table_db("bytes.db", common::plain()).await;

    let payload = vec![1u8, 2, 3];
    db.set("buf", Value::Bytes(payload.clone())).await.unwrap();
    db.set("view", Value::DataView(payload.clone()))
        .await
        .unwrap();

    assert_eq!(db.get("buf").await.unwrap(), Some(Value::Bytes(payload.clone())));
    assert_eq!(db.get("view").await.unwrap(), Some(Value::DataView(payload)));
}
