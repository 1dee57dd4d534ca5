//! Basic Operation Tests
//!
//! Covers the primitive read/write surface on both backends:
//! - set/get/has/delete with default values
//! - array push/pull and numeric add/subtract
//! - bulk operations and clear
//! - persistence across reopen

mod common;

use shaledb::{Error, ShaleDb, Value};

/// set → get → default → has → delete, on the table backend.
#[tokio::test]
async fn basic_roundtrip_table_backend() {
    let (_dir, db) = common::open_table_db("basic.db", common::unbatched()).await;

    db.set("x", 1).await.unwrap();
    assert_eq!(db.get("x").await.unwrap(), Some(Value::Number(1.0)));
    assert_eq!(db.get_or("y", 42).await.unwrap(), Value::Number(42.0));
    assert!(db.has("x").await.unwrap());

    assert!(db.delete("x").await.unwrap());
    assert_eq!(db.get("x").await.unwrap(), None);
    assert!(!db.has("x").await.unwrap());
}

/// The same surface behaves identically on the document backend.
#[tokio::test]
async fn basic_roundtrip_document_backend() {
    let (_dir, db) = common::open_document_db("basic.json", common::unbatched()).await;

    db.set("x", 1).await.unwrap();
    assert_eq!(db.get("x").await.unwrap(), Some(Value::Number(1.0)));
    assert_eq!(db.get_or("y", 42).await.unwrap(), Value::Number(42.0));
    assert!(db.has("x").await.unwrap());

    db.delete("x").await.unwrap();
    assert_eq!(db.get("x").await.unwrap(), None);
}

/// Values survive a close and reopen of the same file.
#[tokio::test]
async fn values_persist_across_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = common::temp_path(&dir, "persist.db");

    {
        let db = ShaleDb::open(&path, common::unbatched()).await.unwrap();
        db.set("kept", "value").await.unwrap();
        db.destroy(true).await.unwrap();
    }

    let db = ShaleDb::open(&path, common::unbatched()).await.unwrap();
    assert_eq!(
        db.get("kept").await.unwrap(),
        Some(Value::String("value".to_string()))
    );
}

/// push creates, appends, and rejects non-arrays; pull removes all
/// strictly-equal occurrences.
#[tokio::test]
async fn push_and_pull_semantics() {
    let (_dir, db) = common::open_table_db("arrays.db", common::unbatched()).await;

    db.push("tags", "a").await.unwrap();
    db.push("tags", "b").await.unwrap();
    db.push("tags", "a").await.unwrap();

    db.pull("tags", "a").await.unwrap();
    assert_eq!(
        db.get("tags").await.unwrap(),
        Some(Value::Array(vec![Value::from("b")]))
    );

    db.set("scalar", 1).await.unwrap();
    assert!(matches!(
        db.push("scalar", "x").await,
        Err(Error::NotArray { .. })
    ));
    assert!(matches!(
        db.pull("missing", "x").await,
        Err(Error::NotArray { .. })
    ));
}

/// add/subtract on absent, numeric, and non-numeric values.
#[tokio::test]
async fn numeric_operations() {
    let (_dir, db) = common::open_table_db("numbers.db", common::unbatched()).await;

    assert_eq!(db.add("counter", 10.0).await.unwrap(), 10.0);
    assert_eq!(db.subtract("counter", 3.0).await.unwrap(), 7.0);
    assert_eq!(
        db.get("counter").await.unwrap(),
        Some(Value::Number(7.0))
    );

    db.set("name", "not a number").await.unwrap();
    assert!(matches!(
        db.add("name", 1.0).await,
        Err(Error::InvalidNumber { .. })
    ));
    assert!(matches!(
        db.add("counter", f64::NAN).await,
        Err(Error::InvalidNumber { .. })
    ));
}

/// Bulk writes and deletes hit every entry and fire per-entry events.
#[tokio::test]
async fn bulk_operations() {
    let (_dir, db) = common::open_table_db("bulk.db", common::unbatched()).await;
    let mut events = db.subscribe();

    db.bulk_set(vec![
        ("a".to_string(), Value::from(1)),
        ("b".to_string(), Value::from(2)),
        ("c".to_string(), Value::from(3)),
    ])
    .await
    .unwrap();
    assert_eq!(db.len().await.unwrap(), 3);

    db.bulk_delete(vec!["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert_eq!(db.len().await.unwrap(), 1);
    assert_eq!(db.get("c").await.unwrap(), Some(Value::Number(3.0)));

    let mut sets = 0;
    let mut deletes = 0;
    while let Ok(event) = events.try_recv() {
        match event.event {
            shaledb::EventKind::Set => sets += 1,
            shaledb::EventKind::Delete => deletes += 1,
            _ => {}
        }
    }
    assert_eq!(sets, 3);
    assert_eq!(deletes, 2);
}

/// clear empties the store and the cache in one step.
#[tokio::test]
async fn clear_empties_everything() {
    let (_dir, db) = common::open_table_db("clear.db", common::unbatched()).await;

    db.set("a", 1).await.unwrap();
    db.set("b", 2).await.unwrap();
    db.clear().await.unwrap();

    assert!(db.is_empty().await.unwrap());
    assert_eq!(db.get("a").await.unwrap(), None);
}

/// Key scans: prefix and regex.
#[tokio::test]
async fn key_scans() {
    let (_dir, db) = common::open_table_db("scan.db", common::unbatched()).await;

    db.set("user:1", 1).await.unwrap();
    db.set("user:2", 2).await.unwrap();
    db.set("order:9", 3).await.unwrap();

    assert_eq!(
        db.starts_with("user:").await.unwrap(),
        vec!["user:1", "user:2"]
    );
    let found = db
        .find_keys(&regex::Regex::new(r"^order:").unwrap())
        .await
        .unwrap();
    assert_eq!(found, vec!["order:9"]);

    assert_eq!(
        db.keys().await.unwrap(),
        vec!["order:9", "user:1", "user:2"]
    );
    assert_eq!(
        db.values().await.unwrap(),
        vec![Value::Number(3.0), Value::Number(1.0), Value::Number(2.0)]
    );
}

/// Validation fires before the backend sees anything.
#[tokio::test]
async fn invalid_inputs_rejected_before_io() {
    let (_dir, db) = common::open_table_db("validate.db", common::unbatched()).await;

    for bad_key in ["", "a;b", "a/b", "a\\b", "a\"b", "a\u{FDD0}"] {
        assert!(
            matches!(db.set(bad_key, 1).await, Err(Error::InvalidKey(_))),
            "expected rejection for {:?}",
            bad_key
        );
    }
    assert!(matches!(
        db.set("ok", Value::Undefined).await,
        Err(Error::InvalidValue(_))
    ));

    assert!(db.is_empty().await.unwrap());
}
