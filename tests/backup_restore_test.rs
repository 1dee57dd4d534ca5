//! Backup & Restore Integration Tests
//!
//! Snapshot → restore cycles through the façade, across backends, plus
//! merge semantics and directory listing.

mod common;

use chrono::TimeZone;
use shaledb::{Error, ShaleDb, Value};

async fn seed(db: &ShaleDb) {
    db.set("plain", 1).await.unwrap();
    db.set("text", "hello").await.unwrap();
    db.set(
        "date",
        Value::Date(chrono::Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap()),
    )
    .await
    .unwrap();
    db.set(
        "doc",
        Value::object([("nested", Value::Array(vec![Value::from(1)]))]),
    )
    .await
    .unwrap();
}

/// A snapshot of the table backend restores into a fresh document backend
/// with full type fidelity: backends are interchangeable through the
/// backup format.
#[tokio::test]
async fn backup_crosses_backends() {
    let dir = tempfile::TempDir::new().unwrap();
    let backup_path = dir.path().join("snapshot.json");

    let (_src_dir, source) = common::open_table_db("source.db", common::unbatched()).await;
    seed(&source).await;
    let written = source.backup(&backup_path).await.unwrap();
    assert_eq!(written, 4);

    let target = ShaleDb::open(dir.path().join("target.json"), common::unbatched())
        .await
        .unwrap();
    let restored = target.restore(&backup_path, false).await.unwrap();
    assert_eq!(restored, 4);

    assert_eq!(target.get("plain").await.unwrap(), Some(Value::Number(1.0)));
    assert!(matches!(
        target.get("date").await.unwrap(),
        Some(Value::Date(_))
    ));
    let doc = target.get("doc").await.unwrap().unwrap();
    assert!(matches!(doc.get_field("nested"), Some(Value::Array(_))));
}

/// A plain restore replaces current contents entirely.
#[tokio::test]
async fn restore_replaces_state() {
    let dir = tempfile::TempDir::new().unwrap();
    let backup_path = dir.path().join("snapshot.json");

    let (_db_dir, db) = common::open_table_db("replace.db", common::unbatched()).await;
    seed(&db).await;
    db.backup(&backup_path).await.unwrap();

    db.set("later", "should vanish").await.unwrap();
    db.delete("plain").await.unwrap();

    db.restore(&backup_path, false).await.unwrap();

    assert_eq!(db.get("later").await.unwrap(), None);
    assert_eq!(db.get("plain").await.unwrap(), Some(Value::Number(1.0)));
}

/// A merge restore unions: local-only keys survive, incoming keys win.
#[tokio::test]
async fn merge_restore_unions() {
    let dir = tempfile::TempDir::new().unwrap();
    let backup_path = dir.path().join("snapshot.json");

    let (_db_dir, db) = common::open_table_db("merge.db", common::unbatched()).await;
    seed(&db).await;
    db.backup(&backup_path).await.unwrap();

    db.set("plain", 999).await.unwrap(); // diverge an incoming key
    db.set("local", "kept").await.unwrap(); // local-only key

    db.restore(&backup_path, true).await.unwrap();

    assert_eq!(db.get("plain").await.unwrap(), Some(Value::Number(1.0)));
    assert_eq!(
        db.get("local").await.unwrap(),
        Some(Value::String("kept".to_string()))
    );
}

/// The cache is cleared by restore: a stale cached value never shadows the
/// restored state.
#[tokio::test]
async fn restore_invalidates_cache() {
    let dir = tempfile::TempDir::new().unwrap();
    let backup_path = dir.path().join("snapshot.json");

    let (_db_dir, db) = common::open_table_db("cacheinv.db", common::unbatched()).await;
    db.set("k", "original").await.unwrap();
    db.backup(&backup_path).await.unwrap();

    db.set("k", "changed").await.unwrap();
    db.get("k").await.unwrap(); // definitely cached now

    db.restore(&backup_path, false).await.unwrap();
    assert_eq!(
        db.get("k").await.unwrap(),
        Some(Value::String("original".to_string()))
    );
}

/// Restores of invalid backup files fail without touching the store.
#[tokio::test]
async fn invalid_backup_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let (_db_dir, db) = common::open_table_db("invalid.db", common::unbatched()).await;
    db.set("untouched", 1).await.unwrap();

    let bad = dir.path().join("bad.json");
    std::fs::write(
        &bad,
        r#"{"version":"not-semver","timestamp":"2026-01-01T00:00:00Z","data":{},"entries":0}"#,
    )
    .unwrap();

    assert!(matches!(
        db.restore(&bad, false).await,
        Err(Error::Read(_))
    ));
    assert_eq!(
        db.get("untouched").await.unwrap(),
        Some(Value::Number(1.0))
    );
}

/// Listing returns valid backups newest-first and skips garbage.
#[tokio::test]
async fn list_backups_in_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    let backups_dir = dir.path().join("backups");
    std::fs::create_dir_all(&backups_dir).unwrap();

    let (_db_dir, db) = common::open_table_db("list.db", common::unbatched()).await;
    seed(&db).await;

    db.backup(backups_dir.join("first.json")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    db.backup(backups_dir.join("second.json")).await.unwrap();
    std::fs::write(backups_dir.join("junk.json"), "not a backup").unwrap();

    let listed = db.list_backups(&backups_dir).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].file, "second.json");
    assert_eq!(listed[1].file, "first.json");
    assert_eq!(listed[0].entries, 4);
    assert!(listed[0].size > 0);
    assert!(listed[0].timestamp >= listed[1].timestamp);
}
