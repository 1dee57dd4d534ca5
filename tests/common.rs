#![allow(dead_code)]

use std::path::PathBuf;

use shaledb::{Options, ShaleDb, Value};

/// Creates a temp dir and a table-backend store inside it.
pub async fn open_table_db(name: &str, options: Options) -> (tempfile::TempDir, ShaleDb) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let db = ShaleDb::open(dir.path().join(name), options)
        .await
        .expect("open table db");
    (dir, db)
}

/// Creates a temp dir and a document-backend store inside it.
pub async fn open_document_db(name: &str, options: Options) -> (tempfile::TempDir, ShaleDb) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let db = ShaleDb::open(dir.path().join(name), options)
        .await
        .expect("open document db");
    (dir, db)
}

/// Options with batching disabled, so single writes complete without
/// waiting out the batch deadline.
pub fn unbatched() -> Options {
    Options {
        batch: false,
        ..Options::default()
    }
}

/// Options with batching and caching disabled.
pub fn plain() -> Options {
    Options {
        batch: false,
        cache: false,
        ..Options::default()
    }
}

pub fn temp_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

/// A user document in the shape the query tests populate.
pub fn user_doc(age: i64, city: &str, active: bool) -> Value {
    Value::object([
        ("age", Value::from(age)),
        ("city", Value::from(city)),
        ("active", Value::from(active)),
    ])
}
