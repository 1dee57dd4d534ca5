//! # Table Backend (SQLite)
//!
//! The relational-table variant: a single `data(key, value)` table in a
//! SQLite file, driven through prepared statements.
//!
//! ## The SQLite Challenge
//!
//! SQLite's `Connection` uses `RefCell` internally, making it `!Sync`: it
//! cannot be shared across threads, even behind `Arc`. The solution here is
//! a dedicated OS thread that owns the connection outright and serves
//! requests over async channels:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Async Tasks (callers)                   │
//! │   get ─┐                                        ┌─ batch    │
//! │   set ─┼── tokio::sync::mpsc ───────────────────┼─ scan     │
//! │   tx  ─┘        (requests + oneshot replies)    └─ destroy  │
//! └────────────────────────────┬────────────────────────────────┘
//!                              │
//!                              ▼
//!                  ┌───────────────────────┐
//!                  │  Dedicated OS Thread  │
//!                  │  ┌─────────────────┐  │
//!                  │  │   Connection    │  │  ← owned, never shared
//!                  │  │ (WAL, prepared  │  │
//!                  │  │   statements)   │  │
//!                  │  └─────────────────┘  │
//!                  └───────────────────────┘
//! ```
//!
//! One thread also gives us the transaction story for free: while a
//! transaction session is open, the actor serves only that session's
//! operations, so the atomic section has genuinely exclusive use of the
//! connection, and a second concurrent transaction waits its turn in the
//! request queue.
//!
//! ## Pragmas
//!
//! WAL journaling (configurable), `synchronous = NORMAL`,
//! `temp_store = MEMORY`, and a 64 MiB page cache. On destroy, the `-wal`
//! and `-shm` sidecars are removed best-effort.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};

use super::{decode_logged, Backend, EntryStream, STREAM_CHANNEL_SIZE};
use crate::codec;
use crate::error::{Error, Result};
use crate::value::Value;

/// Size of the request channel into the actor thread.
const REQUEST_CHANNEL_SIZE: usize = 1024;

/// Size of the per-transaction operation channel.
const TX_CHANNEL_SIZE: usize = 32;

// =============================================================================
// Schema
// =============================================================================

/// The single data table: key is the primary key, value is encoded text.
const CREATE_DATA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS data (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Secondary index on key for ranged prefix scans.
const CREATE_KEY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_data_key ON data(key)
"#;

const SQL_GET: &str = "SELECT value FROM data WHERE key = ?1";
const SQL_UPSERT: &str =
    "INSERT INTO data (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value";
const SQL_DELETE: &str = "DELETE FROM data WHERE key = ?1";
const SQL_SCAN: &str = "SELECT key, value FROM data ORDER BY key";
const SQL_CLEAR: &str = "DELETE FROM data";

/// Opens the connection, applies pragmas, and initializes the schema.
fn open_connection(path: &Path, wal_mode: bool) -> Result<Connection> {
    let conn = Connection::open(path)?;
    if wal_mode {
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
    }
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;
    conn.execute_batch("PRAGMA temp_store = MEMORY")?;
    // Negative cache_size is KiB: 64 MiB of page cache.
    conn.execute_batch("PRAGMA cache_size = -64000")?;

    conn.execute(CREATE_DATA_TABLE, [])?;
    conn.execute(CREATE_KEY_INDEX, [])?;
    Ok(conn)
}

// =============================================================================
// Request Protocol
// =============================================================================

enum TableRequest {
    Get {
        key: String,
        reply: oneshot::Sender<Result<Option<String>>>,
    },
    Set {
        key: String,
        value: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Delete {
        key: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    ReadAll {
        reply: oneshot::Sender<Result<Vec<(String, String)>>>,
    },
    WriteAll {
        entries: Vec<(String, String)>,
        reply: oneshot::Sender<Result<()>>,
    },
    BatchSet {
        entries: Vec<(String, String)>,
        reply: oneshot::Sender<Result<()>>,
    },
    BatchDelete {
        keys: Vec<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Scan {
        out: mpsc::Sender<Result<(String, String)>>,
    },
    QueryPrefix {
        prefix: String,
        descending: bool,
        limit: Option<usize>,
        offset: usize,
        reply: oneshot::Sender<Result<Vec<(String, String)>>>,
    },
    Begin {
        ops: mpsc::Receiver<TxOp>,
        reply: oneshot::Sender<Result<()>>,
    },
    Destroy {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Operations valid inside an open atomic section.
enum TxOp {
    Get {
        key: String,
        reply: oneshot::Sender<Result<Option<String>>>,
    },
    Set {
        key: String,
        value: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Delete {
        key: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Commit {
        reply: oneshot::Sender<Result<()>>,
    },
    Rollback {
        reply: oneshot::Sender<Result<()>>,
    },
}

// =============================================================================
// Transaction Session Handle
// =============================================================================

/// An open backend-level atomic section.
///
/// Created by the transaction engine; every call runs a prepared statement
/// on the actor thread inside the `BEGIN IMMEDIATE` section. Dropping the
/// session without committing rolls the section back.
pub struct TransactionSession {
    ops: mpsc::Sender<TxOp>,
}

impl TransactionSession {
    async fn send_op<T>(
        &self,
        op: TxOp,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.ops
            .send(op)
            .await
            .map_err(|_| Error::Transaction("transaction session closed".to_string()))?;
        rx.await
            .map_err(|_| Error::Transaction("transaction session closed".to_string()))?
    }

    /// Reads a key's encoded value inside the atomic section.
    pub(crate) async fn get(&self, key: &str) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.send_op(
            TxOp::Get {
                key: key.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Writes a key inside the atomic section.
    pub(crate) async fn set(&self, key: &str, value: String) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_op(
            TxOp::Set {
                key: key.to_string(),
                value,
                reply,
            },
            rx,
        )
        .await
    }

    /// Deletes a key inside the atomic section.
    pub(crate) async fn delete(&self, key: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send_op(
            TxOp::Delete {
                key: key.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Commits the atomic section. The session is spent afterwards.
    pub(crate) async fn commit(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_op(TxOp::Commit { reply }, rx).await
    }

    /// Rolls the atomic section back. The session is spent afterwards.
    pub(crate) async fn rollback(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_op(TxOp::Rollback { reply }, rx).await
    }
}

// =============================================================================
// Table Backend
// =============================================================================

/// The SQLite-backed table backend.
pub struct TableBackend {
    path: PathBuf,
    wal_mode: bool,
    sender: StdMutex<Option<mpsc::Sender<TableRequest>>>,
}

impl TableBackend {
    /// Creates a backend for `path`. Nothing is opened until `connect`.
    pub fn new(path: impl Into<PathBuf>, wal_mode: bool) -> Self {
        Self {
            path: path.into(),
            wal_mode,
            sender: StdMutex::new(None),
        }
    }

    /// The database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sender(&self) -> Result<mpsc::Sender<TableRequest>> {
        self.sender
            .lock()
            .expect("sender lock")
            .clone()
            .ok_or_else(|| Error::Write("table backend is not connected".to_string()))
    }

    async fn send(&self, request: TableRequest) -> Result<()> {
        self.sender()?
            .send(request)
            .await
            .map_err(|_| Error::Write("table backend has shut down".to_string()))
    }

    /// Ranged key-prefix query used by the query planner's push-down.
    ///
    /// The exclusive upper bound appends U+10FFFF to the prefix: keys can
    /// never contain that code point (it is a Unicode non-character the key
    /// validator rejects), so the range covers exactly the prefixed keys.
    pub(crate) async fn query_prefix(
        &self,
        prefix: &str,
        descending: bool,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<(String, String)>> {
        let (reply, rx) = oneshot::channel();
        self.send(TableRequest::QueryPrefix {
            prefix: prefix.to_string(),
            descending,
            limit,
            offset,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Read("table backend dropped the reply".to_string()))?
            .map_err(as_read_error)
    }

    /// Opens a backend-level atomic section with immediate write intent.
    pub(crate) async fn begin_session(&self) -> Result<TransactionSession> {
        let (ops_tx, ops_rx) = mpsc::channel(TX_CHANNEL_SIZE);
        let (reply, rx) = oneshot::channel();
        self.send(TableRequest::Begin { ops: ops_rx, reply }).await?;
        rx.await
            .map_err(|_| Error::Transaction("table backend dropped the reply".to_string()))?
            .map_err(|e| Error::transaction(e))?;
        Ok(TransactionSession { ops: ops_tx })
    }

    /// Closes and re-opens the actor, preserving the database file.
    pub(crate) async fn reconnect(&self) -> Result<()> {
        let old = self.sender.lock().expect("sender lock").take();
        if let Some(old) = old {
            let _ = old.send(TableRequest::Shutdown).await;
        }
        let sender = spawn_actor(self.path.clone(), self.wal_mode).await?;
        *self.sender.lock().expect("sender lock") = Some(sender);
        Ok(())
    }
}

impl Backend for TableBackend {
    async fn connect(&self) -> Result<()> {
        if self.sender.lock().expect("sender lock").is_some() {
            return Ok(());
        }
        let sender = spawn_actor(self.path.clone(), self.wal_mode).await?;
        *self.sender.lock().expect("sender lock") = Some(sender);
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<Value>> {
        let (reply, rx) = oneshot::channel();
        self.send(TableRequest::Get {
            key: key.to_string(),
            reply,
        })
        .await?;
        let row = rx
            .await
            .map_err(|_| Error::Read("table backend dropped the reply".to_string()))?
            .map_err(as_read_error)?;
        Ok(row.map(|encoded| decode_logged(key, &encoded)))
    }

    async fn set_value(&self, key: &str, value: &Value) -> Result<()> {
        let encoded = codec::encode(value)?;
        let (reply, rx) = oneshot::channel();
        self.send(TableRequest::Set {
            key: key.to_string(),
            value: encoded,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Write("table backend dropped the reply".to_string()))?
            .map_err(as_write_error)
    }

    async fn delete_value(&self, key: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(TableRequest::Delete {
            key: key.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Write("table backend dropped the reply".to_string()))?
            .map_err(as_write_error)
    }

    async fn read_all(&self) -> Result<BTreeMap<String, Value>> {
        let (reply, rx) = oneshot::channel();
        self.send(TableRequest::ReadAll { reply }).await?;
        let rows = rx
            .await
            .map_err(|_| Error::Read("table backend dropped the reply".to_string()))?
            .map_err(as_read_error)?;
        Ok(rows
            .into_iter()
            .map(|(key, encoded)| {
                let value = decode_logged(&key, &encoded);
                (key, value)
            })
            .collect())
    }

    async fn write_all(&self, entries: BTreeMap<String, JsonValue>) -> Result<()> {
        let encoded: Vec<(String, String)> = entries
            .into_iter()
            .map(|(k, v)| (k, v.to_string()))
            .collect();
        let (reply, rx) = oneshot::channel();
        self.send(TableRequest::WriteAll {
            entries: encoded,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Write("table backend dropped the reply".to_string()))?
            .map_err(as_write_error)
    }

    async fn batch_set(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in &entries {
            encoded.push((key.clone(), codec::encode(value)?));
        }
        let (reply, rx) = oneshot::channel();
        self.send(TableRequest::BatchSet {
            entries: encoded,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Write("table backend dropped the reply".to_string()))?
            .map_err(as_write_error)
    }

    async fn batch_delete(&self, keys: Vec<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(TableRequest::BatchDelete { keys, reply }).await?;
        rx.await
            .map_err(|_| Error::Write("table backend dropped the reply".to_string()))?
            .map_err(as_write_error)
    }

    async fn stream_entries(&self) -> Result<EntryStream> {
        let (out, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        self.send(TableRequest::Scan { out }).await?;
        Ok(EntryStream::new(rx))
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    async fn destroy(&self) -> Result<()> {
        let sender = self.sender.lock().expect("sender lock").take();
        if let Some(sender) = sender {
            let (reply, rx) = oneshot::channel();
            if sender.send(TableRequest::Destroy { reply }).await.is_ok() {
                let _ = rx.await;
            }
        }
        Ok(())
    }
}

impl Drop for TableBackend {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.lock().expect("sender lock").take() {
            let _ = sender.try_send(TableRequest::Shutdown);
        }
    }
}

/// Keeps already-categorized errors, folds driver errors into the read
/// category.
fn as_read_error(e: Error) -> Error {
    match e {
        Error::Read(_) | Error::Write(_) | Error::Timeout(_) => e,
        other => Error::read(other),
    }
}

/// Keeps already-categorized errors, folds driver errors into the write
/// category.
fn as_write_error(e: Error) -> Error {
    match e {
        Error::Read(_) | Error::Write(_) | Error::Timeout(_) => e,
        other => Error::write(other),
    }
}

// =============================================================================
// Actor Thread
// =============================================================================

/// Spawns the dedicated connection thread and waits for the open handshake.
async fn spawn_actor(path: PathBuf, wal_mode: bool) -> Result<mpsc::Sender<TableRequest>> {
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

    std::thread::Builder::new()
        .name("shaledb-table".to_string())
        .spawn(move || {
            let conn = match open_connection(&path, wal_mode) {
                Ok(conn) => {
                    let _ = ready_tx.send(Ok(()));
                    conn
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to create table runtime");
            rt.block_on(run_actor(conn, rx, path));
        })
        .map_err(|e| Error::Write(format!("failed to spawn table thread: {}", e)))?;

    ready_rx
        .await
        .map_err(|_| Error::Write("table thread exited during startup".to_string()))??;

    Ok(tx)
}

/// The actor loop: serves requests until shutdown or destroy.
async fn run_actor(conn: Connection, mut rx: mpsc::Receiver<TableRequest>, path: PathBuf) {
    let mut destroyed = false;

    while let Some(request) = rx.recv().await {
        match request {
            TableRequest::Get { key, reply } => {
                let _ = reply.send(get_row(&conn, &key));
            }
            TableRequest::Set { key, value, reply } => {
                let _ = reply.send(set_row(&conn, &key, &value));
            }
            TableRequest::Delete { key, reply } => {
                let _ = reply.send(delete_row(&conn, &key));
            }
            TableRequest::ReadAll { reply } => {
                let _ = reply.send(read_all_rows(&conn));
            }
            TableRequest::WriteAll { entries, reply } => {
                let _ = reply.send(in_immediate_section(&conn, |conn| {
                    conn.execute(SQL_CLEAR, [])?;
                    upsert_rows(conn, &entries)
                }));
            }
            TableRequest::BatchSet { entries, reply } => {
                let _ = reply.send(in_immediate_section(&conn, |conn| {
                    upsert_rows(conn, &entries)
                }));
            }
            TableRequest::BatchDelete { keys, reply } => {
                let _ = reply.send(in_immediate_section(&conn, |conn| {
                    let mut stmt = conn.prepare_cached(SQL_DELETE)?;
                    for key in &keys {
                        stmt.execute(params![key])?;
                    }
                    Ok(())
                }));
            }
            TableRequest::Scan { out } => {
                run_scan(&conn, out).await;
            }
            TableRequest::QueryPrefix {
                prefix,
                descending,
                limit,
                offset,
                reply,
            } => {
                let _ = reply.send(query_prefix_rows(&conn, &prefix, descending, limit, offset));
            }
            TableRequest::Begin { ops, reply } => {
                run_transaction_session(&conn, ops, reply).await;
            }
            TableRequest::Destroy { reply } => {
                destroyed = true;
                let _ = reply.send(Ok(()));
                break;
            }
            TableRequest::Shutdown => break,
        }
    }

    drop(conn);
    if destroyed {
        remove_sidecars(&path);
    }
}

fn get_row(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare_cached(SQL_GET)?;
    Ok(stmt
        .query_row(params![key], |row| row.get(0))
        .optional()?)
}

fn set_row(conn: &Connection, key: &str, value: &str) -> Result<()> {
    let mut stmt = conn.prepare_cached(SQL_UPSERT)?;
    stmt.execute(params![key, value])?;
    Ok(())
}

fn delete_row(conn: &Connection, key: &str) -> Result<bool> {
    let mut stmt = conn.prepare_cached(SQL_DELETE)?;
    Ok(stmt.execute(params![key])? > 0)
}

fn read_all_rows(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare_cached(SQL_SCAN)?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

fn upsert_rows(conn: &Connection, entries: &[(String, String)]) -> Result<()> {
    let mut stmt = conn.prepare_cached(SQL_UPSERT)?;
    for (key, value) in entries {
        stmt.execute(params![key, value])?;
    }
    Ok(())
}

/// Runs `body` inside `BEGIN IMMEDIATE … COMMIT`, rolling back on error.
fn in_immediate_section(
    conn: &Connection,
    body: impl FnOnce(&Connection) -> Result<()>,
) -> Result<()> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match body(conn) {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn query_prefix_rows(
    conn: &Connection,
    prefix: &str,
    descending: bool,
    limit: Option<usize>,
    offset: usize,
) -> Result<Vec<(String, String)>> {
    let upper = format!("{}{}", prefix, '\u{10FFFF}');
    let order = if descending { "DESC" } else { "ASC" };
    let sql = format!(
        "SELECT key, value FROM data WHERE key >= ?1 AND key < ?2 ORDER BY key {} LIMIT ?3 OFFSET ?4",
        order
    );
    let limit = limit.map_or(-1i64, |l| l as i64);

    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![prefix, upper, limit, offset as i64], |row| {
        Ok((row.get(0)?, row.get(1)?))
    })?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

/// Streams every row into `out`, ending with an error item if iteration
/// fails mid-way.
async fn run_scan(conn: &Connection, out: mpsc::Sender<Result<(String, String)>>) {
    let mut stmt = match conn.prepare_cached(SQL_SCAN) {
        Ok(stmt) => stmt,
        Err(e) => {
            let _ = out.send(Err(Error::Read(e.to_string()))).await;
            return;
        }
    };
    let mut rows = match stmt.query([]) {
        Ok(rows) => rows,
        Err(e) => {
            let _ = out.send(Err(Error::Read(e.to_string()))).await;
            return;
        }
    };

    loop {
        match rows.next() {
            Ok(Some(row)) => {
                let pair: rusqlite::Result<(String, String)> =
                    (|| Ok((row.get(0)?, row.get(1)?)))();
                match pair {
                    Ok(pair) => {
                        if out.send(Ok(pair)).await.is_err() {
                            return; // consumer dropped the stream
                        }
                    }
                    Err(e) => {
                        let _ = out.send(Err(Error::Read(e.to_string()))).await;
                        return;
                    }
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = out.send(Err(Error::Read(e.to_string()))).await;
                return;
            }
        }
    }
}

/// Serves one open atomic section until commit, rollback, or session drop.
async fn run_transaction_session(
    conn: &Connection,
    mut ops: mpsc::Receiver<TxOp>,
    reply: oneshot::Sender<Result<()>>,
) {
    if let Err(e) = conn.execute_batch("BEGIN IMMEDIATE") {
        let _ = reply.send(Err(e.into()));
        return;
    }
    let _ = reply.send(Ok(()));

    let mut finished = false;
    while let Some(op) = ops.recv().await {
        match op {
            TxOp::Get { key, reply } => {
                let _ = reply.send(get_row(conn, &key));
            }
            TxOp::Set { key, value, reply } => {
                let _ = reply.send(set_row(conn, &key, &value));
            }
            TxOp::Delete { key, reply } => {
                let _ = reply.send(delete_row(conn, &key));
            }
            TxOp::Commit { reply } => {
                let result = conn.execute_batch("COMMIT").map_err(Error::from);
                if result.is_err() {
                    let _ = conn.execute_batch("ROLLBACK");
                }
                let _ = reply.send(result);
                finished = true;
                break;
            }
            TxOp::Rollback { reply } => {
                let _ = reply.send(conn.execute_batch("ROLLBACK").map_err(Error::from));
                finished = true;
                break;
            }
        }
    }

    if !finished {
        // Session handle dropped without an explicit end.
        let _ = conn.execute_batch("ROLLBACK");
    }
}

/// Best-effort removal of the WAL sidecar files.
fn remove_sidecars(path: &Path) {
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_os_string();
        sidecar.push(suffix);
        if let Err(e) = std::fs::remove_file(&sidecar) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = ?sidecar, error = %e, "sidecar removal failed");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
