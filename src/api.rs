//! # Async API for ShaleDB
//!
//! This module provides [`ShaleDb`], the public async handle. It wires the
//! cache, the write coalescer, the watcher manager, and the selected backend
//! into one coherent façade and owns the consistency rules between them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        ShaleDb (façade)                         │
//! │                                                                 │
//! │   reads ──► LRU+TTL cache ──miss──► backend                     │
//! │   writes ─► batch coalescer ──flush─► backend ──► cache update  │
//! │   every mutation ──────────────────► watcher fan-out            │
//! │   transactions ─► flush batch ─► backend atomic section         │
//! └────────────────────────────┬────────────────────────────────────┘
//!                              │
//!                ┌─────────────┴─────────────┐
//!                ▼                           ▼
//!        ┌───────────────┐          ┌─────────────────┐
//!        │ document file │          │  SQLite table   │
//!        │    (.json)    │          │ (.db, .sqlite)  │
//!        └───────────────┘          └─────────────────┘
//! ```
//!
//! ## Consistency Rules
//!
//! - **Cache coherence**: a successful write lands in the backend first,
//!   then the cache, so a cached value is always a committed value. Reads
//!   populate the cache on a miss.
//! - **Events after persistence**: watcher events dispatch only after the
//!   mutation is durably in the backend (for batched sets, after the batch
//!   partition committed).
//! - **Timeouts**: each individual backend operation runs under the session
//!   timeout; when `keepConnectionOpen` is off, a timed-out backend is
//!   closed and re-opened.
//!
//! ## Sharing
//!
//! `ShaleDb` is `Clone`, `Send`, and `Sync`; clones share the same
//! underlying store, cache, and watchers.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::FutureExt;
use futures::StreamExt;
use regex::Regex;
use tokio::sync::broadcast;

use crate::backend::{AnyBackend, DocumentBackend, EntryStream, TableBackend};
use crate::backup::{self, BackupInfo, RESTORE_TIMEOUT};
use crate::batch::{BatchCoalescer, BatchExecutor, BatchOp, CoalescerConfig};
use crate::cache::{Cache, CacheStats};
use crate::config::{BackendKind, Options};
use crate::error::{Error, Result};
use crate::query::Query;
use crate::transaction::{self, TransactionHandle};
use crate::value::{validate_key, validate_value, Value};
use crate::watcher::{
    EventKind, WatchEvent, WatcherError, WatcherId, WatcherManager, WatchPattern,
};

// =============================================================================
// Statistics
// =============================================================================

#[derive(Default)]
struct OpCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

/// A point-in-time snapshot of store statistics.
#[derive(Debug, Clone)]
pub struct Stats {
    /// Read operations served (cache hits included).
    pub reads: u64,
    /// Write operations performed.
    pub writes: u64,
    /// Delete operations performed.
    pub deletes: u64,
    /// Cache statistics, when caching is enabled.
    pub cache: Option<CacheStats>,
}

// =============================================================================
// Batch Executor Wiring
// =============================================================================

/// Forwards coalesced partitions to the backend's grouped write.
struct BackendBatchExecutor {
    backend: Arc<AnyBackend>,
}

impl BatchExecutor for BackendBatchExecutor {
    fn execute(&self, ops: Vec<BatchOp>) -> futures::future::BoxFuture<'static, Result<()>> {
        let backend = Arc::clone(&self.backend);
        async move {
            let entries: Vec<(String, Value)> =
                ops.into_iter().map(|op| (op.key, op.value)).collect();
            backend.batch_set(entries).await
        }
        .boxed()
    }
}

// =============================================================================
// ShaleDb
// =============================================================================

struct DbInner {
    backend: Arc<AnyBackend>,
    cache: Option<Arc<Cache>>,
    coalescer: Option<Arc<BatchCoalescer>>,
    watchers: Arc<WatcherManager>,
    options: Options,
    counters: OpCounters,
}

/// The embedded key-value store.
///
/// # Example
///
/// ```rust,ignore
/// use shaledb::{Options, ShaleDb, Value};
///
/// #[tokio::main]
/// async fn main() -> shaledb::Result<()> {
///     let db = ShaleDb::open("data.db", Options::default()).await?;
///
///     db.set("user:1", Value::object([("name", Value::from("Nadia"))])).await?;
///     let user = db.get("user:1").await?;
///     println!("{:?}", user);
///
///     db.destroy(true).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ShaleDb {
    inner: Arc<DbInner>,
}

impl ShaleDb {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Opens (or creates) a store at `path` with the given options.
    ///
    /// The file extension selects the backend: `.json` for the document
    /// file, `.db`/`.sqlite` for the SQLite table.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for bad filenames or option values;
    /// [`Error::Write`] with a "Connection failed" message when the backend
    /// cannot be opened.
    pub async fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let path = path.as_ref();
        options.validate()?;

        let backend = match BackendKind::for_path(path)? {
            BackendKind::Document => {
                AnyBackend::Document(DocumentBackend::new(path))
            }
            BackendKind::Table => {
                AnyBackend::Table(TableBackend::new(path, options.wal_mode))
            }
        };
        backend
            .connect()
            .await
            .map_err(|e| Error::Write(format!("Connection failed: {}", e)))?;
        let backend = Arc::new(backend);

        let cache = if options.cache {
            let cache = Arc::new(Cache::new(
                options.cache_size,
                options.cache_max_memory_bytes(),
                options.cache_ttl(),
            ));
            Cache::spawn_sweeper(&cache);
            Some(cache)
        } else {
            None
        };

        let coalescer = if options.batch {
            let config = CoalescerConfig {
                max_batch_size: options.batch_size,
                max_wait: options.batch_delay(),
                operation_timeout: options.operation_timeout(),
                max_queue_size: options.batch_size * 100,
                ..CoalescerConfig::default()
            };
            let executor = Arc::new(BackendBatchExecutor {
                backend: Arc::clone(&backend),
            });
            Some(BatchCoalescer::new(config, executor))
        } else {
            None
        };

        Ok(Self {
            inner: Arc::new(DbInner {
                backend,
                cache,
                coalescer,
                watchers: Arc::new(WatcherManager::new()),
                options,
                counters: OpCounters::default(),
            }),
        })
    }

    pub(crate) fn backend_ref(&self) -> &AnyBackend {
        &self.inner.backend
    }

    /// Runs a backend operation under the session timeout, re-opening the
    /// backend afterwards when the connection policy asks for it.
    async fn with_timeout<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let budget = self.inner.options.session_timeout();
        match tokio::time::timeout(budget, operation).await {
            Ok(result) => result,
            Err(_) => {
                if !self.inner.options.keep_connection_open {
                    if let Err(e) = self.inner.backend.reconnect().await {
                        tracing::warn!(error = %e, "backend re-open after timeout failed");
                    }
                }
                Err(Error::Timeout(budget))
            }
        }
    }

    /// Persists one value (through the coalescer when batching is enabled)
    /// and updates the cache. Dispatches no event: callers own that.
    async fn write_value(&self, key: &str, value: &Value) -> Result<()> {
        self.inner.counters.writes.fetch_add(1, Ordering::Relaxed);

        if let Some(coalescer) = &self.inner.coalescer {
            let completion = coalescer
                .enqueue(BatchOp {
                    key: key.to_string(),
                    value: value.clone(),
                })
                .await?;
            completion
                .await
                .map_err(|_| Error::Write("write batch was cancelled".to_string()))?
                .map_err(|e| e.into_error())?;
        } else {
            self.with_timeout(self.inner.backend.set_value(key, value))
                .await?;
        }

        if let Some(cache) = &self.inner.cache {
            cache.set(key, value.clone(), None);
        }
        Ok(())
    }

    fn notify(&self, event: EventKind, key: &str, value: Value, old_value: Option<Value>) {
        self.inner.watchers.notify(event, key, value, old_value);
    }

    // =========================================================================
    // Primitive Reads
    // =========================================================================

    /// Reads a key. `Ok(None)` means absent.
    ///
    /// Cache-first: a hit never touches the backend; a miss reads the
    /// backend and populates the cache.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;
        self.inner.counters.reads.fetch_add(1, Ordering::Relaxed);

        if let Some(cache) = &self.inner.cache {
            if let Some(hit) = cache.get(key) {
                return Ok(Some(hit));
            }
        }

        let value = self
            .with_timeout(self.inner.backend.get_value(key))
            .await?;
        if let (Some(cache), Some(value)) = (&self.inner.cache, &value) {
            cache.set(key, value.clone(), None);
        }
        Ok(value)
    }

    /// Reads a key, returning `default` when absent.
    pub async fn get_or(&self, key: &str, default: impl Into<Value>) -> Result<Value> {
        Ok(self.get(key).await?.unwrap_or_else(|| default.into()))
    }

    /// Cache-first existence check.
    pub async fn has(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        if let Some(cache) = &self.inner.cache {
            if cache.has(key) {
                return Ok(true);
            }
        }
        Ok(self
            .with_timeout(self.inner.backend.get_value(key))
            .await?
            .is_some())
    }

    // =========================================================================
    // Primitive Writes
    // =========================================================================

    /// Writes a key.
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        validate_key(key)?;
        validate_value(&value)?;

        let old_value = self.inner.cache.as_ref().and_then(|c| c.peek(key));
        self.write_value(key, &value).await?;
        self.notify(EventKind::Set, key, value, old_value);
        Ok(())
    }

    /// Appends to the array at `key`, creating it when absent.
    ///
    /// # Errors
    ///
    /// [`Error::NotArray`] when the current value exists and is not an
    /// array; the backend is not touched in that case.
    pub async fn push(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        validate_key(key)?;
        validate_value(&value)?;

        let current = self.get(key).await?;
        let mut items = match current {
            None => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(Error::NotArray {
                    key: key.to_string(),
                })
            }
        };
        let old_value = (!items.is_empty()).then(|| Value::Array(items.clone()));
        items.push(value);

        let new_value = Value::Array(items);
        self.write_value(key, &new_value).await?;
        self.notify(EventKind::Push, key, new_value, old_value);
        Ok(())
    }

    /// Removes every occurrence strictly equal to `value` from the array at
    /// `key`.
    ///
    /// # Errors
    ///
    /// [`Error::NotArray`] when the current value is absent or not an array.
    pub async fn pull(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        validate_key(key)?;

        let current = self.get(key).await?;
        let Some(Value::Array(items)) = current else {
            return Err(Error::NotArray {
                key: key.to_string(),
            });
        };
        let old_value = Value::Array(items.clone());
        let remaining: Vec<Value> = items.into_iter().filter(|item| item != &value).collect();

        let new_value = Value::Array(remaining);
        self.write_value(key, &new_value).await?;
        self.notify(EventKind::Pull, key, new_value, Some(old_value));
        Ok(())
    }

    /// Deletes a key. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.inner.counters.deletes.fetch_add(1, Ordering::Relaxed);

        let old_value = match self.inner.cache.as_ref().and_then(|c| c.peek(key)) {
            Some(cached) => Some(cached),
            None => {
                self.with_timeout(self.inner.backend.get_value(key))
                    .await?
            }
        };

        let existed = self
            .with_timeout(self.inner.backend.delete_value(key))
            .await?;
        if let Some(cache) = &self.inner.cache {
            cache.delete(key);
        }
        self.notify(EventKind::Delete, key, Value::Undefined, old_value);
        Ok(existed)
    }

    // =========================================================================
    // Numeric Operations
    // =========================================================================

    /// Adds `amount` to the number at `key` (absent counts as 0) and
    /// returns the new value.
    ///
    /// Not linearizable under concurrency: the read and the write are
    /// separate steps. Use a transaction when increments must not race.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidNumber`] for a non-finite amount or a non-numeric
    /// current value; the backend is not touched in that case.
    pub async fn add(&self, key: &str, amount: f64) -> Result<f64> {
        self.apply_numeric(key, amount, EventKind::Add).await
    }

    /// Subtracts `amount` from the number at `key` (absent counts as 0) and
    /// returns the new value. Shares `add`'s concurrency caveat.
    pub async fn subtract(&self, key: &str, amount: f64) -> Result<f64> {
        self.apply_numeric(key, -amount, EventKind::Subtract).await
    }

    async fn apply_numeric(&self, key: &str, delta: f64, event: EventKind) -> Result<f64> {
        validate_key(key)?;
        if !delta.is_finite() {
            return Err(Error::InvalidNumber {
                key: key.to_string(),
            });
        }

        let current = self.get(key).await?;
        let current_number = match current {
            None => 0.0,
            Some(Value::Number(n)) if n.is_finite() => n,
            Some(_) => {
                return Err(Error::InvalidNumber {
                    key: key.to_string(),
                })
            }
        };

        let next = current_number + delta;
        self.write_value(key, &Value::Number(next)).await?;
        self.notify(
            event,
            key,
            Value::Number(next),
            Some(Value::Number(current_number)),
        );
        Ok(next)
    }

    // =========================================================================
    // Bulk Operations
    // =========================================================================

    /// Writes many entries through the backend's grouped primitive.
    pub async fn bulk_set(&self, entries: Vec<(String, Value)>) -> Result<()> {
        for (key, value) in &entries {
            validate_key(key)?;
            validate_value(value)?;
        }
        self.inner
            .counters
            .writes
            .fetch_add(entries.len() as u64, Ordering::Relaxed);

        let old_values: Vec<Option<Value>> = entries
            .iter()
            .map(|(key, _)| self.inner.cache.as_ref().and_then(|c| c.peek(key)))
            .collect();

        self.with_timeout(self.inner.backend.batch_set(entries.clone()))
            .await?;

        for ((key, value), old_value) in entries.into_iter().zip(old_values) {
            if let Some(cache) = &self.inner.cache {
                cache.set(&key, value.clone(), None);
            }
            self.notify(EventKind::Set, &key, value, old_value);
        }
        Ok(())
    }

    /// Deletes many keys through the backend's grouped primitive.
    pub async fn bulk_delete(&self, keys: Vec<String>) -> Result<()> {
        for key in &keys {
            validate_key(key)?;
        }
        self.inner
            .counters
            .deletes
            .fetch_add(keys.len() as u64, Ordering::Relaxed);

        let old_values: Vec<Option<Value>> = keys
            .iter()
            .map(|key| self.inner.cache.as_ref().and_then(|c| c.peek(key)))
            .collect();

        self.with_timeout(self.inner.backend.batch_delete(keys.clone()))
            .await?;

        for (key, old_value) in keys.into_iter().zip(old_values) {
            if let Some(cache) = &self.inner.cache {
                cache.delete(&key);
            }
            self.notify(EventKind::Delete, &key, Value::Undefined, old_value);
        }
        Ok(())
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Streams every entry in key order.
    pub async fn stream(&self) -> Result<EntryStream> {
        self.inner.backend.stream_entries().await
    }

    /// Returns the keys matching a regex.
    pub async fn find_keys(&self, pattern: &Regex) -> Result<Vec<String>> {
        let mut stream = self.stream().await?;
        let mut keys = Vec::new();
        while let Some(entry) = stream.next().await {
            let (key, _) = entry?;
            if pattern.is_match(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Returns the keys starting with a prefix.
    pub async fn starts_with(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stream = self.stream().await?;
        let mut keys = Vec::new();
        while let Some(entry) = stream.next().await {
            let (key, _) = entry?;
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Reads every entry, decoded, in key order.
    pub async fn get_all(&self) -> Result<Vec<(String, Value)>> {
        let mut stream = self.stream().await?;
        let mut entries = Vec::new();
        while let Some(entry) = stream.next().await {
            entries.push(entry?);
        }
        Ok(entries)
    }

    /// Returns every key, in key order.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut stream = self.stream().await?;
        let mut keys = Vec::new();
        while let Some(entry) = stream.next().await {
            keys.push(entry?.0);
        }
        Ok(keys)
    }

    /// Returns every value, in key order.
    pub async fn values(&self) -> Result<Vec<Value>> {
        let mut stream = self.stream().await?;
        let mut values = Vec::new();
        while let Some(entry) = stream.next().await {
            values.push(entry?.1);
        }
        Ok(values)
    }

    /// Current entry count.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.get_all().await?.len())
    }

    /// True when the store holds no entries.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Starts a query over the store.
    pub fn query(&self) -> Query<'_> {
        Query::new(self)
    }

    // =========================================================================
    // Whole-Store Operations
    // =========================================================================

    /// Removes every entry.
    pub async fn clear(&self) -> Result<()> {
        self.with_timeout(self.inner.backend.write_all(BTreeMap::new()))
            .await?;
        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
        self.notify(EventKind::Clear, "", Value::Undefined, None);
        Ok(())
    }

    /// Flushes any pending write batch.
    pub async fn flush(&self) -> Result<()> {
        if let Some(coalescer) = &self.inner.coalescer {
            coalescer.flush().await;
        }
        Ok(())
    }

    /// Tears the store down: flushes (or drops) pending writes, destroys the
    /// cache, clears watchers, and closes the backend.
    pub async fn destroy(&self, flush: bool) -> Result<()> {
        if let Some(coalescer) = &self.inner.coalescer {
            if flush {
                coalescer.flush().await;
            } else {
                coalescer.clear();
            }
        }
        if let Some(cache) = &self.inner.cache {
            cache.destroy();
        }
        self.inner.watchers.clear();
        self.inner.backend.destroy().await
    }

    // =========================================================================
    // Watchers
    // =========================================================================

    /// Registers a watcher for keys matching `pattern`.
    ///
    /// Literal patterns match exactly; `*` globs; a `Regex` matches keys
    /// directly. The callback runs synchronously after each matching
    /// mutation; its errors are isolated and counted toward auto-disable.
    pub fn watch<F>(&self, pattern: impl Into<WatchPattern>, callback: F) -> Result<WatcherId>
    where
        F: Fn(&WatchEvent) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.inner.watchers.watch(pattern, Arc::new(callback))
    }

    /// Removes a watcher.
    pub fn unwatch(&self, id: WatcherId) -> bool {
        self.inner.watchers.unwatch(id)
    }

    /// Removes every watcher.
    pub fn clear_watchers(&self) {
        self.inner.watchers.clear();
    }

    /// Number of registered watchers.
    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.count()
    }

    /// Subscribes to the global mutation event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.watchers.subscribe_events()
    }

    /// Subscribes to out-of-band watcher error reports.
    pub fn error_events(&self) -> broadcast::Receiver<WatcherError> {
        self.inner.watchers.subscribe_errors()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Runs `body` inside a backend-level atomic section.
    ///
    /// All of the body's `set`/`delete` operations commit together or not at
    /// all, in both the backend and the cache. Requires a backend that
    /// supports transactions (the table backend).
    ///
    /// The atomic section has exclusive use of the backend connection:
    /// inside `body`, read and write through the [`TransactionHandle`] only.
    /// Calling the store's own operations from within the body would wait on
    /// a connection the transaction is holding.
    pub async fn transaction<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(TransactionHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        transaction::run(
            &self.inner.backend,
            self.inner.cache.clone(),
            self.inner.coalescer.as_ref(),
            body,
        )
        .await
    }

    // =========================================================================
    // Backup & Restore
    // =========================================================================

    /// Writes a streaming snapshot of the store to `path`.
    ///
    /// Pending batched writes are flushed first. Returns the entry count.
    pub async fn backup(&self, path: impl AsRef<Path>) -> Result<u64> {
        self.flush().await?;
        backup::write_backup(&self.inner.backend, path.as_ref()).await
    }

    /// Restores a snapshot from `path`, replacing current contents, or
    /// unioning over them when `merge` is set (incoming entries win).
    ///
    /// Validates the envelope before writing anything, clears the cache
    /// afterwards, and honors a 5-minute timeout.
    pub async fn restore(&self, path: impl AsRef<Path>, merge: bool) -> Result<u64> {
        self.flush().await?;
        let restored = tokio::time::timeout(
            RESTORE_TIMEOUT,
            backup::restore_backup(&self.inner.backend, path.as_ref(), merge),
        )
        .await
        .map_err(|_| Error::Timeout(RESTORE_TIMEOUT))??;

        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
        Ok(restored)
    }

    /// Lists the valid backup files in a directory, newest first.
    pub async fn list_backups(&self, dir: impl AsRef<Path>) -> Result<Vec<BackupInfo>> {
        backup::list_backups(dir.as_ref()).await
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Snapshot of operation counters and cache statistics.
    pub fn stats(&self) -> Stats {
        Stats {
            reads: self.inner.counters.reads.load(Ordering::Relaxed),
            writes: self.inner.counters.writes.load(Ordering::Relaxed),
            deletes: self.inner.counters.deletes.load(Ordering::Relaxed),
            cache: self.inner.cache.as_ref().map(|c| c.stats()),
        }
    }

    /// Zeroes the operation counters and the cache counters.
    pub fn reset_stats(&self) {
        self.inner.counters.reads.store(0, Ordering::Relaxed);
        self.inner.counters.writes.store(0, Ordering::Relaxed);
        self.inner.counters.deletes.store(0, Ordering::Relaxed);
        if let Some(cache) = &self.inner.cache {
            cache.reset_stats();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_document_db(dir: &tempfile::TempDir) -> ShaleDb {
        // Batching off in unit tests so single sets do not wait out the
        // batch deadline; the coalescer has its own tests.
        let options = Options {
            batch: false,
            ..Options::default()
        };
        ShaleDb::open(dir.path().join("store.json"), options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_rejects_bad_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = ShaleDb::open(dir.path().join("store.txt"), Options::default()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_open_rejects_bad_options() {
        let dir = tempfile::TempDir::new().unwrap();
        let options = Options {
            cache_size: 0,
            ..Options::default()
        };
        let result = ShaleDb::open(dir.path().join("store.json"), options).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_connection_failure_message() {
        let result = ShaleDb::open("/no/such/dir/at/all/store.db", Options::default()).await;
        assert!(matches!(
            result,
            Err(Error::Write(ref m)) if m.contains("Connection failed")
        ));
    }

    #[tokio::test]
    async fn test_get_set_delete_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = open_document_db(&dir).await;

        db.set("x", 1).await.unwrap();
        assert_eq!(db.get("x").await.unwrap(), Some(Value::Number(1.0)));
        assert_eq!(db.get_or("y", 42).await.unwrap(), Value::Number(42.0));
        assert!(db.has("x").await.unwrap());

        assert!(db.delete("x").await.unwrap());
        assert_eq!(db.get("x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_push_and_pull() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = open_document_db(&dir).await;

        db.push("list", 1).await.unwrap();
        db.push("list", 2).await.unwrap();
        db.push("list", 1).await.unwrap();
        assert_eq!(
            db.get("list").await.unwrap(),
            Some(Value::Array(vec![
                Value::from(1),
                Value::from(2),
                Value::from(1)
            ]))
        );

        db.pull("list", 1).await.unwrap();
        assert_eq!(
            db.get("list").await.unwrap(),
            Some(Value::Array(vec![Value::from(2)]))
        );
    }

    #[tokio::test]
    async fn test_push_rejects_non_array() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = open_document_db(&dir).await;

        db.set("scalar", 7).await.unwrap();
        assert!(matches!(
            db.push("scalar", 1).await,
            Err(Error::NotArray { .. })
        ));
        // Pull on an absent key is also a shape error.
        assert!(matches!(
            db.pull("missing", 1).await,
            Err(Error::NotArray { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_and_subtract() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = open_document_db(&dir).await;

        assert_eq!(db.add("n", 5.0).await.unwrap(), 5.0);
        assert_eq!(db.add("n", 2.5).await.unwrap(), 7.5);
        assert_eq!(db.subtract("n", 0.5).await.unwrap(), 7.0);

        assert!(matches!(
            db.add("n", f64::INFINITY).await,
            Err(Error::InvalidNumber { .. })
        ));
        db.set("s", "text").await.unwrap();
        assert!(matches!(
            db.add("s", 1.0).await,
            Err(Error::InvalidNumber { .. })
        ));
    }

    #[tokio::test]
    async fn test_key_scans() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = open_document_db(&dir).await;

        db.set("user:1", 1).await.unwrap();
        db.set("user:2", 2).await.unwrap();
        db.set("order:1", 3).await.unwrap();

        let users = db.starts_with("user:").await.unwrap();
        assert_eq!(users, vec!["user:1", "user:2"]);

        let found = db
            .find_keys(&Regex::new(r":\d$").unwrap())
            .await
            .unwrap();
        assert_eq!(found.len(), 3);

        assert_eq!(db.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_clear_empties_store_and_cache() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = open_document_db(&dir).await;

        db.set("a", 1).await.unwrap();
        db.clear().await.unwrap();

        assert!(db.is_empty().await.unwrap());
        assert_eq!(db.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stats_track_operations() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = open_document_db(&dir).await;

        db.set("a", 1).await.unwrap();
        db.get("a").await.unwrap();
        db.get("missing").await.unwrap();
        db.delete("a").await.unwrap();

        let stats = db.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.deletes, 1);
        let cache = stats.cache.unwrap();
        assert_eq!(cache.hits, 1);

        db.reset_stats();
        let stats = db.stats();
        assert_eq!(stats.writes, 0);
        assert_eq!(stats.cache.unwrap().hits, 0);
    }

    #[tokio::test]
    async fn test_cached_read_skips_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = open_document_db(&dir).await;

        db.set("k", 1).await.unwrap();

        // Remove the file behind the store's back; the cache still answers.
        std::fs::remove_file(dir.path().join("store.json")).unwrap();
        assert_eq!(db.get("k").await.unwrap(), Some(Value::Number(1.0)));
    }

    #[tokio::test]
    async fn test_validation_happens_before_io() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = open_document_db(&dir).await;

        assert!(matches!(db.set("bad;key", 1).await, Err(Error::InvalidKey(_))));
        assert!(matches!(
            db.set("ok", Value::Undefined).await,
            Err(Error::InvalidValue(_))
        ));
        assert!(db.is_empty().await.unwrap());
    }
}
