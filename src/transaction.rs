//! # Transaction Engine
//!
//! Atomic multi-operation commits with cache reconciliation. A transaction
//! runs the caller's async closure against a [`TransactionHandle`] whose
//! `get`/`set`/`delete` execute prepared statements inside a backend-level
//! `BEGIN IMMEDIATE` atomic section.
//!
//! ## Protocol
//!
//! 1. Flush any pending write batch (so the section sees current state).
//! 2. Refuse backends that report `supports_transactions = false`.
//! 3. Open the atomic section with immediate write-intent acquisition.
//! 4. Run the caller's closure. Every `set`/`delete` is journaled, and the
//!    first touch of a key snapshots its pre-transaction cache entry.
//! 5. On success: commit, then replay the journal into the cache.
//! 6. On failure (closure error or commit error): roll back, restore the
//!    cache from the snapshots, and re-raise as a transaction error.
//!
//! The result is all-or-nothing across BOTH stores: backend and cache agree
//! whether the transaction happened.
//!
//! ## Reads Inside the Section
//!
//! `get` consults the transaction's working overlay first (so a transaction
//! reads its own writes), then the backend through the open section. The
//! cache is deliberately NOT consulted: the section's isolation guarantees
//! come from the backend, and a cache hit would bypass them.
//!
//! ## Isolation
//!
//! Whatever the backend's immediate section provides. With the table
//! backend's single connection thread, concurrent transactions serialize:
//! the second waits until the first commits or rolls back. Transactions do
//! not nest.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::backend::{AnyBackend, TransactionSession};
use crate::batch::BatchCoalescer;
use crate::cache::Cache;
use crate::codec;
use crate::error::{Error, Result};
use crate::value::{validate_key, validate_value, Value};

// =============================================================================
// Journal
// =============================================================================

enum JournalEntry {
    Set { key: String, value: Value },
    Delete { key: String },
}

#[derive(Default)]
struct Journal {
    /// Mutations in execution order, replayed into the cache on commit.
    entries: Vec<JournalEntry>,
    /// Read-your-writes overlay: `Some` = written, `None` = deleted.
    working: HashMap<String, Option<Value>>,
    /// First-touch snapshot of affected cache entries; `None` = was absent.
    cache_backup: HashMap<String, Option<Value>>,
}

// =============================================================================
// Transaction Handle
// =============================================================================

/// The caller's view of an open transaction.
///
/// Cloneable so the closure can move it into helper futures; all clones
/// share the same journal and atomic section.
#[derive(Clone)]
pub struct TransactionHandle {
    session: Arc<TransactionSession>,
    journal: Arc<Mutex<Journal>>,
    cache: Option<Arc<Cache>>,
}

impl TransactionHandle {
    /// Reads a key inside the atomic section.
    ///
    /// Sees this transaction's own earlier writes. `Ok(None)` means absent.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;

        if let Some(overlay) = self
            .journal
            .lock()
            .expect("journal lock")
            .working
            .get(key)
            .cloned()
        {
            return Ok(overlay);
        }

        let row = self.session.get(key).await?;
        Ok(row.map(|encoded| codec::decode(&encoded)))
    }

    /// Writes a key inside the atomic section.
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        validate_key(key)?;
        validate_value(&value)?;
        let encoded = codec::encode(&value)?;

        self.backup_cache_entry(key);
        self.session.set(key, encoded).await?;

        let mut journal = self.journal.lock().expect("journal lock");
        journal.entries.push(JournalEntry::Set {
            key: key.to_string(),
            value: value.clone(),
        });
        journal.working.insert(key.to_string(), Some(value));
        Ok(())
    }

    /// Deletes a key inside the atomic section.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        self.backup_cache_entry(key);
        let existed = self.session.delete(key).await?;

        let mut journal = self.journal.lock().expect("journal lock");
        journal.entries.push(JournalEntry::Delete {
            key: key.to_string(),
        });
        journal.working.insert(key.to_string(), None);
        Ok(existed)
    }

    /// Snapshots the pre-transaction cache entry for `key`, once.
    fn backup_cache_entry(&self, key: &str) {
        let Some(cache) = &self.cache else { return };
        let mut journal = self.journal.lock().expect("journal lock");
        if !journal.cache_backup.contains_key(key) {
            journal
                .cache_backup
                .insert(key.to_string(), cache.peek(key));
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Runs a transaction end to end. Called by the façade.
pub(crate) async fn run<F, Fut, T>(
    backend: &AnyBackend,
    cache: Option<Arc<Cache>>,
    coalescer: Option<&Arc<BatchCoalescer>>,
    body: F,
) -> Result<T>
where
    F: FnOnce(TransactionHandle) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if let Some(coalescer) = coalescer {
        coalescer.flush().await;
    }

    if !backend.supports_transactions() {
        return Err(Error::Transaction(
            "this backend does not support transactions".to_string(),
        ));
    }

    let session = Arc::new(backend.begin_transaction().await?);
    let handle = TransactionHandle {
        session: Arc::clone(&session),
        journal: Arc::new(Mutex::new(Journal::default())),
        cache,
    };
    let journal = Arc::clone(&handle.journal);
    let cache = handle.cache.clone();

    match body(handle).await {
        Ok(value) => match session.commit().await {
            Ok(()) => {
                apply_journal_to_cache(&journal, cache.as_deref());
                Ok(value)
            }
            Err(commit_err) => {
                restore_cache_from_backup(&journal, cache.as_deref());
                Err(Error::Transaction(format!(
                    "commit failed: {}",
                    commit_err
                )))
            }
        },
        Err(body_err) => {
            if let Err(rollback_err) = session.rollback().await {
                tracing::warn!(error = %rollback_err, "transaction rollback failed");
            }
            restore_cache_from_backup(&journal, cache.as_deref());
            Err(Error::Transaction(body_err.to_string()))
        }
    }
}

/// Replays committed mutations into the cache.
fn apply_journal_to_cache(journal: &Mutex<Journal>, cache: Option<&Cache>) {
    let Some(cache) = cache else { return };
    let journal = journal.lock().expect("journal lock");
    for entry in &journal.entries {
        match entry {
            JournalEntry::Set { key, value } => cache.set(key, value.clone(), None),
            JournalEntry::Delete { key } => {
                cache.delete(key);
            }
        }
    }
}

/// Restores affected cache entries to their pre-transaction state.
fn restore_cache_from_backup(journal: &Mutex<Journal>, cache: Option<&Cache>) {
    let Some(cache) = cache else { return };
    let journal = journal.lock().expect("journal lock");
    for (key, previous) in &journal.cache_backup {
        match previous {
            Some(value) => cache.set(key, value.clone(), None),
            None => {
                cache.delete(key);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, DocumentBackend, TableBackend};
    use std::time::Duration;

    async fn table_backend(name: &str) -> (tempfile::TempDir, AnyBackend) {
        let dir = tempfile::TempDir::new().expect("create temp dir");
        let backend = TableBackend::new(dir.path().join(name), true);
        backend.connect().await.expect("connect");
        (dir, AnyBackend::Table(backend))
    }

    fn test_cache() -> Arc<Cache> {
        Arc::new(Cache::new(100, usize::MAX, None))
    }

    #[tokio::test]
    async fn test_commit_applies_to_backend_and_cache() {
        let (_dir, backend) = table_backend("tx.db").await;
        let cache = test_cache();

        run(&backend, Some(Arc::clone(&cache)), None, |tx| async move {
            tx.set("a", 1).await?;
            tx.set("b", 2).await?;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(
            backend.get_value("a").await.unwrap(),
            Some(Value::Number(1.0))
        );
        assert_eq!(cache.peek("a"), Some(Value::Number(1.0)));
        assert_eq!(cache.peek("b"), Some(Value::Number(2.0)));
    }

    #[tokio::test]
    async fn test_body_error_rolls_back_backend_and_cache() {
        let (_dir, backend) = table_backend("tx.db").await;
        let cache = test_cache();

        backend.set_value("a", &Value::from(100)).await.unwrap();
        cache.set("a", Value::from(100), None);

        let result: Result<()> =
            run(&backend, Some(Arc::clone(&cache)), None, |tx| async move {
                tx.set("a", 0).await?;
                tx.set("fresh", 1).await?;
                Err(Error::InvalidValue("insufficient funds".to_string()))
            })
            .await;

        assert!(matches!(
            result,
            Err(Error::Transaction(ref m)) if m.contains("insufficient funds")
        ));
        assert_eq!(
            backend.get_value("a").await.unwrap(),
            Some(Value::Number(100.0))
        );
        assert_eq!(backend.get_value("fresh").await.unwrap(), None);
        assert_eq!(cache.peek("a"), Some(Value::Number(100.0)));
        assert_eq!(cache.peek("fresh"), None);
    }

    #[tokio::test]
    async fn test_reads_own_writes() {
        let (_dir, backend) = table_backend("tx.db").await;

        run(&backend, None, None, |tx| async move {
            tx.set("k", 41).await?;
            let seen = tx.get("k").await?;
            assert_eq!(seen, Some(Value::Number(41.0)));

            tx.delete("k").await?;
            assert_eq!(tx.get("k").await?, None);

            tx.set("k", 42).await?;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(
            backend.get_value("k").await.unwrap(),
            Some(Value::Number(42.0))
        );
    }

    #[tokio::test]
    async fn test_unsupported_backend_refused() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = AnyBackend::Document(DocumentBackend::new(dir.path().join("doc.json")));
        backend.connect().await.unwrap();

        let result: Result<()> = run(&backend, None, None, |_tx| async move { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Transaction(_))));
    }

    #[tokio::test]
    async fn test_concurrent_transactions_serialize() {
        let (_dir, backend) = table_backend("tx.db").await;
        let backend = Arc::new(backend);
        backend.set_value("n", &Value::from(0)).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let backend = Arc::clone(&backend);
            tasks.push(tokio::spawn(async move {
                run(&backend, None, None, |tx| async move {
                    let current = tx
                        .get("n")
                        .await?
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    tx.set("n", current + 1.0).await?;
                    Ok(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Serialized sections: every increment observed the previous one.
        assert_eq!(
            backend.get_value("n").await.unwrap(),
            Some(Value::Number(4.0))
        );
    }

    #[tokio::test]
    async fn test_validation_inside_transaction() {
        let (_dir, backend) = table_backend("tx.db").await;

        let result: Result<()> = run(&backend, None, None, |tx| async move {
            tx.set("bad;key", 1).await?;
            Ok(())
        })
        .await;

        // The validation error surfaces wrapped as a transaction error and
        // nothing was committed.
        assert!(matches!(result, Err(Error::Transaction(_))));
        assert_eq!(backend.get_value("bad;key").await.unwrap(), None);
    }
}
