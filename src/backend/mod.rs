//! # Backend Abstraction
//!
//! This module defines the minimal contract the two persistence backends
//! uphold, and the dispatch type the façade holds.
//!
//! ## The Contract
//!
//! A backend persists a `key → encoded value` mapping and supports point
//! reads/writes, grouped writes, an atomic full-state replace, and a lazy
//! key-ordered entry scan. Transaction support is optional: the table
//! backend reports it, the document backend does not, and the transaction
//! engine checks the flag before doing anything.
//!
//! ## Dispatch
//!
//! [`Backend`] uses async methods, which keeps the contract explicit but
//! rules out `dyn` dispatch; [`AnyBackend`] is the concrete enum the façade
//! stores, delegating each call to the selected variant. The variant is
//! chosen once, from the database filename's extension.
//!
//! ## Streaming and Decode Failures
//!
//! [`EntryStream`] yields `(key, value)` pairs in key order. Values decode
//! through the codec as they are pulled; a value that fails to decode is
//! yielded as its raw encoded text (logged, stream continues), while an
//! iteration-level failure ends the stream with a read error.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::codec;
use crate::error::Result;
use crate::value::Value;

pub mod document;
pub mod table;

pub use document::DocumentBackend;
pub use table::{TableBackend, TransactionSession};

/// Channel capacity between a backend's scan producer and [`EntryStream`].
const STREAM_CHANNEL_SIZE: usize = 256;

// =============================================================================
// Backend Contract
// =============================================================================

/// The minimal contract a persistence backend upholds.
///
/// All mutating operations are atomic at their own granularity: a point
/// write is atomic, a grouped write commits or fails as a unit, and
/// `write_all` replaces the entire state atomically.
pub trait Backend {
    /// Establishes the connection (opens files, spawns the driver).
    async fn connect(&self) -> Result<()>;

    /// Point read. `Ok(None)` means the key is absent.
    async fn get_value(&self, key: &str) -> Result<Option<Value>>;

    /// Point upsert.
    async fn set_value(&self, key: &str, value: &Value) -> Result<()>;

    /// Point delete. Returns whether the key existed.
    async fn delete_value(&self, key: &str) -> Result<bool>;

    /// Reads the whole store, decoded, in key order.
    async fn read_all(&self) -> Result<BTreeMap<String, Value>>;

    /// Atomically replaces the whole store with `entries` (encoded form).
    async fn write_all(&self, entries: BTreeMap<String, JsonValue>) -> Result<()>;

    /// Grouped upsert; commits or fails as a unit.
    async fn batch_set(&self, entries: Vec<(String, Value)>) -> Result<()>;

    /// Grouped delete; commits or fails as a unit.
    async fn batch_delete(&self, keys: Vec<String>) -> Result<()>;

    /// Lazy key-ordered scan of every entry.
    async fn stream_entries(&self) -> Result<EntryStream>;

    /// Whether [`crate::ShaleDb::transaction`] can run on this backend.
    fn supports_transactions(&self) -> bool;

    /// Tears the backend down (closes the driver, removes sidecar files).
    async fn destroy(&self) -> Result<()>;
}

// =============================================================================
// Entry Stream
// =============================================================================

/// A lazy stream of `(key, value)` entries in key order.
///
/// Decoding happens as items are pulled. Malformed values come through as
/// raw text rather than ending the stream.
pub struct EntryStream {
    rx: mpsc::Receiver<Result<(String, String)>>,
}

impl EntryStream {
    pub(crate) fn new(rx: mpsc::Receiver<Result<(String, String)>>) -> Self {
        Self { rx }
    }
}

impl Stream for EntryStream {
    type Item = Result<(String, Value)>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok((key, encoded)))) => {
                let value = decode_logged(&key, &encoded);
                Poll::Ready(Some(Ok((key, value))))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Decodes an encoded value, logging and yielding the raw text on failure.
pub(crate) fn decode_logged(key: &str, encoded: &str) -> Value {
    match serde_json::from_str::<JsonValue>(encoded) {
        Ok(json) => codec::from_json(&json),
        Err(e) => {
            tracing::warn!(key, error = %e, "value failed to decode; yielding raw text");
            Value::String(encoded.to_string())
        }
    }
}

// =============================================================================
// Concrete Dispatch
// =============================================================================

/// The backend actually selected for a database file.
pub enum AnyBackend {
    /// Whole-map JSON document file.
    Document(DocumentBackend),
    /// SQLite table file.
    Table(TableBackend),
}

impl AnyBackend {
    pub async fn connect(&self) -> Result<()> {
        match self {
            AnyBackend::Document(b) => b.connect().await,
            AnyBackend::Table(b) => b.connect().await,
        }
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<Value>> {
        match self {
            AnyBackend::Document(b) => b.get_value(key).await,
            AnyBackend::Table(b) => b.get_value(key).await,
        }
    }

    pub async fn set_value(&self, key: &str, value: &Value) -> Result<()> {
        match self {
            AnyBackend::Document(b) => b.set_value(key, value).await,
            AnyBackend::Table(b) => b.set_value(key, value).await,
        }
    }

    pub async fn delete_value(&self, key: &str) -> Result<bool> {
        match self {
            AnyBackend::Document(b) => b.delete_value(key).await,
            AnyBackend::Table(b) => b.delete_value(key).await,
        }
    }

    pub async fn read_all(&self) -> Result<BTreeMap<String, Value>> {
        match self {
            AnyBackend::Document(b) => b.read_all().await,
            AnyBackend::Table(b) => b.read_all().await,
        }
    }

    pub async fn write_all(&self, entries: BTreeMap<String, JsonValue>) -> Result<()> {
        match self {
            AnyBackend::Document(b) => b.write_all(entries).await,
            AnyBackend::Table(b) => b.write_all(entries).await,
        }
    }

    pub async fn batch_set(&self, entries: Vec<(String, Value)>) -> Result<()> {
        match self {
            AnyBackend::Document(b) => b.batch_set(entries).await,
            AnyBackend::Table(b) => b.batch_set(entries).await,
        }
    }

    pub async fn batch_delete(&self, keys: Vec<String>) -> Result<()> {
        match self {
            AnyBackend::Document(b) => b.batch_delete(keys).await,
            AnyBackend::Table(b) => b.batch_delete(keys).await,
        }
    }

    pub async fn stream_entries(&self) -> Result<EntryStream> {
        match self {
            AnyBackend::Document(b) => b.stream_entries().await,
            AnyBackend::Table(b) => b.stream_entries().await,
        }
    }

    pub fn supports_transactions(&self) -> bool {
        match self {
            AnyBackend::Document(b) => b.supports_transactions(),
            AnyBackend::Table(b) => b.supports_transactions(),
        }
    }

    pub async fn destroy(&self) -> Result<()> {
        match self {
            AnyBackend::Document(b) => b.destroy().await,
            AnyBackend::Table(b) => b.destroy().await,
        }
    }

    /// Opens a backend-level atomic section. Table backend only.
    pub async fn begin_transaction(&self) -> Result<TransactionSession> {
        match self {
            AnyBackend::Document(_) => Err(crate::error::Error::Transaction(
                "the document backend does not support transactions".to_string(),
            )),
            AnyBackend::Table(b) => b.begin_session().await,
        }
    }

    /// Ranged key-prefix query for planner push-down. `None` when this
    /// backend cannot push the query down.
    pub async fn query_prefix(
        &self,
        prefix: &str,
        descending: bool,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Option<Vec<(String, Value)>>> {
        match self {
            AnyBackend::Document(_) => Ok(None),
            AnyBackend::Table(b) => {
                let rows = b.query_prefix(prefix, descending, limit, offset).await?;
                Ok(Some(
                    rows.into_iter()
                        .map(|(k, encoded)| {
                            let value = decode_logged(&k, &encoded);
                            (k, value)
                        })
                        .collect(),
                ))
            }
        }
    }

    /// Closes and re-opens the backend after a timed-out operation.
    pub async fn reconnect(&self) -> Result<()> {
        match self {
            AnyBackend::Document(_) => Ok(()),
            AnyBackend::Table(b) => b.reconnect().await,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_logged_is_lenient() {
        assert_eq!(decode_logged("k", "42"), Value::Number(42.0));
        assert_eq!(
            decode_logged("k", "{not json"),
            Value::String("{not json".to_string())
        );
    }
}
