//! # ShaleDB - Embedded Key-Value Store
//!
//! ShaleDB is an embedded, single-process key-value store with two
//! interchangeable persistence backends behind one async API. It provides:
//!
//! - **Rich values**: dates, regexes, byte buffers, big integers, sets,
//!   maps, typed arrays, and error descriptors all round-trip with type
//!   fidelity
//! - **Bounded caching**: an LRU+TTL cache with entry, memory, and expiry
//!   bounds
//! - **Write coalescing**: batched writes with deadline-based flushing
//! - **Atomic transactions**: multi-operation commit/rollback with cache
//!   reconciliation (table backend)
//! - **Watchers**: pattern-matched change notifications with rate limiting
//!   and error isolation
//! - **Queries**: prefix/regex/field filtering, sort, limit, offset over a
//!   streaming scan, with backend push-down where possible
//! - **Backup/restore**: streaming snapshots with validated restore
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API (ShaleDb)                      │
//! │            (get, set, query, watch, transaction, …)             │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!         ┌─────────────┬───────┴───────┬──────────────┐
//!         ▼             ▼               ▼              ▼
//! ┌──────────────┐ ┌──────────┐ ┌─────────────┐ ┌────────────┐
//! │ LRU+TTL      │ │ Batch    │ │ Watcher     │ │ Transaction│
//! │ cache        │ │ coalescer│ │ manager     │ │ engine     │
//! └──────────────┘ └────┬─────┘ └─────────────┘ └─────┬──────┘
//!                       │                             │
//!                       ▼                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Backend (selected by extension)            │
//! │      .json → document file      .db/.sqlite → SQLite table      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! These invariants are enforced throughout the codebase and must never be
//! violated:
//!
//! 1. **Cache coherence**: a cached value is always a committed value; the
//!    last committed write for a key is what a subsequent read returns
//! 2. **Transaction atomicity**: a transaction's effects are entirely
//!    present in backend and cache, or entirely absent from both
//! 3. **Bounded cache**: entry count and estimated memory stay within their
//!    configured bounds after every write
//! 4. **Batch FIFO**: coalesced writes reach the backend in enqueue order,
//!    completing all-or-nothing per partition
//! 5. **Watcher isolation**: a failing callback never affects the mutating
//!    caller or other watchers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shaledb::{Options, ShaleDb, Value};
//!
//! #[tokio::main]
//! async fn main() -> shaledb::Result<()> {
//!     let db = ShaleDb::open("app.db", Options::default()).await?;
//!
//!     db.set("user:1", Value::object([
//!         ("name", Value::from("Nadia")),
//!         ("age", Value::from(34)),
//!     ])).await?;
//!
//!     let adults = db.query()
//!         .prefix("user:")
//!         .where_field("age", shaledb::FilterOp::Ge, 18)
//!         .sort("age", shaledb::SortOrder::Desc)
//!         .limit(10)
//!         .get()
//!         .await?;
//!     println!("{} adults", adults.len());
//!
//!     db.destroy(true).await?;
//!     Ok(())
//! }
//! ```

/// Error types for ShaleDB operations.
///
/// This module defines all error variants that can occur during store
/// operations. Using a single error enum simplifies error handling for
/// callers.
pub mod error;

/// Domain values and admission validators.
///
/// This module defines the [`Value`] tree covering every recognized rich
/// type, plus the key and value admission rules.
pub mod value;

/// Type-preserving value codec.
///
/// Encodes values into a self-describing JSON text form and decodes them
/// back with full type fidelity. Decoding is lenient: malformed text comes
/// back as a plain string.
pub mod codec;

/// Configuration: options with defaults and the filename rules that select
/// a backend.
pub mod config;

/// The LRU+TTL cache with memory-bounded eviction and a periodic expiry
/// sweep.
pub mod cache;

/// The write-batch coalescer: deadline-based flushing, FIFO partitions,
/// bounded retry.
pub mod batch;

/// Watchers: pattern-matched change notifications with rate limiting,
/// error isolation, and auto-disable.
pub mod watcher;

/// The backend contract and the two concrete stores (document file and
/// SQLite table).
pub mod backend;

/// The transaction engine: atomic multi-operation commits with cache
/// reconciliation.
pub mod transaction;

/// The query planner: filter/sort/limit fused over a streaming scan, with
/// backend push-down where possible.
pub mod query;

/// Backup and restore: streaming snapshots, validated restores, and backup
/// listing.
pub mod backup;

/// The async API (main entry point).
///
/// The main type is [`ShaleDb`](api::ShaleDb).
pub mod api;

pub use api::{ShaleDb, Stats};
pub use backend::EntryStream;
pub use backup::BackupInfo;
pub use cache::CacheStats;
pub use config::{BackendKind, Options};
pub use error::{Error, Result};
pub use query::{FilterOp, Query, SortOrder};
pub use transaction::TransactionHandle;
pub use value::{TypedArrayKind, Value};
pub use watcher::{EventKind, WatchEvent, WatcherError, WatcherId, WatchPattern};
