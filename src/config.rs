//! # Configuration for ShaleDB
//!
//! This module defines [`Options`] (every tunable with its default and
//! constraint) and the filename rules that select a backend.
//!
//! ## Validation Strategy
//!
//! Options are validated once, in [`crate::ShaleDb::open`], before anything
//! touches the disk. Unknown keys are rejected structurally: the struct's
//! fields are the closed set, and deserialized option files additionally get
//! `deny_unknown_fields`. Range violations surface as
//! [`Error::Config`](crate::Error::Config) with the offending option named.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Options
// =============================================================================

/// All tunables, with serde names matching the public option keys.
///
/// | Option | Default | Constraint |
/// |---|---|---|
/// | `cache` | true | boolean |
/// | `cacheSize` | 1000 | positive integer |
/// | `cacheTTL` | 0 (no expiry) | non-negative integer ms |
/// | `cacheMaxMemoryMB` | 100 | positive number |
/// | `batch` | true | boolean |
/// | `batchSize` | 100 | positive integer |
/// | `batchDelay` | 50 | non-negative ms |
/// | `operationTimeout` | 30000 | positive integer ms |
/// | `keepConnectionOpen` | true | boolean |
/// | `timeout` | 5000 | positive integer ms |
/// | `walMode` | true | boolean (table backend only) |
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Options {
    /// Enables the read cache.
    pub cache: bool,

    /// Maximum number of cached entries.
    pub cache_size: usize,

    /// Default cache entry TTL in milliseconds. Zero disables expiry.
    #[serde(rename = "cacheTTL")]
    pub cache_ttl: u64,

    /// Cache memory budget in mebibytes.
    #[serde(rename = "cacheMaxMemoryMB")]
    pub cache_max_memory_mb: f64,

    /// Enables write batching through the coalescer.
    pub batch: bool,

    /// Maximum operations per flushed batch.
    pub batch_size: usize,

    /// Deadline in milliseconds before a partial batch is flushed.
    pub batch_delay: u64,

    /// Time budget in milliseconds for one batch-executor invocation.
    pub operation_timeout: u64,

    /// Keeps the backend connection open after a timed-out operation.
    /// When false, a timeout closes and re-opens the backend.
    pub keep_connection_open: bool,

    /// Time budget in milliseconds for an individual (non-batched) backend
    /// operation.
    pub timeout: u64,

    /// Enables SQLite write-ahead logging. Ignored by the document backend.
    pub wal_mode: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache: true,
            cache_size: 1000,
            cache_ttl: 0,
            cache_max_memory_mb: 100.0,
            batch: true,
            batch_size: 100,
            batch_delay: 50,
            operation_timeout: 30_000,
            keep_connection_open: true,
            timeout: 5000,
            wal_mode: true,
        }
    }
}

impl Options {
    /// Checks every range constraint.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] naming the offending option.
    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 {
            return Err(Error::Config("cacheSize must be a positive integer".into()));
        }
        if !(self.cache_max_memory_mb > 0.0) || !self.cache_max_memory_mb.is_finite() {
            return Err(Error::Config(
                "cacheMaxMemoryMB must be a positive number".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batchSize must be a positive integer".into()));
        }
        if self.operation_timeout == 0 {
            return Err(Error::Config(
                "operationTimeout must be a positive integer".into(),
            ));
        }
        if self.timeout == 0 {
            return Err(Error::Config("timeout must be a positive integer".into()));
        }
        Ok(())
    }

    /// Default TTL as a duration; `None` when expiry is disabled.
    pub fn cache_ttl(&self) -> Option<Duration> {
        if self.cache_ttl == 0 {
            None
        } else {
            Some(Duration::from_millis(self.cache_ttl))
        }
    }

    /// Cache memory budget in bytes.
    pub fn cache_max_memory_bytes(&self) -> usize {
        (self.cache_max_memory_mb * 1024.0 * 1024.0) as usize
    }

    /// Batch deadline as a duration.
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay)
    }

    /// Batch executor budget as a duration.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout)
    }

    /// Individual backend-operation budget as a duration.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

// =============================================================================
// Filenames and Backend Selection
// =============================================================================

/// Which persistence backend a path selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Whole-map JSON document file (`.json`).
    Document,
    /// SQLite table file (`.db`, `.sqlite`).
    Table,
}

/// Validates a database file name.
///
/// Rules: non-empty, at most 255 characters, no control characters, none of
/// `< > : " | ? *`.
///
/// # Errors
///
/// [`Error::Config`].
pub fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("file name must not be empty".into()));
    }
    if name.chars().count() > 255 {
        return Err(Error::Config("file name exceeds 255 characters".into()));
    }
    for c in name.chars() {
        if c.is_control() {
            return Err(Error::Config(format!(
                "file name contains control character U+{:04X}",
                c as u32
            )));
        }
        if matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*') {
            return Err(Error::Config(format!(
                "file name contains forbidden character {:?}",
                c
            )));
        }
    }
    Ok(())
}

impl BackendKind {
    /// Selects the backend for a database path by its extension.
    ///
    /// `.json` selects the document backend; `.db` and `.sqlite` select the
    /// table backend. Anything else is rejected.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for a missing file name, a name that violates the
    /// filename rules, or an unsupported extension.
    pub fn for_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config("path has no valid file name".into()))?;
        validate_filename(name)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(BackendKind::Document),
            Some("db") | Some("sqlite") => Ok(BackendKind::Table),
            Some(other) => Err(Error::Config(format!(
                "unsupported extension '.{}' (expected .json, .db or .sqlite)",
                other
            ))),
            None => Err(Error::Config(
                "file name has no extension (expected .json, .db or .sqlite)".into(),
            )),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
