//! # Error Handling for ShaleDB
//!
//! This module defines the error types used throughout ShaleDB. We use a single
//! error enum ([`Error`]) to represent all possible failure modes, which simplifies
//! error handling for library users.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations.
//! This provides:
//! - Automatic `Display` implementation from the `#[error(...)]` attributes
//! - Automatic `From` implementations from the `#[from]` attributes
//! - Proper error source chaining via `#[source]`
//!
//! ## Error Categories
//!
//! Errors fall into these categories:
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Validation | Bad key, undefined value | Fix the input |
//! | I/O | Backend read/write failed | Retry or investigate |
//! | Shape | Non-array push, non-numeric add | Fix the stored value or the call |
//! | Transaction | Callback threw, commit failed | Nothing was applied; retry |
//! | Timeout | Backend op or restore exceeded its budget | Retry, maybe reconnect |
//!
//! Validation errors are raised before any backend I/O happens. Transaction
//! errors are raised only after both the backend and the cache have been
//! rolled back, so callers never observe a partial commit.

use std::time::Duration;

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in ShaleDB operations.
///
/// Each variant is a distinct, stable failure category. The `#[error(...)]`
/// attribute defines the `Display` message shown when the error is printed.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Validation Errors (raised before any backend I/O)
    // =========================================================================

    /// The key does not satisfy the admission rules.
    ///
    /// Keys must be non-empty NFC-normalized strings of at most 256 code
    /// points, with no quotes, semicolons, slashes, backslashes, control
    /// characters, or Unicode non-characters. The message names the rule
    /// that was violated.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The value cannot be stored or encoded.
    ///
    /// Raised for `undefined` used as a stored value and for values whose
    /// nesting exceeds the codec's depth bound.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    // =========================================================================
    // I/O Errors (backend or filesystem failed)
    // =========================================================================

    /// A backend read failed.
    ///
    /// Wraps the underlying driver error. A read that merely finds no entry
    /// is NOT an error; this fires only when the backend itself failed.
    #[error("read failed: {0}")]
    Read(String),

    /// A backend write failed.
    ///
    /// Also used for connection-establishment failures, with a
    /// "Connection failed" message, so callers can treat "could not open the
    /// store" and "could not write to the store" uniformly.
    #[error("write failed: {0}")]
    Write(String),

    // =========================================================================
    // Shape Errors (the stored value has the wrong type for the operation)
    // =========================================================================

    /// `push`/`pull` was called on a key whose value is not an array.
    ///
    /// The backend is not touched when this fires.
    #[error("value at '{key}' is not an array")]
    NotArray {
        /// The offending key.
        key: String,
    },

    /// `add`/`subtract` was called with a non-finite amount, or on a key
    /// whose current value is neither a number nor absent.
    ///
    /// The backend is not touched when this fires.
    #[error("value at '{key}' is not a number")]
    InvalidNumber {
        /// The offending key.
        key: String,
    },

    // =========================================================================
    // Transaction Errors (rolled back; nothing was applied)
    // =========================================================================

    /// A transaction failed and was rolled back.
    ///
    /// Raised when the backend does not support transactions, when the
    /// caller's closure returns an error, or when commit itself fails. By the
    /// time this surfaces, both the backend atomic section and the cache have
    /// been restored, so no partial state is visible.
    #[error("transaction failed: {0}")]
    Transaction(String),

    // =========================================================================
    // Timeouts
    // =========================================================================

    /// An operation exceeded its time budget.
    ///
    /// Individual backend operations run under the session timeout (default
    /// 5 s), batch flushes under the operation timeout (default 30 s), and
    /// restore under its own 5-minute budget.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    // =========================================================================
    // Configuration Errors (constructor-time)
    // =========================================================================

    /// The database filename or an option value is invalid.
    ///
    /// Raised by [`crate::ShaleDb::open`] before anything touches the disk:
    /// bad extensions, forbidden filename characters, zero cache sizes, and
    /// similar misconfiguration all land here.
    #[error("configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Wrapped Driver Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// The `#[from]` attribute lets the table backend use `?` on `rusqlite`
    /// calls directly; the backend boundary then folds this into
    /// [`Error::Read`] / [`Error::Write`] before it reaches callers.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem operation failed.
    ///
    /// Used by the document backend and backup/restore; folded into
    /// [`Error::Read`] / [`Error::Write`] at the operation boundary.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps any error into the read category.
    pub(crate) fn read(err: impl std::fmt::Display) -> Self {
        Error::Read(err.to_string())
    }

    /// Wraps any error into the write category.
    pub(crate) fn write(err: impl std::fmt::Display) -> Self {
        Error::Write(err.to_string())
    }

    /// Wraps any error into the transaction category.
    pub(crate) fn transaction(err: impl std::fmt::Display) -> Self {
        Error::Transaction(err.to_string())
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
///
/// Functions return `Result<Foo>` instead of `Result<Foo, Error>`: less
/// typing, clearer intent, and the standard pattern for Rust libraries.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify error messages are formatted correctly.
    ///
    /// Error messages appear in logs and user output. Testing ensures they're
    /// readable and contain the relevant information.
    #[test]
    fn test_error_display() {
        let key = Error::InvalidKey("contains a semicolon".to_string());
        assert_eq!(key.to_string(), "invalid key: contains a semicolon");

        let arr = Error::NotArray {
            key: "scores".to_string(),
        };
        assert_eq!(arr.to_string(), "value at 'scores' is not an array");

        let num = Error::InvalidNumber {
            key: "counter".to_string(),
        };
        assert_eq!(num.to_string(), "value at 'counter' is not a number");

        let conn = Error::Write("Connection failed: no such directory".to_string());
        assert!(conn.to_string().contains("Connection failed"));
    }

    /// Verify that rusqlite errors convert automatically.
    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }

    /// Verify the category helpers preserve the source message.
    #[test]
    fn test_wrap_helpers() {
        let read = Error::read("disk on fire");
        assert_eq!(read.to_string(), "read failed: disk on fire");

        let write = Error::write("disk still on fire");
        assert_eq!(write.to_string(), "write failed: disk still on fire");

        let tx = Error::transaction("insufficient funds");
        assert_eq!(tx.to_string(), "transaction failed: insufficient funds");
    }
}
