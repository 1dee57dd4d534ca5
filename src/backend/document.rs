//! # Document-File Backend
//!
//! The ordered in-memory document variant: the entire `key → value` mapping
//! lives in a single JSON object file. Every mutation loads the document,
//! mutates it in memory, and writes it back atomically.
//!
//! ## Atomic Rewrite
//!
//! Writes go to a sibling temp file, get fsynced, and are renamed over the
//! original. A crash mid-write leaves either the old document or the new one,
//! never a torn file. On Unix the file is created owner-only (0600).
//!
//! ## Bounds
//!
//! Loads refuse files beyond a configured maximum, so a corrupted or
//! runaway document cannot OOM the process.
//!
//! ## Concurrency
//!
//! Filesystem work runs on blocking threads (`spawn_blocking`), and a
//! single async mutex serializes load-mutate-store cycles, so concurrent
//! point writes cannot lose updates to each other. This backend reports
//! `supports_transactions = false`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use super::{Backend, EntryStream, STREAM_CHANNEL_SIZE};
use crate::codec;
use crate::error::{Error, Result};
use crate::value::Value;

/// Default load-size bound: 512 MiB.
pub const DEFAULT_MAX_LOAD_BYTES: u64 = 512 * 1024 * 1024;

/// The JSON-object-in-a-file backend.
pub struct DocumentBackend {
    path: PathBuf,
    max_load_bytes: u64,
    /// Serializes load-mutate-store cycles.
    file_lock: tokio::sync::Mutex<()>,
}

impl DocumentBackend {
    /// Creates a backend for `path` with the default load bound.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_max_load_bytes(path, DEFAULT_MAX_LOAD_BYTES)
    }

    /// Creates a backend with an explicit load bound.
    pub fn with_max_load_bytes(path: impl Into<PathBuf>, max_load_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_load_bytes,
            file_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The document file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the whole document. A missing file is an empty document.
    async fn load(&self) -> Result<BTreeMap<String, JsonValue>> {
        let path = self.path.clone();
        let max = self.max_load_bytes;
        tokio::task::spawn_blocking(move || load_document(&path, max))
            .await
            .map_err(|e| Error::Read(format!("document load task failed: {}", e)))?
    }

    /// Atomically replaces the document on disk.
    async fn store(&self, document: BTreeMap<String, JsonValue>) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let bytes = serde_json::to_vec(&document)
                .map_err(|e| Error::Write(format!("document failed to serialize: {}", e)))?;
            atomic_write(&path, &bytes).map_err(Error::write)
        })
        .await
        .map_err(|e| Error::Write(format!("document store task failed: {}", e)))?
    }
}

impl Backend for DocumentBackend {
    async fn connect(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(Error::write)?;
            }
        }
        // An existing document must be loadable, or the open is refused.
        self.load().await?;
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.file_lock.lock().await;
        let document = self.load().await?;
        Ok(document.get(key).map(codec::from_json))
    }

    async fn set_value(&self, key: &str, value: &Value) -> Result<()> {
        let encoded = codec::to_json(value, 0)?;
        let _guard = self.file_lock.lock().await;
        let mut document = self.load().await?;
        document.insert(key.to_string(), encoded);
        self.store(document).await
    }

    async fn delete_value(&self, key: &str) -> Result<bool> {
        let _guard = self.file_lock.lock().await;
        let mut document = self.load().await?;
        let existed = document.remove(key).is_some();
        if existed {
            self.store(document).await?;
        }
        Ok(existed)
    }

    async fn read_all(&self) -> Result<BTreeMap<String, Value>> {
        let _guard = self.file_lock.lock().await;
        let document = self.load().await?;
        Ok(document
            .iter()
            .map(|(k, v)| (k.clone(), codec::from_json(v)))
            .collect())
    }

    async fn write_all(&self, entries: BTreeMap<String, JsonValue>) -> Result<()> {
        let _guard = self.file_lock.lock().await;
        self.store(entries).await
    }

    async fn batch_set(&self, entries: Vec<(String, Value)>) -> Result<()> {
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in &entries {
            encoded.push((key.clone(), codec::to_json(value, 0)?));
        }
        let _guard = self.file_lock.lock().await;
        let mut document = self.load().await?;
        for (key, value) in encoded {
            document.insert(key, value);
        }
        // One atomic rewrite covers the whole group.
        self.store(document).await
    }

    async fn batch_delete(&self, keys: Vec<String>) -> Result<()> {
        let _guard = self.file_lock.lock().await;
        let mut document = self.load().await?;
        for key in &keys {
            document.remove(key);
        }
        self.store(document).await
    }

    async fn stream_entries(&self) -> Result<EntryStream> {
        // The load bound caps the document's size, so the scan snapshots it
        // and feeds the channel from a task; BTreeMap iteration is key order.
        let document = {
            let _guard = self.file_lock.lock().await;
            self.load().await?
        };
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        tokio::spawn(async move {
            for (key, value) in document {
                let encoded = value.to_string();
                if tx.send(Ok((key, encoded))).await.is_err() {
                    break; // consumer dropped the stream
                }
            }
        });
        Ok(EntryStream::new(rx))
    }

    fn supports_transactions(&self) -> bool {
        false
    }

    async fn destroy(&self) -> Result<()> {
        // Nothing to close; the document file itself is the persistent state.
        Ok(())
    }
}

// =============================================================================
// Filesystem Helpers
// =============================================================================

fn load_document(path: &Path, max_load_bytes: u64) -> Result<BTreeMap<String, JsonValue>> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(BTreeMap::new());
        }
        Err(e) => return Err(Error::read(e)),
    };

    if metadata.len() > max_load_bytes {
        return Err(Error::Read(format!(
            "document file is {} bytes, exceeding the {} byte load bound",
            metadata.len(),
            max_load_bytes
        )));
    }

    let text = std::fs::read_to_string(path).map_err(Error::read)?;
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&text)
        .map_err(|e| Error::Read(format!("document file failed to parse: {}", e)))
}

/// Writes `bytes` to `path` via temp file + fsync + rename, owner-only on
/// systems that support it.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)
}

// =============================================================================
// Tests
// =============================================================================
