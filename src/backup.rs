//! # Backup & Restore
//!
//! Streaming snapshots of the whole store and validated restores.
//!
//! ## Backup File Format
//!
//! A single JSON document:
//!
//! ```text
//! {
//!   "version":   "1.0.0",                      // this crate's version
//!   "timestamp": "2026-08-02T12:00:00.000Z",   // RFC 3339 instant
//!   "data":      { "key": <encoded value>, … },
//!   "entries":   1234
//! }
//! ```
//!
//! Written with owner-only permissions where the host supports them, and
//! written incrementally: entries stream from the backend straight into
//! buffered file writes, so the whole map is never materialized as one
//! string.
//!
//! ## Restore
//!
//! The envelope is validated before anything is written: semver version,
//! parsable timestamp, `data` is a mapping, `entries` (when present) matches
//! `|data|`, every key passes admission, and no value is `undefined`. Files
//! beyond 100 MiB parse through a buffered reader instead of loading the
//! text up front. A merge restore unions the backup over current contents
//! (incoming wins); a plain restore replaces state. Either way the restore
//! ends with one atomic `write_all`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::io::AsyncWriteExt;

use crate::backend::AnyBackend;
use crate::codec;
use crate::error::{Error, Result};
use crate::value::validate_key;

use futures::StreamExt;

/// Default restore time budget.
pub const RESTORE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Files beyond this size parse via a buffered reader.
const STREAMING_PARSE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Buffered bytes before a write flushes to the backup file.
const WRITE_CHUNK_SIZE: usize = 64 * 1024;

fn semver_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("static regex"))
}

// =============================================================================
// Backup
// =============================================================================

/// Streams the store into a backup file. Returns the entry count.
pub(crate) async fn write_backup(backend: &AnyBackend, path: &Path) -> Result<u64> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options.open(path).await.map_err(Error::write)?;

    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut buffer = format!(
        "{{\"version\":{},\"timestamp\":{},\"data\":{{",
        serde_json::to_string(env!("CARGO_PKG_VERSION")).expect("literal"),
        serde_json::to_string(&timestamp).expect("literal"),
    );

    let mut stream = backend.stream_entries().await?;
    let mut entries: u64 = 0;
    while let Some(entry) = stream.next().await {
        let (key, value) = entry?;
        if entries > 0 {
            buffer.push(',');
        }
        buffer.push_str(&serde_json::to_string(&key).map_err(Error::write)?);
        buffer.push(':');
        let encoded = codec::to_json(&value, 0)?;
        buffer.push_str(&encoded.to_string());
        entries += 1;

        if buffer.len() >= WRITE_CHUNK_SIZE {
            file.write_all(buffer.as_bytes()).await.map_err(Error::write)?;
            buffer.clear();
        }
    }

    buffer.push_str(&format!("}},\"entries\":{}}}", entries));
    file.write_all(buffer.as_bytes()).await.map_err(Error::write)?;
    file.sync_all().await.map_err(Error::write)?;

    tracing::debug!(path = %path.display(), entries, "backup written");
    Ok(entries)
}

// =============================================================================
// Envelope
// =============================================================================

/// The parsed backup document.
#[derive(Debug, Deserialize)]
struct BackupEnvelope {
    version: String,
    timestamp: String,
    data: serde_json::Map<String, JsonValue>,
    #[serde(default)]
    entries: Option<u64>,
}

impl BackupEnvelope {
    /// Validates everything the format promises. Returns the parsed
    /// timestamp.
    fn validate(&self) -> Result<DateTime<Utc>> {
        if !semver_pattern().is_match(&self.version) {
            return Err(Error::Read(format!(
                "backup version '{}' is not MAJOR.MINOR.PATCH",
                self.version
            )));
        }
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| Error::Read(format!("backup timestamp failed to parse: {}", e)))?
            .with_timezone(&Utc);

        if let Some(entries) = self.entries {
            if entries != self.data.len() as u64 {
                return Err(Error::Read(format!(
                    "backup declares {} entries but data holds {}",
                    entries,
                    self.data.len()
                )));
            }
        }

        for (key, value) in &self.data {
            validate_key(key)
                .map_err(|e| Error::Read(format!("backup contains invalid key: {}", e)))?;
            if is_undefined_tag(value) {
                return Err(Error::Read(format!(
                    "backup value for '{}' is undefined",
                    key
                )));
            }
        }

        Ok(timestamp)
    }
}

/// True for the tagged `undefined` wire form.
fn is_undefined_tag(value: &JsonValue) -> bool {
    match value {
        JsonValue::Object(map) => {
            map.iter().next().map(|(k, _)| k.as_str()) == Some(codec::TYPE_TAG)
                && map.get(codec::TYPE_TAG).and_then(JsonValue::as_str) == Some("undefined")
        }
        _ => false,
    }
}

/// Parses a backup file, streaming the parse for large files.
async fn parse_backup_file(path: &Path) -> Result<BackupEnvelope> {
    let metadata = tokio::fs::metadata(path).await.map_err(Error::read)?;

    if metadata.len() > STREAMING_PARSE_THRESHOLD {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path).map_err(Error::read)?;
            let reader = std::io::BufReader::new(file);
            serde_json::from_reader(reader)
                .map_err(|e| Error::Read(format!("backup failed to parse: {}", e)))
        })
        .await
        .map_err(|e| Error::Read(format!("backup parse task failed: {}", e)))?
    } else {
        let text = tokio::fs::read_to_string(path).await.map_err(Error::read)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Read(format!("backup failed to parse: {}", e)))
    }
}

// =============================================================================
// Restore
// =============================================================================

/// Restores a backup file into the backend. Returns the restored entry
/// count. With `merge`, the backup unions over current contents and
/// incoming entries win; otherwise the backup replaces everything.
///
/// The caller owns cache invalidation and the restore timeout.
pub(crate) async fn restore_backup(
    backend: &AnyBackend,
    path: &Path,
    merge: bool,
) -> Result<u64> {
    let envelope = parse_backup_file(path).await?;
    envelope.validate()?;

    let mut to_restore: BTreeMap<String, JsonValue> = if merge {
        backend
            .read_all()
            .await?
            .into_iter()
            .map(|(key, value)| {
                let encoded = codec::to_json(&value, 0)?;
                Ok((key, encoded))
            })
            .collect::<Result<_>>()?
    } else {
        BTreeMap::new()
    };

    for (key, value) in envelope.data {
        to_restore.insert(key, value);
    }

    let count = to_restore.len() as u64;
    backend.write_all(to_restore).await?;

    tracing::debug!(path = %path.display(), entries = count, merge, "backup restored");
    Ok(count)
}

// =============================================================================
// Listing
// =============================================================================

/// Metadata for one valid backup file in a directory.
#[derive(Debug, Clone)]
pub struct BackupInfo {
    /// File name within the directory.
    pub file: String,
    /// Full path.
    pub path: PathBuf,
    /// The envelope's version text.
    pub version: String,
    /// The envelope's timestamp.
    pub timestamp: DateTime<Utc>,
    /// Entry count.
    pub entries: u64,
    /// File size in bytes.
    pub size: u64,
}

/// Enumerates a directory's backup files, newest first.
///
/// Files that fail envelope validation are skipped with a warning rather
/// than failing the listing.
pub async fn list_backups(dir: &Path) -> Result<Vec<BackupInfo>> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(Error::read)?;
    let mut backups = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(Error::read)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let size = match entry.metadata().await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable backup");
                continue;
            }
        };

        let envelope = match parse_backup_file(&path).await {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping invalid backup");
                continue;
            }
        };
        let timestamp = match envelope.validate() {
            Ok(timestamp) => timestamp,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping invalid backup");
                continue;
            }
        };

        backups.push(BackupInfo {
            file: entry.file_name().to_string_lossy().into_owned(),
            path,
            version: envelope.version,
            timestamp,
            entries: envelope.entries.unwrap_or(envelope.data.len() as u64),
            size,
        });
    }

    backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(backups)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, DocumentBackend};
    use crate::value::Value;

    async fn seeded_backend(dir: &Path) -> AnyBackend {
        let backend = DocumentBackend::new(dir.join("store.json"));
        backend.connect().await.unwrap();
        backend
            .batch_set(vec![
                ("a".to_string(), Value::from(1)),
                ("b".to_string(), Value::from("two")),
                ("d".to_string(), Value::Date(Utc::now())),
            ])
            .await
            .unwrap();
        AnyBackend::Document(backend)
    }

    #[tokio::test]
    async fn test_backup_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = seeded_backend(dir.path()).await;
        let backup_path = dir.path().join("snapshot.json");

        let written = write_backup(&backend, &backup_path).await.unwrap();
        assert_eq!(written, 3);

        // Restore into an empty store.
        let fresh = DocumentBackend::new(dir.path().join("fresh.json"));
        fresh.connect().await.unwrap();
        let fresh = AnyBackend::Document(fresh);
        let restored = restore_backup(&fresh, &backup_path, false).await.unwrap();
        assert_eq!(restored, 3);

        assert_eq!(
            fresh.get_value("a").await.unwrap(),
            Some(Value::Number(1.0))
        );
        assert!(matches!(
            fresh.get_value("d").await.unwrap(),
            Some(Value::Date(_))
        ));
    }

    #[tokio::test]
    async fn test_backup_envelope_shape() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = seeded_backend(dir.path()).await;
        let backup_path = dir.path().join("snapshot.json");
        write_backup(&backend, &backup_path).await.unwrap();

        let text = std::fs::read_to_string(&backup_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert!(semver_pattern().is_match(parsed["version"].as_str().unwrap()));
        assert!(DateTime::parse_from_rfc3339(parsed["timestamp"].as_str().unwrap()).is_ok());
        assert_eq!(parsed["entries"], serde_json::json!(3));
        assert_eq!(parsed["data"].as_object().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_merge_restore_unions_with_incoming_winning() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = seeded_backend(dir.path()).await;
        let backup_path = dir.path().join("snapshot.json");
        write_backup(&backend, &backup_path).await.unwrap();

        // Diverge the store after the snapshot.
        let AnyBackend::Document(ref doc) = backend else {
            unreachable!()
        };
        doc.set_value("a", &Value::from(999)).await.unwrap();
        doc.set_value("local", &Value::from("kept")).await.unwrap();

        restore_backup(&backend, &backup_path, true).await.unwrap();

        // Incoming overrode "a"; local-only key survived the merge.
        assert_eq!(
            backend.get_value("a").await.unwrap(),
            Some(Value::Number(1.0))
        );
        assert_eq!(
            backend.get_value("local").await.unwrap(),
            Some(Value::String("kept".to_string()))
        );
    }

    #[tokio::test]
    async fn test_invalid_envelopes_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = seeded_backend(dir.path()).await;

        let cases = [
            ("bad_version.json", r#"{"version":"1.0","timestamp":"2026-01-01T00:00:00Z","data":{},"entries":0}"#),
            ("bad_timestamp.json", r#"{"version":"1.0.0","timestamp":"yesterday","data":{},"entries":0}"#),
            ("bad_count.json", r#"{"version":"1.0.0","timestamp":"2026-01-01T00:00:00Z","data":{"a":1},"entries":5}"#),
            ("bad_key.json", r#"{"version":"1.0.0","timestamp":"2026-01-01T00:00:00Z","data":{"a;b":1},"entries":1}"#),
            ("bad_value.json", r#"{"version":"1.0.0","timestamp":"2026-01-01T00:00:00Z","data":{"a":{"$type":"undefined"}},"entries":1}"#),
            ("not_json.json", "{"),
        ];

        for (name, contents) in cases {
            let path = dir.path().join(name);
            std::fs::write(&path, contents).unwrap();
            let result = restore_backup(&backend, &path, false).await;
            assert!(
                matches!(result, Err(Error::Read(_))),
                "expected rejection for {}",
                name
            );
        }

        // The store was untouched by every failed restore.
        assert_eq!(
            backend.get_value("a").await.unwrap(),
            Some(Value::Number(1.0))
        );
    }

    #[tokio::test]
    async fn test_list_backups_sorted_and_skips_invalid() {
        let dir = tempfile::TempDir::new().unwrap();

        std::fs::write(
            dir.path().join("old.json"),
            r#"{"version":"1.0.0","timestamp":"2026-01-01T00:00:00Z","data":{"a":1},"entries":1}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("new.json"),
            r#"{"version":"1.0.0","timestamp":"2026-06-01T00:00:00Z","data":{},"entries":0}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("garbage.json"), "not json").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "not a backup").unwrap();

        let backups = list_backups(dir.path()).await.unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].file, "new.json");
        assert_eq!(backups[1].file, "old.json");
        assert_eq!(backups[1].entries, 1);
        assert!(backups[1].size > 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_backup_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let backend = seeded_backend(dir.path()).await;
        let backup_path = dir.path().join("snapshot.json");
        write_backup(&backend, &backup_path).await.unwrap();

        let mode = std::fs::metadata(&backup_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
