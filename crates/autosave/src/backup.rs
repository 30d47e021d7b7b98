use std::collections::HashMap;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::buffer::EditableDocument;

pub const BACKUP_KEY_PREFIX: &str = "note-backup-";

/// Backups older than this are never restored.
pub const DEFAULT_BACKUP_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Crash-safety copy of unsaved edits, one per document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub document_id: String,
    pub title: String,
    pub body: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl BackupRecord {
    pub fn capture(doc: &EditableDocument) -> Self {
        Self::capture_at(doc, Utc::now())
    }

    pub fn capture_at(doc: &EditableDocument, at: DateTime<Utc>) -> Self {
        Self {
            document_id: doc.id().to_string(),
            title: doc.title().to_string(),
            body: doc.body().to_string(),
            timestamp: at.timestamp_millis(),
        }
    }

    pub fn key(&self) -> String {
        backup_key(&self.document_id)
    }

    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }

    /// Freshness is checked at restore time only. A timestamp ahead of `now`
    /// (clock skew) counts as fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let age_ms = now.timestamp_millis().saturating_sub(self.timestamp).max(0);
        u128::from(age_ms.unsigned_abs()) <= max_age.as_millis()
    }
}

pub fn backup_key(document_id: &str) -> String {
    format!("{BACKUP_KEY_PREFIX}{document_id}")
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup io error: {0}")]
    Io(#[from] io::Error),
    #[error("backup record is not valid json: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type BackupResult<T> = Result<T, BackupError>;

/// Origin-scoped key-value storage holding at most one record per document.
pub trait BackupStore: Send + Sync {
    fn load(&self, document_id: &str) -> BackupResult<Option<BackupRecord>>;

    /// Creates or overwrites the record for `record.document_id`.
    fn store(&self, record: &BackupRecord) -> BackupResult<()>;

    /// Removing a missing record is not an error.
    fn remove(&self, document_id: &str) -> BackupResult<()>;

    fn list(&self) -> BackupResult<Vec<BackupRecord>>;

    /// Deletes records outside the freshness window and returns how many went.
    /// Never called implicitly; stale records are simply ignored on restore.
    fn prune_stale(&self, now: DateTime<Utc>, max_age: Duration) -> BackupResult<usize> {
        let mut removed = 0;
        for record in self.list()? {
            if !record.is_fresh(now, max_age) {
                self.remove(&record.document_id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// One JSON file per key in a directory owned by this client.
#[derive(Debug, Clone)]
pub struct FileBackupStore {
    dir: PathBuf,
}

impl FileBackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, document_id: &str) -> PathBuf {
        self.dir.join(file_name(document_id))
    }
}

/// Everything except `[A-Za-z0-9_-]` is escaped so ids map to distinct,
/// portable file names.
const FILE_NAME_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

fn file_name(document_id: &str) -> String {
    format!(
        "{BACKUP_KEY_PREFIX}{}.json",
        utf8_percent_encode(document_id, FILE_NAME_ESCAPES)
    )
}

impl BackupStore for FileBackupStore {
    fn load(&self, document_id: &str) -> BackupResult<Option<BackupRecord>> {
        match fs::read(self.path_for(document_id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, record: &BackupRecord) -> BackupResult<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&record.document_id);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer(&mut file, record)?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, document_id: &str) -> BackupResult<()> {
        match fs::remove_file(self.path_for(document_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self) -> BackupResult<Vec<BackupRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !name.starts_with(BACKUP_KEY_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            match fs::read(&path)
                .map_err(BackupError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(BackupError::from))
            {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(
                        target = "autosave.backup",
                        path = %path.display(),
                        error = %err,
                        "skipping unreadable backup"
                    );
                }
            }
        }
        debug!(target = "autosave.backup", count = records.len(), "listed backups");
        Ok(records)
    }
}

/// In-memory adapter for tests and early wiring.
#[derive(Debug, Default)]
pub struct InMemoryBackupStore {
    records: RwLock<HashMap<String, BackupRecord>>,
}

impl InMemoryBackupStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl BackupStore for InMemoryBackupStore {
    fn load(&self, document_id: &str) -> BackupResult<Option<BackupRecord>> {
        Ok(self.records.read().get(&backup_key(document_id)).cloned())
    }

    fn store(&self, record: &BackupRecord) -> BackupResult<()> {
        self.records.write().insert(record.key(), record.clone());
        Ok(())
    }

    fn remove(&self, document_id: &str) -> BackupResult<()> {
        self.records.write().remove(&backup_key(document_id));
        Ok(())
    }

    fn list(&self) -> BackupResult<Vec<BackupRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }
}
