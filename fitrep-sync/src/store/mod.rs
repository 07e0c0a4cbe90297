//! Local durable key-value store with named stores and secondary indexes.

mod file;
mod sqlite;

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

pub use file::FileStore;
pub use sqlite::{DB_NAME, DB_VERSION, MIGRATIONS, Migration, SqliteStore, pending_migrations};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("data directory is unavailable")]
    MissingDataDir,
    #[error("database version {found} is newer than supported version {supported}")]
    VersionTooNew { found: u32, supported: u32 },
    #[error("record for store `{0}` has no string `key`")]
    MissingKey(&'static str),
    #[error("store `{store}` has no index `{index}`")]
    UnknownIndex {
        store: &'static str,
        index: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreName {
    Profiles,
    Evaluations,
    EvaluationIndexes,
    Sessions,
    Preferences,
}

impl StoreName {
    pub const ALL: [StoreName; 5] = [
        StoreName::Profiles,
        StoreName::Evaluations,
        StoreName::EvaluationIndexes,
        StoreName::Sessions,
        StoreName::Preferences,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StoreName::Profiles => "profiles",
            StoreName::Evaluations => "evaluations",
            StoreName::EvaluationIndexes => "evaluationIndexes",
            StoreName::Sessions => "sessions",
            StoreName::Preferences => "preferences",
        }
    }

    fn table(self) -> &'static str {
        match self {
            StoreName::Profiles => "profiles",
            StoreName::Evaluations => "evaluations",
            StoreName::EvaluationIndexes => "evaluation_indexes",
            StoreName::Sessions => "sessions",
            StoreName::Preferences => "preferences",
        }
    }

    fn ordinal(self) -> usize {
        match self {
            StoreName::Profiles => 0,
            StoreName::Evaluations => 1,
            StoreName::EvaluationIndexes => 2,
            StoreName::Sessions => 3,
            StoreName::Preferences => 4,
        }
    }

    pub fn indexes(self) -> &'static [IndexName] {
        match self {
            StoreName::Evaluations => &[IndexName::Email, IndexName::SyncStatus],
            _ => &[IndexName::Email],
        }
    }

    fn check_index(self, index: IndexName) -> Result<(), StoreError> {
        if self.indexes().contains(&index) {
            Ok(())
        } else {
            Err(StoreError::UnknownIndex {
                store: self.as_str(),
                index: index.field(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexName {
    Email,
    SyncStatus,
}

impl IndexName {
    /// Field of the stored JSON value the index reads.
    pub fn field(self) -> &'static str {
        match self {
            IndexName::Email => "email",
            IndexName::SyncStatus => "syncStatus",
        }
    }

    fn column(self) -> &'static str {
        match self {
            IndexName::Email => "email",
            IndexName::SyncStatus => "sync_status",
        }
    }

    fn value_of(self, record: &Value) -> Option<&str> {
        record.get(self.field()).and_then(Value::as_str)
    }
}

/// Every store is keyed by the record's `key` field.
pub const KEY_FIELD: &str = "key";

fn record_key(store: StoreName, record: &Value) -> Result<String, StoreError> {
    record
        .get(KEY_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(StoreError::MissingKey(store.as_str()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Sqlite,
    File,
}

impl BackendKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "db" => Some(BackendKind::Sqlite),
            "file" | "json" => Some(BackendKind::File),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::File => "file",
        }
    }
}

#[derive(Clone)]
pub enum LocalStore {
    Sqlite(SqliteStore),
    File(FileStore),
}

impl LocalStore {
    /// Opens the preferred backend under `data_dir`. A SQLite database that
    /// cannot be opened falls back to the file store.
    pub async fn open_with_fallback(
        data_dir: &Path,
        preferred: BackendKind,
    ) -> Result<Self, StoreError> {
        if preferred == BackendKind::Sqlite {
            match SqliteStore::open(&data_dir.join(DB_NAME)).await {
                Ok(store) => return Ok(LocalStore::Sqlite(store)),
                Err(StoreError::VersionTooNew { found, supported }) => {
                    return Err(StoreError::VersionTooNew { found, supported });
                }
                Err(err) => {
                    warn!(error = %err, "sqlite store unavailable, falling back to file store");
                }
            }
        }
        let root = data_dir.join("kv");
        let store = FileStore::open(&root).await?;
        info!(path = %root.display(), "using file store");
        Ok(LocalStore::File(store))
    }

    pub fn in_memory() -> Self {
        LocalStore::File(FileStore::in_memory())
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            LocalStore::Sqlite(_) => BackendKind::Sqlite,
            LocalStore::File(_) => BackendKind::File,
        }
    }

    pub async fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>, StoreError> {
        match self {
            LocalStore::Sqlite(inner) => inner.get(store, key).await,
            LocalStore::File(inner) => inner.get(store, key).await,
        }
    }

    /// Upserts a record and returns its key.
    pub async fn put(&self, store: StoreName, record: &Value) -> Result<String, StoreError> {
        match self {
            LocalStore::Sqlite(inner) => inner.put(store, record).await,
            LocalStore::File(inner) => inner.put(store, record).await,
        }
    }

    /// Upserts all records atomically: either every record lands or none does.
    pub async fn put_many(&self, store: StoreName, records: &[Value]) -> Result<(), StoreError> {
        match self {
            LocalStore::Sqlite(inner) => inner.put_many(store, records).await,
            LocalStore::File(inner) => inner.put_many(store, records).await,
        }
    }

    pub async fn delete(&self, store: StoreName, key: &str) -> Result<bool, StoreError> {
        match self {
            LocalStore::Sqlite(inner) => inner.delete(store, key).await,
            LocalStore::File(inner) => inner.delete(store, key).await,
        }
    }

    pub async fn get_all(&self, store: StoreName) -> Result<Vec<Value>, StoreError> {
        match self {
            LocalStore::Sqlite(inner) => inner.get_all(store).await,
            LocalStore::File(inner) => inner.get_all(store).await,
        }
    }

    pub async fn clear(&self, store: StoreName) -> Result<(), StoreError> {
        match self {
            LocalStore::Sqlite(inner) => inner.clear(store).await,
            LocalStore::File(inner) => inner.clear(store).await,
        }
    }

    pub async fn query_by_index(
        &self,
        store: StoreName,
        index: IndexName,
        value: &str,
    ) -> Result<Vec<Value>, StoreError> {
        store.check_index(index)?;
        match self {
            LocalStore::Sqlite(inner) => inner.query_by_index(store, index, value).await,
            LocalStore::File(inner) => inner.query_by_index(store, index, value).await,
        }
    }
}

pub fn default_data_dir() -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(base.join("fitrep-sync"))
}
