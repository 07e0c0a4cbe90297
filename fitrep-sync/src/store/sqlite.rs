use std::{fs, path::Path};

use serde_json::Value;
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};
use tracing::{debug, info};

use super::{IndexName, StoreError, StoreName, record_key};

pub const DB_NAME: &str = "fitrep.db";
pub const DB_VERSION: u32 = 2;

/// One schema step, applied when upgrading across `version`.
#[derive(Debug)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "profiles, evaluations and sessions",
        statements: &[
            "CREATE TABLE IF NOT EXISTS profiles (
                key TEXT PRIMARY KEY NOT NULL,
                email TEXT,
                value TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_profiles_email ON profiles(email)",
            "CREATE TABLE IF NOT EXISTS evaluations (
                key TEXT PRIMARY KEY NOT NULL,
                email TEXT,
                sync_status TEXT,
                value TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_evaluations_email ON evaluations(email)",
            "CREATE TABLE IF NOT EXISTS sessions (
                key TEXT PRIMARY KEY NOT NULL,
                email TEXT,
                value TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_sessions_email ON sessions(email)",
        ],
    },
    Migration {
        version: 2,
        description: "evaluation indexes, preferences and sync status lookup",
        statements: &[
            "CREATE TABLE IF NOT EXISTS evaluation_indexes (
                key TEXT PRIMARY KEY NOT NULL,
                email TEXT,
                value TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_evaluation_indexes_email ON evaluation_indexes(email)",
            "CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY NOT NULL,
                email TEXT,
                value TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_preferences_email ON preferences(email)",
            "CREATE INDEX IF NOT EXISTS idx_evaluations_sync_status ON evaluations(sync_status)",
        ],
    },
];

/// Migrations to run when moving from `old` to `new`, in version order.
pub fn pending_migrations(old: u32, new: u32) -> Vec<&'static Migration> {
    let mut steps: Vec<_> = MIGRATIONS
        .iter()
        .filter(|m| m.version > old && m.version <= new)
        .collect();
    steps.sort_by_key(|m| m.version);
    steps
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.migrate_to(DB_VERSION).await.map(|_| ())
    }

    pub async fn schema_version(&self) -> Result<u32, StoreError> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(u32::try_from(version).unwrap_or(0))
    }

    /// Runs every step between the stored version and `target` in one
    /// transaction. Returns the version found before upgrading.
    pub async fn migrate_to(&self, target: u32) -> Result<u32, StoreError> {
        let current = self.schema_version().await?;
        if current > target {
            return Err(StoreError::VersionTooNew {
                found: current,
                supported: target,
            });
        }
        if current == target {
            return Ok(current);
        }

        let mut tx = self.pool.begin().await?;
        for migration in pending_migrations(current, target) {
            info!(
                version = migration.version,
                description = migration.description,
                "applying store migration"
            );
            for statement in migration.statements {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
        }
        // PRAGMA does not accept bound parameters.
        sqlx::query(&format!("PRAGMA user_version = {target}"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(current)
    }

    pub async fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query(&format!("SELECT value FROM {} WHERE key = ?1", store.table()))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let text: String = row.try_get("value")?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    pub async fn put(&self, store: StoreName, record: &Value) -> Result<String, StoreError> {
        let row = EncodedRow::new(store, record)?;
        let sql = upsert_sql(store);
        row.bind_to(sqlx::query(&sql))
            .execute(&self.pool)
            .await?;
        debug!(store = store.as_str(), key = %row.key, "stored record");
        Ok(row.key)
    }

    pub async fn put_many(&self, store: StoreName, records: &[Value]) -> Result<(), StoreError> {
        let rows = records
            .iter()
            .map(|record| EncodedRow::new(store, record))
            .collect::<Result<Vec<_>, _>>()?;
        let sql = upsert_sql(store);

        let mut tx = self.pool.begin().await?;
        for row in &rows {
            row.bind_to(sqlx::query(&sql)).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, store: StoreName, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE key = ?1", store.table()))
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_all(&self, store: StoreName) -> Result<Vec<Value>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT value FROM {} ORDER BY key ASC",
            store.table()
        ))
        .fetch_all(&self.pool)
        .await?;
        decode_rows(rows)
    }

    pub async fn clear(&self, store: StoreName) -> Result<(), StoreError> {
        sqlx::query(&format!("DELETE FROM {}", store.table()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn query_by_index(
        &self,
        store: StoreName,
        index: IndexName,
        value: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT value FROM {} WHERE {} = ?1 ORDER BY key ASC",
            store.table(),
            index.column()
        ))
        .bind(value)
        .fetch_all(&self.pool)
        .await?;
        decode_rows(rows)
    }
}

fn upsert_sql(store: StoreName) -> String {
    let mut columns = vec!["key"];
    columns.extend(store.indexes().iter().map(|index| index.column()));
    columns.push("value");

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let updates: Vec<String> = columns
        .iter()
        .skip(1)
        .map(|column| format!("{column} = excluded.{column}"))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(key) DO UPDATE SET {}",
        store.table(),
        columns.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    )
}

struct EncodedRow {
    key: String,
    index_values: Vec<Option<String>>,
    value: String,
}

impl EncodedRow {
    fn new(store: StoreName, record: &Value) -> Result<Self, StoreError> {
        Ok(Self {
            key: record_key(store, record)?,
            index_values: store
                .indexes()
                .iter()
                .map(|index| index.value_of(record).map(str::to_string))
                .collect(),
            value: serde_json::to_string(record)?,
        })
    }

    fn bind_to<'q>(
        &'q self,
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        let mut query = query.bind(&self.key);
        for value in &self.index_values {
            query = query.bind(value);
        }
        query.bind(&self.value)
    }
}

fn decode_rows(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<Value>, StoreError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let text: String = row.try_get("value")?;
        out.push(serde_json::from_str(&text)?);
    }
    Ok(out)
}
