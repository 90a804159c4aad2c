mod schema;
mod users;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;

use b2b_group_core::legacy::{LOGS_OPTION, MAPPINGS_OPTION};
use b2b_group_core::logbook::prepend_bounded;
use b2b_group_core::types::{log_lines_from_value, Mappings};

pub use schema::{SchemaError, SchemaInspector};
pub use users::{UserRecord, UserRepository, UserStoreError};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the generic key-value option store.
    pub fn options(&self) -> OptionRepository {
        OptionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns the canonical domain → group mapping store.
    pub fn mappings(&self) -> MappingRepository {
        MappingRepository {
            options: self.options(),
        }
    }

    /// Returns the canonical assignment log store.
    pub fn assignment_logs(&self) -> AssignmentLogRepository {
        AssignmentLogRepository {
            options: self.options(),
        }
    }

    /// Returns a handle for user records and their meta fields.
    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.pool.clone())
    }

    /// Returns the advisory schema inspector used for group discovery.
    pub fn schema(&self) -> SchemaInspector {
        SchemaInspector::new(self.pool.clone())
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository over the `options` table. Values are arbitrary JSON documents.
#[derive(Clone)]
pub struct OptionRepository {
    pool: SqlitePool,
}

impl OptionRepository {
    /// Loads an option, returning `None` when it has never been written.
    pub async fn get(&self, name: &str) -> Result<Option<Value>, OptionError> {
        let row = sqlx::query("SELECT value_json FROM options WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.get("value_json");
        let value = serde_json::from_str(&raw).map_err(|source| OptionError::Decode {
            name: name.to_string(),
            source,
        })?;
        Ok(Some(value))
    }

    /// Creates or replaces an option.
    pub async fn set(&self, name: &str, value: &Value) -> Result<(), OptionError> {
        sqlx::query(
            "INSERT INTO options (name, value_json, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(name) DO UPDATE \
             SET value_json = excluded.value_json, updated_at = excluded.updated_at",
        )
        .bind(name)
        .bind(value.to_string())
        .bind(to_rfc3339(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes an option, returning whether a row existed.
    pub async fn delete(&self, name: &str) -> Result<bool, OptionError> {
        let result = sqlx::query("DELETE FROM options WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reads an option as a boolean flag. Missing options are `false`.
    pub async fn get_flag(&self, name: &str) -> Result<bool, OptionError> {
        Ok(self.get(name).await?.map(|v| is_truthy(&v)).unwrap_or(false))
    }

    pub async fn set_flag(&self, name: &str, value: bool) -> Result<(), OptionError> {
        self.set(name, &Value::Bool(value)).await
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Errors that can occur while reading or writing options.
#[derive(Debug, Error)]
pub enum OptionError {
    #[error("option {name} holds invalid json: {source}")]
    Decode {
        name: String,
        source: serde_json::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Domain → group mappings persisted as a single JSON object option.
#[derive(Clone)]
pub struct MappingRepository {
    options: OptionRepository,
}

impl MappingRepository {
    /// Returns the canonical mapping.
    pub async fn get_all(&self) -> Result<Mappings, OptionError> {
        self.load(MAPPINGS_OPTION).await
    }

    /// Creates or replaces the group for `domain`.
    pub async fn set(&self, domain: &str, group: &str) -> Result<(), OptionError> {
        let mut mappings = self.get_all().await?;
        mappings.insert(domain, group);
        self.replace(&mappings).await
    }

    /// Removes `domain` from the canonical mapping.
    pub async fn delete(&self, domain: &str) -> Result<bool, OptionError> {
        self.delete_from(MAPPINGS_OPTION, domain).await
    }

    /// Removes `domain` from an arbitrary mapping option, writing only when
    /// the domain was present. Other entries are written back untouched.
    pub async fn delete_from(&self, option_name: &str, domain: &str) -> Result<bool, OptionError> {
        let Some(Value::Object(mut entries)) = self.options.get(option_name).await? else {
            return Ok(false);
        };
        if entries.remove(domain).is_none() {
            return Ok(false);
        }
        self.options.set(option_name, &Value::Object(entries)).await?;
        Ok(true)
    }

    /// Overwrites the canonical mapping.
    pub async fn replace(&self, mappings: &Mappings) -> Result<(), OptionError> {
        self.options.set(MAPPINGS_OPTION, &mappings.to_value()).await
    }

    /// Loads any mapping-shaped option; unknown shapes decode as empty.
    pub async fn load(&self, option_name: &str) -> Result<Mappings, OptionError> {
        Ok(self
            .options
            .get(option_name)
            .await?
            .map(|value| Mappings::from_value(&value))
            .unwrap_or_default())
    }
}

/// Bounded most-recent-first list of assignment log lines.
#[derive(Clone)]
pub struct AssignmentLogRepository {
    options: OptionRepository,
}

impl AssignmentLogRepository {
    pub async fn get_all(&self) -> Result<Vec<String>, OptionError> {
        Ok(self
            .options
            .get(LOGS_OPTION)
            .await?
            .map(|value| log_lines_from_value(&value))
            .unwrap_or_default())
    }

    /// Prepends `line` and keeps at most `capacity` entries.
    pub async fn append(&self, line: String, capacity: usize) -> Result<(), OptionError> {
        let mut lines = self.get_all().await?;
        prepend_bounded(&mut lines, line, capacity);
        self.replace(&lines).await
    }

    pub async fn clear(&self) -> Result<(), OptionError> {
        self.replace(&[]).await
    }

    /// Overwrites the log with `lines` as given, without applying the cap.
    pub async fn replace(&self, lines: &[String]) -> Result<(), OptionError> {
        let value = Value::Array(lines.iter().cloned().map(Value::String).collect());
        self.options.set(LOGS_OPTION, &value).await
    }
}

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;

    /// Opens a migrated database in a fresh temporary directory.
    pub async fn setup_db() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        (db, dir)
    }
}
