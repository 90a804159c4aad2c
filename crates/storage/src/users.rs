use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use b2b_group_core::meta;
use b2b_group_core::types::UserAssignmentState;

use crate::to_rfc3339;

/// Identity of a user account as seen by the assignment engine.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
}

/// Repository over `users` and `user_meta`.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Loads a user by id.
    pub async fn get_user(&self, user_id: i64) -> Result<Option<UserRecord>, UserStoreError> {
        let user = sqlx::query_as::<_, UserRecord>("SELECT id, email FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Creates the user or updates its email when it already exists.
    pub async fn upsert_user(
        &self,
        user_id: i64,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<(), UserStoreError> {
        let ts = to_rfc3339(now);
        sqlx::query(
            "INSERT INTO users (id, email, created_at, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET email = excluded.email, updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(email)
        .bind(&ts)
        .bind(&ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reads a meta field. Empty values are reported as absent.
    pub async fn get_field(
        &self,
        user_id: i64,
        key: &str,
    ) -> Result<Option<String>, UserStoreError> {
        let row = sqlx::query("SELECT meta_value FROM user_meta WHERE user_id = ? AND meta_key = ?")
            .bind(user_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|row| row.get::<String, _>("meta_value"))
            .filter(|value| !value.is_empty()))
    }

    /// Writes a meta field, replacing any previous value.
    pub async fn set_field(
        &self,
        user_id: i64,
        key: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<(), UserStoreError> {
        sqlx::query(
            "INSERT INTO user_meta (user_id, meta_key, meta_value, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(user_id, meta_key) DO UPDATE \
             SET meta_value = excluded.meta_value, updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(key)
        .bind(value)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("787") => {
                UserStoreError::MissingUser(user_id)
            }
            other => UserStoreError::Database(other),
        })?;
        Ok(())
    }

    /// Distinct non-empty values stored under `key` across all users.
    pub async fn distinct_field_values(&self, key: &str) -> Result<Vec<String>, UserStoreError> {
        let values = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT meta_value FROM user_meta \
             WHERE meta_key = ? AND meta_value != '' ORDER BY meta_value",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(values)
    }

    /// Reads the bookkeeping fields written by the assignment engine.
    pub async fn assignment_state(
        &self,
        user_id: i64,
    ) -> Result<UserAssignmentState, UserStoreError> {
        Ok(UserAssignmentState {
            group: self.get_field(user_id, meta::ASSIGNED_GROUP).await?,
            assigned_at: self.get_field(user_id, meta::ASSIGNED_AT).await?,
            domain: self.get_field(user_id, meta::SOURCE_DOMAIN).await?,
        })
    }
}

/// Errors raised by the user store.
#[derive(Debug, Error)]
pub enum UserStoreError {
    #[error("user {0} does not exist")]
    MissingUser(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_db;

    #[tokio::test]
    async fn upsert_then_get_user() {
        let (db, _dir) = setup_db().await;
        let users = db.users();
        assert_eq!(users.get_user(7).await.expect("get"), None);

        users
            .upsert_user(7, "bob@acme.com", Utc::now())
            .await
            .expect("insert");
        users
            .upsert_user(7, "bob@beta.io", Utc::now())
            .await
            .expect("update");

        let user = users.get_user(7).await.expect("get").expect("exists");
        assert_eq!(user.email, "bob@beta.io");
    }

    #[tokio::test]
    async fn fields_are_replaced_and_listed() {
        let (db, _dir) = setup_db().await;
        let users = db.users();
        let now = Utc::now();
        users.upsert_user(1, "a@acme.com", now).await.expect("user");
        users.upsert_user(2, "b@acme.com", now).await.expect("user");

        users.set_field(1, "wcb2b_group", "Silver", now).await.expect("set");
        users.set_field(1, "wcb2b_group", "Gold", now).await.expect("replace");
        users.set_field(2, "wcb2b_group", "Gold", now).await.expect("set");
        users.set_field(2, "customer_group", "", now).await.expect("set empty");

        assert_eq!(
            users.get_field(1, "wcb2b_group").await.expect("get").as_deref(),
            Some("Gold")
        );
        assert_eq!(users.get_field(2, "customer_group").await.expect("get"), None);
        assert_eq!(
            users.distinct_field_values("wcb2b_group").await.expect("distinct"),
            vec!["Gold"]
        );
        assert!(users
            .distinct_field_values("customer_group")
            .await
            .expect("distinct")
            .is_empty());
    }

    #[tokio::test]
    async fn set_field_for_unknown_user_fails() {
        let (db, _dir) = setup_db().await;
        let err = db
            .users()
            .set_field(99, "wcb2b_group", "Gold", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, UserStoreError::MissingUser(99)));
    }

    #[tokio::test]
    async fn assignment_state_reads_bookkeeping_fields() {
        let (db, _dir) = setup_db().await;
        let users = db.users();
        let now = Utc::now();
        users.upsert_user(3, "c@acme.com", now).await.expect("user");
        users.set_field(3, meta::ASSIGNED_GROUP, "Gold", now).await.expect("set");
        users
            .set_field(3, meta::ASSIGNED_AT, "2024-01-01 00:00:00", now)
            .await
            .expect("set");

        let state = users.assignment_state(3).await.expect("state");
        assert_eq!(state.group.as_deref(), Some("Gold"));
        assert_eq!(state.assigned_at.as_deref(), Some("2024-01-01 00:00:00"));
        assert_eq!(state.domain, None);
    }
}
