// src/storage/sql.rs

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, install_default_drivers};
use sqlx::AnyPool;
use tracing::info;

use crate::error::{AppError, Result};
use crate::storage::record::KeyRecord;
use crate::storage::traits::KeyStore;

/// Relational key store over a `sqlx` connection pool.
///
/// The driver is picked from the URL scheme: `sqlite:` for the embedded
/// single-file store (or `sqlite::memory:` in tests), `mysql:` for a
/// networked server. Timestamps are stored as RFC 3339 text and the query
/// set sticks to `?` placeholders so the same statements run on both.
pub struct SqlKeyStore {
    pool: AnyPool,
}

impl SqlKeyStore {
    /// Connects to the database behind `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        install_default_drivers();
        ensure_sqlite_parent_dir(database_url)?;

        // An in-memory SQLite database exists per connection; more than one
        // pooled connection would see different databases.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!(
            db.scheme = database_url.split(':').next().unwrap_or("?"),
            "Database pool created"
        );
        Ok(Self { pool })
    }
}

/// SQLite refuses to create a database file in a missing directory, so the
/// parent is created up front. `sqlite::memory:` and non-sqlite URLs skip
/// this.
fn ensure_sqlite_parent_dir(database_url: &str) -> Result<()> {
    if let Some(path) = database_url.strip_prefix("sqlite:") {
        if !path.starts_with(':') {
            let normalized = path.trim_start_matches("//");
            let without_params = normalized.split('?').next().unwrap_or(normalized);
            if let Some(parent) = std::path::Path::new(without_params).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
    }
    Ok(())
}

#[derive(sqlx::FromRow)]
struct KeyRow {
    secret: String,
    weight: i64,
    is_active: i64,
    failure_count: i64,
    last_failure_at: Option<String>,
    cooldown_until: Option<String>,
    last_used_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl KeyRow {
    fn into_record(self) -> Result<KeyRecord> {
        Ok(KeyRecord {
            secret: self.secret,
            weight: self.weight.max(1),
            is_active: self.is_active != 0,
            failure_count: self.failure_count,
            last_failure_at: parse_opt_ts(self.last_failure_at)?,
            cooldown_until: parse_opt_ts(self.cooldown_until)?,
            last_used_at: parse_opt_ts(self.last_used_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::storage(format!("invalid timestamp {raw:?}: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(&s)).transpose()
}

fn fmt_opt_ts(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

const SELECT_COLUMNS: &str = "secret, weight, is_active, failure_count, last_failure_at, \
     cooldown_until, last_used_at, created_at, updated_at";

const INSERT_SQL: &str = "INSERT INTO api_keys \
     (secret, weight, is_active, failure_count, last_failure_at, cooldown_until, \
      last_used_at, created_at, updated_at, deleted_at) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)";

fn bind_record<'q>(
    query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    record: &'q KeyRecord,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    query
        .bind(record.secret.as_str())
        .bind(record.weight)
        .bind(i64::from(record.is_active))
        .bind(record.failure_count)
        .bind(fmt_opt_ts(record.last_failure_at))
        .bind(fmt_opt_ts(record.cooldown_until))
        .bind(fmt_opt_ts(record.last_used_at))
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
}

#[async_trait]
impl KeyStore for SqlKeyStore {
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS api_keys (\
                secret VARCHAR(255) NOT NULL UNIQUE, \
                weight BIGINT NOT NULL DEFAULT 1, \
                is_active BIGINT NOT NULL DEFAULT 1, \
                failure_count BIGINT NOT NULL DEFAULT 0, \
                last_failure_at VARCHAR(64) NULL, \
                cooldown_until VARCHAR(64) NULL, \
                last_used_at VARCHAR(64) NULL, \
                created_at VARCHAR(64) NOT NULL, \
                updated_at VARCHAR(64) NOT NULL, \
                deleted_at VARCHAR(64) NULL)",
        )
        .execute(&self.pool)
        .await?;
        info!("Database schema migration complete");
        Ok(())
    }

    async fn insert_if_absent(&self, record: &KeyRecord) -> Result<()> {
        // All writers funnel through the pool lock, so check-then-insert is
        // not racing anything; the unique index still backstops it.
        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM api_keys WHERE secret = ?")
                .bind(record.secret.as_str())
                .fetch_one(&self.pool)
                .await?;
        if existing > 0 {
            return Err(AppError::KeyAlreadyExists);
        }
        bind_record(sqlx::query(INSERT_SQL), record)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_batch(&self, records: &[KeyRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for record in records {
            bind_record(sqlx::query(INSERT_SQL), record)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<KeyRecord>> {
        let rows: Vec<KeyRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM api_keys \
             WHERE deleted_at IS NULL ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(KeyRow::into_record).collect()
    }

    async fn get_by_secret(&self, secret: &str) -> Result<KeyRecord> {
        let row: Option<KeyRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM api_keys \
             WHERE secret = ? AND deleted_at IS NULL"
        ))
        .bind(secret)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(AppError::KeyNotFound)?.into_record()
    }

    async fn delete_by_secret(&self, secret: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE api_keys SET deleted_at = ?, updated_at = ? \
             WHERE secret = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(secret)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::KeyNotFound);
        }
        Ok(())
    }

    async fn delete_by_secrets(&self, secrets: &[String]) -> Result<u64> {
        if secrets.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0u64;
        let now = Utc::now().to_rfc3339();
        for secret in secrets {
            let result = sqlx::query(
                "UPDATE api_keys SET deleted_at = ?, updated_at = ? \
                 WHERE secret = ? AND deleted_at IS NULL",
            )
            .bind(now.as_str())
            .bind(now.as_str())
            .bind(secret.as_str())
            .execute(&mut *tx)
            .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn delete_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM api_keys")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        secret: &str,
        failure_count: i64,
        cooldown: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let cooldown_until = now + chrono::Duration::from_std(cooldown).unwrap_or_default();
        let result = sqlx::query(
            "UPDATE api_keys SET is_active = 0, failure_count = ?, \
             last_failure_at = ?, cooldown_until = ?, updated_at = ? \
             WHERE secret = ? AND deleted_at IS NULL",
        )
        .bind(failure_count)
        .bind(now.to_rfc3339())
        .bind(cooldown_until.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(secret)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::KeyNotFound);
        }
        Ok(())
    }

    async fn record_success(&self, secret: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE api_keys SET is_active = 1, failure_count = 0, \
             last_failure_at = NULL, cooldown_until = NULL, updated_at = ? \
             WHERE secret = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(secret)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::KeyNotFound);
        }
        Ok(())
    }

    async fn touch_last_used(&self, secret: &str) -> Result<()> {
        sqlx::query(
            "UPDATE api_keys SET last_used_at = ? \
             WHERE secret = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(secret)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqlKeyStore {
        let store = SqlKeyStore::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn insert_and_list_round_trip() {
        let store = memory_store().await;
        store.insert_if_absent(&KeyRecord::new("sk-a", 2)).await.unwrap();
        store.insert_if_absent(&KeyRecord::new("sk-b", 1)).await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.is_active && r.failure_count == 0));

        let a = store.get_by_secret("sk-a").await.unwrap();
        assert_eq!(a.weight, 2);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected_unchanged() {
        let store = memory_store().await;
        store.insert_if_absent(&KeyRecord::new("sk-a", 2)).await.unwrap();
        let err = store
            .insert_if_absent(&KeyRecord::new("sk-a", 9))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::KeyAlreadyExists));
        assert_eq!(store.get_by_secret("sk-a").await.unwrap().weight, 2);
    }

    #[tokio::test]
    async fn batch_insert_conflict_rolls_back_whole_batch() {
        let store = memory_store().await;
        store.insert_if_absent(&KeyRecord::new("sk-a", 1)).await.unwrap();
        let batch = vec![KeyRecord::new("sk-new", 1), KeyRecord::new("sk-a", 1)];
        assert!(store.insert_batch(&batch).await.is_err());
        assert!(matches!(
            store.get_by_secret("sk-new").await.unwrap_err(),
            AppError::KeyNotFound
        ));
    }

    #[tokio::test]
    async fn failure_and_success_writes_round_trip() {
        let store = memory_store().await;
        store.insert_if_absent(&KeyRecord::new("sk-a", 1)).await.unwrap();

        store
            .record_failure("sk-a", 2, Duration::from_secs(600))
            .await
            .unwrap();
        let failed = store.get_by_secret("sk-a").await.unwrap();
        assert!(!failed.is_active);
        assert_eq!(failed.failure_count, 2);
        assert!(failed.cooldown_until.is_some());
        assert!(failed.last_failure_at.is_some());

        store.record_success("sk-a").await.unwrap();
        let healthy = store.get_by_secret("sk-a").await.unwrap();
        assert!(healthy.is_active);
        assert_eq!(healthy.failure_count, 0);
        assert!(healthy.cooldown_until.is_none());
        assert!(healthy.last_failure_at.is_none());
    }

    #[tokio::test]
    async fn soft_delete_hides_rows_but_blocks_reinsertion() {
        let store = memory_store().await;
        store.insert_if_absent(&KeyRecord::new("sk-a", 1)).await.unwrap();
        store.delete_by_secret("sk-a").await.unwrap();

        assert!(store.list_all().await.unwrap().is_empty());
        // Tombstone still owns the secret.
        assert!(matches!(
            store.insert_if_absent(&KeyRecord::new("sk-a", 1)).await,
            Err(AppError::KeyAlreadyExists)
        ));

        // Hard purge clears the tombstone as well.
        store.delete_all().await.unwrap();
        store.insert_if_absent(&KeyRecord::new("sk-a", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn batch_delete_reports_affected_count() {
        let store = memory_store().await;
        store.insert_if_absent(&KeyRecord::new("sk-a", 1)).await.unwrap();
        store.insert_if_absent(&KeyRecord::new("sk-b", 1)).await.unwrap();
        let deleted = store
            .delete_by_secrets(&["sk-a".into(), "sk-missing".into()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }
}
