// src/storage/traits.rs

use crate::error::Result;
use crate::storage::KeyRecord;
use async_trait::async_trait;
use std::time::Duration;

/// Durable CRUD over key records.
///
/// Implementations must treat `secret` as the unique identity of a record.
/// Deletion is a soft delete: tombstoned rows stay in the store but are
/// invisible to every read.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Creates the schema if needed. Idempotent; runs at startup.
    async fn migrate(&self) -> Result<()>;

    /// Inserts a record; `Err(KeyAlreadyExists)` without modifying an
    /// existing row matching the secret.
    async fn insert_if_absent(&self, record: &KeyRecord) -> Result<()>;

    /// Transactional batch insert; any row-level conflict fails the batch.
    async fn insert_batch(&self, records: &[KeyRecord]) -> Result<()>;

    /// All live records, newest first.
    async fn list_all(&self) -> Result<Vec<KeyRecord>>;

    /// Looks a record up by secret; `Err(KeyNotFound)` when absent.
    async fn get_by_secret(&self, secret: &str) -> Result<KeyRecord>;

    /// Soft-deletes one record; `Err(KeyNotFound)` when absent.
    async fn delete_by_secret(&self, secret: &str) -> Result<()>;

    /// Soft-deletes a batch, returning how many rows were affected.
    async fn delete_by_secrets(&self, secrets: &[String]) -> Result<u64>;

    /// Unconditional hard purge, tombstones included. Used by destructive
    /// reload.
    async fn delete_all(&self) -> Result<()>;

    /// State-machine write: key failed, store the new consecutive-failure
    /// count and the freshly computed cooldown.
    async fn record_failure(
        &self,
        secret: &str,
        failure_count: i64,
        cooldown: Duration,
    ) -> Result<()>;

    /// State-machine write: key succeeded or was reactivated; failure state
    /// and cooldown are cleared.
    async fn record_success(&self, secret: &str) -> Result<()>;

    /// Best-effort bookkeeping of the last selection time.
    async fn touch_last_used(&self, secret: &str) -> Result<()>;
}
