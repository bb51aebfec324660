// src/storage/memory.rs

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::storage::record::KeyRecord;
use crate::storage::traits::KeyStore;

/// In-memory `KeyStore` used by tests. Mirrors the SQL store's semantics,
/// tombstones included.
#[derive(Default)]
pub struct MemoryKeyStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rows: Vec<KeyRecord>,
    tombstones: HashSet<String>,
    /// When set, every write fails; lets tests exercise rollback paths.
    fail_writes: bool,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with a transient storage error.
    pub async fn fail_writes(&self, fail: bool) {
        self.inner.lock().await.fail_writes = fail;
    }
}

impl Inner {
    fn check_writable(&self) -> Result<()> {
        if self.fail_writes {
            return Err(AppError::storage("simulated write failure"));
        }
        Ok(())
    }

    fn owns_secret(&self, secret: &str) -> bool {
        self.tombstones.contains(secret) || self.rows.iter().any(|r| r.secret == secret)
    }

    fn find_mut(&mut self, secret: &str) -> Result<&mut KeyRecord> {
        self.rows
            .iter_mut()
            .find(|r| r.secret == secret)
            .ok_or(AppError::KeyNotFound)
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_if_absent(&self, record: &KeyRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        if inner.owns_secret(&record.secret) {
            return Err(AppError::KeyAlreadyExists);
        }
        inner.rows.push(record.clone());
        Ok(())
    }

    async fn insert_batch(&self, records: &[KeyRecord]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        if records
            .iter()
            .any(|record| inner.owns_secret(&record.secret))
        {
            return Err(AppError::KeyAlreadyExists);
        }
        inner.rows.extend(records.iter().cloned());
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<KeyRecord>> {
        let inner = self.inner.lock().await;
        let mut rows = inner.rows.clone();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn get_by_secret(&self, secret: &str) -> Result<KeyRecord> {
        let inner = self.inner.lock().await;
        inner
            .rows
            .iter()
            .find(|r| r.secret == secret)
            .cloned()
            .ok_or(AppError::KeyNotFound)
    }

    async fn delete_by_secret(&self, secret: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        let before = inner.rows.len();
        inner.rows.retain(|r| r.secret != secret);
        if inner.rows.len() == before {
            return Err(AppError::KeyNotFound);
        }
        inner.tombstones.insert(secret.to_string());
        Ok(())
    }

    async fn delete_by_secrets(&self, secrets: &[String]) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        let mut deleted = 0u64;
        for secret in secrets {
            let before = inner.rows.len();
            inner.rows.retain(|r| r.secret != *secret);
            if inner.rows.len() < before {
                inner.tombstones.insert(secret.clone());
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        inner.rows.clear();
        inner.tombstones.clear();
        Ok(())
    }

    async fn record_failure(
        &self,
        secret: &str,
        failure_count: i64,
        cooldown: Duration,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        let now = Utc::now();
        let record = inner.find_mut(secret)?;
        record.is_active = false;
        record.failure_count = failure_count;
        record.last_failure_at = Some(now);
        record.cooldown_until = Some(now + chrono::Duration::from_std(cooldown).unwrap_or_default());
        record.updated_at = now;
        Ok(())
    }

    async fn record_success(&self, secret: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        let now = Utc::now();
        let record = inner.find_mut(secret)?;
        record.is_active = true;
        record.failure_count = 0;
        record.last_failure_at = None;
        record.cooldown_until = None;
        record.updated_at = now;
        Ok(())
    }

    async fn touch_last_used(&self, secret: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        let now = Utc::now();
        if let Ok(record) = inner.find_mut(secret) {
            record.last_used_at = Some(now);
        }
        Ok(())
    }
}
