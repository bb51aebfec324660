// src/key_pool.rs

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{Rng, thread_rng};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::storage::{KeyRecord, KeyStore};

pub use crate::storage::record::safe_suffix;

/// Authoritative runtime view of the credential set.
///
/// The pool owns the in-memory records exclusively; every mutation goes
/// through it and is written through to the durable store under the same
/// lock. Callers never see a mutable record, only cloned secrets and
/// redacted projections.
pub struct KeyPool {
    store: Arc<dyn KeyStore>,
    records: Mutex<Vec<KeyRecord>>,
    base_cooldown: Duration,
    max_consecutive_failures: i64,
}

/// Outcome of a batch add or destructive reload.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct BatchAddOutcome {
    pub added: usize,
    pub duplicates_in_input: usize,
    pub duplicates_in_store: usize,
    pub invalid: usize,
    pub errors: Vec<String>,
}

/// Redacted view of a key record for admin surfaces. Carries the suffix
/// only, never the secret.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatusView {
    pub key_suffix: String,
    pub is_active: bool,
    pub failure_count: i64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub weight: i64,
}

impl KeyStatusView {
    fn from_record(record: &KeyRecord) -> Self {
        Self {
            key_suffix: safe_suffix(&record.secret),
            is_active: record.is_active,
            failure_count: record.failure_count,
            last_failure_at: record.last_failure_at,
            cooldown_until: record.cooldown_until,
            last_used_at: record.last_used_at,
            weight: record.weight,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaginatedKeyStatuses {
    pub keys: Vec<KeyStatusView>,
    pub total_count: usize,
    pub page: usize,
    pub limit: usize,
}

/// One parsed key-spec entry.
#[derive(Debug, Default)]
struct ParsedSpec {
    /// Deduplicated entries in first-seen order; a repeated secret keeps its
    /// position but takes the last weight.
    entries: Vec<(String, i64)>,
    duplicates_in_input: usize,
    invalid: usize,
    errors: Vec<String>,
}

/// Parses a key spec: entries separated by comma or newline, each
/// `secret` or `secret:weight`. An unparseable or non-positive weight falls
/// back to 1 with a warning; empty secrets are invalid.
fn parse_key_spec(spec: &str) -> ParsedSpec {
    let mut parsed = ParsedSpec::default();
    let mut index_of: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for raw_entry in spec.split([',', '\n']) {
        let entry = raw_entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (secret, weight) = match entry.split_once(':') {
            Some((secret_part, weight_part)) => {
                let secret = secret_part.trim();
                let weight = match weight_part.trim().parse::<i64>() {
                    Ok(w) if w >= 1 => w,
                    _ => {
                        warn!(
                            key.suffix = %safe_suffix(secret),
                            weight = %weight_part.trim(),
                            "Invalid key weight, falling back to 1"
                        );
                        1
                    }
                };
                (secret, weight)
            }
            None => (entry, 1),
        };

        if secret.is_empty() {
            parsed.invalid += 1;
            parsed
                .errors
                .push(format!("invalid entry {entry:?}: empty secret"));
            continue;
        }

        match index_of.get(secret) {
            Some(&idx) => {
                parsed.duplicates_in_input += 1;
                parsed.entries[idx].1 = weight;
            }
            None => {
                index_of.insert(secret.to_string(), parsed.entries.len());
                parsed.entries.push((secret.to_string(), weight));
            }
        }
    }
    parsed
}

impl KeyPool {
    pub fn new(
        store: Arc<dyn KeyStore>,
        base_cooldown: Duration,
        max_consecutive_failures: i64,
    ) -> Self {
        Self {
            store,
            records: Mutex::new(Vec::new()),
            base_cooldown,
            max_consecutive_failures,
        }
    }

    /// Rebuilds the in-memory set from the durable store.
    pub async fn load_from_store(&self) -> Result<usize> {
        let rows = self.store.list_all().await?;
        let count = rows.len();
        *self.records.lock().await = rows;
        info!(key.count = count, "Key pool loaded from store");
        Ok(count)
    }

    /// Seeds the store from the configured key spec, but only on a pristine
    /// store (zero rows). Returns how many keys were inserted.
    pub async fn seed_from_config_if_empty(&self, spec: &str) -> Result<usize> {
        let mut records = self.records.lock().await;
        if !records.is_empty() || !self.store.list_all().await?.is_empty() {
            debug!("Store already holds keys, skipping config seed");
            return Ok(0);
        }
        let parsed = parse_key_spec(spec);
        if parsed.entries.is_empty() {
            if !spec.trim().is_empty() {
                warn!("Key spec contained no usable entries");
            }
            return Ok(0);
        }
        let new_records: Vec<KeyRecord> = parsed
            .entries
            .iter()
            .map(|(secret, weight)| KeyRecord::new(secret.clone(), *weight))
            .collect();
        self.store.insert_batch(&new_records).await?;
        let count = new_records.len();
        *records = new_records;
        info!(key.count = count, "Seeded key pool from configuration");
        Ok(count)
    }

    pub async fn total_keys(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Picks an eligible key, weighted-random by `weight`, and stamps its
    /// last-used time. Returns `None` when every key is inactive or cooling.
    pub async fn select(&self) -> Option<String> {
        let mut records = self.records.lock().await;
        self.reactivate_expired(&mut records).await;

        let now = Utc::now();
        let eligible: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_eligible(now))
            .map(|(i, _)| i)
            .collect();

        if eligible.is_empty() {
            warn!("No active API keys outside their cooldown are available");
            return None;
        }

        let total_weight: i64 = eligible.iter().map(|&i| records[i].weight).sum();
        let chosen = {
            let mut rng = thread_rng();
            if total_weight <= 0 {
                // Unreachable while weights stay >= 1; kept as a fallback.
                warn!(
                    total_weight,
                    "Non-positive total weight, selecting uniformly"
                );
                eligible[rng.gen_range(0..eligible.len())]
            } else {
                let mut roll = rng.gen_range(0..total_weight);
                let mut picked = eligible[0];
                for &i in &eligible {
                    roll -= records[i].weight;
                    if roll < 0 {
                        picked = i;
                        break;
                    }
                }
                picked
            }
        };

        let record = &mut records[chosen];
        record.last_used_at = Some(now);
        let secret = record.secret.clone();
        debug!(
            key.suffix = %safe_suffix(&secret),
            key.weight = record.weight,
            "Selected API key"
        );
        drop(records);

        // Last-used persistence is best-effort and must not slow selection.
        let store = Arc::clone(&self.store);
        let touched = secret.clone();
        tokio::spawn(async move {
            if let Err(e) = store.touch_last_used(&touched).await {
                debug!(key.suffix = %safe_suffix(&touched), error = %e, "last_used write skipped");
            }
        });

        Some(secret)
    }

    /// Records one failure: bumps the consecutive-failure count, deactivates
    /// the key and puts it on a (possibly progressive) cooldown. Returns the
    /// cooldown that was applied.
    pub async fn record_failure(&self, secret: &str) -> Result<Duration> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|r| r.secret == secret)
            .ok_or(AppError::KeyNotFound)?;

        let snapshot = record.clone();
        let now = Utc::now();
        record.failure_count += 1;
        record.last_failure_at = Some(now);
        record.is_active = false;

        let cooldown = progressive_cooldown(
            self.base_cooldown,
            self.max_consecutive_failures,
            record.failure_count,
        );
        record.cooldown_until = Some(now + chrono::Duration::from_std(cooldown).unwrap_or_default());
        record.updated_at = now;

        warn!(
            key.suffix = %safe_suffix(secret),
            key.failure_count = record.failure_count,
            cooldown_secs = cooldown.as_secs(),
            "Key failed, cooling down"
        );

        if let Err(e) = self
            .store
            .record_failure(secret, record.failure_count, cooldown)
            .await
        {
            warn!(key.suffix = %safe_suffix(secret), error = %e, "Failure write-through failed, rolling back");
            *record = snapshot;
            return Err(e);
        }
        Ok(cooldown)
    }

    /// Records a success or reactivation: the key becomes active and clean.
    /// Logging is suppressed when the state did not actually change.
    pub async fn record_success(&self, secret: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|r| r.secret == secret)
            .ok_or(AppError::KeyNotFound)?;

        let changed =
            !record.is_active || record.failure_count > 0 || record.cooldown_until.is_some();
        let snapshot = record.clone();
        record.is_active = true;
        record.failure_count = 0;
        record.last_failure_at = None;
        record.cooldown_until = None;
        record.updated_at = Utc::now();

        if let Err(e) = self.store.record_success(secret).await {
            warn!(key.suffix = %safe_suffix(secret), error = %e, "Success write-through failed, rolling back");
            *record = snapshot;
            return Err(e);
        }
        if changed {
            info!(key.suffix = %safe_suffix(secret), "Key marked healthy");
        }
        Ok(())
    }

    /// Adds keys from a spec string: dedupes within the input
    /// (last weight wins), skips secrets the pool already holds, inserts the
    /// rest in one transactional batch.
    pub async fn add_batch(&self, spec: &str) -> BatchAddOutcome {
        let mut records = self.records.lock().await;
        let parsed = parse_key_spec(spec);
        let mut outcome = BatchAddOutcome {
            duplicates_in_input: parsed.duplicates_in_input,
            invalid: parsed.invalid,
            errors: parsed.errors,
            ..Default::default()
        };

        let mut fresh: Vec<KeyRecord> = Vec::new();
        for (secret, weight) in parsed.entries {
            if records.iter().any(|r| r.secret == secret) {
                outcome.duplicates_in_store += 1;
                debug!(key.suffix = %safe_suffix(&secret), "Key already in pool, skipping");
                continue;
            }
            fresh.push(KeyRecord::new(secret, weight));
        }

        if fresh.is_empty() {
            return outcome;
        }

        match self.store.insert_batch(&fresh).await {
            Ok(()) => {
                outcome.added = fresh.len();
                records.extend(fresh);
                info!(
                    added = outcome.added,
                    duplicates_in_input = outcome.duplicates_in_input,
                    duplicates_in_store = outcome.duplicates_in_store,
                    invalid = outcome.invalid,
                    total = records.len(),
                    "Batch key add complete"
                );
            }
            Err(e) => {
                warn!(error = %e, "Batch key insert failed");
                outcome.errors.push(format!("batch insert failed: {e}"));
            }
        }
        outcome
    }

    /// Maps presentation suffixes back to full secrets and deletes them from
    /// both the store and the in-memory set. Returns the number of rows the
    /// store deleted.
    pub async fn delete_by_suffix_batch(&self, suffixes: &[String]) -> Result<u64> {
        let mut records = self.records.lock().await;
        let matched: Vec<String> = records
            .iter()
            .filter(|r| suffixes.iter().any(|s| safe_suffix(&r.secret) == *s))
            .map(|r| r.secret.clone())
            .collect();

        if matched.is_empty() {
            return Ok(0);
        }

        let deleted = self.store.delete_by_secrets(&matched).await?;
        records.retain(|r| !matched.contains(&r.secret));
        info!(
            requested = suffixes.len(),
            deleted, "Batch key deletion complete"
        );
        Ok(deleted)
    }

    /// Redacted, paginated snapshot for admin surfaces. Runs the
    /// reactivation sweep first so the view reflects current eligibility.
    pub async fn paginated_safe_view(&self, page: usize, limit: usize) -> PaginatedKeyStatuses {
        let mut records = self.records.lock().await;
        self.reactivate_expired(&mut records).await;

        let total_count = records.len();
        let page = page.max(1);
        let start = (page - 1).saturating_mul(limit);
        let keys = records
            .iter()
            .skip(start)
            .take(limit)
            .map(KeyStatusView::from_record)
            .collect();
        PaginatedKeyStatuses {
            keys,
            total_count,
            page,
            limit,
        }
    }

    /// Purges the store and the in-memory set, then loads the given spec.
    pub async fn reload_destructive(&self, spec: &str) -> Result<BatchAddOutcome> {
        let mut records = self.records.lock().await;
        warn!("Destructive key reload requested, purging all stored keys");
        self.store.delete_all().await?;
        records.clear();

        let parsed = parse_key_spec(spec);
        let mut outcome = BatchAddOutcome {
            duplicates_in_input: parsed.duplicates_in_input,
            invalid: parsed.invalid,
            errors: parsed.errors,
            ..Default::default()
        };
        let fresh: Vec<KeyRecord> = parsed
            .entries
            .into_iter()
            .map(|(secret, weight)| KeyRecord::new(secret, weight))
            .collect();
        if fresh.is_empty() {
            return Ok(outcome);
        }
        self.store.insert_batch(&fresh).await?;
        outcome.added = fresh.len();
        records.extend(fresh);
        info!(added = outcome.added, "Destructive reload complete");
        Ok(outcome)
    }

    /// Secrets the health prober should probe this cycle: keys that are
    /// inactive or carry failures, and are either already eligible again or
    /// close enough to cooldown expiry to be worth checking early.
    pub async fn probe_candidates(&self) -> Vec<String> {
        let mut records = self.records.lock().await;
        self.reactivate_expired(&mut records).await;

        let now = Utc::now();
        let near_window = near_expiry_window(self.base_cooldown);
        records
            .iter()
            .filter(|r| !r.is_active || r.failure_count > 0)
            .filter(|r| {
                r.is_eligible(now)
                    || r.cooldown_until.is_some_and(|until| {
                        now >= until - chrono::Duration::from_std(near_window).unwrap_or_default()
                    })
            })
            .map(|r| r.secret.clone())
            .collect()
    }

    /// Reactivation sweep: any inactive key whose cooldown has expired is
    /// restored to active-clean, in memory and in the store. Runs under the
    /// caller's lock so it is atomic with selection and snapshots.
    async fn reactivate_expired(&self, records: &mut Vec<KeyRecord>) {
        let now = Utc::now();
        for record in records.iter_mut() {
            if record.is_active {
                continue;
            }
            let Some(until) = record.cooldown_until else {
                continue;
            };
            if now < until {
                continue;
            }

            let snapshot = record.clone();
            record.is_active = true;
            record.failure_count = 0;
            record.last_failure_at = None;
            record.cooldown_until = None;
            record.updated_at = now;

            if let Err(e) = self.store.record_success(&record.secret).await {
                warn!(
                    key.suffix = %safe_suffix(&record.secret),
                    error = %e,
                    "Reactivation write-through failed, key stays cooling"
                );
                *record = snapshot;
            } else {
                info!(key.suffix = %safe_suffix(&record.secret), "Cooldown expired, key reactivated");
            }
        }
    }
}

/// Cooldown for the given consecutive-failure count: the base cooldown until
/// the count passes half the configured maximum, then multiplied by
/// `max(overshoot + 1, 2)`.
fn progressive_cooldown(base: Duration, max_consecutive_failures: i64, failure_count: i64) -> Duration {
    let half = max_consecutive_failures / 2;
    if max_consecutive_failures > 0 && failure_count > half {
        let overshoot = failure_count - half;
        let multiplier = (overshoot + 1).max(2) as u32;
        base * multiplier
    } else {
        base
    }
}

/// How far before cooldown expiry the prober may probe early.
fn near_expiry_window(base_cooldown: Duration) -> Duration {
    (base_cooldown / 5).min(Duration::from_secs(60))
}
