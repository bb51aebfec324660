// src/storage/record.rs

use chrono::{DateTime, Utc};

/// Durable state of a single upstream API key. This is the single source of
/// truth for key identity, weight and long-lived failure state; the pool
/// keeps an in-memory copy and writes every mutation back through the store.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRecord {
    /// The credential itself. Never logged in full; see `safe_suffix`.
    pub secret: String,
    /// Selection bias, always >= 1.
    pub weight: i64,
    /// False while cooling down or externally disabled.
    pub is_active: bool,
    /// Consecutive failures since the last success.
    pub failure_count: i64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KeyRecord {
    /// Fresh active record with the given weight.
    pub fn new(secret: impl Into<String>, weight: i64) -> Self {
        let now = Utc::now();
        Self {
            secret: secret.into(),
            weight: weight.max(1),
            is_active: true,
            failure_count: 0,
            last_failure_at: None,
            cooldown_until: None,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the cooldown (if any) still reaches into the future.
    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Whether a selection attempt may observe this key.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_cooling_down(now)
    }
}

/// Short suffix of a secret for logs and admin views, e.g. `...wxyz`.
pub fn safe_suffix(secret: &str) -> String {
    const SUFFIX_LEN: usize = 4;
    if secret.is_empty() {
        return "[EMPTY]".to_string();
    }
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > SUFFIX_LEN {
        let tail: String = chars[chars.len() - SUFFIX_LEN..].iter().collect();
        format!("...{tail}")
    } else {
        format!("...{secret}")
    }
}
