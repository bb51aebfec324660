// src/config.rs

use std::env;
use std::time::Duration;

use tracing::warn;

// Defaults mirror the documented environment reference.
const DEFAULT_CHAT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_MODELS_URL: &str = "https://openrouter.ai/api/v1/models";
const DEFAULT_MODEL: &str = "deepseek/deepseek-chat-v3-0324:free";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 180;
const DEFAULT_KEY_FAILURE_COOLDOWN_SECS: u64 = 600;
const DEFAULT_KEY_MAX_CONSECUTIVE_FAILURES: i64 = 3;
const DEFAULT_RETRY_WITH_NEW_KEY_COUNT: u32 = 3;
const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 300;
// `mode=rwc` lets SQLite create the database file on first run.
const DEFAULT_DATABASE_URL: &str = "sqlite:data/keys.db?mode=rwc";
const DEFAULT_PORT: u16 = 8000;

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Port the gateway listens on.
    pub port: u16,
    /// Upstream chat-completions endpoint (POST target).
    pub chat_url: String,
    /// Upstream model catalogue endpoint (GET target, also used by probes).
    pub models_url: String,
    /// Substituted when a request omits or empties `model`.
    pub default_model: String,
    /// Overall per-attempt budget for one upstream call.
    pub request_timeout: Duration,
    /// Base cooldown applied after a key failure.
    pub key_failure_cooldown: Duration,
    /// Progressive-cooldown knee: past half of this count the cooldown grows.
    pub key_max_consecutive_failures: i64,
    /// How many times the dispatcher retries with a fresh key.
    pub retry_with_new_key_count: u32,
    /// Health prober tick period.
    pub health_check_interval: Duration,
    /// Optional static bearer token protecting the `/v1` surface.
    pub app_api_key: Option<String>,
    /// Optional static token protecting the admin surface. Unset disables it.
    pub admin_token: Option<String>,
    /// Initial key spec (`secret[:weight]`, comma or newline separated).
    pub openrouter_api_keys: String,
    /// Database URL; driver is chosen from the scheme.
    pub database_url: String,
    /// Optional identity headers forwarded to the upstream.
    pub http_referer: Option<String>,
    pub x_title: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            chat_url: DEFAULT_CHAT_URL.to_string(),
            models_url: DEFAULT_MODELS_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            key_failure_cooldown: Duration::from_secs(DEFAULT_KEY_FAILURE_COOLDOWN_SECS),
            key_max_consecutive_failures: DEFAULT_KEY_MAX_CONSECUTIVE_FAILURES,
            retry_with_new_key_count: DEFAULT_RETRY_WITH_NEW_KEY_COUNT,
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            app_api_key: None,
            admin_token: None,
            openrouter_api_keys: String::new(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            http_referer: None,
            x_title: None,
        }
    }
}

impl Settings {
    /// Loads configuration from environment variables, falling back to
    /// defaults (with a warning) on unset or unparseable values.
    pub fn from_env() -> Self {
        Self {
            port: env_parsed("PORT", DEFAULT_PORT),
            chat_url: env_string("OPENROUTER_API_URL", DEFAULT_CHAT_URL),
            models_url: env_string("OPENROUTER_MODELS_URL", DEFAULT_MODELS_URL),
            default_model: env_string("DEFAULT_MODEL", DEFAULT_MODEL),
            request_timeout: env_duration_secs(
                "REQUEST_TIMEOUT_SECONDS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            ),
            key_failure_cooldown: env_duration_secs(
                "KEY_FAILURE_COOLDOWN_SECONDS",
                DEFAULT_KEY_FAILURE_COOLDOWN_SECS,
            ),
            key_max_consecutive_failures: env_parsed(
                "KEY_MAX_CONSECUTIVE_FAILURES",
                DEFAULT_KEY_MAX_CONSECUTIVE_FAILURES,
            ),
            retry_with_new_key_count: env_parsed(
                "RETRY_WITH_NEW_KEY_COUNT",
                DEFAULT_RETRY_WITH_NEW_KEY_COUNT,
            ),
            health_check_interval: env_duration_secs(
                "HEALTH_CHECK_INTERVAL_SECONDS",
                DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            ),
            app_api_key: env_optional("APP_API_KEY"),
            admin_token: env_optional("ADMIN_TOKEN"),
            openrouter_api_keys: env::var("OPENROUTER_API_KEYS").unwrap_or_default(),
            database_url: env_string("DATABASE_URL", DEFAULT_DATABASE_URL),
            http_referer: env_optional("HTTP_REFERER"),
            x_title: env_optional("X_TITLE"),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v.parse().unwrap_or_else(|_| {
            warn!(var = key, value = %v, "Unparseable value, using default");
            default
        }),
        _ => default,
    }
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    let secs: u64 = env_parsed(key, default_secs);
    Duration::from_secs(secs)
}
