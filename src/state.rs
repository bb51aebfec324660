// src/state.rs

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::info;

use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::key_pool::KeyPool;
use crate::storage::{KeyStore, SqlKeyStore};

/// Shared application state, accessible by all handlers.
pub struct AppState {
    pub settings: Settings,
    pub key_pool: Arc<KeyPool>,
    pub http_client: Client,
    pub start_time: Instant,
}

/// Connection-pool knobs for the shared upstream client.
#[derive(Debug, Clone)]
struct ClientPoolConfig {
    max_idle_per_host: usize,
    idle_timeout: Duration,
    keepalive: Duration,
    connect_timeout: Duration,
}

impl Default for ClientPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 20,
            idle_timeout: Duration::from_secs(90),
            keepalive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

fn build_http_client(pool_config: &ClientPoolConfig) -> Result<Client> {
    // No client-wide total timeout: per-attempt deadlines are enforced by
    // the dispatcher, and a global timeout would cut long-lived streams.
    Client::builder()
        .connect_timeout(pool_config.connect_timeout)
        .pool_idle_timeout(pool_config.idle_timeout)
        .pool_max_idle_per_host(pool_config.max_idle_per_host)
        .tcp_keepalive(Some(pool_config.keepalive))
        .build()
        .map_err(|e| AppError::internal(format!("failed to build HTTP client: {e}")))
}

impl AppState {
    /// Creates the shared state: connects and migrates the store, loads the
    /// pool (seeding it from configuration on first run) and builds the
    /// upstream HTTP client.
    pub async fn new(settings: Settings) -> Result<Self> {
        let store = SqlKeyStore::connect(&settings.database_url).await?;
        store.migrate().await?;
        Self::with_store(settings, Arc::new(store)).await
    }

    /// Like `new`, but over an externally supplied store. Used by tests.
    pub async fn with_store(settings: Settings, store: Arc<dyn KeyStore>) -> Result<Self> {
        let key_pool = Arc::new(KeyPool::new(
            store,
            settings.key_failure_cooldown,
            settings.key_max_consecutive_failures,
        ));

        let loaded = key_pool.load_from_store().await?;
        if loaded == 0 {
            let seeded = key_pool
                .seed_from_config_if_empty(&settings.openrouter_api_keys)
                .await?;
            if seeded == 0 {
                info!("Starting with an empty key pool; add keys via the admin surface");
            }
        }

        let http_client = build_http_client(&ClientPoolConfig::default())?;

        Ok(Self {
            settings,
            key_pool,
            http_client,
            start_time: Instant::now(),
        })
    }
}
