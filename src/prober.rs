// src/prober.rs

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::key_pool::safe_suffix;
use crate::state::AppState;

/// Grace before the first probe cycle after startup.
const INITIAL_GRACE: Duration = Duration::from_secs(15);
/// Per-probe budget.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Spawns the periodic key health prober. It reactivates keys whose
/// cooldowns expired by probing the upstream model catalogue with each
/// candidate key and reporting the outcome back through the pool.
///
/// Stops when the shutdown channel is signalled or its sender is dropped.
pub fn spawn(state: Arc<AppState>, mut shutdown: watch::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(INITIAL_GRACE) => {}
            _ = shutdown.changed() => {
                info!("Health prober cancelled during the initial grace period");
                return;
            }
        }

        let probe_client = match Client::builder().timeout(PROBE_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "Could not build the probe HTTP client; prober disabled");
                return;
            }
        };

        info!(
            period_secs = state.settings.health_check_interval.as_secs(),
            "Health prober started"
        );
        let mut ticker = interval(state.settings.health_check_interval);
        // An interval fires immediately; consume that so the first real
        // cycle lands one period after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Health prober stopping");
                    return;
                }
                _ = ticker.tick() => {
                    run_probe_cycle(&state, &probe_client, &shutdown).await;
                }
            }
        }
    })
}

/// One probe cycle over a snapshot of candidate keys.
async fn run_probe_cycle(
    state: &AppState,
    probe_client: &Client,
    shutdown: &watch::Receiver<()>,
) {
    let candidates = state.key_pool.probe_candidates().await;
    if candidates.is_empty() {
        debug!("No keys need probing this cycle");
        return;
    }
    debug!(candidate_count = candidates.len(), "Starting probe cycle");

    let mut checked = 0usize;
    for secret in candidates {
        if shutdown.has_changed().unwrap_or(true) {
            info!("Health prober interrupted mid-cycle");
            return;
        }
        probe_one(state, probe_client, &secret).await;
        checked += 1;
    }
    debug!(checked, "Probe cycle complete");
}

/// Probes one key against the model catalogue endpoint.
///
/// 200 reports success, 401/403/429 and timeouts report failure, anything
/// else (including other transport errors) leaves the key untouched.
async fn probe_one(state: &AppState, probe_client: &Client, secret: &str) {
    let result = probe_client
        .get(&state.settings.models_url)
        .bearer_auth(secret)
        .send()
        .await;

    match result {
        Ok(response) => match response.status() {
            StatusCode::OK => {
                info!(key.suffix = %safe_suffix(secret), "Probe passed, key healthy");
                if let Err(e) = state.key_pool.record_success(secret).await {
                    warn!(key.suffix = %safe_suffix(secret), error = %e, "Could not record probe success");
                }
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                warn!(
                    key.suffix = %safe_suffix(secret),
                    status = response.status().as_u16(),
                    "Probe rejected, marking key failed"
                );
                if let Err(e) = state.key_pool.record_failure(secret).await {
                    warn!(key.suffix = %safe_suffix(secret), error = %e, "Could not record probe failure");
                }
            }
            status => {
                debug!(
                    key.suffix = %safe_suffix(secret),
                    status = status.as_u16(),
                    "Unexpected probe status, leaving key state unchanged"
                );
            }
        },
        Err(e) if e.is_timeout() => {
            warn!(key.suffix = %safe_suffix(secret), "Probe timed out, marking key failed");
            if let Err(err) = state.key_pool.record_failure(secret).await {
                warn!(key.suffix = %safe_suffix(secret), error = %err, "Could not record probe failure");
            }
        }
        Err(e) => {
            debug!(
                key.suffix = %safe_suffix(secret),
                error = %e,
                "Probe transport error, leaving key state unchanged"
            );
        }
    }
}
