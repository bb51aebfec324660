// src/admin.rs

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{AppError, Result};
use crate::handlers::{bearer_token, secure_compare};
use crate::key_pool::{BatchAddOutcome, PaginatedKeyStatuses};
use crate::models::{AddKeysRequest, BatchDeleteRequest, ReloadKeysRequest};
use crate::state::AppState;

const DEFAULT_PAGE_LIMIT: usize = 10;
const MAX_PAGE_LIMIT: usize = 100;

/// JSON admin surface for key management. Token-guarded; the router is only
/// mounted when an admin token is configured.
pub fn admin_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/admin/keys",
            get(list_keys).post(add_keys).delete(delete_keys),
        )
        .route("/admin/keys/reload", post(reload_keys))
        .route("/admin/status", get(app_status))
        .layer(middleware::from_fn_with_state(state, admin_auth))
}

/// Middleware checking the static admin token on every admin request.
async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response> {
    let Some(expected) = state.settings.admin_token.as_deref() else {
        return Err(AppError::Config {
            message: "admin surface is disabled; set ADMIN_TOKEN to enable it".to_string(),
        });
    };
    let token = bearer_token(req.headers().get(axum::http::header::AUTHORIZATION))?;
    if !secure_compare(token, expected) {
        warn!("Admin request presented an invalid token");
        return Err(AppError::Unauthorized {
            message: "The provided admin token is invalid.".to_string(),
            code: "invalid_admin_token",
        });
    }
    Ok(next.run(req).await)
}

#[derive(Debug, Deserialize)]
struct PaginationParams {
    page: Option<usize>,
    limit: Option<usize>,
}

/// `GET /admin/keys?page&limit`: redacted, paginated key statuses.
#[instrument(name = "admin_list_keys", skip_all)]
async fn list_keys(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> Json<PaginatedKeyStatuses> {
    let page = params.page.unwrap_or(1).max(1);
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT);
    Json(state.key_pool.paginated_safe_view(page, limit).await)
}

/// `POST /admin/keys`: batch add from a key spec string.
#[instrument(name = "admin_add_keys", skip_all)]
async fn add_keys(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddKeysRequest>,
) -> Json<BatchAddOutcome> {
    info!("Admin requested a batch key add");
    Json(state.key_pool.add_batch(&request.key_data).await)
}

#[derive(Debug, Serialize)]
struct BatchDeleteOutcome {
    deleted_count: u64,
    requested_count: usize,
}

/// `DELETE /admin/keys`: batch delete by presentation suffixes.
#[instrument(name = "admin_delete_keys", skip_all)]
async fn delete_keys(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchDeleteRequest>,
) -> Result<Json<BatchDeleteOutcome>> {
    if request.suffixes.is_empty() {
        return Err(AppError::InvalidRequest {
            message: "the list of key suffixes to delete must not be empty".to_string(),
        });
    }
    info!(requested = request.suffixes.len(), "Admin requested a batch key deletion");
    let deleted_count = state
        .key_pool
        .delete_by_suffix_batch(&request.suffixes)
        .await?;
    Ok(Json(BatchDeleteOutcome {
        deleted_count,
        requested_count: request.suffixes.len(),
    }))
}

/// `POST /admin/keys/reload`: destructive reload from a key spec string.
#[instrument(name = "admin_reload_keys", skip_all)]
async fn reload_keys(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReloadKeysRequest>,
) -> Result<Json<BatchAddOutcome>> {
    warn!("Admin requested a destructive key reload");
    let outcome = state.key_pool.reload_destructive(&request.keys_spec).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
struct AppStatusInfo {
    uptime_seconds: u64,
    total_keys: usize,
    default_model: String,
    chat_url: String,
    models_url: String,
    request_timeout_seconds: u64,
    key_failure_cooldown_seconds: u64,
    key_max_consecutive_failures: i64,
    retry_with_new_key_count: u32,
    health_check_interval_seconds: u64,
    gateway_auth_enabled: bool,
    port: u16,
}

/// `GET /admin/status`: uptime and the effective configuration.
#[instrument(name = "admin_app_status", skip_all)]
async fn app_status(State(state): State<Arc<AppState>>) -> Json<AppStatusInfo> {
    let settings = &state.settings;
    Json(AppStatusInfo {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        total_keys: state.key_pool.total_keys().await,
        default_model: settings.default_model.clone(),
        chat_url: settings.chat_url.clone(),
        models_url: settings.models_url.clone(),
        request_timeout_seconds: settings.request_timeout.as_secs(),
        key_failure_cooldown_seconds: settings.key_failure_cooldown.as_secs(),
        key_max_consecutive_failures: settings.key_max_consecutive_failures,
        retry_with_new_key_count: settings.retry_with_new_key_count,
        health_check_interval_seconds: settings.health_check_interval.as_secs(),
        gateway_auth_enabled: settings.app_api_key.is_some(),
        port: settings.port,
    })
}
