// src/lib.rs

// Declare modules that constitute the library's public API or internal structure
pub mod admin;
pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod key_pool;
pub mod models;
pub mod prober;
pub mod state;
pub mod storage;

use axum::{
    Router,
    body::Body,
    http::Request as AxumRequest,
    middleware::{self, Next},
    response::Response as AxumResponse,
    routing::{get, post},
};
use std::{sync::Arc, time::Instant};
use tracing::{Instrument, Level, info, span};
use uuid::Uuid;

pub use config::Settings;
pub use error::{AppError, Result};
pub use state::AppState;

/// Creates the main Axum router for the application.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut v1 = Router::new()
        .route("/v1/models", get(handlers::models::list_models))
        .route("/v1/chat/completions", post(handlers::chat::chat_completions));

    if state.settings.app_api_key.is_some() {
        v1 = v1.layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::verify_api_key,
        ));
        info!("'/v1' surface requires the configured gateway API key");
    }

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .merge(v1);

    if state.settings.admin_token.is_some() {
        router = router.merge(admin::admin_routes(state.clone()));
        info!("Admin surface enabled");
    }

    router
        .layer(middleware::from_fn(trace_requests))
        .with_state(state)
}

/// Middleware to add Request ID and trace requests.
async fn trace_requests(req: AxumRequest<Body>, next: Next) -> AxumResponse {
    let request_id = Uuid::new_v4();
    let start_time = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let span = span!(
        Level::INFO,
        "request",
        request_id = %request_id,
        http.method = %method,
        url.path = %path,
    );

    let response = next.run(req).instrument(span).await;
    let elapsed = start_time.elapsed();

    info!(
        request_id = %request_id,
        http.method = %method,
        url.path = %path,
        http.response.duration = ?elapsed,
        http.status_code = response.status().as_u16(),
        "Finished processing request"
    );

    response
}

/// Builds the application state and router from the given settings.
///
/// # Errors
///
/// Returns an error if the database cannot be reached or migrated, or the
/// HTTP client cannot be constructed.
pub async fn run(settings: Settings) -> Result<(Router, Arc<AppState>)> {
    info!("Starting OpenRouter credential-pooling gateway...");

    if settings.openrouter_api_keys.trim().is_empty() {
        info!("OPENROUTER_API_KEYS not set; relying on previously stored keys");
    }

    let state = Arc::new(AppState::new(settings).await?);
    info!(
        key.count = state.key_pool.total_keys().await,
        server.port = state.settings.port,
        "Application state initialized"
    );

    let router = create_router(state.clone());
    Ok((router, state))
}
