// src/handlers/mod.rs

pub mod chat;
pub mod models;
pub mod relay;

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use tracing::{debug, instrument, warn};

use crate::error::{AppError, Result};
use crate::state::AppState;

/// Simple liveness probe. Returns HTTP 200 OK.
#[instrument(name = "health_check", level = "debug", skip_all)]
pub async fn health_check() -> StatusCode {
    debug!("Responding to health check");
    StatusCode::OK
}

/// Constant-time string comparison to prevent timing attacks.
pub(crate) fn secure_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (byte_a, byte_b) in a.bytes().zip(b.bytes()) {
        result |= byte_a ^ byte_b;
    }
    result == 0
}

/// Middleware guarding the `/v1` surface with the configured static bearer
/// token. Only attached when a token is configured; without one the surface
/// is open.
pub async fn verify_api_key(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response> {
    let Some(expected) = state.settings.app_api_key.as_deref() else {
        // The router only installs this middleware when a token is set.
        return Err(AppError::internal("API key middleware active without a configured token"));
    };

    let token = bearer_token(req.headers().get(header::AUTHORIZATION))?;
    if !secure_compare(token, expected) {
        warn!("Inbound request presented an invalid gateway API key");
        return Err(AppError::Unauthorized {
            message: "The provided API key is invalid.".to_string(),
            code: "invalid_api_key",
        });
    }
    Ok(next.run(req).await)
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub(crate) fn bearer_token(header: Option<&header::HeaderValue>) -> Result<&str> {
    let raw = header
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::Unauthorized {
            message: "An API key is required to access this service.".to_string(),
            code: "missing_api_key",
        })?;

    match raw.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim())
        }
        _ => Err(AppError::Unauthorized {
            message: "Invalid authorization scheme or missing token; use 'Bearer <token>'."
                .to_string(),
            code: "invalid_auth_scheme",
        }),
    }
}
