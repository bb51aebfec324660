// src/handlers/chat.rs

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{AppError, error_body};
use crate::handlers::relay::{CloseReason, RelayBody, run_relay};
use crate::key_pool::safe_suffix;
use crate::models::{ChatCompletionRequest, SSE_DATA_PREFIX, SSE_DONE_PAYLOAD};
use crate::state::AppState;

/// Pause between retries with a fresh key.
const RETRY_PAUSE: Duration = Duration::from_millis(250);
/// Extra pause after an upstream 5xx before the next attempt.
const SERVER_ERROR_BACKOFF: Duration = Duration::from_millis(500);
/// Capacity of the relay channel feeding a streaming response body.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Substrings of a 400 body that indicate a key/account problem rather than
/// a malformed request. Matched case-insensitively.
const KEY_ATTRIBUTABLE_400_MARKERS: &[&str] = &[
    "invalid api key",
    "quota",
    "credit",
    "balance",
    "funds",
    "insufficient_quota",
];

/// The last failure seen by the dispatcher, surfaced to the client when the
/// retry budget runs out.
struct LastError {
    status: StatusCode,
    message: String,
    kind: &'static str,
}

impl LastError {
    fn new(status: StatusCode, message: impl Into<String>, kind: &'static str) -> Self {
        Self {
            status,
            message: message.into(),
            kind,
        }
    }
}

/// Result of a single upstream attempt.
enum AttemptOutcome {
    /// The response reached the client (buffered body for the non-stream
    /// path, nothing for the stream path where bytes already flowed).
    Delivered(Option<Response>),
    /// Key-attributable or transient failure; try a fresh key.
    Retry(LastError),
    /// Terminal failure; stop and surface it.
    Fatal(LastError),
    /// The client went away; stop silently.
    ClientGone,
}

/// Where attempt output goes: a buffered response, or the SSE channel of an
/// already-opened stream.
enum Sink<'a> {
    Buffered,
    Stream(&'a mpsc::Sender<Bytes>),
}

/// `POST /v1/chat/completions`.
#[instrument(name = "chat_completions", skip_all)]
pub async fn chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let mut request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Rejecting malformed chat request");
            return AppError::InvalidRequest {
                message: format!("request body parse failed: {e}"),
            }
            .into_response();
        }
    };

    // The upstream payload's `stream` field always matches the client's
    // effective choice; absent means false.
    let is_stream = request.stream.unwrap_or(false);
    request.stream = Some(is_stream);
    if request.model.trim().is_empty() {
        request.model = state.settings.default_model.clone();
        debug!(model = %request.model, "No model given, using default");
    }

    info!(
        model = %request.model,
        stream = is_stream,
        user = request.user.as_deref().unwrap_or("N/A"),
        "Chat completion request accepted"
    );

    let payload = match serde_json::to_vec(&request) {
        Ok(p) => Bytes::from(p),
        Err(e) => {
            error!(error = %e, "Could not serialize upstream payload");
            return AppError::internal("failed to serialize upstream request").into_response();
        }
    };

    if is_stream {
        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        let task_state = state.clone();
        tokio::spawn(async move {
            dispatch(task_state, payload, Sink::Stream(&tx)).await;
        });

        // SSE streams are always 200; failures surface as error events.
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .header("x-accel-buffering", "no")
            .body(Body::from_stream(RelayBody::new(rx)))
            .unwrap_or_else(|e| AppError::internal(e.to_string()).into_response())
    } else {
        dispatch(state, payload, Sink::Buffered)
            .await
            .unwrap_or_else(|| AppError::internal("request produced no response").into_response())
    }
}

/// The per-request retry loop: selects a key, runs one attempt, rotates to a
/// fresh key on retryable failures until the budget is spent, then surfaces
/// the last failure.
async fn dispatch(state: Arc<AppState>, payload: Bytes, sink: Sink<'_>) -> Option<Response> {
    let mut retries_left = i64::from(state.settings.retry_with_new_key_count);
    let mut tried: HashSet<String> = HashSet::new();
    let mut last_error = LastError::new(
        StatusCode::SERVICE_UNAVAILABLE,
        "Request could not be completed after trying multiple keys.",
        "upstream_api_error",
    );

    loop {
        if let Sink::Stream(tx) = &sink {
            if tx.is_closed() {
                debug!("Client gone before next attempt, dropping request");
                return None;
            }
        }

        let Some(mut secret) = state.key_pool.select().await else {
            last_error = LastError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "All API keys are currently unavailable or cooling down.",
                "no_available_keys_error",
            );
            break;
        };

        // Best-effort anti-repeat: the pool's draw is probabilistic, so ask
        // again (at most pool-size times) for a key this request has not
        // burned yet. If none turns up, the duplicate is used anyway.
        if tried.contains(&secret) {
            let total = state.key_pool.total_keys().await;
            if tried.len() < total {
                for _ in 0..total {
                    match state.key_pool.select().await {
                        Some(candidate) if !tried.contains(&candidate) => {
                            debug!(key.suffix = %safe_suffix(&candidate), "Switched to an untried key");
                            secret = candidate;
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
            if tried.contains(&secret) {
                warn!(
                    tried = tried.len(),
                    key.suffix = %safe_suffix(&secret),
                    "No untried key available, reusing one"
                );
            }
        }
        tried.insert(secret.clone());

        info!(
            key.suffix = %safe_suffix(&secret),
            retries_left,
            "Attempting upstream request"
        );

        match attempt(&state, &payload, &secret, &sink).await {
            AttemptOutcome::Delivered(response) => return response,
            AttemptOutcome::ClientGone => {
                debug!("Client disconnected mid-attempt");
                return None;
            }
            AttemptOutcome::Fatal(err) => {
                warn!(
                    status = err.status.as_u16(),
                    error_type = err.kind,
                    "Non-retryable failure, stopping"
                );
                last_error = err;
                break;
            }
            AttemptOutcome::Retry(err) => {
                last_error = err;
                retries_left -= 1;
                if retries_left < 0 {
                    error!(
                        status = last_error.status.as_u16(),
                        error_type = last_error.kind,
                        "Retry budget exhausted"
                    );
                    break;
                }
                info!(retries_left, "Retrying with a fresh key");
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
    }

    emit_final_error(&sink, &last_error).await
}

/// One upstream call with the chosen key, including outcome classification.
async fn attempt(
    state: &AppState,
    payload: &Bytes,
    secret: &str,
    sink: &Sink<'_>,
) -> AttemptOutcome {
    let settings = &state.settings;
    let deadline = Instant::now() + settings.request_timeout;

    let mut request = state
        .http_client
        .post(&settings.chat_url)
        .header(header::AUTHORIZATION, format!("Bearer {secret}"))
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(referer) = &settings.http_referer {
        request = request.header("HTTP-Referer", referer);
    }
    if let Some(title) = &settings.x_title {
        request = request.header("X-Title", title);
    }

    let response = match timeout_at(deadline, request.body(payload.clone()).send()).await {
        Err(_) => {
            mark_failure(state, secret).await;
            return AttemptOutcome::Retry(LastError::new(
                StatusCode::GATEWAY_TIMEOUT,
                format!("Upstream request timed out (key {}).", safe_suffix(secret)),
                "upstream_timeout_error",
            ));
        }
        Ok(Err(e)) => {
            mark_failure(state, secret).await;
            if e.is_timeout() {
                return AttemptOutcome::Retry(LastError::new(
                    StatusCode::GATEWAY_TIMEOUT,
                    format!("Upstream request timed out (key {}).", safe_suffix(secret)),
                    "upstream_timeout_error",
                ));
            }
            return AttemptOutcome::Retry(LastError::new(
                StatusCode::BAD_GATEWAY,
                format!("Upstream network error (key {}): {e}", safe_suffix(secret)),
                "upstream_api_error",
            ));
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    if status == StatusCode::OK {
        return match sink {
            Sink::Buffered => deliver_buffered(state, secret, response, deadline).await,
            Sink::Stream(tx) => {
                let outcome =
                    run_relay(&state.key_pool, secret, response.bytes_stream(), tx, deadline).await;
                map_relay_outcome(state, secret, outcome).await
            }
        };
    }

    let detail = match timeout_at(deadline, response.text()).await {
        Ok(Ok(text)) if !text.trim().is_empty() => text.trim().to_string(),
        _ => format!("Upstream returned status {status} with an empty body."),
    };
    classify_error_status(state, secret, status, detail).await
}

/// Forwards a successful non-stream response body byte-for-byte.
async fn deliver_buffered(
    state: &AppState,
    secret: &str,
    response: reqwest::Response,
    deadline: Instant,
) -> AttemptOutcome {
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| header::HeaderValue::from_static("application/json"));

    let body = match timeout_at(deadline, response.bytes()).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            // The call itself got a 200; the key is not blamed for a broken
            // body read, but the attempt failed.
            return AttemptOutcome::Retry(LastError::new(
                StatusCode::BAD_GATEWAY,
                format!("Failed reading upstream response (key {}): {e}", safe_suffix(secret)),
                "upstream_api_error",
            ));
        }
        Err(_) => {
            return AttemptOutcome::Retry(LastError::new(
                StatusCode::GATEWAY_TIMEOUT,
                format!("Upstream response read timed out (key {}).", safe_suffix(secret)),
                "upstream_timeout_error",
            ));
        }
    };

    if let Err(e) = state.key_pool.record_success(secret).await {
        warn!(key.suffix = %safe_suffix(secret), error = %e, "Could not record key success");
    }
    info!(
        key.suffix = %safe_suffix(secret),
        bytes = body.len(),
        "Non-stream response delivered"
    );

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap_or_else(|e| AppError::internal(e.to_string()).into_response());
    AttemptOutcome::Delivered(Some(response))
}

/// Translates a relay outcome into the dispatcher's terms.
async fn map_relay_outcome(
    state: &AppState,
    secret: &str,
    outcome: crate::handlers::relay::RelayOutcome,
) -> AttemptOutcome {
    match outcome.close {
        CloseReason::DoneSentinel | CloseReason::UpstreamEof => AttemptOutcome::Delivered(None),
        CloseReason::ClientDisconnected => AttemptOutcome::ClientGone,
        CloseReason::TimeoutFirst => {
            mark_failure(state, secret).await;
            AttemptOutcome::Retry(LastError::new(
                StatusCode::GATEWAY_TIMEOUT,
                format!("Timed out waiting for initial data (key {}).", safe_suffix(secret)),
                "initial_data_timeout_error",
            ))
        }
        CloseReason::TimeoutMeaningful => {
            mark_failure(state, secret).await;
            AttemptOutcome::Retry(LastError::new(
                StatusCode::GATEWAY_TIMEOUT,
                format!("Timed out waiting for meaningful chat data (key {}).", safe_suffix(secret)),
                "meaningful_data_timeout_error",
            ))
        }
        CloseReason::PrematureEof => {
            mark_failure(state, secret).await;
            AttemptOutcome::Retry(LastError::new(
                StatusCode::BAD_GATEWAY,
                format!("Stream ended before meaningful data (key {}).", safe_suffix(secret)),
                "premature_eof_error",
            ))
        }
        CloseReason::TimeoutSubsequent => {
            // Partial data already reached the client; the stream just ends.
            warn!(key.suffix = %safe_suffix(secret), "Stream cut after partial delivery, not retrying");
            AttemptOutcome::Delivered(None)
        }
        CloseReason::ReadError(message) => {
            if outcome.meaningful {
                warn!(key.suffix = %safe_suffix(secret), error = %message, "Read error after partial delivery, not retrying");
                AttemptOutcome::Delivered(None)
            } else {
                mark_failure(state, secret).await;
                AttemptOutcome::Retry(LastError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Error reading upstream stream (key {}): {message}", safe_suffix(secret)),
                    "stream_read_error",
                ))
            }
        }
    }
}

/// Classification of non-200 upstream statuses.
async fn classify_error_status(
    state: &AppState,
    secret: &str,
    status: StatusCode,
    detail: String,
) -> AttemptOutcome {
    let wrapped = format!("Upstream API error (status {}): {}", status.as_u16(), detail);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            mark_failure(state, secret).await;
            AttemptOutcome::Retry(LastError::new(status, wrapped, "authentication_error"))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            mark_failure(state, secret).await;
            AttemptOutcome::Retry(LastError::new(status, wrapped, "rate_limit_error"))
        }
        StatusCode::BAD_REQUEST => {
            if is_key_attributable_400(&detail) {
                mark_failure(state, secret).await;
                AttemptOutcome::Retry(LastError::new(status, wrapped, "billing_error"))
            } else {
                // The request itself is bad; the upstream detail goes back to
                // the client verbatim and no other key is tried.
                AttemptOutcome::Fatal(LastError::new(status, wrapped, "invalid_request_error"))
            }
        }
        StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE => {
            mark_failure(state, secret).await;
            tokio::time::sleep(SERVER_ERROR_BACKOFF).await;
            AttemptOutcome::Retry(LastError::new(status, wrapped, "upstream_server_error"))
        }
        _ => AttemptOutcome::Fatal(LastError::new(status, wrapped, "upstream_api_error")),
    }
}

fn is_key_attributable_400(detail: &str) -> bool {
    let lowered = detail.to_lowercase();
    KEY_ATTRIBUTABLE_400_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

async fn mark_failure(state: &AppState, secret: &str) {
    if let Err(e) = state.key_pool.record_failure(secret).await {
        warn!(key.suffix = %safe_suffix(secret), error = %e, "Could not record key failure");
    }
}

/// Sends the last-seen failure to the client: a JSON envelope for buffered
/// requests, an SSE error event followed by `[DONE]` for streams.
async fn emit_final_error(sink: &Sink<'_>, last_error: &LastError) -> Option<Response> {
    let envelope = error_body(last_error.status, last_error.message.clone(), last_error.kind);
    match sink {
        Sink::Buffered => {
            Some((last_error.status, axum::Json(envelope)).into_response())
        }
        Sink::Stream(tx) => {
            let json = serde_json::to_string(&envelope).unwrap_or_else(|_| {
                r#"{"error":{"message":"internal error","type":"internal_server_error","code":"500"}}"#
                    .to_string()
            });
            if tx
                .send(Bytes::from(format!("{SSE_DATA_PREFIX}{json}\n\n")))
                .await
                .is_err()
            {
                return None;
            }
            let _ = tx
                .send(Bytes::from(format!("{SSE_DATA_PREFIX}{SSE_DONE_PAYLOAD}\n\n")))
                .await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_substrings_match_case_insensitively() {
        assert!(is_key_attributable_400("Invalid API Key provided"));
        assert!(is_key_attributable_400("you have exceeded your QUOTA"));
        assert!(is_key_attributable_400("insufficient_quota"));
        assert!(is_key_attributable_400("not enough credit remaining"));
        assert!(!is_key_attributable_400("model does not exist"));
        assert!(!is_key_attributable_400("messages must not be empty"));
    }
}
