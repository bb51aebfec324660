// src/handlers/models.rs

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tokio::time::{Instant, timeout_at};
use tracing::{error, info, instrument, warn};

use crate::error::error_body;
use crate::models::{
    ListModelsResponse, ModelData, ModelPermission, UpstreamModel, UpstreamModelsResponse,
};
use crate::state::AppState;

/// `GET /v1/models`: fetches the upstream catalogue and rewrites it to the
/// OpenAI list shape. The catalogue is public, so no key is attached.
#[instrument(name = "list_models", skip_all)]
pub async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let settings = &state.settings;
    let deadline = Instant::now() + settings.request_timeout;

    let response = match timeout_at(deadline, state.http_client.get(&settings.models_url).send())
        .await
    {
        Err(_) => {
            warn!("Upstream model catalogue request timed out");
            return (
                StatusCode::GATEWAY_TIMEOUT,
                Json(error_body(
                    StatusCode::GATEWAY_TIMEOUT,
                    "Upstream model catalogue request timed out.",
                    "upstream_timeout_error",
                )),
            )
                .into_response();
        }
        Ok(Err(e)) => {
            error!(error = %e, "Upstream model catalogue request failed");
            return (
                StatusCode::BAD_GATEWAY,
                Json(error_body(
                    StatusCode::BAD_GATEWAY,
                    format!("Upstream model catalogue request failed: {e}"),
                    "upstream_api_error",
                )),
            )
                .into_response();
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    if status != StatusCode::OK {
        let detail = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), "Upstream model catalogue returned an error");
        return (
            status,
            Json(error_body(
                status,
                format!(
                    "Upstream model catalogue error (status {}): {}",
                    status.as_u16(),
                    detail.trim()
                ),
                "upstream_api_error",
            )),
        )
            .into_response();
    }

    let upstream: UpstreamModelsResponse = match response.json().await {
        Ok(parsed) => parsed,
        Err(e) => {
            error!(error = %e, "Could not decode upstream model catalogue");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(error_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to parse upstream model catalogue.",
                    "internal_server_error",
                )),
            )
                .into_response();
        }
    };

    let created = Utc::now().timestamp();
    let data: Vec<ModelData> = upstream
        .data
        .into_iter()
        .map(|model| translate_model(model, created))
        .collect();

    info!(model.count = data.len(), "Model catalogue translated");
    Json(ListModelsResponse {
        object: "list".to_string(),
        data,
    })
    .into_response()
}

fn translate_model(model: UpstreamModel, created: i64) -> ModelData {
    let owned_by = owner_of(&model.id);
    let permission = ModelPermission {
        id: format!("modelperm-{}-{}", model.id.replace('/', "-"), created),
        object: "model_permission".to_string(),
        created,
        allow_create_engine: false,
        allow_sampling: true,
        allow_logprobs: true,
        allow_search_indices: false,
        allow_view: true,
        allow_fine_tuning: false,
        organization: "*".to_string(),
        group: None,
        is_blocking: false,
    };
    ModelData {
        id: model.id.clone(),
        object: "model".to_string(),
        created,
        owned_by,
        permissions: vec![permission],
        root: model.id,
        parent: None,
    }
}

/// The part of the id before the first `/`, else `"openrouter"`.
fn owner_of(id: &str) -> String {
    match id.split_once('/') {
        Some((owner, _)) if !owner.is_empty() => owner.to_string(),
        _ => "openrouter".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_is_prefix_before_first_slash() {
        assert_eq!(owner_of("openai/gpt-4o"), "openai");
        assert_eq!(owner_of("deepseek/deepseek-chat-v3-0324:free"), "deepseek");
        assert_eq!(owner_of("plainmodel"), "openrouter");
        assert_eq!(owner_of("/weird"), "openrouter");
    }

    #[test]
    fn translation_fills_openai_shape() {
        let model = UpstreamModel {
            id: "openai/gpt-4o".to_string(),
            name: None,
        };
        let data = translate_model(model, 1_700_000_000);
        assert_eq!(data.object, "model");
        assert_eq!(data.owned_by, "openai");
        assert_eq!(data.root, "openai/gpt-4o");
        assert!(data.parent.is_none());
        assert_eq!(data.permissions.len(), 1);
        assert_eq!(data.permissions[0].object, "model_permission");
        assert!(data.permissions[0].allow_sampling);
        assert!(!data.permissions[0].is_blocking);
    }
}
