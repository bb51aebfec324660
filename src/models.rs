// src/models.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;

// --- SSE framing constants ---

/// SSE data lines start with this prefix.
pub const SSE_DATA_PREFIX: &str = "data: ";
/// Payload of the terminal SSE event.
pub const SSE_DONE_PAYLOAD: &str = "[DONE]";

// --- OpenAI-compatible chat types ---

/// A single message in a chat conversation.
///
/// `content` stays an opaque JSON value: it is a plain string for text
/// messages and an array of parts for multimodal ones, and the gateway
/// forwards it untouched either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Chat completion request, OpenAI schema.
///
/// The `extra` map captures every field this struct does not model so the
/// payload reaches the upstream unmodified; the gateway only ever rewrites
/// `model` (default substitution) and `stream` (coerced to the effective
/// client choice).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// --- Streaming (SSE) chunk types ---

/// Incremental message content inside a streamed choice.
#[derive(Debug, Clone, Deserialize)]
pub struct SseChoiceDelta {
    pub content: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SseChoice {
    pub delta: SseChoiceDelta,
    #[serde(default)]
    pub index: i64,
    pub finish_reason: Option<String>,
}

/// One SSE event payload of a streamed chat completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<SseChoice>,
}

impl ChatCompletionChunk {
    /// A chunk is meaningful when the first choice carries non-empty
    /// delta content.
    pub fn has_meaningful_content(&self) -> bool {
        self.choices
            .first()
            .and_then(|c| c.delta.content.as_deref())
            .is_some_and(|content| !content.is_empty())
    }
}

// --- /v1/models response types ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPermission {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub allow_create_engine: bool,
    pub allow_sampling: bool,
    pub allow_logprobs: bool,
    pub allow_search_indices: bool,
    pub allow_view: bool,
    pub allow_fine_tuning: bool,
    pub organization: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub is_blocking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelData {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    // The OpenAI schema uses the singular key for an array value.
    #[serde(rename = "permission")]
    pub permissions: Vec<ModelPermission>,
    pub root: String,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListModelsResponse {
    pub object: String,
    pub data: Vec<ModelData>,
}

/// One model entry as the upstream catalogue reports it. Only `id` matters
/// for the translation; the rest is tolerated and dropped.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamModel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamModelsResponse {
    #[serde(default)]
    pub data: Vec<UpstreamModel>,
}

// --- Error envelope ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

// --- Admin surface DTOs ---

#[derive(Debug, Deserialize)]
pub struct AddKeysRequest {
    pub key_data: String,
}

#[derive(Debug, Deserialize)]
pub struct BatchDeleteRequest {
    pub suffixes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReloadKeysRequest {
    pub keys_spec: String,
}
