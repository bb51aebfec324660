// tests/dispatcher_tests.rs

mod common;

use std::time::Duration;

use common::{TestGateway, TestSettingsBuilder};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn chat_body() -> Value {
    json!({
        "model": "openai/gpt-4o",
        "messages": [{"role": "user", "content": "hi"}]
    })
}

async fn spawn_against(upstream: &MockServer, keys: &str, retry_count: u32) -> TestGateway {
    let settings = TestSettingsBuilder::new()
        .with_upstream(&upstream.uri())
        .with_keys(keys)
        .with_retry_count(retry_count)
        .with_request_timeout(Duration::from_secs(5))
        .build();
    TestGateway::spawn(settings).await
}

#[tokio::test]
async fn retries_with_a_fresh_key_after_401() {
    let upstream = MockServer::start().await;
    // First attempt is rejected as unauthorized, the next one succeeds.
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("User not found."))
        .up_to_n_times(1)
        .expect(1)
        .mount(&upstream)
        .await;
    let success_body = json!({"id": "chatcmpl-1", "choices": [{"message": {"content": "pong"}}]});
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&success_body))
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = spawn_against(&upstream, "sk-alpha,sk-beta", 3).await;
    let response = reqwest::Client::new()
        .post(gateway.url("/v1/chat/completions"))
        .json(&chat_body())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, success_body);

    // Exactly two upstream calls, with two different keys.
    let requests = upstream.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let auth_first = requests[0].headers.get("authorization").unwrap();
    let auth_second = requests[1].headers.get("authorization").unwrap();
    assert_ne!(auth_first, auth_second);

    // One key took the failure, the other is clean.
    let view = gateway.state.key_pool.paginated_safe_view(1, 10).await;
    let failed: Vec<_> = view.keys.iter().filter(|k| !k.is_active).collect();
    let healthy: Vec<_> = view.keys.iter().filter(|k| k.is_active).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].failure_count, 1);
    assert_eq!(healthy.len(), 1);
    assert_eq!(healthy[0].failure_count, 0);
}

#[tokio::test]
async fn cooling_pool_fails_fast_with_503_and_no_upstream_call() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let gateway = spawn_against(&upstream, "sk-only", 3).await;
    gateway.state.key_pool.record_failure("sk-only").await.unwrap();

    let response = reqwest::Client::new()
        .post(gateway.url("/v1/chat/completions"))
        .json(&chat_body())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "no_available_keys_error");
}

#[tokio::test]
async fn successful_response_passes_through_byte_for_byte() {
    let upstream = MockServer::start().await;
    // Deliberately odd formatting; the gateway must not re-serialize.
    let raw_body = "{\"id\":\"chatcmpl-7\",  \"unmodelled_field\": [1,2,3]}\n";
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(raw_body.as_bytes().to_vec(), "application/json"),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = spawn_against(&upstream, "sk-only", 0).await;
    let response = reqwest::Client::new()
        .post(gateway.url("/v1/chat/completions"))
        .json(&chat_body())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    let bytes = response.bytes().await.unwrap();
    assert_eq!(&bytes[..], raw_body.as_bytes());
}

#[tokio::test]
async fn non_key_400_is_forwarded_without_retry() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("model does not exist"))
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = spawn_against(&upstream, "sk-a,sk-b", 3).await;
    let response = reqwest::Client::new()
        .post(gateway.url("/v1/chat/completions"))
        .json(&chat_body())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("model does not exist")
    );

    // A request-shaped 400 does not blame the key.
    let view = gateway.state.key_pool.paginated_safe_view(1, 10).await;
    assert!(view.keys.iter().all(|k| k.is_active && k.failure_count == 0));
}

#[tokio::test]
async fn billing_400_marks_the_key_and_is_retryable() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_string("{\"error\":{\"message\":\"insufficient_quota\"}}"),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    // Zero retry budget: the billing classification itself surfaces.
    let gateway = spawn_against(&upstream, "sk-only", 0).await;
    let response = reqwest::Client::new()
        .post(gateway.url("/v1/chat/completions"))
        .json(&chat_body())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "billing_error");

    let view = gateway.state.key_pool.paginated_safe_view(1, 10).await;
    assert!(!view.keys[0].is_active);
    assert_eq!(view.keys[0].failure_count, 1);
}

#[tokio::test]
async fn upstream_5xx_is_retried_with_a_fresh_key() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = spawn_against(&upstream, "sk-a,sk-b", 3).await;
    let response = reqwest::Client::new()
        .post(gateway.url("/v1/chat/completions"))
        .json(&chat_body())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(upstream.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn malformed_request_body_is_rejected_immediately() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let gateway = spawn_against(&upstream, "sk-only", 3).await;
    let response = reqwest::Client::new()
        .post(gateway.url("/v1/chat/completions"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn empty_model_falls_back_to_the_configured_default() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = spawn_against(&upstream, "sk-only", 0).await;
    let response = reqwest::Client::new()
        .post(gateway.url("/v1/chat/completions"))
        .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let requests = upstream.received_requests().await.unwrap();
    let forwarded: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(forwarded["model"], gateway.state.settings.default_model);
    // The stream field is coerced to an explicit false.
    assert_eq!(forwarded["stream"], json!(false));
}

#[tokio::test]
async fn gateway_bearer_token_guards_the_v1_surface() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&upstream)
        .await;

    let settings = TestSettingsBuilder::new()
        .with_upstream(&upstream.uri())
        .with_keys("sk-only")
        .with_app_api_key("gateway-token")
        .build();
    let gateway = TestGateway::spawn(settings).await;
    let client = reqwest::Client::new();

    let missing = client
        .get(gateway.url("/v1/models"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 401);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"]["type"], "authentication_error");

    let wrong = client
        .get(gateway.url("/v1/models"))
        .bearer_auth("other-token")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let right = client
        .get(gateway.url("/v1/models"))
        .bearer_auth("gateway-token")
        .send()
        .await
        .unwrap();
    assert_eq!(right.status(), 200);

    // The health endpoint stays open.
    let health = client.get(gateway.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn models_catalogue_is_translated_to_openai_shape() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"id": "openai/gpt-4o", "name": "GPT-4o", "context_length": 128000},
                {"id": "plainmodel"}
            ]
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = spawn_against(&upstream, "sk-only", 0).await;
    let response = reqwest::Client::new()
        .get(gateway.url("/v1/models"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"], "list");
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["id"], "openai/gpt-4o");
    assert_eq!(data[0]["object"], "model");
    assert_eq!(data[0]["owned_by"], "openai");
    assert_eq!(data[0]["root"], "openai/gpt-4o");
    assert!(data[0]["parent"].is_null());
    assert_eq!(data[0]["permission"][0]["object"], "model_permission");
    assert_eq!(data[1]["owned_by"], "openrouter");
}
