//! Integration tests for the HTTP transport.
//!
//! Drives the axum router in-process with `tower::ServiceExt::oneshot`,
//! with providers pointed at a wiremock upstream.

use axum::body::Body;
use http::{Request, StatusCode};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llm_router::config::{ApiKey, Config, ProviderConfig};
use llm_router::proxy::{create_router, AppState, DONE_MARKER, REQUEST_ID_HEADER};

fn test_app(server: Option<&MockServer>) -> axum::Router {
    let mut config = Config::default();
    if let Some(server) = server {
        config.providers.openai = ProviderConfig {
            api_key: Some(ApiKey::from("sk-openai")),
            base_url: Some(format!("{}/v1", server.uri())),
            default_max_tokens: None,
        };
    }
    create_router(AppState::from_config(config, reqwest::Client::new()))
}

fn chat_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .expect("read body")
        .to_vec()
}

async fn parse_body(response: axum::response::Response) -> (StatusCode, serde_json::Value) {
    let status = response.status();
    let bytes = body_bytes(response).await;
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap_or_default();
    (status, json)
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_lists_providers() {
    let server = MockServer::start().await;
    for uri in ["/health", "/_health"] {
        let response = test_app(Some(&server))
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let (status, json) = parse_body(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["providers"], serde_json::json!(["openai"]));
    }
}

#[tokio::test]
async fn test_health_without_providers() {
    let response = test_app(None)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let (status, json) = parse_body(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["providers"], serde_json::json!([]));
}

#[tokio::test]
async fn test_request_id_header_present() {
    let response = test_app(None)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let id = response
        .headers()
        .get(REQUEST_ID_HEADER)
        .expect("request id header")
        .to_str()
        .unwrap();
    assert!(uuid::Uuid::parse_str(id).is_ok(), "not a UUID: {id}");
}

// ============================================================================
// Chat completions
// ============================================================================

#[tokio::test]
async fn test_validation_error_is_400() {
    let response = test_app(None)
        .oneshot(chat_request(serde_json::json!({
            "model": "gpt-4o",
            "messages": []
        })))
        .await
        .unwrap();

    let (status, json) = parse_body(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["type"], "invalid_request_error");
    assert_eq!(json["error"]["code"], 400);
}

#[tokio::test]
async fn test_malformed_body_uses_error_envelope() {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from("{\"model\": \"gpt-4o\", \"messages\": ["))
        .unwrap();
    let response = test_app(None).oneshot(request).await.unwrap();

    let (status, json) = parse_body(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["type"], "invalid_request_error");
    assert_eq!(json["error"]["code"], 400);
}

#[tokio::test]
async fn test_missing_content_type_uses_error_envelope() {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .body(Body::from(r#"{"model":"gpt-4o","messages":[]}"#))
        .unwrap();
    let response = test_app(None).oneshot(request).await.unwrap();

    let (status, json) = parse_body(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"]["message"].as_str().is_some());
}

#[tokio::test]
async fn test_unconfigured_provider_is_400() {
    let response = test_app(None)
        .oneshot(chat_request(serde_json::json!({
            "model": "claude-3-opus",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    let (status, json) = parse_body(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["type"], "provider_not_found");
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .contains("claude-3-opus"));
}

#[tokio::test]
async fn test_blocking_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "chatcmpl-7",
            "model": "gpt-4o",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hi!"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2}
        })))
        .mount(&server)
        .await;

    let response = test_app(Some(&server))
        .oneshot(chat_request(serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    let (status, json) = parse_body(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["object"], "chat.completion");
    assert_eq!(json["choices"][0]["message"]["content"], "Hi!");
    assert_eq!(json["usage"]["total_tokens"], 5);
}

#[tokio::test]
async fn test_upstream_failure_is_502() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let response = test_app(Some(&server))
        .oneshot(chat_request(serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    let (status, json) = parse_body(response).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["error"]["type"], "upstream_error");
}

#[tokio::test]
async fn test_streaming_completion_framed_as_sse() {
    let server = MockServer::start().await;
    let upstream = concat!(
        "data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(upstream, "text/event-stream"))
        .mount(&server)
        .await;

    let response = test_app(Some(&server))
        .oneshot(chat_request(serde_json::json!({
            "model": "gpt-4o",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[http::header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = String::from_utf8(body_bytes(response).await).unwrap();
    let data: Vec<&str> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();

    assert_eq!(data.len(), 3, "body: {body}");
    let first: serde_json::Value = serde_json::from_str(data[0]).unwrap();
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["choices"][0]["delta"]["content"], "Hel");
    let second: serde_json::Value = serde_json::from_str(data[1]).unwrap();
    assert_eq!(second["choices"][0]["finish_reason"], "stop");
    assert_eq!(data[2], DONE_MARKER);
    assert!(!body.contains("event: error"));
}

#[tokio::test]
async fn test_streaming_failure_emits_error_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let response = test_app(Some(&server))
        .oneshot(chat_request(serde_json::json!({
            "model": "gpt-4o",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    // Headers are already sent when the upstream fails.
    assert_eq!(response.status(), StatusCode::OK);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("event: error"), "body: {body}");
    assert!(body.contains("bad key"), "body: {body}");
    assert!(!body.contains(DONE_MARKER));
}
