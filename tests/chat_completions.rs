use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use grok_proxy::{
    ApiKeyStore, ChatCompletionResponse, ChatProvider, ConversationParams, ProxyState,
    StaticKeyStore, UpstreamReply, router,
};
use serde_json::{Value, json};
use tower::util::ServiceExt;

#[derive(Clone, Default)]
struct StubProvider {
    reply: UpstreamReply,
    unavailable: Option<String>,
    internal: Option<String>,
    calls: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ChatProvider for StubProvider {
    async fn converse(
        &self,
        _model: &str,
        prompt: &str,
        _params: ConversationParams,
    ) -> grok_proxy::Result<UpstreamReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(message) = &self.unavailable {
            return Err(grok_proxy::ProxyError::UpstreamUnavailable(message.clone()));
        }
        if let Some(message) = &self.internal {
            return Err(grok_proxy::ProxyError::Config(message.clone()));
        }
        Ok(self.reply.clone())
    }
}

struct FailingKeyStore;

#[async_trait]
impl ApiKeyStore for FailingKeyStore {
    async fn is_valid(&self, _api_key: &str) -> grok_proxy::Result<bool> {
        Err(grok_proxy::ProxyError::Config("key store offline".to_string()))
    }
}

fn text_reply(text: &str) -> UpstreamReply {
    UpstreamReply {
        response: Some(text.to_string()),
        ..UpstreamReply::default()
    }
}

fn app(stub: StubProvider) -> axum::Router {
    router(ProxyState::new(stub, StaticKeyStore::new(["gk-test"])))
}

fn chat_request(body: Value, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn user_chat(content: &str) -> Value {
    json!({
        "model": "grok-4",
        "messages": [{"role": "user", "content": content}]
    })
}

#[tokio::test]
async fn missing_api_key_returns_401_without_upstream_call() {
    let stub = StubProvider {
        reply: text_reply("hi"),
        ..StubProvider::default()
    };
    let calls = stub.calls.clone();
    let response = app(stub)
        .oneshot(chat_request(user_chat("hello"), None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["detail"], "Invalid or missing API key");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_api_key_returns_401() {
    let stub = StubProvider {
        reply: text_reply("hi"),
        ..StubProvider::default()
    };
    let response = app(stub)
        .oneshot(chat_request(user_chat("hello"), Some("gk-wrong")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn raw_authorization_and_x_api_key_headers_are_accepted() {
    for (header, value) in [("authorization", "gk-test"), ("x-api-key", "gk-test")] {
        let stub = StubProvider {
            reply: text_reply("hi"),
            ..StubProvider::default()
        };
        let request = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .header(header, value)
            .body(Body::from(user_chat("hello").to_string()))
            .unwrap();
        let response = app(stub).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn missing_user_message_returns_400_without_upstream_call() {
    let stub = StubProvider {
        reply: text_reply("hi"),
        ..StubProvider::default()
    };
    let calls = stub.calls.clone();
    let body = json!({
        "model": "grok-4",
        "messages": [{"role": "system", "content": "be brief"}]
    });
    let response = app(stub)
        .oneshot(chat_request(body, Some("gk-test")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["detail"], "No user message found in messages");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_body_returns_400() {
    let stub = StubProvider::default();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", "Bearer gk-test")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app(stub).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_model_returns_400_without_upstream_call() {
    let stub = StubProvider {
        reply: text_reply("hi"),
        ..StubProvider::default()
    };
    let calls = stub.calls.clone();
    let body = json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "hello"}]
    });
    let response = app(stub)
        .oneshot(chat_request(body, Some("gk-test")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let parsed: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
            .unwrap();
    assert_eq!(parsed["detail"], "Model gpt-4o not found");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn single_user_message_flattens_without_context() {
    let stub = StubProvider {
        reply: text_reply("hi"),
        ..StubProvider::default()
    };
    let prompts = stub.prompts.clone();
    let response = app(stub)
        .oneshot(chat_request(user_chat("hello"), Some("gk-test")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(prompts.lock().unwrap().as_slice(), ["User: hello"]);
}

#[tokio::test]
async fn system_message_prefixes_the_flattened_prompt() {
    let stub = StubProvider {
        reply: text_reply("hi"),
        ..StubProvider::default()
    };
    let prompts = stub.prompts.clone();
    let body = json!({
        "model": "grok-4",
        "messages": [
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hello"}
        ]
    });
    let response = app(stub)
        .oneshot(chat_request(body, Some("gk-test")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        prompts.lock().unwrap().as_slice(),
        ["System: be brief\nUser: hello"]
    );
}

#[tokio::test]
async fn history_is_flattened_without_duplicating_the_last_message() {
    let stub = StubProvider {
        reply: text_reply("hi"),
        ..StubProvider::default()
    };
    let prompts = stub.prompts.clone();
    let body = json!({
        "model": "grok-4",
        "messages": [
            {"role": "user", "content": "A"},
            {"role": "assistant", "content": "B"},
            {"role": "user", "content": "C"}
        ]
    });
    let response = app(stub)
        .oneshot(chat_request(body, Some("gk-test")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        prompts.lock().unwrap().as_slice(),
        ["User: A\nAssistant: B\nUser: C"]
    );
}

#[tokio::test]
async fn successful_completion_has_openai_shape_and_consistent_usage() {
    let stub = StubProvider {
        reply: text_reply("the answer is four"),
        ..StubProvider::default()
    };
    let response = app(stub)
        .oneshot(chat_request(user_chat("what is two plus two"), Some("gk-test")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: ChatCompletionResponse = serde_json::from_slice(&body).unwrap();
    assert!(parsed.id.starts_with("chatcmpl-"));
    assert_eq!(parsed.object, "chat.completion");
    assert!(parsed.created > 0);
    assert_eq!(parsed.model, "grok-4");
    assert_eq!(parsed.choices.len(), 1);
    assert_eq!(parsed.choices[0].index, 0);
    assert_eq!(parsed.choices[0].message.role, "assistant");
    assert_eq!(parsed.choices[0].message.content, "the answer is four");
    assert_eq!(parsed.choices[0].finish_reason.as_deref(), Some("stop"));
    assert_eq!(
        parsed.usage.total_tokens,
        parsed.usage.prompt_tokens + parsed.usage.completion_tokens
    );
    assert!(parsed.usage.completion_tokens > 0);
}

#[tokio::test]
async fn identical_requests_get_distinct_ids_but_identical_content() {
    let stub = StubProvider {
        reply: text_reply("deterministic"),
        ..StubProvider::default()
    };
    let app = app(stub);

    let mut ids = Vec::new();
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(chat_request(user_chat("same"), Some("gk-test")))
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: ChatCompletionResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.choices[0].message.content, "deterministic");
        ids.push(parsed.id);
    }
    assert_ne!(ids[0], ids[1]);
}

#[tokio::test]
async fn upstream_error_payload_maps_to_502_error_completion() {
    let stub = StubProvider {
        reply: UpstreamReply {
            error: Some(json!({ "error": { "message": "rate limited" } })),
            ..UpstreamReply::default()
        },
        ..StubProvider::default()
    };
    let response = app(stub)
        .oneshot(chat_request(user_chat("hello"), Some("gk-test")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: ChatCompletionResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed.object, "chat.completion");
    assert_eq!(
        parsed.choices[0].message.content,
        "Grok API Error: rate limited"
    );
}

#[tokio::test]
async fn upstream_transport_failure_maps_to_502() {
    let stub = StubProvider {
        unavailable: Some("connection refused".to_string()),
        ..StubProvider::default()
    };
    let response = app(stub)
        .oneshot(chat_request(user_chat("hello"), Some("gk-test")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: ChatCompletionResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        parsed.choices[0].message.content,
        "Grok API Error: connection refused"
    );
}

#[tokio::test]
async fn key_store_failure_returns_500_detail() {
    let stub = StubProvider {
        reply: text_reply("hi"),
        ..StubProvider::default()
    };
    let calls = stub.calls.clone();
    let app = router(ProxyState::new(stub, FailingKeyStore));
    let response = app
        .oneshot(chat_request(user_chat("hello"), Some("gk-test")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let parsed: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
            .unwrap();
    let detail = parsed["detail"].as_str().unwrap();
    assert!(detail.starts_with("Error: "));
    assert!(detail.contains("key store offline"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn internal_provider_error_returns_500_detail() {
    let stub = StubProvider {
        internal: Some("misconfigured client".to_string()),
        ..StubProvider::default()
    };
    let response = app(stub)
        .oneshot(chat_request(user_chat("hello"), Some("gk-test")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let parsed: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
            .unwrap();
    let detail = parsed["detail"].as_str().unwrap();
    assert!(detail.starts_with("Error: "));
    assert!(detail.contains("misconfigured client"));
}

#[tokio::test]
async fn empty_upstream_response_maps_to_503() {
    let stub = StubProvider::default();
    let response = app(stub)
        .oneshot(chat_request(user_chat("hello"), Some("gk-test")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let parsed: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
            .unwrap();
    assert_eq!(parsed["detail"], "Empty response from Grok API");
}

#[tokio::test]
async fn models_endpoint_requires_key_and_lists_catalog() {
    let stub = StubProvider::default();
    let app = app(stub);

    let denied = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(denied).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let allowed = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .header("authorization", "Bearer gk-test")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(allowed).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let parsed: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
            .unwrap();
    assert_eq!(parsed["object"], "list");
    let ids: Vec<&str> = parsed["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(
        ids,
        ["grok-3-auto", "grok-3-fast", "grok-4", "grok-4-mini-thinking-tahoe"]
    );
    assert!(
        parsed["data"]
            .as_array()
            .unwrap()
            .iter()
            .all(|m| m["owned_by"] == "grok")
    );
}

#[tokio::test]
async fn health_endpoint_is_open() {
    let stub = StubProvider::default();
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app(stub).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
