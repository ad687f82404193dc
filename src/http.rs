//! The OpenAI-compatible HTTP surface: request gate, translation to one
//! upstream call, response shaping (JSON or SSE), and error mapping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use futures_util::stream;
use serde::Serialize;

use crate::ProxyError;
use crate::keystore::{ApiKeyStore, hex_encode};
use crate::model;
use crate::prompt::{estimate_usage, flatten_messages};
use crate::provider::{ChatProvider, ConversationParams, error_display_message};
use crate::types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Usage};

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

const PACING_DELAY: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct ProxyState {
    provider: Arc<dyn ChatProvider>,
    keys: Arc<dyn ApiKeyStore>,
    json_logs: bool,
}

impl ProxyState {
    pub fn new(
        provider: impl ChatProvider + 'static,
        keys: impl ApiKeyStore + 'static,
    ) -> Self {
        Self {
            provider: Arc::new(provider),
            keys: Arc::new(keys),
            json_logs: false,
        }
    }

    pub fn with_json_logs(mut self) -> Self {
        self.json_logs = true;
        self
    }
}

#[derive(Debug, Serialize)]
struct Detail {
    detail: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn list_models(
    State(state): State<ProxyState>,
    headers: HeaderMap,
) -> Result<Json<model::ModelList>, (StatusCode, Json<Detail>)> {
    require_api_key(&state, &headers).await?;
    Ok(Json(model::catalog()))
}

async fn chat_completions(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, (StatusCode, Json<Detail>)> {
    require_api_key(&state, &headers).await?;

    let request: ChatCompletionRequest = serde_json::from_slice(&body).map_err(|err| {
        detail_response(
            StatusCode::BAD_REQUEST,
            format!("Invalid request body: {err}"),
        )
    })?;

    model::lookup(&request.model)
        .map_err(|err| detail_response(StatusCode::BAD_REQUEST, err.to_string()))?;

    let prompt = flatten_messages(&request.messages)
        .map_err(|err| detail_response(StatusCode::BAD_REQUEST, err.to_string()))?;

    let request_id =
        extract_header(&headers, "x-request-id").unwrap_or_else(generate_request_id);
    emit_json_log(
        &state,
        "chat.request",
        serde_json::json!({
            "request_id": &request_id,
            "model": &request.model,
            "messages": request.messages.len(),
            "stream": request.stream,
        }),
    );

    let params = ConversationParams {
        max_tokens: request.max_tokens,
        temperature: request.temperature,
    };
    let reply = match state.provider.converse(&request.model, &prompt, params).await {
        Ok(reply) => reply,
        Err(ProxyError::UpstreamUnavailable(message)) => {
            emit_json_log(
                &state,
                "chat.error",
                serde_json::json!({ "request_id": &request_id, "error": &message }),
            );
            return Ok(error_completion_response(&request.model, &message));
        }
        Err(err) => {
            emit_json_log(
                &state,
                "chat.error",
                serde_json::json!({ "request_id": &request_id, "error": err.to_string() }),
            );
            return Err(detail_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error: {err}"),
            ));
        }
    };

    if let Some(payload) = reply.error.as_ref() {
        let message = error_display_message(payload);
        emit_json_log(
            &state,
            "chat.error",
            serde_json::json!({ "request_id": &request_id, "error": &message }),
        );
        return Ok(error_completion_response(&request.model, &message));
    }

    let completion_id = generate_completion_id();
    let created = now_epoch_seconds();

    if request.stream {
        if let Some(fragments) = reply.fragments.clone().filter(|f| !f.is_empty()) {
            emit_json_log(
                &state,
                "chat.response",
                serde_json::json!({
                    "request_id": &request_id,
                    "id": &completion_id,
                    "fragments": fragments.len(),
                }),
            );
            return Ok(sse_response(
                completion_id,
                created,
                request.model.clone(),
                fragments,
            ));
        }
    }

    let text = reply
        .response
        .as_deref()
        .filter(|text| !text.is_empty())
        .ok_or_else(|| {
            detail_response(
                StatusCode::SERVICE_UNAVAILABLE,
                ProxyError::EmptyUpstreamResponse.to_string(),
            )
        })?;

    let usage = estimate_usage(&prompt, text);
    emit_json_log(
        &state,
        "chat.response",
        serde_json::json!({
            "request_id": &request_id,
            "id": &completion_id,
            "completion_tokens": usage.completion_tokens,
        }),
    );

    let response =
        ChatCompletionResponse::new(completion_id, created, &request.model, text, usage);
    Ok(json_response(StatusCode::OK, &response))
}

async fn require_api_key(
    state: &ProxyState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<Detail>)> {
    let denied = || {
        detail_response(StatusCode::UNAUTHORIZED, ProxyError::Auth.to_string())
    };
    let Some(api_key) = extract_api_key(headers) else {
        return Err(denied());
    };
    match state.keys.is_valid(&api_key).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(denied()),
        Err(err) => Err(detail_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error: {err}"),
        )),
    }
}

/// Bearer token from `Authorization` (with or without the `Bearer ` prefix),
/// falling back to the legacy `X-API-KEY` header.
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = extract_header(headers, "authorization") {
        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .unwrap_or(&auth)
            .trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    extract_header(headers, "x-api-key")
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn detail_response(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<Detail>) {
    (
        status,
        Json(Detail {
            detail: message.into(),
        }),
    )
}

/// Upstream failures still come back as a well-formed chat completion, with
/// the error text in the assistant content and HTTP 502 at the transport.
fn error_completion_response(model: &str, message: &str) -> Response {
    let response = ChatCompletionResponse::new(
        generate_completion_id(),
        now_epoch_seconds(),
        model,
        format!("Grok API Error: {message}"),
        Usage::default(),
    );
    json_response(StatusCode::BAD_GATEWAY, &response)
}

fn json_response(status: StatusCode, payload: &impl Serialize) -> Response {
    let (status, body) = match serde_json::to_vec(payload) {
        Ok(body) => (status, body),
        Err(err) => {
            let detail =
                serde_json::json!({ "detail": format!("Error: {err}") }).to_string();
            (StatusCode::INTERNAL_SERVER_ERROR, detail.into_bytes())
        }
    };
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", "application/json".parse().unwrap());
    response
}

enum SsePhase {
    Fragments {
        fragments: std::vec::IntoIter<String>,
        emitted: usize,
    },
    Finish,
    Closed,
}

/// One SSE event per upstream fragment, in order, sharing one id and one
/// creation timestamp, then the terminal stop chunk and the `[DONE]`
/// sentinel. Dropping the body (client disconnect) stops the generator.
fn sse_response(id: String, created: u64, model: String, fragments: Vec<String>) -> Response {
    let state = SsePhase::Fragments {
        fragments: fragments.into_iter(),
        emitted: 0,
    };
    let stream = stream::unfold(state, move |phase| {
        let id = id.clone();
        let model = model.clone();
        async move {
            match phase {
                SsePhase::Fragments {
                    mut fragments,
                    emitted,
                } => match fragments.next() {
                    Some(text) => {
                        if emitted > 0 {
                            tokio::time::sleep(PACING_DELAY).await;
                        }
                        let chunk = ChatCompletionChunk::delta(&id, created, &model, text);
                        Some((
                            sse_event_bytes(&chunk),
                            SsePhase::Fragments {
                                fragments,
                                emitted: emitted + 1,
                            },
                        ))
                    }
                    None => {
                        let chunk = ChatCompletionChunk::finish(&id, created, &model);
                        Some((sse_event_bytes(&chunk), SsePhase::Finish))
                    }
                },
                SsePhase::Finish => Some((
                    Ok(bytes::Bytes::from_static(b"data: [DONE]\n\n")),
                    SsePhase::Closed,
                )),
                SsePhase::Closed => None,
            }
        }
    });

    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        "content-type",
        "text/event-stream".parse().unwrap(),
    );
    headers.insert("cache-control", "no-cache".parse().unwrap());
    headers.insert("connection", "keep-alive".parse().unwrap());
    // nginx and friends must not buffer the event stream.
    headers.insert("x-accel-buffering", "no".parse().unwrap());
    response
}

fn sse_event_bytes(chunk: &ChatCompletionChunk) -> Result<bytes::Bytes, std::io::Error> {
    let json = serde_json::to_string(chunk).map_err(std::io::Error::other)?;
    Ok(bytes::Bytes::from(format!("data: {json}\n\n")))
}

fn generate_completion_id() -> String {
    let mut bytes = [0u8; 16];
    if getrandom::fill(&mut bytes).is_err() {
        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0);
        let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
        return format!("chatcmpl-{ts_ms}{seq}");
    }
    format!("chatcmpl-{}", hex_encode(&bytes))
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("grok-{ts_ms}-{seq}")
}

fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

fn emit_json_log(state: &ProxyState, event: &str, payload: serde_json::Value) {
    if !state.json_logs {
        return;
    }

    let record = serde_json::json!({
        "ts_ms": SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0),
        "event": event,
        "payload": payload,
    });
    eprintln!("{record}");
}
