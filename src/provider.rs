//! Upstream conversational provider: the capability trait plus the Grok
//! HTTP client that implements it.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{ProxyError, Result};

/// What the upstream provider handed back for one conversation turn.
///
/// Exactly one of `response`/`error` is normally set; `fragments` rides
/// along with `response` when the provider produced token-level output.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpstreamReply {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default, rename = "stream")]
    pub fragments: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConversationParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Sends one flattened prompt upstream and returns the structured reply.
    /// Transport-level failures surface as `ProxyError::UpstreamUnavailable`;
    /// application-level failures come back inside `UpstreamReply::error`.
    async fn converse(
        &self,
        model: &str,
        prompt: &str,
        params: ConversationParams,
    ) -> Result<UpstreamReply>;
}

#[derive(Clone)]
pub struct GrokClient {
    http: reqwest::Client,
    base_url: String,
}

impl GrokClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::build(base_url, None)
    }

    /// Routes upstream calls through an HTTP proxy origin. The origin comes
    /// from configuration, never from the request body.
    pub fn with_proxy(base_url: impl Into<String>, proxy_origin: &str) -> Result<Self> {
        Self::build(base_url, Some(proxy_origin))
    }

    fn build(base_url: impl Into<String>, proxy_origin: Option<&str>) -> Result<Self> {
        let mut builder =
            reqwest::Client::builder().timeout(std::time::Duration::from_secs(120));
        if let Some(origin) = proxy_origin {
            let proxy = reqwest::Proxy::all(origin)
                .map_err(|err| ProxyError::Config(format!("invalid proxy origin: {err}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder.build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn conversation_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}/conversation")
    }
}

#[async_trait]
impl ChatProvider for GrokClient {
    async fn converse(
        &self,
        model: &str,
        prompt: &str,
        params: ConversationParams,
    ) -> Result<UpstreamReply> {
        let mut body = Map::<String, Value>::new();
        body.insert("message".to_string(), Value::String(prompt.to_string()));
        body.insert("model".to_string(), Value::String(model.to_string()));
        if let Some(max_tokens) = params.max_tokens {
            body.insert("max_tokens".to_string(), Value::Number(max_tokens.into()));
        }
        if let Some(temperature) = params.temperature {
            body.insert(
                "temperature".to_string(),
                Value::Number(
                    serde_json::Number::from_f64(f64::from(temperature))
                        .unwrap_or_else(|| 0.into()),
                ),
            );
        }

        // Any failure of the upstream call itself, timeout, refused
        // connection, redirect loop, maps to UpstreamUnavailable.
        let response = self
            .http
            .post(self.conversation_url())
            .json(&body)
            .send()
            .await
            .map_err(|err| ProxyError::UpstreamUnavailable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let payload =
                serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
            return Ok(UpstreamReply {
                error: Some(payload),
                ..UpstreamReply::default()
            });
        }

        response
            .json::<UpstreamReply>()
            .await
            .map_err(|err| ProxyError::UpstreamUnavailable(err.to_string()))
    }
}

/// Reduces an upstream error payload to a display message.
///
/// Precedence: string payloads are JSON-parsed and re-examined, then
/// `error.message`, then `message`, then the payload serialized as-is.
pub fn error_display_message(payload: &Value) -> String {
    match payload {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed) => error_display_message(&parsed),
            Err(_) => raw.clone(),
        },
        Value::Object(map) => {
            if let Some(message) = map
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
            {
                return message.to_string();
            }
            if let Some(message) = map.get("message").and_then(Value::as_str) {
                return message.to_string();
            }
            payload.to_string()
        }
        other => other.to_string(),
    }
}
