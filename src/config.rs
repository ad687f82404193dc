//! Process configuration: JSON file, environment overrides, CLI flags last.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{ProxyError, Result};

#[derive(Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys_db: Option<PathBuf>,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub json_logs: bool,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("listen", &self.listen)
            .field("upstream_url", &self.upstream_url)
            .field("upstream_proxy", &self.upstream_proxy)
            .field("keys_db", &self.keys_db)
            .field("api_keys", &"<redacted>")
            .field("json_logs", &self.json_logs)
            .finish()
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream_url: default_upstream_url(),
            upstream_proxy: None,
            keys_db: None,
            api_keys: Vec::new(),
            json_logs: false,
        }
    }
}

impl ProxyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Environment variables override whatever the file said.
    pub fn apply_env(&mut self) {
        self.apply_env_from(env_var);
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("GROK_PROXY_LISTEN") {
            self.listen = listen;
        }
        if let Some(upstream_url) = lookup("GROK_UPSTREAM_URL") {
            self.upstream_url = upstream_url;
        }
        if let Some(proxy) = lookup("GROK_API_PROXY") {
            self.upstream_proxy = Some(proxy);
        }
        if let Some(keys_db) = lookup("GROK_KEYS_DB") {
            self.keys_db = Some(PathBuf::from(keys_db));
        }
        if let Some(raw) = lookup("GROK_JSON_LOGS") {
            self.json_logs = matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream_url.trim().is_empty() {
            return Err(ProxyError::Config("upstream_url is empty".to_string()));
        }
        if self.keys_db.is_none() && self.api_keys.is_empty() {
            return Err(ProxyError::Config(
                "no API key store configured (set keys_db or api_keys)".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_listen() -> String {
    "127.0.0.1:6969".to_string()
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
