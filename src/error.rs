use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid or missing API key")]
    Auth,
    #[error("No user message found in messages")]
    MissingUserMessage,
    #[error("Model {0} not found")]
    UnknownModel(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Empty response from Grok API")]
    EmptyUpstreamResponse,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("invalid config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
