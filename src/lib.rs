pub mod config;
mod error;
pub mod http;
pub mod keystore;
pub mod model;
pub mod prompt;
pub mod provider;
pub mod types;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use http::{ProxyState, router};
pub use keystore::{ApiKeyStore, SqliteKeyStore, StaticKeyStore};
pub use provider::{ChatProvider, ConversationParams, GrokClient, UpstreamReply};
pub use types::{
    AssistantMessage, ChatChoice, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChatMessage, ChunkChoice, ChunkDelta, Role, Usage,
};
