//! Static catalog of the upstream models exposed through `GET /v1/models`.

use serde::{Deserialize, Serialize};

use crate::{ProxyError, Result};

pub const MODEL_IDS: &[&str] = &[
    "grok-3-auto",
    "grok-3-fast",
    "grok-4",
    "grok-4-mini-thinking-tahoe",
];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

pub fn catalog() -> ModelList {
    ModelList {
        object: "list".to_string(),
        data: MODEL_IDS
            .iter()
            .map(|id| ModelInfo {
                id: (*id).to_string(),
                object: "model".to_string(),
                created: 0,
                owned_by: "grok".to_string(),
            })
            .collect(),
    }
}

pub fn lookup(model_id: &str) -> Result<ModelInfo> {
    catalog()
        .data
        .into_iter()
        .find(|model| model.id == model_id)
        .ok_or_else(|| ProxyError::UnknownModel(model_id.to_string()))
}
