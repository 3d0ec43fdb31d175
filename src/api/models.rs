//! API request and response models

use crate::gpu::GpuInfo;
use crate::rerank::RankedDocument;
use serde::{Deserialize, Serialize};

pub const OWNED_BY: &str = "native-llama-server";

/// GET / response
#[derive(Debug, Serialize, Deserialize)]
pub struct RootResponse {
    pub message: String,
    pub status: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub models: HealthModels,
    pub backend: String,
    #[serde(flatten)]
    pub gpu: GpuInfo,
}

#[derive(Debug, Serialize)]
pub struct HealthModels {
    pub embeddings: Vec<String>,
    pub rerankers: Vec<String>,
    pub running: Vec<String>,
}

/// OpenAI model listing
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    pub permission: Vec<serde_json::Value>,
    pub root: String,
    pub parent: Option<String>,
}

impl ModelCard {
    pub fn new(id: &str, created: i64) -> Self {
        Self {
            id: id.to_string(),
            object: "model".to_string(),
            created,
            owned_by: OWNED_BY.to_string(),
            permission: Vec::new(),
            root: id.to_string(),
            parent: None,
        }
    }
}

/// A single string or a batch of strings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Batch(Vec<String>),
}

impl EmbeddingInput {
    pub fn into_texts(self) -> Vec<String> {
        match self {
            Self::Single(text) => vec![text],
            Self::Batch(texts) => texts,
        }
    }
}

/// POST /v1/embeddings request
#[derive(Debug, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub input: EmbeddingInput,
    pub model: String,

    /// Accepted for compatibility; only `float` output is produced
    #[serde(default)]
    pub encoding_format: Option<String>,
}

/// POST /embeddings request
#[derive(Debug, Serialize, Deserialize)]
pub struct LegacyEmbeddingRequest {
    pub input: EmbeddingInput,

    /// Defaults to the first embedding model
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub object: String,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    pub usage: Usage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub object: String,
    pub embedding: Vec<f32>,
    pub index: usize,
}

/// Token accounting by whitespace-separated word count
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn from_texts<'a>(texts: impl IntoIterator<Item = &'a str>) -> Self {
        let words = texts
            .into_iter()
            .map(|text| text.split_whitespace().count())
            .sum();
        Self {
            prompt_tokens: words,
            total_tokens: words,
        }
    }
}

/// POST /v1/rerank request
#[derive(Debug, Serialize, Deserialize)]
pub struct RerankRequest {
    pub model: String,
    pub query: String,
    pub documents: Vec<String>,

    /// Keep only the best N results; 0 or absent keeps all
    #[serde(default, alias = "top_n")]
    pub top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RerankResponse {
    pub model: String,
    pub results: Vec<RankedDocument>,
    pub usage: Usage,
}

/// POST /v1/models/{model}/stop response
#[derive(Debug, Serialize, Deserialize)]
pub struct StopResponse {
    pub message: String,
}
