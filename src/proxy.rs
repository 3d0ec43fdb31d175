//! Request forwarding and embedding response handling

use crate::backend::BackendClient;
use crate::config::EmbeddingFailurePolicy;
use crate::error::{ManagerError, ManagerResult};
use crate::manager::ServerManager;
use crate::models::ModelDescriptor;
use crate::supervisor::SupervisedProcess;
use serde_json::{Value, json};
use std::time::Duration;

/// llama-server's native embedding endpoint
pub const EMBEDDING_ENDPOINT: &str = "/embedding";

/// One bounded call to a running server. Transport and HTTP failures become
/// `ProxyFailed`; nothing is retried and the process is left alone.
pub async fn forward(
    backend: &dyn BackendClient,
    descriptor: &ModelDescriptor,
    endpoint: &str,
    payload: &Value,
    timeout: Duration,
) -> ManagerResult<Value> {
    match backend
        .post_json(descriptor.port, endpoint, payload, timeout)
        .await
    {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!(
                model = %descriptor.name,
                port = descriptor.port,
                endpoint = endpoint,
                error = %e,
                "Request to llama-server failed"
            );
            crate::metrics::record_proxy_failure(&descriptor.name);
            Err(ManagerError::ProxyFailed {
                model: descriptor.name.clone(),
                reason: format!("{:#}", e),
            })
        }
    }
}

/// Embed one text through `process`, recording the vector width
pub async fn embed_text(process: &SupervisedProcess, text: &str) -> ManagerResult<Vec<f32>> {
    let response = process
        .proxy(EMBEDDING_ENDPOINT, &json!({ "content": text }))
        .await?;

    let embedding = parse_embedding(&response).ok_or_else(|| ManagerError::ProxyFailed {
        model: process.name().to_string(),
        reason: "unrecognized embedding response".to_string(),
    })?;

    process.record_dimensions(embedding.len());
    Ok(embedding)
}

/// Pull the first embedding out of any llama-server response shape:
///
/// - `{"embedding": [..]}`
/// - `{"embedding": [[..]]}`
/// - `[{"index": 0, "embedding": [..] | [[..]]}, ..]`
/// - `{"embeddings": [[..]]}`
pub fn parse_embedding(response: &Value) -> Option<Vec<f32>> {
    match response {
        Value::Array(items) => items.first().and_then(|item| item.get("embedding")).and_then(vector),
        Value::Object(map) => {
            if let Some(embedding) = map.get("embedding") {
                return vector(embedding);
            }
            map.get("embeddings")
                .and_then(Value::as_array)
                .and_then(|rows| rows.first())
                .and_then(vector)
        }
        _ => None,
    }
}

/// A flat numeric array, or the first row of a nested one
fn vector(value: &Value) -> Option<Vec<f32>> {
    let items = value.as_array()?;
    match items.first() {
        Some(Value::Array(_)) => vector(&items[0]),
        _ => items
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect(),
    }
}

/// Embed `texts` in order through `model`.
///
/// Lifecycle errors always fail the call. Per-text proxy failures follow
/// `policy`: `ZeroVector` substitutes a zero vector of the model's last known
/// width (or `fallback_dimensions`), `Fail` returns the first error.
pub async fn embed_texts(
    manager: &ServerManager,
    model: &str,
    texts: &[String],
    policy: EmbeddingFailurePolicy,
    fallback_dimensions: usize,
) -> ManagerResult<Vec<Vec<f32>>> {
    let mut embeddings: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());

    for (index, text) in texts.iter().enumerate() {
        match manager.embed(model, text).await {
            Ok(embedding) => embeddings.push(Some(embedding)),
            Err(err) => handle_failure(policy, model, index, err, &mut embeddings)?,
        }
    }

    let width = match manager.embedding_dimensions(model).await {
        Some(width) => width,
        None => embeddings
            .iter()
            .flatten()
            .map(Vec::len)
            .next()
            .unwrap_or(fallback_dimensions),
    };

    Ok(embeddings
        .into_iter()
        .map(|e| e.unwrap_or_else(|| vec![0.0; width]))
        .collect())
}

fn handle_failure(
    policy: EmbeddingFailurePolicy,
    model: &str,
    index: usize,
    err: ManagerError,
    embeddings: &mut Vec<Option<Vec<f32>>>,
) -> ManagerResult<()> {
    match (&err, policy) {
        (ManagerError::ProxyFailed { .. }, EmbeddingFailurePolicy::ZeroVector) => {
            tracing::warn!(
                model = %model,
                index = index,
                error = %err,
                "Embedding failed, substituting zero vector"
            );
            embeddings.push(None);
            Ok(())
        }
        _ => Err(err),
    }
}
