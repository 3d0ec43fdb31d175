//! API request handlers

use super::models::{
    EmbeddingData, EmbeddingRequest, EmbeddingResponse, HealthModels, HealthResponse,
    LegacyEmbeddingRequest, ModelCard, ModelList, OWNED_BY, RerankRequest, RerankResponse,
    RootResponse, StopResponse, Usage,
};
use super::routes::AppState;
use crate::error::{ApiError, ManagerError};
use crate::models::ModelRole;
use axum::{
    Json,
    extract::{Path, State},
};

/// GET / - Service banner
pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Native LLaMA-Server Manager".to_string(),
        status: "running".to_string(),
    })
}

/// GET /health - Manager health check
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let catalog = state.manager.catalog();

    Json(HealthResponse {
        status: "healthy".to_string(),
        models: HealthModels {
            embeddings: catalog.embeddings(),
            rerankers: catalog.rerankers(),
            running: state.manager.running_models().await,
        },
        backend: OWNED_BY.to_string(),
        gpu: (*state.gpu).clone(),
    })
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /v1/models - Every discovered model, embeddings first
pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let created = chrono::Utc::now().timestamp();
    let data = state
        .manager
        .catalog()
        .list()
        .iter()
        .map(|m| ModelCard::new(&m.name, created))
        .collect();

    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}

/// POST /v1/embeddings - OpenAI-compatible embeddings
pub async fn create_embeddings(
    State(state): State<AppState>,
    Json(req): Json<EmbeddingRequest>,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    if let Some(format) = req.encoding_format.as_deref()
        && format != "float"
    {
        tracing::debug!(encoding_format = %format, "Ignoring encoding format, returning floats");
    }

    let texts = req.input.into_texts();
    let embeddings = embed(&state, &req.model, &texts).await?;
    let usage = Usage::from_texts(texts.iter().map(String::as_str));

    let data = embeddings
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| EmbeddingData {
            object: "embedding".to_string(),
            embedding,
            index,
        })
        .collect();

    Ok(Json(EmbeddingResponse {
        object: "list".to_string(),
        data,
        model: req.model,
        usage,
    }))
}

/// POST /embeddings - Bare list of vectors
pub async fn legacy_embeddings(
    State(state): State<AppState>,
    Json(req): Json<LegacyEmbeddingRequest>,
) -> Result<Json<Vec<Vec<f32>>>, ApiError> {
    let model = match req.model {
        Some(model) => model,
        None => state
            .manager
            .catalog()
            .first_of(ModelRole::Embedding)
            .map(|m| m.name.clone())
            .ok_or_else(|| ApiError::NotFound("No embedding models available".to_string()))?,
    };

    let texts = req.input.into_texts();
    Ok(Json(embed(&state, &model, &texts).await?))
}

/// POST /v1/rerank - Rank documents by embedding similarity to the query
pub async fn rerank(
    State(state): State<AppState>,
    Json(req): Json<RerankRequest>,
) -> Result<Json<RerankResponse>, ApiError> {
    // A failed query embedding fails the request under either policy
    let query = state.manager.embed(&req.model, &req.query).await?;
    let documents = embed(&state, &req.model, &req.documents).await?;

    let results = crate::rerank::rank(&query, &req.documents, &documents, req.top_k);
    let usage = Usage::from_texts(
        std::iter::once(req.query.as_str()).chain(req.documents.iter().map(String::as_str)),
    );

    Ok(Json(RerankResponse {
        model: req.model,
        results,
        usage,
    }))
}

/// POST /v1/models/{model}/stop - Stop a model's server
pub async fn stop_model(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    state.manager.stop_server(&model).await?;

    Ok(Json(StopResponse {
        message: format!("Server for {} stopped successfully", model),
    }))
}

async fn embed(state: &AppState, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
    if !state.manager.catalog().contains(model) {
        return Err(ManagerError::UnknownModel {
            model: model.to_string(),
        }
        .into());
    }

    let embeddings = crate::proxy::embed_texts(
        &state.manager,
        model,
        texts,
        state.failure_policy,
        state.fallback_dimensions,
    )
    .await?;

    Ok(embeddings)
}
