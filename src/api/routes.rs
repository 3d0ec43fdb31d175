//! API route definitions

use crate::config::EmbeddingFailurePolicy;
use crate::gpu::GpuInfo;
use crate::manager::ServerManager;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ServerManager>,
    pub gpu: Arc<GpuInfo>,
    pub failure_policy: EmbeddingFailurePolicy,
    pub fallback_dimensions: usize,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // OpenAI-compatible surface
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/embeddings", post(handlers::create_embeddings))
        .route("/v1/rerank", post(handlers::rerank))
        .route("/embeddings", post(handlers::legacy_embeddings))
        // Lifecycle
        .route("/v1/models/{model}/stop", post(handlers::stop_model))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
