//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// llama-server became healthy
pub fn record_server_started(model: &str) {
    metrics::counter!("llama_manager_server_starts_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Spawn failure, early exit or startup timeout
pub fn record_startup_failure(model: &str) {
    metrics::counter!("llama_manager_startup_failures_total",
        "model" => model.to_string()
    )
    .increment(1);
}

pub fn record_server_stopped(model: &str) {
    metrics::counter!("llama_manager_server_stops_total",
        "model" => model.to_string()
    )
    .increment(1);
}

pub fn record_idle_eviction(model: &str) {
    metrics::counter!("llama_manager_idle_evictions_total",
        "model" => model.to_string()
    )
    .increment(1);
}

pub fn record_proxy_failure(model: &str) {
    metrics::counter!("llama_manager_proxy_failures_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Update running server gauge
pub fn update_running_servers(count: usize) {
    metrics::gauge!("llama_manager_running_servers").set(count as f64);
}
