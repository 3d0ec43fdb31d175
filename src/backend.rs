//! HTTP transport to llama-server instances

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Maximum number of body bytes quoted in upstream error messages
const ERROR_BODY_LIMIT: usize = 512;

/// Calls made against a running llama-server
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// `GET /health`; `Ok(true)` on a success status
    async fn health(&self, port: u16, timeout: Duration) -> Result<bool>;

    /// POST `payload` to `endpoint` and return the decoded JSON body.
    /// Non-success statuses are errors.
    async fn post_json(
        &self,
        port: u16,
        endpoint: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value>;
}

/// reqwest-backed client talking to llama-server on a local port
pub struct HttpBackendClient {
    client: reqwest::Client,
    host: String,
}

impl HttpBackendClient {
    /// `host` is the address llama-server binds to; wildcard binds are
    /// reached through loopback.
    pub fn new(host: &str) -> Result<Self> {
        let host = match host {
            "0.0.0.0" | "::" | "" => "127.0.0.1".to_string(),
            other => other.to_string(),
        };

        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, host })
    }

    fn url(&self, port: u16, endpoint: &str) -> String {
        let endpoint = endpoint.trim_start_matches('/');
        if self.host.contains(':') {
            format!("http://[{}]:{}/{}", self.host, port, endpoint)
        } else {
            format!("http://{}:{}/{}", self.host, port, endpoint)
        }
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn health(&self, port: u16, timeout: Duration) -> Result<bool> {
        let response = self
            .client
            .get(self.url(port, "/health"))
            .timeout(timeout)
            .send()
            .await?;

        Ok(response.status().is_success())
    }

    async fn post_json(
        &self,
        port: u16,
        endpoint: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value> {
        let response = self
            .client
            .post(self.url(port, endpoint))
            .json(payload)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            anyhow::bail!("llama-server returned status {}: {}", status, body);
        }

        response
            .json::<Value>()
            .await
            .context("Failed to decode llama-server response")
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
