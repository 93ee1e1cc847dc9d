use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::health::BackendEndpoint;

const MAX_BACKEND_ERROR_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_input: Option<u64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend {backend} timed out after {timeout:?}")]
    Timeout { backend: String, timeout: Duration },
    #[error("backend {backend} returned status {status}: {body}")]
    Status {
        backend: String,
        status: u16,
        body: String,
    },
    #[error("backend {backend} request failed: {message}")]
    Transport { backend: String, message: String },
    #[error("backend {backend} response decode error: {message}")]
    Decode { backend: String, message: String },
}

impl BackendError {
    pub fn backend(&self) -> &str {
        match self {
            Self::Timeout { backend, .. }
            | Self::Status { backend, .. }
            | Self::Transport { backend, .. }
            | Self::Decode { backend, .. } => backend,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// One synchronous call to a backend. Implementations must not retry;
/// failover is decided by the routing engine.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    async fn forward(
        &self,
        endpoint: &BackendEndpoint,
        payload: &BackendRequest,
        timeout: Duration,
    ) -> Result<BackendResponse, BackendError>;

    async fn probe(&self, endpoint: &BackendEndpoint, timeout: Duration)
    -> Result<(), BackendError>;
}

#[derive(Clone, Debug, Default)]
pub struct HttpBackendClient {
    client: reqwest::Client,
    headers: BTreeMap<String, String>,
}

impl HttpBackendClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    fn map_send_error(endpoint: &BackendEndpoint, timeout: Duration, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout {
                backend: endpoint.id.clone(),
                timeout,
            }
        } else {
            BackendError::Transport {
                backend: endpoint.id.clone(),
                message: err.to_string(),
            }
        }
    }
}

pub fn health_url(uri: &str) -> String {
    format!("{}/health", uri.trim_end_matches('/'))
}

#[async_trait]
impl BackendTransport for HttpBackendClient {
    async fn forward(
        &self,
        endpoint: &BackendEndpoint,
        payload: &BackendRequest,
        timeout: Duration,
    ) -> Result<BackendResponse, BackendError> {
        let mut req = self.client.post(&endpoint.uri).timeout(timeout).json(payload);
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }

        let started = std::time::Instant::now();
        let response = req
            .send()
            .await
            .map_err(|err| Self::map_send_error(endpoint, timeout, err))?;

        let status = response.status();
        if !status.is_success() {
            let body =
                crate::utils::http::response_text_truncated(response, MAX_BACKEND_ERROR_BODY_BYTES)
                    .await;
            return Err(BackendError::Status {
                backend: endpoint.id.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let decoded = response.json::<BackendResponse>().await.map_err(|err| {
            if err.is_timeout() {
                BackendError::Timeout {
                    backend: endpoint.id.clone(),
                    timeout,
                }
            } else {
                BackendError::Decode {
                    backend: endpoint.id.clone(),
                    message: err.to_string(),
                }
            }
        })?;

        tracing::debug!(
            backend_id = %endpoint.id,
            latency_ms = started.elapsed().as_millis() as u64,
            tokens_used = decoded.tokens_used,
            "backend request completed"
        );
        Ok(decoded)
    }

    async fn probe(
        &self,
        endpoint: &BackendEndpoint,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        let response = self
            .client
            .get(health_url(&endpoint.uri))
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| Self::map_send_error(endpoint, timeout, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = crate::utils::http::response_text_truncated(response, 1024).await;
            return Err(BackendError::Status {
                backend: endpoint.id.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
