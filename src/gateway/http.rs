//! Axum surface: the public inference route, the admin routing API, the
//! buffered-usage audit lookup and liveness/readiness/metrics endpoints.

mod admin;
mod inference;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Gateway, GatewayError, ObservabilitySnapshot, Readiness};

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: Arc<Gateway>,
    admin_token: Option<String>,
}

impl GatewayHttpState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            admin_token: None,
        }
    }

    /// Requires `Authorization: Bearer <token>` or `x-admin-token` on every
    /// admin route.
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.admin_token = (!token.trim().is_empty()).then_some(token);
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_context: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/status/healthz", get(health))
        .route("/v1/status/readyz", get(readiness))
        .route("/metrics", get(metrics))
        .route("/metrics.json", get(metrics_json))
        .route("/v1/inference", post(inference::handle_inference))
        .route("/v1/audit/requests/:request_id", get(admin::request_audit))
        .nest("/v1/admin/routing", admin::routes())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn readiness(State(state): State<GatewayHttpState>) -> (StatusCode, Json<Readiness>) {
    let readiness = state.gateway.readiness().await;
    let status = if readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}

async fn metrics(State(state): State<GatewayHttpState>) -> Response {
    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        state.gateway.observability().render_prometheus(),
    )
        .into_response()
}

async fn metrics_json(State(state): State<GatewayHttpState>) -> Json<ObservabilitySnapshot> {
    Json(state.gateway.observability())
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message: message.into(),
                retry_after_seconds: None,
                limit_context: None,
            },
        }),
    )
}

/// Structured denial with `Retry-After` on rate limiting.
fn gateway_error_response(err: &GatewayError) -> Response {
    let retry_after = err.retry_after();
    let body = ErrorResponse {
        error: ErrorDetail {
            code: err.code().to_string(),
            message: err.public_message(),
            retry_after_seconds: retry_after.map(|d| d.as_secs_f64()),
            limit_context: err.limit_context(),
        },
    };
    let mut response = (err.status(), Json(body)).into_response();
    if let Some(retry_after) = retry_after {
        if let Ok(value) = HeaderValue::from_str(&retry_after_header(retry_after)) {
            response.headers_mut().insert("retry-after", value);
        }
    }
    response
}

/// Whole seconds, rounded up and at least one.
fn retry_after_header(retry_after: Duration) -> String {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1).to_string()
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}
