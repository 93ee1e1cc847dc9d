use std::collections::BTreeMap;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{GatewayHttpState, error_response, extract_header, gateway_error_response};
use crate::gateway::{AuditSubject, LimitState, RouteRequest, RouteResponse};

#[derive(Debug, Deserialize)]
pub(super) struct InferenceRequest {
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    payload: String,
    #[serde(default)]
    parameters: Map<String, Value>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InferenceUsage {
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub limit_state: LimitState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub request_id: String,
    pub output: InferenceOutput,
    pub usage: InferenceUsage,
    pub trace_id: String,
    pub span_id: String,
}

impl From<RouteResponse> for InferenceResponse {
    fn from(response: RouteResponse) -> Self {
        let usage = response.usage;
        Self {
            request_id: response.request_id,
            output: InferenceOutput {
                text: response.text,
            },
            usage: InferenceUsage {
                tokens_input: usage.tokens_input,
                tokens_output: usage.tokens_output,
                latency_ms: usage.latency_ms,
                cost_usd: usage.cost_usd,
                limit_state: usage.limit_state,
            },
            trace_id: usage.trace_id,
            span_id: usage.span_id,
        }
    }
}

pub(super) async fn handle_inference(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    body: Result<Json<InferenceRequest>, JsonRejection>,
) -> Response {
    let organization_id = extract_header(&headers, "x-organization-id");
    let api_key_id = extract_header(&headers, "x-api-key-id").unwrap_or_default();
    let rejected = |request_id: Option<&str>, model: &str| AuditSubject {
        request_id: request_id
            .map(str::to_string)
            .filter(|id| !id.trim().is_empty())
            .or_else(|| extract_header(&headers, "x-request-id"))
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        organization_id: organization_id.clone().unwrap_or_default(),
        api_key_id: api_key_id.clone(),
        model: model.to_string(),
    };

    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            state
                .gateway
                .reject(rejected(None, ""), "INVALID_REQUEST");
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                format!("invalid request body: {}", rejection.body_text()),
            )
            .into_response();
        }
    };

    let Some(organization_id) = organization_id.clone() else {
        state
            .gateway
            .reject(rejected(Some(&body.request_id), &body.model), "UNAUTHORIZED");
        return error_response(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "missing x-organization-id",
        )
        .into_response();
    };

    let request = RouteRequest {
        request_id: body.request_id,
        organization_id,
        api_key_id,
        model: body.model,
        payload: body.payload,
        parameters: body.parameters,
        metadata: body.metadata,
        traceparent: extract_header(&headers, "traceparent"),
    };

    match state.gateway.handle(request).await {
        Ok(response) => {
            let backend_id = response.backend_id.clone();
            let decision = response.decision;
            let mut http = Json(InferenceResponse::from(response)).into_response();
            if let Ok(value) = HeaderValue::from_str(&backend_id) {
                http.headers_mut().insert("x-routing-backend", value);
            }
            http.headers_mut().insert(
                "x-routing-decision",
                HeaderValue::from_static(decision.as_str()),
            );
            http
        }
        Err(err) => gateway_error_response(&err),
    }
}
