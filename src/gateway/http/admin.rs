use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::{ErrorResponse, GatewayHttpState, error_response, extract_bearer, extract_header};
use crate::gateway::router::DECISION_LOG_CAPACITY;
use crate::gateway::{BackendEndpoint, RoutingDecision, RoutingPolicy, UsageRecord};

type AdminResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

const DEFAULT_DECISION_LIMIT: usize = 50;

pub(super) fn routes() -> Router<GatewayHttpState> {
    Router::new()
        .route("/backends", get(list_backends))
        .route("/backends/:id/health", get(backend_health))
        .route("/backends/:id/degrade", post(degrade_backend))
        .route("/backends/:id/healthy", post(restore_backend))
        .route("/decisions", get(recent_decisions))
        .route("/policies", post(upsert_policy))
        .route("/policies/:org/:model", get(get_policy))
}

fn ensure_admin(state: &GatewayHttpState, headers: &HeaderMap) -> AdminResult<()> {
    check_admin_token(state.admin_token.as_deref(), headers)
}

/// Open when no token is configured.
fn check_admin_token(expected: Option<&str>, headers: &HeaderMap) -> AdminResult<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let provided = extract_bearer(headers)
        .or_else(|| extract_header(headers, "x-admin-token"))
        .unwrap_or_default();
    if provided == expected {
        return Ok(());
    }
    Err(error_response(
        StatusCode::UNAUTHORIZED,
        "UNAUTHORIZED",
        "missing or invalid admin token",
    ))
}

fn backend_not_found(id: &str) -> (StatusCode, Json<ErrorResponse>) {
    error_response(
        StatusCode::NOT_FOUND,
        "NOT_FOUND",
        format!("unknown backend: {id}"),
    )
}

async fn list_backends(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> AdminResult<Json<Vec<BackendEndpoint>>> {
    ensure_admin(&state, &headers)?;
    let mut endpoints: Vec<BackendEndpoint> = state
        .gateway
        .health()
        .endpoints()
        .into_iter()
        .map(Arc::unwrap_or_clone)
        .collect();
    endpoints.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Json(endpoints))
}

async fn backend_health(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AdminResult<Json<BackendEndpoint>> {
    ensure_admin(&state, &headers)?;
    let endpoint = state
        .gateway
        .health()
        .endpoint(&id)
        .ok_or_else(|| backend_not_found(&id))?;
    Ok(Json(BackendEndpoint::clone(&endpoint)))
}

#[derive(Debug, Default, Deserialize)]
struct DegradeRequest {
    #[serde(default)]
    reason: String,
}

async fn degrade_backend(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<DegradeRequest>>,
) -> AdminResult<Json<BackendEndpoint>> {
    ensure_admin(&state, &headers)?;
    let Json(body) = body.unwrap_or_default();
    let reason = if body.reason.trim().is_empty() {
        "manual".to_string()
    } else {
        body.reason
    };
    let endpoint = state
        .gateway
        .health()
        .mark_degraded(&id, &reason)
        .ok_or_else(|| backend_not_found(&id))?;
    Ok(Json(BackendEndpoint::clone(&endpoint)))
}

async fn restore_backend(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AdminResult<Json<BackendEndpoint>> {
    ensure_admin(&state, &headers)?;
    let endpoint = state
        .gateway
        .health()
        .mark_healthy(&id)
        .await
        .ok_or_else(|| backend_not_found(&id))?;
    Ok(Json(BackendEndpoint::clone(&endpoint)))
}

#[derive(Debug, Deserialize)]
struct DecisionsQuery {
    limit: Option<usize>,
}

async fn recent_decisions(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Query(query): Query<DecisionsQuery>,
) -> AdminResult<Json<Vec<RoutingDecision>>> {
    ensure_admin(&state, &headers)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DECISION_LIMIT)
        .min(DECISION_LOG_CAPACITY);
    Ok(Json(state.gateway.router().recent_decisions(limit)))
}

async fn upsert_policy(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    body: Result<Json<RoutingPolicy>, JsonRejection>,
) -> AdminResult<(StatusCode, Json<RoutingPolicy>)> {
    ensure_admin(&state, &headers)?;
    let Json(policy) = body.map_err(|rejection| {
        error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            format!("invalid policy body: {}", rejection.body_text()),
        )
    })?;
    let stored = state
        .gateway
        .policies()
        .upsert(policy)
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", err.to_string()))?;
    Ok((StatusCode::CREATED, Json(RoutingPolicy::clone(&stored))))
}

async fn get_policy(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path((org, model)): Path<(String, String)>,
) -> AdminResult<Json<RoutingPolicy>> {
    ensure_admin(&state, &headers)?;
    let policy = state
        .gateway
        .policies()
        .get_exact(&org, &model)
        .ok_or_else(|| {
            error_response(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("no routing policy for {org}/{model}"),
            )
        })?;
    Ok(Json(RoutingPolicy::clone(&policy)))
}

/// `GET /v1/audit/requests/:request_id`: usage records still waiting in
/// the disk buffer. Shares the admin token guard.
pub(super) async fn request_audit(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Path(request_id): Path<String>,
) -> AdminResult<Json<UsageRecord>> {
    ensure_admin(&state, &headers)?;
    if request_id.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "request id required",
        ));
    }
    let record = state
        .gateway
        .buffered_usage(&request_id)
        .await
        .map_err(|err| {
            tracing::warn!(request_id = %request_id, error = %err, "usage buffer lookup failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                "usage buffer unavailable",
            )
        })?
        .ok_or_else(|| {
            error_response(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("audit record not found for request ID: {request_id}"),
            )
        })?;
    Ok(Json(record))
}
