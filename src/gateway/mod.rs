//! Admission control and routing for the inference gateway.
//!
//! Per request: rate limits (organization, then credential), budget check,
//! backend selection, forwarding with failover, usage publication and one
//! audit event.

pub mod audit;
pub mod bootstrap;
pub mod budget;
pub mod config;
pub mod costing;
pub mod health;
pub mod http;
pub mod http_backend;
pub mod limits;
pub mod observability;
pub mod otel;
pub mod policy;
pub mod redis_store;
pub mod router;
pub mod trace;
pub mod usage;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::Instrument as _;

pub use audit::{AuditEvent, AuditGuard, AuditLogger, AuditSubject};
pub use bootstrap::GatewayRuntime;
pub use budget::{BudgetClient, BudgetConfig, BudgetStatus, QuotaType};
pub use config::{ConfigError, GatewayConfig, LimitsConfig, StoreBackend, UsageConfig};
pub use costing::{ModelPricing, PricingTable, PricingTableError};
pub use health::{BackendConfig, BackendEndpoint, HealthConfig, HealthMonitor, HealthStatus};
pub use http::{GatewayHttpState, router as http_router};
pub use http_backend::{
    BackendError, BackendRequest, BackendResponse, BackendTransport, HttpBackendClient,
};
pub use limits::{
    BucketLimit, BucketStore, CheckResult, LimitScope, LimiterError, MemoryBucketStore,
    RateLimiter,
};
pub use observability::{ComponentStatus, Observability, ObservabilitySnapshot, Readiness};
pub use policy::{BackendWeight, PolicyCache, PolicyError, RoutingPolicy};
pub use redis_store::{RedisStore, RedisStoreError, RedisStreamSink};
pub use router::{DecisionReason, RouteSelection, RoutingDecision, RoutingEngine, RoutingError};
pub use trace::TraceContext;
pub use usage::{
    BufferError, BufferStore, LimitState, MemoryUsageSink, PublishError, PublishOutcome,
    UsageContext, UsagePublisher, UsageRecord, UsageRecordBuilder, UsageSink,
};

/// Largest accepted inference payload.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limit exceeded for {scope}")]
    RateLimited {
        scope: LimitScope,
        limit: u32,
        remaining: u32,
        retry_after: Duration,
    },
    #[error("budget exceeded: {}", status.reason)]
    BudgetExceeded { status: BudgetStatus },
    #[error("quota exceeded: {}", status.reason)]
    QuotaExceeded { status: BudgetStatus },
    #[error(transparent)]
    RoutingUnavailable(#[from] RoutingError),
    #[error("backend {backend} timed out after {timeout:?}")]
    BackendTimeout { backend: String, timeout: Duration },
    #[error("backend {backend} failed: {message}")]
    Backend { backend: String, message: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("rate limiter unavailable: {0}")]
    LimiterUnavailable(#[from] LimiterError),
}

impl GatewayError {
    /// Machine-readable reason code returned to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::RoutingUnavailable(_) => "NO_BACKEND_AVAILABLE",
            Self::BackendTimeout { .. } => "BACKEND_TIMEOUT",
            Self::Backend { .. } => "BACKEND_ERROR",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::LimiterUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BudgetExceeded { .. } | Self::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::RoutingUnavailable(_) | Self::LimiterUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Backend { .. } => StatusCode::BAD_GATEWAY,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Client-facing message. Backend error text stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Backend { .. } => "backend request failed".to_string(),
            Self::BackendTimeout { .. } => "backend request timed out".to_string(),
            Self::LimiterUnavailable(_) => "rate limiter unavailable".to_string(),
            other => other.to_string(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Remaining-headroom details that let clients back off sensibly.
    pub fn limit_context(&self) -> Option<Value> {
        match self {
            Self::RateLimited {
                scope,
                limit,
                remaining,
                ..
            } => Some(serde_json::json!({
                "scope": scope.to_string(),
                "limit": limit,
                "remaining": remaining,
            })),
            Self::BudgetExceeded { status } | Self::QuotaExceeded { status } => {
                Some(serde_json::json!({
                    "quota_type": status.quota_type,
                    "current_usage": status.current_usage,
                    "limit": status.limit,
                    "reason": status.reason,
                }))
            }
            _ => None,
        }
    }

    fn limit_state(&self) -> LimitState {
        match self {
            Self::RateLimited { .. } => LimitState::RateLimited,
            Self::BudgetExceeded { .. } | Self::QuotaExceeded { .. } => LimitState::BudgetExceeded,
            _ => LimitState::WithinLimit,
        }
    }
}

impl From<BackendError> for GatewayError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Timeout { backend, timeout } => Self::BackendTimeout { backend, timeout },
            other => Self::Backend {
                backend: other.backend().to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RouteRequest {
    pub request_id: String,
    pub organization_id: String,
    pub api_key_id: String,
    pub model: String,
    pub payload: String,
    pub parameters: Map<String, Value>,
    pub metadata: BTreeMap<String, String>,
    pub traceparent: Option<String>,
}

impl RouteRequest {
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        let invalid = |reason: &str| GatewayError::InvalidRequest {
            reason: reason.to_string(),
        };
        if self.request_id.trim().is_empty() {
            return Err(invalid("request_id is required"));
        }
        if self.organization_id.trim().is_empty() {
            return Err(invalid("organization id is required"));
        }
        if self.model.trim().is_empty() {
            return Err(invalid("model is required"));
        }
        if self.payload.is_empty() {
            return Err(invalid("payload is required"));
        }
        if self.payload_size() > MAX_PAYLOAD_BYTES {
            return Err(invalid(&format!(
                "payload exceeds {MAX_PAYLOAD_BYTES} bytes"
            )));
        }
        Ok(())
    }

    fn audit_subject(&self) -> AuditSubject {
        AuditSubject {
            request_id: self.request_id.clone(),
            organization_id: self.organization_id.clone(),
            api_key_id: self.api_key_id.clone(),
            model: self.model.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RouteResponse {
    pub request_id: String,
    pub text: String,
    pub backend_id: String,
    pub decision: DecisionReason,
    pub attempts: u32,
    pub usage: UsageRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishOutcome>,
}

struct Forwarded {
    selection: RouteSelection,
    response: BackendResponse,
    attempts: u32,
    latency: Duration,
}

pub struct Gateway {
    limiter: RateLimiter,
    limits: LimitsConfig,
    budget: BudgetClient,
    router: Arc<RoutingEngine>,
    transport: Arc<dyn BackendTransport>,
    usage: UsageRecordBuilder,
    publisher: Arc<UsagePublisher>,
    audit: AuditLogger,
    observability: Arc<Observability>,
    max_attempts: u32,
    request_timeout: Duration,
    record_denials: bool,
    redis: Option<(RedisStore, Duration)>,
}

impl Gateway {
    pub fn new(
        limiter: RateLimiter,
        budget: BudgetClient,
        router: Arc<RoutingEngine>,
        transport: Arc<dyn BackendTransport>,
        publisher: Arc<UsagePublisher>,
    ) -> Self {
        Self {
            limiter,
            limits: LimitsConfig::default(),
            budget,
            router,
            transport,
            usage: UsageRecordBuilder::default(),
            publisher,
            audit: AuditLogger::default(),
            observability: Arc::new(Observability::default()),
            max_attempts: 3,
            request_timeout: Duration::from_secs(60),
            record_denials: true,
            redis: None,
        }
    }

    /// Redis connection checked by [`Self::readiness`].
    pub fn with_redis(mut self, store: RedisStore, timeout: Duration) -> Self {
        self.redis = Some((store, timeout));
        self
    }

    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_usage_builder(mut self, usage: UsageRecordBuilder) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_record_denials(mut self, record_denials: bool) -> Self {
        self.record_denials = record_denials;
        self
    }

    pub fn router(&self) -> &Arc<RoutingEngine> {
        &self.router
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        self.router.health()
    }

    pub fn policies(&self) -> &Arc<PolicyCache> {
        self.router.policies()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn publisher(&self) -> &Arc<UsagePublisher> {
        &self.publisher
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    /// Pings Redis when configured and requires at least one registered
    /// backend.
    pub async fn readiness(&self) -> Readiness {
        let mut components = BTreeMap::new();

        let redis = match &self.redis {
            None => ComponentStatus::NotConfigured,
            Some((store, timeout)) => match tokio::time::timeout(*timeout, store.ping()).await {
                Ok(Ok(())) => ComponentStatus::Healthy,
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "redis readiness ping failed");
                    ComponentStatus::Unhealthy
                }
                Err(_) => {
                    tracing::debug!(timeout_ms = timeout.as_millis() as u64, "redis readiness ping timed out");
                    ComponentStatus::Unhealthy
                }
            },
        };
        components.insert("redis".to_string(), redis);

        let backends = if self.health().endpoints().is_empty() {
            ComponentStatus::Unhealthy
        } else {
            ComponentStatus::Healthy
        };
        components.insert("backend_registry".to_string(), backends);

        let readiness = Readiness::from_components(components);
        if !readiness.is_ready() {
            tracing::warn!(components = ?readiness.components, "readiness check degraded");
        }
        readiness
    }

    /// Looks up a request's usage record in the disk buffer, i.e. among
    /// records not yet delivered to the usage stream.
    pub async fn buffered_usage(&self, request_id: &str) -> Result<Option<UsageRecord>, BufferError> {
        let records = self.publisher.buffer().load().await?;
        Ok(records
            .into_iter()
            .find(|record| record.request_id == request_id))
    }

    /// Runs one request through the full admission and routing pipeline.
    pub async fn handle(&self, request: RouteRequest) -> Result<RouteResponse, GatewayError> {
        let span = trace::request_span(&request.request_id, request.traceparent.as_deref());
        self.handle_in_span(request).instrument(span).await
    }

    /// Counts and audits a request refused before it could enter
    /// [`Self::handle`], e.g. an undecodable body.
    pub fn reject(&self, subject: AuditSubject, reason: &str) {
        self.observability.record_request();
        self.audit.begin(subject).deny(reason, LimitState::WithinLimit);
    }

    async fn handle_in_span(&self, request: RouteRequest) -> Result<RouteResponse, GatewayError> {
        self.observability.record_request();
        let audit = self.audit.begin(request.audit_subject());
        let trace = TraceContext::for_request(request.traceparent.as_deref());
        let started = Instant::now();

        if let Err(err) = request.validate() {
            audit.deny(err.code(), LimitState::WithinLimit);
            return Err(err);
        }

        if let Err(err) = self.check_rate_limits(&request).await {
            if let GatewayError::RateLimited { .. } = err {
                self.observability.record_rate_limited();
                self.publish_denial(&request, &trace, "RATE_LIMIT", &err, None, started)
                    .await;
            }
            audit.deny(err.code(), err.limit_state());
            return Err(err);
        }

        let budget = self
            .budget
            .check_credential(&request.organization_id, &request.api_key_id)
            .await;
        if !budget.allowed {
            self.observability.record_budget_exceeded();
            let err = match budget.quota_type {
                QuotaType::Budget => GatewayError::BudgetExceeded {
                    status: budget.clone(),
                },
                QuotaType::DailyQuota | QuotaType::MonthlyQuota => GatewayError::QuotaExceeded {
                    status: budget.clone(),
                },
            };
            self.publish_denial(&request, &trace, err.code(), &err, Some(budget), started)
                .await;
            audit.deny(err.code(), err.limit_state());
            return Err(err);
        }

        let forwarded = match self.forward_with_failover(&request).await {
            Ok(forwarded) => forwarded,
            Err(err) => {
                audit.deny(err.code(), LimitState::WithinLimit);
                return Err(err);
            }
        };

        let reason = forwarded.selection.reason;
        let backend_id = forwarded.selection.endpoint.id.clone();
        let tokens_input = forwarded
            .response
            .tokens_input
            .unwrap_or_else(|| estimate_tokens(&request.payload));
        let record = self.usage.build(&UsageContext {
            request_id: request.request_id.clone(),
            organization_id: request.organization_id.clone(),
            api_key_id: request.api_key_id.clone(),
            model: request.model.clone(),
            backend_id: backend_id.clone(),
            tokens_input,
            tokens_output: forwarded.response.tokens_used,
            latency: forwarded.latency,
            limit_state: LimitState::WithinLimit,
            decision_reason: reason.as_str().to_string(),
            budget: Some(budget),
            retry_count: forwarded.attempts.saturating_sub(1),
            trace_id: trace.trace_id.clone(),
            span_id: trace.span_id.clone(),
            metadata: request.metadata.clone(),
            timestamp: None,
        });
        let publish = self.publish(record.clone()).await;
        audit.allow(reason.as_str());

        Ok(RouteResponse {
            request_id: request.request_id,
            text: forwarded.response.text,
            backend_id,
            decision: reason,
            attempts: forwarded.attempts,
            usage: record,
            publish,
        })
    }

    async fn check_rate_limits(&self, request: &RouteRequest) -> Result<(), GatewayError> {
        let mut scopes = vec![(
            LimitScope::organization(&request.organization_id),
            self.limits.organization_limit(&request.organization_id),
        )];
        if !request.api_key_id.trim().is_empty() {
            scopes.push((
                LimitScope::credential(&request.api_key_id),
                self.limits.credential_limit(&request.api_key_id),
            ));
        }

        for (scope, limit) in scopes {
            match self
                .limiter
                .check(&scope, limit.rate_per_second, limit.burst)
                .await
            {
                Ok(result) if result.allowed => {}
                Ok(result) => {
                    return Err(GatewayError::RateLimited {
                        scope,
                        limit: result.limit,
                        remaining: result.remaining,
                        retry_after: result.retry_after,
                    });
                }
                Err(err) if self.limits.fail_open => {
                    tracing::warn!(scope = %scope, error = %err, "rate limiter unavailable, admitting request");
                }
                Err(err) => {
                    tracing::error!(scope = %scope, error = %err, "rate limiter unavailable, rejecting request");
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    async fn forward_with_failover(&self, request: &RouteRequest) -> Result<Forwarded, GatewayError> {
        let deadline = Instant::now() + self.request_timeout;
        let backend_request = BackendRequest {
            prompt: request.payload.clone(),
            parameters: request.parameters.clone(),
        };

        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<GatewayError> = None;
        for attempt in 1..=self.max_attempts {
            let selection = match self.router.select_excluding(
                &request.organization_id,
                &request.model,
                &tried,
            ) {
                Ok(selection) => selection,
                Err(err) => {
                    return Err(match last_error {
                        Some(last) => last,
                        None => {
                            self.observability.record_routing_unavailable();
                            err.into()
                        }
                    });
                }
            };
            if selection.reason == DecisionReason::Failover {
                self.observability.record_failover();
            }

            let endpoint = Arc::clone(&selection.endpoint);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::BackendTimeout {
                    backend: endpoint.id.clone(),
                    timeout: self.request_timeout,
                });
            }
            let timeout = endpoint.timeout().min(remaining);

            self.observability.record_backend_call();
            let started = Instant::now();
            match self.transport.forward(&endpoint, &backend_request, timeout).await {
                Ok(response) => {
                    let latency = started.elapsed();
                    self.router.health().record_success(&endpoint.id, Some(latency));
                    return Ok(Forwarded {
                        selection,
                        response,
                        attempts: attempt,
                        latency,
                    });
                }
                Err(err) => {
                    self.observability.record_backend_error();
                    self.router.health().record_failure(&endpoint.id, &err.to_string());
                    tracing::warn!(
                        request_id = %request.request_id,
                        backend_id = %endpoint.id,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "backend request failed"
                    );
                    tried.push(endpoint.id.clone());
                    last_error = Some(err.into());
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GatewayError::RoutingUnavailable(RoutingError::NoBackendAvailable {
                organization_id: request.organization_id.clone(),
                model: request.model.clone(),
            })
        }))
    }

    async fn publish_denial(
        &self,
        request: &RouteRequest,
        trace: &TraceContext,
        reason: &str,
        err: &GatewayError,
        budget: Option<BudgetStatus>,
        started: Instant,
    ) {
        if !self.record_denials {
            return;
        }
        let record = self.usage.build(&UsageContext {
            request_id: request.request_id.clone(),
            organization_id: request.organization_id.clone(),
            api_key_id: request.api_key_id.clone(),
            model: request.model.clone(),
            latency: started.elapsed(),
            limit_state: err.limit_state(),
            decision_reason: reason.to_string(),
            budget,
            trace_id: trace.trace_id.clone(),
            span_id: trace.span_id.clone(),
            metadata: request.metadata.clone(),
            ..UsageContext::default()
        });
        self.publish(record).await;
    }

    /// Publishes on a detached task so a cancelled request still gets its
    /// record published or buffered.
    async fn publish(&self, record: UsageRecord) -> Option<PublishOutcome> {
        let publisher = Arc::clone(&self.publisher);
        let observability = Arc::clone(&self.observability);
        let task = tokio::spawn(async move {
            match publisher.publish(&record).await {
                Ok(outcome) => {
                    match outcome {
                        PublishOutcome::Published => observability.record_usage_published(),
                        PublishOutcome::Buffered => observability.record_usage_buffered(),
                    }
                    Some(outcome)
                }
                Err(err) => {
                    observability.record_usage_publish_failed();
                    tracing::error!(
                        alert = "PublishDropped",
                        record_id = %record.record_id,
                        request_id = %record.request_id,
                        error = %err,
                        "usage record could not be published or buffered"
                    );
                    None
                }
            }
        });
        task.await.ok().flatten()
    }
}

/// Rough token count used when a backend does not report input tokens.
fn estimate_tokens(text: &str) -> u64 {
    let chars = u64::try_from(text.chars().count()).unwrap_or(u64::MAX);
    chars.div_ceil(4)
}
