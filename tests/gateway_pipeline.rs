use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use api_router::gateway::audit::{AuditAction, MemoryAuditSink};
use api_router::gateway::{
    AuditLogger, BackendEndpoint, BackendError, BackendRequest, BackendResponse, BackendTransport,
    BackendWeight, BucketLimit, BucketStore, BudgetClient, BufferStore, CheckResult,
    DecisionReason, Gateway, GatewayError, GatewayHttpState, HealthConfig, HealthMonitor,
    LimitState, LimiterError, LimitsConfig, ManualClock, MemoryUsageSink, PolicyCache,
    PublishOutcome, RateLimiter, RouteRequest, RoutingEngine, RoutingPolicy, UsagePublisher,
    http_router,
};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tempfile::TempDir;
use tower::util::ServiceExt;

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    Hang,
}

#[derive(Default)]
struct ScriptedTransport {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: AtomicU32,
}

impl ScriptedTransport {
    fn set(&self, backend: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(backend.to_string(), behavior);
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendTransport for ScriptedTransport {
    async fn forward(
        &self,
        endpoint: &BackendEndpoint,
        payload: &BackendRequest,
        _timeout: Duration,
    ) -> Result<BackendResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&endpoint.id)
            .copied()
            .unwrap_or(Behavior::Succeed);
        match behavior {
            Behavior::Succeed => Ok(BackendResponse {
                text: format!("{} says: {}", endpoint.id, payload.prompt),
                tokens_used: 7,
                ..BackendResponse::default()
            }),
            Behavior::Fail => Err(BackendError::Status {
                backend: endpoint.id.clone(),
                status: 500,
                body: "internal failure".to_string(),
            }),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(BackendResponse::default())
            }
        }
    }

    async fn probe(&self, _endpoint: &BackendEndpoint, _timeout: Duration) -> Result<(), BackendError> {
        Ok(())
    }
}

struct Harness {
    gateway: Arc<Gateway>,
    transport: Arc<ScriptedTransport>,
    sink: Arc<MemoryUsageSink>,
    audit: Arc<MemoryAuditSink>,
    clock: Arc<ManualClock>,
    _dir: TempDir,
}

/// Bucket store whose backend is down.
struct UnavailableStore;

#[async_trait]
impl BucketStore for UnavailableStore {
    async fn take(
        &self,
        _key: &str,
        _limit: BucketLimit,
        _now_ms: u64,
    ) -> Result<CheckResult, LimiterError> {
        Err(LimiterError::Store("connection refused".to_string()))
    }

    async fn reset(&self, _key: &str) -> Result<(), LimiterError> {
        Err(LimiterError::Store("connection refused".to_string()))
    }
}

async fn harness(limits: LimitsConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let limiter = RateLimiter::in_memory().with_clock(clock.clone());
    harness_with(limits, limiter, clock).await
}

async fn harness_with(limits: LimitsConfig, limiter: RateLimiter, clock: Arc<ManualClock>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::default());

    let health = Arc::new(HealthMonitor::new(HealthConfig::default(), transport.clone()));
    for id in ["b1", "b2"] {
        health.register(BackendEndpoint::new(id, format!("mock://{id}"), Duration::from_secs(5)));
    }
    let policies = Arc::new(
        PolicyCache::from_policies(vec![RoutingPolicy::new(
            "org-1",
            "m",
            vec![BackendWeight::new("b1", 70), BackendWeight::new("b2", 30)],
        )])
        .unwrap(),
    );
    let router = Arc::new(RoutingEngine::new(policies, health).with_seed(7));

    let sink = Arc::new(MemoryUsageSink::new());
    let buffer = BufferStore::open(dir.path().join("buffer"), Duration::from_secs(3600))
        .await
        .unwrap();
    let publisher = Arc::new(UsagePublisher::new(sink.clone(), Arc::new(buffer)));
    let audit = Arc::new(MemoryAuditSink::new());

    let gateway = Gateway::new(
        limiter,
        BudgetClient::stub(),
        router,
        transport.clone(),
        publisher,
    )
    .with_limits(limits)
    .with_audit(AuditLogger::with_sink(audit.clone()));

    Harness {
        gateway: Arc::new(gateway),
        transport,
        sink,
        audit,
        clock,
        _dir: dir,
    }
}

fn request(n: usize, api_key_id: &str) -> RouteRequest {
    RouteRequest {
        request_id: format!("req-{n}"),
        organization_id: "org-1".to_string(),
        api_key_id: api_key_id.to_string(),
        model: "m".to_string(),
        payload: "hello there".to_string(),
        ..RouteRequest::default()
    }
}

#[tokio::test]
async fn organization_burst_then_refill() {
    let limits = LimitsConfig {
        org_rps: 10.0,
        org_burst: 20,
        ..LimitsConfig::default()
    };
    let h = harness(limits).await;

    for n in 0..20 {
        h.gateway.handle(request(n, "key-1")).await.unwrap();
    }

    let err = h.gateway.handle(request(20, "key-1")).await.unwrap_err();
    match &err {
        GatewayError::RateLimited {
            limit,
            remaining,
            retry_after,
            ..
        } => {
            assert_eq!(*limit, 20);
            assert_eq!(*remaining, 0);
            assert_eq!(*retry_after, Duration::from_millis(100));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(err.code(), "RATE_LIMITED");
    assert_eq!(err.status().as_u16(), 429);
    assert_eq!(h.transport.calls(), 20);

    h.clock.advance_ms(100);
    h.gateway.handle(request(21, "key-1")).await.unwrap();

    let records = h.sink.records().await;
    assert_eq!(records.len(), 22);
    let denied: Vec<_> = records
        .iter()
        .filter(|r| r.limit_state == LimitState::RateLimited)
        .collect();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].request_id, "req-20");
    assert_eq!(denied[0].cost_usd, 0.0);
    assert_eq!(denied[0].tokens_output, 0);

    let snapshot = h.gateway.observability();
    assert_eq!(snapshot.requests, 22);
    assert_eq!(snapshot.rate_limited, 1);
}

#[tokio::test]
async fn exhausted_budget_credential_is_rejected_before_routing() {
    let h = harness(LimitsConfig::default()).await;

    let err = h
        .gateway
        .handle(request(1, "dev-exhausted-budget-key"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "BUDGET_EXCEEDED");
    assert_eq!(err.status().as_u16(), 402);
    assert_eq!(h.transport.calls(), 0);

    let records = h.sink.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].limit_state, LimitState::BudgetExceeded);
    let budget = records[0].budget_snapshot.as_ref().unwrap();
    assert_eq!(budget.currency_remaining, 0.0);
    assert_eq!(budget.period, "monthly");

    let events = h.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, AuditAction::RequestDenied);
    assert_eq!(events[0].limit_state, LimitState::BudgetExceeded);
}

#[tokio::test]
async fn exhausted_quota_credential_maps_to_quota_error() {
    let h = harness(LimitsConfig::default()).await;
    let err = h
        .gateway
        .handle(request(1, "dev-exhausted-quota-key"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "QUOTA_EXCEEDED");
    assert_eq!(err.status().as_u16(), 402);
}

#[tokio::test]
async fn failing_primary_fails_over_within_one_request() {
    let h = harness(LimitsConfig::default()).await;
    h.transport.set("b1", Behavior::Fail);

    // Keep drawing until the weighted pick lands on the failing primary.
    let mut failed_over = None;
    for n in 0..50 {
        let response = h.gateway.handle(request(n, "key-1")).await.unwrap();
        assert_eq!(response.backend_id, "b2");
        if response.attempts == 2 {
            failed_over = Some(response);
            break;
        }
    }
    let response = failed_over.expect("primary was never selected");
    assert_eq!(response.decision, DecisionReason::Failover);
    assert_eq!(response.usage.retry_count, 1);
    assert!(!response.text.contains("internal failure"));

    let b1 = h.gateway.health().endpoint("b1").unwrap();
    assert!(b1.consecutive_errors >= 1);
    assert!(h.gateway.observability().failovers >= 1);
}

#[tokio::test]
async fn all_backends_failing_returns_sanitized_backend_error() {
    let h = harness(LimitsConfig::default()).await;
    h.transport.set("b1", Behavior::Fail);
    h.transport.set("b2", Behavior::Fail);

    let err = h.gateway.handle(request(1, "key-1")).await.unwrap_err();
    assert_eq!(err.code(), "BACKEND_ERROR");
    assert_eq!(err.status().as_u16(), 502);
    assert!(!err.public_message().contains("internal failure"));
    assert_eq!(h.transport.calls(), 2);
}

#[tokio::test]
async fn unknown_model_has_no_backend() {
    let h = harness(LimitsConfig::default()).await;
    let mut req = request(1, "key-1");
    req.model = "unrouted".to_string();

    let err = h.gateway.handle(req).await.unwrap_err();
    assert_eq!(err.code(), "NO_BACKEND_AVAILABLE");
    assert_eq!(err.status().as_u16(), 503);
    assert_eq!(h.audit.events().len(), 1);
}

#[tokio::test]
async fn sink_outage_buffers_then_retry_publishes() {
    let h = harness(LimitsConfig::default()).await;
    h.sink.set_failing(true);

    let response = h.gateway.handle(request(1, "key-1")).await.unwrap();
    assert_eq!(response.publish, Some(PublishOutcome::Buffered));
    let publisher = h.gateway.publisher();
    assert_eq!(publisher.buffer().count().await.unwrap(), 1);

    h.sink.set_failing(false);
    let report = publisher.retry_buffered().await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(publisher.buffer().count().await.unwrap(), 0);

    let records = h.sink.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].record_id, response.usage.record_id);
}

#[tokio::test]
async fn every_request_is_audited_exactly_once() {
    let h = harness(LimitsConfig::default()).await;

    h.gateway.handle(request(1, "key-1")).await.unwrap();
    h.gateway
        .handle(request(2, "dev-exhausted-budget-key"))
        .await
        .unwrap_err();
    let mut invalid = request(3, "key-1");
    invalid.payload.clear();
    h.gateway.handle(invalid).await.unwrap_err();

    let events = h.audit.events();
    assert_eq!(events.len(), 3);
    let ids: Vec<_> = events.iter().map(|e| e.request_id.as_str()).collect();
    assert_eq!(ids, ["req-1", "req-2", "req-3"]);
    assert_eq!(events[0].action, AuditAction::RequestAllowed);
    assert_eq!(events[2].decision_reason, "INVALID_REQUEST");
}

#[tokio::test]
async fn cancelled_request_is_audited_as_cancelled() {
    let h = harness(LimitsConfig::default()).await;
    h.transport.set("b1", Behavior::Hang);
    h.transport.set("b2", Behavior::Hang);

    let outcome =
        tokio::time::timeout(Duration::from_millis(50), h.gateway.handle(request(1, "key-1"))).await;
    assert!(outcome.is_err());

    let events = h.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].decision_reason, "CANCELLED");
    assert_eq!(events[0].action, AuditAction::RequestDenied);
}

#[tokio::test]
async fn unavailable_limiter_store_fails_closed() {
    let clock = Arc::new(ManualClock::new(0));
    let limiter = RateLimiter::new(Arc::new(UnavailableStore));
    let h = harness_with(LimitsConfig::default(), limiter, clock).await;

    let err = h.gateway.handle(request(1, "key-1")).await.unwrap_err();
    assert!(matches!(err, GatewayError::LimiterUnavailable(_)));
    assert_eq!(err.code(), "SERVICE_UNAVAILABLE");
    assert_eq!(err.status().as_u16(), 503);
    assert!(!err.public_message().contains("connection refused"));
    assert_eq!(h.transport.calls(), 0);

    let events = h.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].decision_reason, "SERVICE_UNAVAILABLE");
}

#[tokio::test]
async fn unavailable_limiter_store_admits_when_fail_open() {
    let clock = Arc::new(ManualClock::new(0));
    let limiter = RateLimiter::new(Arc::new(UnavailableStore));
    let limits = LimitsConfig {
        fail_open: true,
        ..LimitsConfig::default()
    };
    let h = harness_with(limits, limiter, clock).await;

    let response = h.gateway.handle(request(1, "key-1")).await.unwrap();
    assert_eq!(response.usage.limit_state, LimitState::WithinLimit);
    assert_eq!(h.transport.calls(), 1);
    assert_eq!(h.audit.events()[0].action, AuditAction::RequestAllowed);
}

#[tokio::test]
async fn requests_rejected_at_the_http_edge_are_audited() {
    let h = harness(LimitsConfig::default()).await;
    let router = http_router(GatewayHttpState::new(h.gateway.clone()));

    let malformed = router
        .clone()
        .oneshot(
            Request::post("/v1/inference")
                .header("content-type", "application/json")
                .header("x-organization-id", "org-1")
                .header("x-request-id", "edge-1")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

    let anonymous = router
        .oneshot(
            Request::post("/v1/inference")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"request_id":"edge-2","model":"m","payload":"hi"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let events = h.audit.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].request_id, "edge-1");
    assert_eq!(events[0].organization_id, "org-1");
    assert_eq!(events[0].decision_reason, "INVALID_REQUEST");
    assert_eq!(events[1].request_id, "edge-2");
    assert_eq!(events[1].model, "m");
    assert_eq!(events[1].decision_reason, "UNAUTHORIZED");
    assert!(events.iter().all(|e| e.action == AuditAction::RequestDenied));
    assert_eq!(h.transport.calls(), 0);
    assert_eq!(h.gateway.observability().requests, 2);
}
