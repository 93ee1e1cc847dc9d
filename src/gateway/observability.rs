use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub rate_limited: u64,
    pub budget_exceeded: u64,
    pub routing_unavailable: u64,
    pub backend_calls: u64,
    pub backend_errors: u64,
    pub failovers: u64,
    pub usage_published: u64,
    pub usage_buffered: u64,
    pub usage_publish_failed: u64,
}

impl ObservabilitySnapshot {
    /// Prometheus text exposition (format 0.0.4).
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, help, value) in [
            ("requests_total", "Inference requests received.", self.requests),
            ("rate_limited_total", "Requests denied by a rate limit.", self.rate_limited),
            ("budget_exceeded_total", "Requests denied for budget or quota.", self.budget_exceeded),
            ("routing_unavailable_total", "Requests with no routable backend.", self.routing_unavailable),
            ("backend_calls_total", "Forward attempts sent to backends.", self.backend_calls),
            ("backend_errors_total", "Forward attempts that failed.", self.backend_errors),
            ("failovers_total", "Routing decisions made as failover.", self.failovers),
            ("usage_published_total", "Usage records published to the sink.", self.usage_published),
            ("usage_buffered_total", "Usage records spooled to the disk buffer.", self.usage_buffered),
            ("usage_publish_failed_total", "Usage records neither published nor buffered.", self.usage_publish_failed),
        ] {
            let _ = writeln!(out, "# HELP api_router_{name} {help}");
            let _ = writeln!(out, "# TYPE api_router_{name} counter");
            let _ = writeln!(out, "api_router_{name} {value}");
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Healthy,
    Unhealthy,
    NotConfigured,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Readiness {
    /// `ready` or `degraded`.
    pub status: String,
    pub components: BTreeMap<String, ComponentStatus>,
    pub timestamp: DateTime<Utc>,
}

impl Readiness {
    pub fn from_components(components: BTreeMap<String, ComponentStatus>) -> Self {
        let ready = components
            .values()
            .all(|status| *status != ComponentStatus::Unhealthy);
        Self {
            status: if ready { "ready" } else { "degraded" }.to_string(),
            components,
            timestamp: Utc::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == "ready"
    }
}

/// Process-wide request counters, shared by every handler.
#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    rate_limited: AtomicU64,
    budget_exceeded: AtomicU64,
    routing_unavailable: AtomicU64,
    backend_calls: AtomicU64,
    backend_errors: AtomicU64,
    failovers: AtomicU64,
    usage_published: AtomicU64,
    usage_buffered: AtomicU64,
    usage_publish_failed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Observability {
    pub fn record_request(&self) {
        bump(&self.requests);
    }

    pub fn record_rate_limited(&self) {
        bump(&self.rate_limited);
    }

    pub fn record_budget_exceeded(&self) {
        bump(&self.budget_exceeded);
    }

    pub fn record_routing_unavailable(&self) {
        bump(&self.routing_unavailable);
    }

    pub fn record_backend_call(&self) {
        bump(&self.backend_calls);
    }

    pub fn record_backend_error(&self) {
        bump(&self.backend_errors);
    }

    pub fn record_failover(&self) {
        bump(&self.failovers);
    }

    pub fn record_usage_published(&self) {
        bump(&self.usage_published);
    }

    pub fn record_usage_buffered(&self) {
        bump(&self.usage_buffered);
    }

    pub fn record_usage_publish_failed(&self) {
        bump(&self.usage_publish_failed);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ObservabilitySnapshot {
            requests: load(&self.requests),
            rate_limited: load(&self.rate_limited),
            budget_exceeded: load(&self.budget_exceeded),
            routing_unavailable: load(&self.routing_unavailable),
            backend_calls: load(&self.backend_calls),
            backend_errors: load(&self.backend_errors),
            failovers: load(&self.failovers),
            usage_published: load(&self.usage_published),
            usage_buffered: load(&self.usage_buffered),
            usage_publish_failed: load(&self.usage_publish_failed),
        }
    }
}
