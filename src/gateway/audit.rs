use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::usage::LimitState;

/// Decision reason recorded when a request is dropped before reaching a
/// terminal outcome.
pub const CANCELLED_REASON: &str = "CANCELLED";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    RequestAllowed,
    RequestDenied,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestAllowed => "REQUEST_ALLOWED",
            Self::RequestDenied => "REQUEST_DENIED",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub request_id: String,
    pub organization_id: String,
    pub api_key_id: String,
    pub model: String,
    pub action: AuditAction,
    pub decision_reason: String,
    pub limit_state: LimitState,
    pub timestamp: DateTime<Utc>,
}

/// Identity of the request being audited; the outcome is filled in when
/// the event is emitted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditSubject {
    pub request_id: String,
    pub organization_id: String,
    pub api_key_id: String,
    pub model: String,
}

impl AuditSubject {
    fn event(&self, action: AuditAction, reason: &str, limit_state: LimitState) -> AuditEvent {
        AuditEvent {
            request_id: self.request_id.clone(),
            organization_id: self.organization_id.clone(),
            api_key_id: self.api_key_id.clone(),
            model: self.model.clone(),
            action,
            decision_reason: reason.to_string(),
            limit_state,
            timestamp: Utc::now(),
        }
    }
}

/// Receives emitted audit events, e.g. to keep them for inspection.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Append-only decision log, emitted on the `audit` tracing target.
#[derive(Clone, Default)]
pub struct AuditLogger {
    sink: Option<std::sync::Arc<dyn AuditSink>>,
}

impl fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLogger")
            .field("sink", &self.sink.as_ref().map(|_| "<sink>"))
            .finish()
    }
}

impl AuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: std::sync::Arc<dyn AuditSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn log_allowed(&self, event: &AuditEvent) {
        tracing::info!(
            target: "audit",
            request_id = %event.request_id,
            organization_id = %event.organization_id,
            api_key_id = %event.api_key_id,
            model = %event.model,
            action = %event.action,
            decision_reason = %event.decision_reason,
            limit_state = %event.limit_state,
            timestamp = %event.timestamp.to_rfc3339(),
            "request allowed"
        );
        self.forward(event);
    }

    pub fn log_denial(&self, event: &AuditEvent) {
        tracing::warn!(
            target: "audit",
            request_id = %event.request_id,
            organization_id = %event.organization_id,
            api_key_id = %event.api_key_id,
            model = %event.model,
            action = %event.action,
            decision_reason = %event.decision_reason,
            limit_state = %event.limit_state,
            timestamp = %event.timestamp.to_rfc3339(),
            "request denied"
        );
        self.forward(event);
    }

    fn forward(&self, event: &AuditEvent) {
        if let Some(sink) = &self.sink {
            sink.record(event);
        }
    }

    /// Starts auditing a request. The guard emits exactly one event: the
    /// outcome passed to `allow`/`deny`, or a `CANCELLED` denial when it is
    /// dropped first.
    pub fn begin(&self, subject: AuditSubject) -> AuditGuard {
        AuditGuard {
            logger: self.clone(),
            subject: Some(subject),
        }
    }
}

#[must_use = "dropping the guard audits the request as cancelled"]
pub struct AuditGuard {
    logger: AuditLogger,
    subject: Option<AuditSubject>,
}

impl AuditGuard {
    pub fn allow(mut self, reason: &str) {
        if let Some(subject) = self.subject.take() {
            self.logger.log_allowed(&subject.event(
                AuditAction::RequestAllowed,
                reason,
                LimitState::WithinLimit,
            ));
        }
    }

    pub fn deny(mut self, reason: &str, limit_state: LimitState) {
        if let Some(subject) = self.subject.take() {
            self.logger
                .log_denial(&subject.event(AuditAction::RequestDenied, reason, limit_state));
        }
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        if let Some(subject) = self.subject.take() {
            self.logger.log_denial(&subject.event(
                AuditAction::RequestDenied,
                CANCELLED_REASON,
                LimitState::WithinLimit,
            ));
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: std::sync::Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event.clone());
    }
}
