use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::budget::BudgetStatus;
use crate::gateway::costing::PricingTable;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitState {
    #[default]
    WithinLimit,
    RateLimited,
    BudgetExceeded,
}

impl LimitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WithinLimit => "WITHIN_LIMIT",
            Self::RateLimited => "RATE_LIMITED",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
        }
    }
}

impl fmt::Display for LimitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub period: String,
    pub tokens_remaining: i64,
    pub currency_remaining: f64,
}

impl BudgetSnapshot {
    /// Budget limits are currency, quota limits are tokens; the other
    /// dimension is reported as zero.
    pub fn from_status(status: &BudgetStatus) -> Self {
        use crate::gateway::budget::QuotaType;

        let remaining = status.remaining();
        let (tokens_remaining, currency_remaining) = match status.quota_type {
            QuotaType::Budget => (0, remaining),
            QuotaType::DailyQuota | QuotaType::MonthlyQuota => (remaining.floor() as i64, 0.0),
        };
        Self {
            period: status.quota_type.period().to_string(),
            tokens_remaining,
            currency_remaining,
        }
    }
}

/// Billing/analytics fact for one request. Consumers deduplicate by
/// `record_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub record_id: Uuid,
    pub request_id: String,
    pub organization_id: String,
    pub api_key_id: String,
    pub model: String,
    pub backend_id: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub limit_state: LimitState,
    pub decision_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_snapshot: Option<BudgetSnapshot>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub span_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// Everything the builder needs; assembled by the request pipeline.
#[derive(Clone, Debug, Default)]
pub struct UsageContext {
    pub request_id: String,
    pub organization_id: String,
    pub api_key_id: String,
    pub model: String,
    pub backend_id: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub latency: Duration,
    pub limit_state: LimitState,
    pub decision_reason: String,
    pub budget: Option<BudgetStatus>,
    pub retry_count: u32,
    pub trace_id: String,
    pub span_id: String,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default)]
pub struct UsageRecordBuilder {
    pricing: Arc<PricingTable>,
}

impl UsageRecordBuilder {
    pub fn new(pricing: Arc<PricingTable>) -> Self {
        Self { pricing }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn build(&self, context: &UsageContext) -> UsageRecord {
        self.build_with_id(context, Uuid::new_v4())
    }

    pub fn build_with_id(&self, context: &UsageContext, record_id: Uuid) -> UsageRecord {
        let cost_usd = if context.limit_state == LimitState::WithinLimit {
            self.pricing
                .estimate_cost_usd(&context.model, context.tokens_input, context.tokens_output)
        } else {
            0.0
        };

        UsageRecord {
            record_id,
            request_id: context.request_id.clone(),
            organization_id: context.organization_id.clone(),
            api_key_id: context.api_key_id.clone(),
            model: context.model.clone(),
            backend_id: context.backend_id.clone(),
            tokens_input: context.tokens_input,
            tokens_output: context.tokens_output,
            latency_ms: u64::try_from(context.latency.as_millis()).unwrap_or(u64::MAX),
            cost_usd,
            limit_state: context.limit_state,
            decision_reason: context.decision_reason.clone(),
            budget_snapshot: context.budget.as_ref().map(BudgetSnapshot::from_status),
            retry_count: context.retry_count,
            trace_id: context.trace_id.clone(),
            span_id: context.span_id.clone(),
            metadata: context.metadata.clone(),
            timestamp: context.timestamp.unwrap_or_else(Utc::now),
        }
    }
}
