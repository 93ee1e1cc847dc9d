use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Credential that always reports an exhausted monthly budget when no
/// budget service is configured.
pub const EXHAUSTED_BUDGET_CREDENTIAL: &str = "dev-exhausted-budget-key";
/// Credential that always reports an exhausted daily quota when no budget
/// service is configured.
pub const EXHAUSTED_QUOTA_CREDENTIAL: &str = "dev-exhausted-quota-key";

const STUB_BUDGET_LIMIT: f64 = 10_000.0;
const STUB_DAILY_QUOTA_LIMIT: f64 = 1_000.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    #[default]
    Budget,
    DailyQuota,
    MonthlyQuota,
}

impl QuotaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Budget => "budget",
            Self::DailyQuota => "daily_quota",
            Self::MonthlyQuota => "monthly_quota",
        }
    }

    pub fn period(self) -> &'static str {
        match self {
            Self::DailyQuota => "daily",
            Self::Budget | Self::MonthlyQuota => "monthly",
        }
    }
}

impl fmt::Display for QuotaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub allowed: bool,
    /// Currency for budgets, tokens for quotas; the service may send
    /// fractional values for either.
    #[serde(default)]
    pub current_usage: f64,
    #[serde(default)]
    pub limit: f64,
    #[serde(default)]
    pub quota_type: QuotaType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl BudgetStatus {
    fn headroom() -> Self {
        Self {
            allowed: true,
            current_usage: 0.0,
            limit: STUB_BUDGET_LIMIT,
            quota_type: QuotaType::Budget,
            reason: String::new(),
        }
    }

    pub fn remaining(&self) -> f64 {
        (self.limit - self.current_usage).max(0.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default = "default_budget_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_budget_timeout_ms() -> u64 {
    2_000
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: default_budget_timeout_ms(),
        }
    }
}

/// Client for the external budget/quota service.
///
/// Without an endpoint the client answers locally: every organization has
/// headroom except the two `dev-exhausted-*` sentinel credentials. With an
/// endpoint, any transport failure or non-2xx answer is treated as
/// headroom so the budget service can never take inference down.
#[derive(Clone)]
pub struct BudgetClient {
    endpoint: Option<String>,
    http: reqwest::Client,
    timeout: Duration,
}

impl BudgetClient {
    pub fn new(config: &BudgetConfig) -> Self {
        let endpoint = config
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .map(|endpoint| endpoint.trim_end_matches('/').to_string());
        Self {
            endpoint,
            http: reqwest::Client::new(),
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
        }
    }

    pub fn stub() -> Self {
        Self::new(&BudgetConfig::default())
    }

    pub fn is_remote(&self) -> bool {
        self.endpoint.is_some()
    }

    pub async fn check(&self, org_id: &str) -> BudgetStatus {
        self.check_credential(org_id, "").await
    }

    pub async fn check_credential(&self, org_id: &str, credential_id: &str) -> BudgetStatus {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return stub_status(credential_id);
        };

        let url = format!("{endpoint}/v1/budgets/{org_id}/check");
        let response = match self.http.get(&url).timeout(self.timeout).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    organization_id = org_id,
                    error = %err,
                    "budget service unreachable, allowing request"
                );
                return BudgetStatus::headroom();
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                organization_id = org_id,
                status = status.as_u16(),
                "budget service returned error status, allowing request"
            );
            return BudgetStatus::headroom();
        }

        match response.json::<BudgetStatus>().await {
            Ok(budget) => budget,
            Err(err) => {
                tracing::warn!(
                    organization_id = org_id,
                    error = %err,
                    "budget service response undecodable, allowing request"
                );
                BudgetStatus::headroom()
            }
        }
    }
}

fn stub_status(credential_id: &str) -> BudgetStatus {
    match credential_id {
        EXHAUSTED_BUDGET_CREDENTIAL => BudgetStatus {
            allowed: false,
            current_usage: STUB_BUDGET_LIMIT,
            limit: STUB_BUDGET_LIMIT,
            quota_type: QuotaType::Budget,
            reason: "Monthly budget exhausted".to_string(),
        },
        EXHAUSTED_QUOTA_CREDENTIAL => BudgetStatus {
            allowed: false,
            current_usage: STUB_DAILY_QUOTA_LIMIT,
            limit: STUB_DAILY_QUOTA_LIMIT,
            quota_type: QuotaType::DailyQuota,
            reason: "Daily quota exhausted".to_string(),
        },
        _ => BudgetStatus::headroom(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_allows_by_default() {
        let client = BudgetClient::stub();
        let status = client.check("org-1").await;
        assert!(status.allowed);
        assert_eq!(status.limit, 10_000.0);
        assert_eq!(status.quota_type, QuotaType::Budget);
        assert_eq!(status.remaining(), 10_000.0);
    }

    #[tokio::test]
    async fn stub_denies_sentinel_credentials() {
        let client = BudgetClient::stub();

        for _ in 0..3 {
            let budget = client
                .check_credential("org-1", EXHAUSTED_BUDGET_CREDENTIAL)
                .await;
            assert!(!budget.allowed);
            assert_eq!(budget.quota_type, QuotaType::Budget);
            assert_eq!(budget.reason, "Monthly budget exhausted");
            assert_eq!(budget.remaining(), 0.0);
        }

        let quota = client
            .check_credential("org-1", EXHAUSTED_QUOTA_CREDENTIAL)
            .await;
        assert!(!quota.allowed);
        assert_eq!(quota.quota_type, QuotaType::DailyQuota);
        assert_eq!(quota.current_usage, 1_000.0);
    }

    #[test]
    fn quota_type_uses_snake_case_on_the_wire() {
        let raw = r#"{"allowed":false,"current_usage":5,"limit":5,"quota_type":"monthly_quota","reason":"x"}"#;
        let status: BudgetStatus = serde_json::from_str(raw).expect("decode");
        assert_eq!(status.quota_type, QuotaType::MonthlyQuota);
        assert_eq!(status.quota_type.period(), "monthly");
    }

    #[test]
    fn fractional_usage_decodes() {
        let raw = r#"{"allowed":false,"current_usage":10000.5,"limit":10000.0,"quota_type":"budget"}"#;
        let status: BudgetStatus = serde_json::from_str(raw).expect("decode");
        assert!(!status.allowed);
        assert_eq!(status.current_usage, 10_000.5);
        assert_eq!(status.remaining(), 0.0);
    }

    #[test]
    fn blank_endpoint_means_stub() {
        let client = BudgetClient::new(&BudgetConfig {
            endpoint: Some("  ".to_string()),
            timeout_ms: 10,
        });
        assert!(!client.is_remote());
    }
}
