use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::health::{BackendEndpoint, HealthMonitor};
use super::policy::{BackendWeight, PolicyCache, RoutingPolicy};

/// Number of routing decisions kept for the admin surface.
pub const DECISION_LOG_CAPACITY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    Primary,
    Failover,
    Override,
}

impl DecisionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "PRIMARY",
            Self::Failover => "FAILOVER",
            Self::Override => "OVERRIDE",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no routing policy for organization {organization_id} and model {model}")]
    NoPolicy {
        organization_id: String,
        model: String,
    },
    #[error("no backend available for organization {organization_id} and model {model}")]
    NoBackendAvailable {
        organization_id: String,
        model: String,
    },
}

#[derive(Clone, Debug)]
pub struct RouteSelection {
    pub endpoint: Arc<BackendEndpoint>,
    pub reason: DecisionReason,
    pub policy: Arc<RoutingPolicy>,
}

impl RouteSelection {
    pub fn backend_id(&self) -> &str {
        &self.endpoint.id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub timestamp: DateTime<Utc>,
    pub organization_id: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DecisionReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<u64>,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Picks a backend per request from the current policy and health view.
pub struct RoutingEngine {
    policies: Arc<PolicyCache>,
    health: Arc<HealthMonitor>,
    rng: Mutex<fastrand::Rng>,
    decisions: Mutex<VecDeque<RoutingDecision>>,
}

impl RoutingEngine {
    pub fn new(policies: Arc<PolicyCache>, health: Arc<HealthMonitor>) -> Self {
        Self {
            policies,
            health,
            rng: Mutex::new(fastrand::Rng::new()),
            decisions: Mutex::new(VecDeque::with_capacity(DECISION_LOG_CAPACITY)),
        }
    }

    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
            ..self
        }
    }

    pub fn policies(&self) -> &Arc<PolicyCache> {
        &self.policies
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn select(&self, organization_id: &str, model: &str) -> Result<RouteSelection, RoutingError> {
        self.select_excluding(organization_id, model, &[])
    }

    /// Selection for a retry: backends already tried are skipped and the
    /// result is always a failover.
    pub fn select_excluding(
        &self,
        organization_id: &str,
        model: &str,
        tried: &[String],
    ) -> Result<RouteSelection, RoutingError> {
        let attempt = u32::try_from(tried.len()).unwrap_or(u32::MAX).saturating_add(1);
        let result = self.choose(organization_id, model, tried);

        let decision = match &result {
            Ok(selection) => RoutingDecision {
                timestamp: Utc::now(),
                organization_id: organization_id.to_string(),
                model: model.to_string(),
                backend_id: Some(selection.endpoint.id.clone()),
                reason: Some(selection.reason),
                policy_version: Some(selection.policy.version),
                attempt,
                error: None,
            },
            Err(err) => RoutingDecision {
                timestamp: Utc::now(),
                organization_id: organization_id.to_string(),
                model: model.to_string(),
                backend_id: None,
                reason: None,
                policy_version: self.policies.get(organization_id, model).map(|p| p.version),
                attempt,
                error: Some(err.to_string()),
            },
        };
        match &result {
            Ok(selection) => tracing::debug!(
                organization_id,
                model,
                backend_id = %selection.endpoint.id,
                reason = %selection.reason,
                attempt,
                "routing decision"
            ),
            Err(err) => tracing::warn!(organization_id, model, attempt, error = %err, "routing failed"),
        }
        self.push_decision(decision);
        result
    }

    /// Newest first.
    pub fn recent_decisions(&self, limit: usize) -> Vec<RoutingDecision> {
        let decisions = match self.decisions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        decisions.iter().rev().take(limit).cloned().collect()
    }

    fn push_decision(&self, decision: RoutingDecision) {
        let mut decisions = match self.decisions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if decisions.len() >= DECISION_LOG_CAPACITY {
            decisions.pop_front();
        }
        decisions.push_back(decision);
    }

    fn choose(
        &self,
        organization_id: &str,
        model: &str,
        tried: &[String],
    ) -> Result<RouteSelection, RoutingError> {
        let policy = self
            .policies
            .get(organization_id, model)
            .ok_or_else(|| RoutingError::NoPolicy {
                organization_id: organization_id.to_string(),
                model: model.to_string(),
            })?;
        let unavailable = || RoutingError::NoBackendAvailable {
            organization_id: organization_id.to_string(),
            model: model.to_string(),
        };

        let table = self.health.snapshot();
        let eligible: Vec<(&BackendWeight, Arc<BackendEndpoint>)> = policy
            .backends_by_weight()
            .into_iter()
            .filter(|backend| !policy.degraded_backends.contains(&backend.backend_id))
            .filter(|backend| !tried.contains(&backend.backend_id))
            .filter_map(|backend| {
                table
                    .get(&backend.backend_id)
                    .filter(|endpoint| endpoint.is_routable())
                    .map(|endpoint| (backend, Arc::clone(endpoint)))
            })
            .collect();

        let select = |endpoint: Arc<BackendEndpoint>, reason| RouteSelection {
            endpoint,
            reason,
            policy: Arc::clone(&policy),
        };

        if !tried.is_empty() {
            let (_, endpoint) = eligible.into_iter().next().ok_or_else(unavailable)?;
            return Ok(select(endpoint, DecisionReason::Failover));
        }

        if let Some(pinned) = &policy.pinned_backend {
            if let Some((_, endpoint)) = eligible.iter().find(|(b, _)| &b.backend_id == pinned) {
                return Ok(select(Arc::clone(endpoint), DecisionReason::Override));
            }
        }

        let primary_id = policy.primary().map(|b| b.backend_id.as_str());
        let primary = eligible
            .iter()
            .find(|(b, _)| Some(b.backend_id.as_str()) == primary_id);
        let primary_tripped = match primary {
            None => true,
            Some((_, endpoint)) => endpoint.consecutive_errors >= policy.failover_threshold,
        };
        if primary_tripped {
            if let Some((_, endpoint)) = eligible
                .iter()
                .find(|(b, _)| Some(b.backend_id.as_str()) != primary_id)
            {
                return Ok(select(Arc::clone(endpoint), DecisionReason::Failover));
            }
        }

        let endpoint = self.weighted_pick(&eligible).ok_or_else(unavailable)?;
        Ok(select(endpoint, DecisionReason::Primary))
    }

    fn weighted_pick(
        &self,
        eligible: &[(&BackendWeight, Arc<BackendEndpoint>)],
    ) -> Option<Arc<BackendEndpoint>> {
        let now_ms = self.health.now_millis();
        let ramp = self.health.config().recovery_ramp();
        let weights: Vec<f64> = eligible
            .iter()
            .map(|(backend, endpoint)| f64::from(backend.weight) * endpoint.weight_factor(now_ms, ramp))
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return eligible.first().map(|(_, endpoint)| Arc::clone(endpoint));
        }

        let roll = {
            let mut rng = match self.rng.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            rng.f64() * total
        };
        let mut acc = 0.0;
        for ((_, endpoint), weight) in eligible.iter().zip(&weights) {
            acc += weight;
            if *weight > 0.0 && roll < acc {
                return Some(Arc::clone(endpoint));
            }
        }
        eligible
            .iter()
            .zip(&weights)
            .rev()
            .find(|(_, weight)| **weight > 0.0)
            .map(|((_, endpoint), _)| Arc::clone(endpoint))
    }
}
