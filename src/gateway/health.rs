use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::http_backend::BackendTransport;
use super::{Clock, SystemClock};
use crate::utils::task::AbortOnDrop;

/// Share of the configured weight a backend gets right after recovering.
const RECOVERY_FLOOR: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminOverride {
    pub reason: String,
    pub since: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub uri: String,
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_backend_timeout_secs() -> u64 {
    30
}

impl BackendConfig {
    pub fn new(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            timeout_secs: default_backend_timeout_secs(),
        }
    }
}

/// Point-in-time view of one backend. Never mutated in place: every state
/// change publishes a new `Arc<BackendEndpoint>`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendEndpoint {
    pub id: String,
    pub uri: String,
    pub timeout_ms: u64,
    pub status: HealthStatus,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_override: Option<AdminOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_at_ms: Option<u64>,
}

impl BackendEndpoint {
    pub fn new(id: impl Into<String>, uri: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            status: HealthStatus::Healthy,
            consecutive_errors: 0,
            consecutive_successes: 0,
            last_probe: None,
            latency_ms: None,
            last_error: None,
            admin_override: None,
            recovered_at_ms: None,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(
            config.id.clone(),
            config.uri.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_admin_degraded(&self) -> bool {
        self.admin_override.is_some()
    }

    /// Eligible for routing: not unhealthy and not pulled by an operator.
    pub fn is_routable(&self) -> bool {
        self.status != HealthStatus::Unhealthy && !self.is_admin_degraded()
    }

    /// Multiplier applied to the configured weight while a recovered backend
    /// ramps back up, from [`RECOVERY_FLOOR`] to 1.0 over `ramp`.
    pub fn weight_factor(&self, now_ms: u64, ramp: Duration) -> f64 {
        let Some(recovered_at) = self.recovered_at_ms else {
            return 1.0;
        };
        let ramp_ms = ramp.as_millis() as f64;
        if ramp_ms <= 0.0 {
            return 1.0;
        }
        let elapsed = now_ms.saturating_sub(recovered_at) as f64;
        if elapsed >= ramp_ms {
            return 1.0;
        }
        RECOVERY_FLOOR + (1.0 - RECOVERY_FLOOR) * (elapsed / ramp_ms)
    }

    fn after_success(&self, policy: &HealthConfig, latency: Option<Duration>, now_ms: u64) -> Self {
        let mut next = self.clone();
        next.consecutive_errors = 0;
        next.consecutive_successes = self.consecutive_successes.saturating_add(1);
        next.last_error = None;
        if let Some(latency) = latency {
            next.latency_ms = Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
        }
        if self.status != HealthStatus::Healthy
            && next.consecutive_successes >= policy.warmup_successes.max(1)
        {
            next.status = HealthStatus::Healthy;
            next.recovered_at_ms = Some(now_ms);
        }
        next
    }

    fn after_failure(&self, policy: &HealthConfig, error: &str) -> Self {
        let mut next = self.clone();
        next.consecutive_errors = self.consecutive_errors.saturating_add(1);
        next.consecutive_successes = 0;
        next.last_error = Some(error.to_string());

        let observed = if next.consecutive_errors >= policy.unhealthy_after.max(1) {
            HealthStatus::Unhealthy
        } else if next.consecutive_errors >= policy.degraded_after.max(1) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        next.status = next.status.max(observed);
        if next.status != HealthStatus::Healthy {
            next.recovered_at_ms = None;
        }
        next
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after: u32,
    #[serde(default = "default_warmup_successes")]
    pub warmup_successes: u32,
    #[serde(default = "default_recovery_ramp_secs")]
    pub recovery_ramp_secs: u64,
}

fn default_interval_secs() -> u64 {
    10
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_degraded_after() -> u32 {
    1
}

fn default_unhealthy_after() -> u32 {
    3
}

fn default_warmup_successes() -> u32 {
    2
}

fn default_recovery_ramp_secs() -> u64 {
    30
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            degraded_after: default_degraded_after(),
            unhealthy_after: default_unhealthy_after(),
            warmup_successes: default_warmup_successes(),
            recovery_ramp_secs: default_recovery_ramp_secs(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn recovery_ramp(&self) -> Duration {
        Duration::from_secs(self.recovery_ramp_secs)
    }
}

type EndpointTable = HashMap<String, Arc<BackendEndpoint>>;

/// Owns every [`BackendEndpoint`]. Readers get lock-free snapshots; writers
/// swap in a new table so no reader ever sees a half-applied update.
pub struct HealthMonitor {
    endpoints: ArcSwap<EndpointTable>,
    config: HealthConfig,
    transport: Arc<dyn BackendTransport>,
    clock: Arc<dyn Clock>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, transport: Arc<dyn BackendTransport>) -> Self {
        Self {
            endpoints: ArcSwap::from_pointee(HashMap::new()),
            config,
            transport,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn register(&self, endpoint: BackendEndpoint) {
        let endpoint = Arc::new(endpoint);
        self.endpoints.rcu(|current| {
            let mut next = EndpointTable::clone(current);
            next.insert(endpoint.id.clone(), Arc::clone(&endpoint));
            next
        });
        tracing::info!(backend_id = %endpoint.id, uri = %endpoint.uri, "backend registered");
    }

    pub fn endpoint(&self, id: &str) -> Option<Arc<BackendEndpoint>> {
        self.endpoints.load().get(id).cloned()
    }

    pub fn endpoints(&self) -> Vec<Arc<BackendEndpoint>> {
        let mut out: Vec<_> = self.endpoints.load().values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn snapshot(&self) -> Arc<EndpointTable> {
        self.endpoints.load_full()
    }

    fn update<F>(&self, id: &str, f: F) -> Option<(Arc<BackendEndpoint>, Arc<BackendEndpoint>)>
    where
        F: Fn(&BackendEndpoint) -> BackendEndpoint,
    {
        let mut changed = None;
        self.endpoints.rcu(|current| {
            changed = None;
            let mut next = EndpointTable::clone(current);
            if let Some(before) = current.get(id) {
                let after = Arc::new(f(before));
                next.insert(id.to_string(), Arc::clone(&after));
                changed = Some((Arc::clone(before), after));
            }
            next
        });
        if let Some((before, after)) = &changed {
            if before.status != after.status {
                tracing::info!(
                    backend_id = %after.id,
                    from = %before.status,
                    to = %after.status,
                    consecutive_errors = after.consecutive_errors,
                    "backend health changed"
                );
            }
        }
        changed
    }

    /// Feeds a successful probe or request outcome into the state machine.
    pub fn record_success(&self, id: &str, latency: Option<Duration>) -> Option<Arc<BackendEndpoint>> {
        let now_ms = self.clock.now_millis();
        self.update(id, |endpoint| endpoint.after_success(&self.config, latency, now_ms))
            .map(|(_, after)| after)
    }

    pub fn record_failure(&self, id: &str, error: &str) -> Option<Arc<BackendEndpoint>> {
        self.update(id, |endpoint| endpoint.after_failure(&self.config, error))
            .map(|(_, after)| after)
    }

    /// Pulls a backend out of routing until [`Self::mark_healthy`].
    pub fn mark_degraded(&self, id: &str, reason: &str) -> Option<Arc<BackendEndpoint>> {
        let since = self.now_utc();
        let updated = self
            .update(id, |endpoint| {
                let mut next = endpoint.clone();
                next.admin_override = Some(AdminOverride {
                    reason: reason.to_string(),
                    since,
                });
                next
            })
            .map(|(_, after)| after);
        if updated.is_some() {
            tracing::warn!(backend_id = id, reason, "backend marked degraded by operator");
        }
        updated
    }

    /// Clears an operator override, resets the error counters and
    /// immediately re-probes the backend.
    pub async fn mark_healthy(&self, id: &str) -> Option<Arc<BackendEndpoint>> {
        let now_ms = self.clock.now_millis();
        self.update(id, |endpoint| {
            let mut next = endpoint.clone();
            let was_routable = next.is_routable();
            next.admin_override = None;
            next.consecutive_errors = 0;
            next.last_error = None;
            if !was_routable || next.status != HealthStatus::Healthy {
                next.status = HealthStatus::Healthy;
                next.recovered_at_ms = Some(now_ms);
            }
            next
        })?;
        tracing::info!(backend_id = id, "backend marked healthy by operator");
        self.probe_now(id).await
    }

    pub async fn probe_now(&self, id: &str) -> Option<Arc<BackendEndpoint>> {
        let endpoint = self.endpoint(id)?;
        let started = Instant::now();
        let result = self
            .transport
            .probe(&endpoint, self.config.probe_timeout())
            .await;
        let latency = started.elapsed();
        let probed_at = self.now_utc();

        let now_ms = self.clock.now_millis();
        let updated = match result {
            Ok(()) => self.update(id, |endpoint| {
                let mut next = endpoint.after_success(&self.config, Some(latency), now_ms);
                next.last_probe = Some(probed_at);
                next
            }),
            Err(err) => {
                let message = err.to_string();
                tracing::debug!(backend_id = id, error = %message, "health probe failed");
                self.update(id, |endpoint| {
                    let mut next = endpoint.after_failure(&self.config, &message);
                    next.last_probe = Some(probed_at);
                    next
                })
            }
        };
        updated.map(|(_, after)| after)
    }

    pub async fn probe_all(&self) {
        let ids: Vec<String> = self.endpoints.load().keys().cloned().collect();
        futures_util::future::join_all(ids.iter().map(|id| self.probe_now(id))).await;
    }

    /// Spawns the periodic probe loop. The first pass runs immediately.
    pub fn start(self: &Arc<Self>) -> AbortOnDrop {
        let monitor = Arc::clone(self);
        let interval = self.config.interval();
        let task = tokio::spawn(async move {
            loop {
                monitor.probe_all().await;
                tokio::time::sleep(interval).await;
            }
        });
        AbortOnDrop::new(task.abort_handle())
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let now_ms = i64::try_from(self.clock.now_millis()).unwrap_or(i64::MAX);
        DateTime::from_timestamp_millis(now_ms).unwrap_or_else(Utc::now)
    }
}
