use std::sync::Arc;

use super::config::{GatewayConfig, StoreBackend};
use super::costing::PricingTable;
use super::health::{BackendEndpoint, HealthMonitor};
use super::http_backend::{BackendTransport, HttpBackendClient};
use super::limits::RateLimiter;
use super::policy::{PolicyCache, load_policy_file};
use super::redis_store::{RedisStore, RedisStreamSink};
use super::router::RoutingEngine;
use super::usage::{BufferStore, MemoryUsageSink, UsagePublisher, UsageRecordBuilder, UsageSink};
use super::{AuditLogger, BudgetClient, Gateway};
use crate::utils::task::AbortOnDrop;

/// A gateway wired from configuration plus its background tasks. Dropping
/// the runtime stops the tasks.
pub struct GatewayRuntime {
    gateway: Arc<Gateway>,
    config: GatewayConfig,
    tasks: Vec<AbortOnDrop>,
}

impl GatewayRuntime {
    pub async fn from_config(config: GatewayConfig) -> crate::Result<Self> {
        Self::with_transport(config, Arc::new(HttpBackendClient::new())).await
    }

    pub async fn with_transport(
        config: GatewayConfig,
        transport: Arc<dyn BackendTransport>,
    ) -> crate::Result<Self> {
        config.validate()?;

        let needs_redis = config.limits.backend == StoreBackend::Redis
            || config.usage.sink == StoreBackend::Redis;
        let redis = if needs_redis {
            Some(RedisStore::new(&config.redis.url)?.with_prefix(config.redis.prefix.clone()))
        } else {
            None
        };

        let limiter = match (&config.limits.backend, &redis) {
            (StoreBackend::Redis, Some(store)) => {
                RateLimiter::new(Arc::new(store.clone())).with_timeout(config.redis_timeout())
            }
            _ => RateLimiter::in_memory(),
        };

        let health = Arc::new(HealthMonitor::new(config.health.clone(), Arc::clone(&transport)));
        for backend in &config.backends {
            health.register(BackendEndpoint::from_config(backend));
        }

        let policies = Arc::new(PolicyCache::from_policies(config.policies.clone())?);
        if let Some(path) = &config.policy_file {
            policies.replace_all(load_policy_file(path).await?)?;
        }

        let pricing = match &config.pricing_path {
            Some(path) => PricingTable::load(path)?,
            None => PricingTable::default(),
        };

        let mut buffer = BufferStore::open(&config.usage.buffer_dir, config.usage.max_age()).await?;
        if let Some(max_records) = config.usage.max_records {
            buffer = buffer.with_max_records(max_records);
        }

        let sink: Arc<dyn UsageSink> = match (&config.usage.sink, &redis) {
            (StoreBackend::Redis, Some(store)) => {
                let mut sink = RedisStreamSink::new(store.clone()).with_stream(config.usage.stream.clone());
                if let Some(max_len) = config.usage.stream_max_len {
                    sink = sink.with_max_len(max_len);
                }
                Arc::new(sink)
            }
            _ => Arc::new(MemoryUsageSink::new()),
        };
        let publisher = Arc::new(
            UsagePublisher::new(sink, Arc::new(buffer)).with_timeout(config.usage.publish_timeout()),
        );

        let router = Arc::new(RoutingEngine::new(policies, health));
        let mut gateway = Gateway::new(
            limiter,
            BudgetClient::new(&config.budget),
            router,
            transport,
            publisher,
        )
        .with_limits(config.limits.clone())
        .with_usage_builder(UsageRecordBuilder::new(Arc::new(pricing)))
        .with_audit(AuditLogger::new())
        .with_max_attempts(config.max_attempts)
        .with_request_timeout(config.request_timeout())
        .with_record_denials(config.usage.record_denials);
        if let Some(store) = redis {
            gateway = gateway.with_redis(store, config.redis_timeout());
        }

        tracing::info!(
            backends = config.backends.len(),
            policies = gateway.policies().len(),
            limiter = ?config.limits.backend,
            usage_sink = ?config.usage.sink,
            budget_remote = config.budget.endpoint.is_some(),
            "gateway initialized"
        );

        Ok(Self {
            gateway: Arc::new(gateway),
            config,
            tasks: Vec::new(),
        })
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Starts health probing, the usage retry loop and, when configured,
    /// the policy file watcher.
    pub fn start_background_tasks(&mut self) {
        self.tasks.push(self.gateway.health().start());
        self.tasks.push(
            self.gateway
                .publisher()
                .spawn_retry_loop(self.config.usage.retry_interval()),
        );
        if let Some(path) = &self.config.policy_file {
            self.tasks.push(
                self.gateway
                    .policies()
                    .watch_file(path.clone(), self.config.policy_poll_interval()),
            );
        }
    }

    pub fn background_tasks(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::health::BackendConfig;
    use crate::gateway::policy::{BackendWeight, RoutingPolicy};

    fn memory_config(dir: &std::path::Path) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.limits.backend = StoreBackend::Memory;
        config.usage.sink = StoreBackend::Memory;
        config.usage.buffer_dir = dir.join("buffer");
        config.backends = vec![BackendConfig::new("b1", "http://127.0.0.1:9")];
        config.policies = vec![RoutingPolicy::new(
            "*",
            "m",
            vec![BackendWeight::new("b1", 100)],
        )];
        config
    }

    #[tokio::test]
    async fn builds_in_memory_runtime_and_starts_tasks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut runtime = GatewayRuntime::from_config(memory_config(dir.path()))
            .await
            .expect("runtime");

        assert!(dir.path().join("buffer").is_dir());
        assert!(runtime.gateway().health().endpoint("b1").is_some());
        assert_eq!(runtime.gateway().policies().len(), 1);

        runtime.start_background_tasks();
        assert_eq!(runtime.background_tasks(), 2);
    }

    #[tokio::test]
    async fn policy_file_replaces_inline_policies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("policies.json");
        std::fs::write(
            &path,
            r#"[{"organization_id":"org-1","model":"m","backends":[{"backend_id":"b1","weight":1}]}]"#,
        )
        .expect("write");

        let mut config = memory_config(dir.path());
        config.policy_file = Some(path);
        let runtime = GatewayRuntime::from_config(config).await.expect("runtime");
        let policies = runtime.gateway().policies();
        assert_eq!(policies.len(), 1);
        assert!(policies.get_exact("org-1", "m").is_some());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = memory_config(dir.path());
        config.max_attempts = 0;
        assert!(GatewayRuntime::from_config(config).await.is_err());
    }
}
