use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::budget::BudgetConfig;
use super::health::{BackendConfig, HealthConfig};
use super::limits::BucketLimit;
use super::policy::RoutingPolicy;
use super::redis_store::DEFAULT_USAGE_STREAM;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub policies: Vec<RoutingPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_file: Option<PathBuf>,
    #[serde(default = "default_policy_poll_secs")]
    pub policy_poll_secs: u64,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_path: Option<PathBuf>,
    /// Forward attempts per request, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_policy_poll_secs() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_token: None,
            redis: RedisConfig::default(),
            limits: LimitsConfig::default(),
            budget: BudgetConfig::default(),
            health: HealthConfig::default(),
            backends: Vec::new(),
            policies: Vec::new(),
            policy_file: None,
            policy_poll_secs: default_policy_poll_secs(),
            usage: UsageConfig::default(),
            pricing_path: None,
            max_attempts: default_max_attempts(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_timeout_ms() -> u64 {
    250
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            prefix: String::new(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_rps")]
    pub org_rps: f64,
    #[serde(default = "default_burst")]
    pub org_burst: u32,
    #[serde(default = "default_rps")]
    pub key_rps: f64,
    #[serde(default = "default_burst")]
    pub key_burst: u32,
    /// Admit requests when the bucket store is unreachable.
    #[serde(default)]
    pub fail_open: bool,
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub organizations: BTreeMap<String, LimitOverride>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, LimitOverride>,
}

fn default_rps() -> f64 {
    100.0
}

fn default_burst() -> u32 {
    200
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            org_rps: default_rps(),
            org_burst: default_burst(),
            key_rps: default_rps(),
            key_burst: default_burst(),
            fail_open: false,
            backend: StoreBackend::default(),
            organizations: BTreeMap::new(),
            credentials: BTreeMap::new(),
        }
    }
}

impl LimitsConfig {
    pub fn organization_limit(&self, organization_id: &str) -> BucketLimit {
        resolve(
            self.organizations.get(organization_id),
            self.org_rps,
            self.org_burst,
        )
    }

    pub fn credential_limit(&self, credential_id: &str) -> BucketLimit {
        resolve(self.credentials.get(credential_id), self.key_rps, self.key_burst)
    }

    /// Every default and every per-organization or per-credential override
    /// must resolve to `rps > 0` and `burst >= 1`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_limit(
            "limits.org_rps/org_burst",
            BucketLimit::new(self.org_rps, self.org_burst),
        )?;
        check_limit(
            "limits.key_rps/key_burst",
            BucketLimit::new(self.key_rps, self.key_burst),
        )?;
        for id in self.organizations.keys() {
            check_limit(
                &format!("limits.organizations.{id}"),
                self.organization_limit(id),
            )?;
        }
        for id in self.credentials.keys() {
            check_limit(
                &format!("limits.credentials.{id}"),
                self.credential_limit(id),
            )?;
        }
        Ok(())
    }
}

fn check_limit(field: &str, limit: BucketLimit) -> Result<(), ConfigError> {
    if !(limit.rate_per_second.is_finite() && limit.rate_per_second > 0.0) || limit.burst == 0 {
        return Err(ConfigError::Invalid(format!(
            "{field}: rps must be positive and burst at least 1"
        )));
    }
    Ok(())
}

fn resolve(override_: Option<&LimitOverride>, rps: f64, burst: u32) -> BucketLimit {
    let rps = override_.and_then(|o| o.rps).unwrap_or(rps);
    let burst = override_.and_then(|o| o.burst).unwrap_or(burst);
    BucketLimit::new(rps, burst)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageConfig {
    #[serde(default = "default_buffer_dir")]
    pub buffer_dir: PathBuf,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_records: Option<usize>,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default)]
    pub sink: StoreBackend,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_max_len: Option<usize>,
    /// Emit zero-cost records for rate-limited and budget-denied requests.
    #[serde(default = "default_true")]
    pub record_denials: bool,
}

fn default_buffer_dir() -> PathBuf {
    PathBuf::from("/tmp/api-router-usage-buffer")
}

fn default_max_age_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_retry_interval_secs() -> u64 {
    5
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

fn default_stream() -> String {
    DEFAULT_USAGE_STREAM.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            buffer_dir: default_buffer_dir(),
            max_age_secs: default_max_age_secs(),
            max_records: None,
            retry_interval_secs: default_retry_interval_secs(),
            publish_timeout_ms: default_publish_timeout_ms(),
            sink: StoreBackend::default(),
            stream: default_stream(),
            stream_max_len: None,
            record_denials: default_true(),
        }
    }
}

impl UsageConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(1))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms.max(1))
    }
}

impl GatewayConfig {
    /// Reads a config file, picking the format from the extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("json")
            .to_ascii_lowercase();
        Self::parse(&raw, &extension).map_err(|err| match err {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    pub fn parse(raw: &str, format: &str) -> Result<Self, ConfigError> {
        let parse_err = |message: String| ConfigError::Parse {
            path: PathBuf::new(),
            message,
        };
        match format {
            "json" => serde_json::from_str(raw).map_err(|err| parse_err(err.to_string())),
            "toml" => toml::from_str(raw).map_err(|err| parse_err(err.to_string())),
            #[cfg(feature = "config-yaml")]
            "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|err| parse_err(err.to_string())),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies `REDIS_URL`, `BUDGET_SERVICE_ENDPOINT`, `USAGE_BUFFER_DIR`
    /// and `BACKEND_ENDPOINTS` (`id:uri,id:uri`) from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(url) = lookup("REDIS_URL") {
            self.redis.url = url.trim().to_string();
        }
        if let Some(endpoint) = lookup("BUDGET_SERVICE_ENDPOINT") {
            self.budget.endpoint = Some(endpoint.trim().to_string());
        }
        if let Some(dir) = lookup("USAGE_BUFFER_DIR") {
            self.usage.buffer_dir = PathBuf::from(dir.trim());
        }
        if let Some(raw) = lookup("BACKEND_ENDPOINTS") {
            self.backends = parse_backend_endpoints(&raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".to_string()));
        }
        self.limits.validate()?;

        let mut ids = HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() || backend.uri.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "backend id and uri must not be empty".to_string(),
                ));
            }
            if !ids.insert(backend.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend id {}",
                    backend.id
                )));
            }
        }

        for policy in &self.policies {
            policy
                .validate()
                .map_err(|err| ConfigError::Invalid(err.to_string()))?;
            for backend in &policy.backends {
                if !ids.contains(backend.backend_id.as_str()) {
                    tracing::warn!(
                        organization_id = %policy.organization_id,
                        model = %policy.model,
                        backend_id = %backend.backend_id,
                        "policy references an unknown backend"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis.timeout_ms.max(1))
    }

    pub fn policy_poll_interval(&self) -> Duration {
        Duration::from_secs(self.policy_poll_secs.max(1))
    }
}

pub fn parse_backend_endpoints(raw: &str) -> Result<Vec<BackendConfig>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, uri) = entry.split_once(':').ok_or_else(|| {
                ConfigError::Invalid(format!("backend endpoint must be id:uri, got {entry}"))
            })?;
            let (id, uri) = (id.trim(), uri.trim());
            if id.is_empty() || uri.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "backend endpoint must be id:uri, got {entry}"
                )));
            }
            Ok(BackendConfig::new(id, uri))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = GatewayConfig::parse("{}", "json").expect("parse");
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.limits.org_rps, 100.0);
        assert_eq!(config.limits.org_burst, 200);
        assert!(!config.limits.fail_open);
        assert_eq!(config.budget.timeout_ms, 2_000);
        assert_eq!(config.health.unhealthy_after, 3);
        assert_eq!(config.usage.max_age_secs, 604_800);
        assert_eq!(config.usage.stream, "usage.records.v1");
        assert!(config.usage.record_denials);
        assert_eq!(config.max_attempts, 3);
        config.validate().expect("valid");
    }

    #[test]
    fn toml_config_with_overrides() {
        let raw = r#"
listen = "127.0.0.1:9000"

[limits]
org_rps = 10
org_burst = 20
backend = "memory"

[limits.organizations.big]
rps = 1000.0

[[backends]]
id = "primary"
uri = "http://primary:8000/v1/completions"

[[policies]]
organization_id = "*"
model = "gpt-4o"
backends = [{ backend_id = "primary", weight = 100 }]
"#;
        let config = GatewayConfig::parse(raw, "toml").expect("parse");
        assert_eq!(config.limits.backend, StoreBackend::Memory);
        assert_eq!(config.backends[0].timeout_secs, 30);

        let big = config.limits.organization_limit("big");
        assert_eq!(big.rate_per_second, 1000.0);
        assert_eq!(big.burst, 20);
        assert_eq!(config.limits.organization_limit("other").rate_per_second, 10.0);
        config.validate().expect("valid");
    }

    #[test]
    fn env_overrides_replace_sections() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("REDIS_URL", "redis://cache:6379"),
            ("BUDGET_SERVICE_ENDPOINT", "http://budget:8082"),
            ("USAGE_BUFFER_DIR", "/var/spool/usage"),
            (
                "BACKEND_ENDPOINTS",
                "b1:http://localhost:8001/v1/completions, b2:http://localhost:8002/v1/completions",
            ),
        ]);
        let mut config = GatewayConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .expect("overrides");

        assert_eq!(config.redis.url, "redis://cache:6379");
        assert_eq!(config.budget.endpoint.as_deref(), Some("http://budget:8082"));
        assert_eq!(config.usage.buffer_dir, PathBuf::from("/var/spool/usage"));
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[1].id, "b2");
        assert_eq!(config.backends[1].uri, "http://localhost:8002/v1/completions");
    }

    #[test]
    fn rejects_bad_backend_lists_and_unknown_formats() {
        assert!(parse_backend_endpoints("no-separator").is_err());
        assert!(parse_backend_endpoints(":http://x").is_err());

        let mut config = GatewayConfig::default();
        config.backends = vec![BackendConfig::new("a", "http://a"), BackendConfig::new("a", "http://b")];
        assert!(config.validate().is_err());

        assert!(matches!(
            GatewayConfig::parse("", "ini"),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn limit_overrides_are_validated() {
        let config = GatewayConfig::parse(
            r#"{"limits":{"backend":"memory","organizations":{"acme":{"rps":0.0}}}}"#,
            "json",
        )
        .expect("parse");
        match config.validate() {
            Err(ConfigError::Invalid(message)) => {
                assert!(message.contains("limits.organizations.acme"), "{message}")
            }
            other => panic!("unexpected: {other:?}"),
        }

        let config = GatewayConfig::parse(
            r#"{"limits":{"credentials":{"key-1":{"burst":0}}}}"#,
            "json",
        )
        .expect("parse");
        assert!(config.validate().is_err());

        let config = GatewayConfig::parse(
            r#"{"limits":{"organizations":{"acme":{"rps":5.0,"burst":10}}}}"#,
            "json",
        )
        .expect("parse");
        config.validate().expect("valid");
    }

    #[test]
    fn load_reads_file_by_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, r#"{"max_attempts": 2}"#).expect("write");
        assert_eq!(GatewayConfig::load(&path).expect("load").max_attempts, 2);

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "listen = ").expect("write");
        match GatewayConfig::load(&broken) {
            Err(ConfigError::Parse { path, .. }) => assert_eq!(path, broken),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
