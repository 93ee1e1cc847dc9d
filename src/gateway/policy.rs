use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::task::AbortOnDrop;

/// Organization id of the policy used when an organization has none of its own.
pub const GLOBAL_ORGANIZATION: &str = "*";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid routing policy for {organization_id}/{model}: {reason}")]
    Invalid {
        organization_id: String,
        model: String,
        reason: String,
    },
    #[error("failed to read policy file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse policy file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendWeight {
    pub backend_id: String,
    pub weight: u32,
}

impl BackendWeight {
    pub fn new(backend_id: impl Into<String>, weight: u32) -> Self {
        Self {
            backend_id: backend_id.into(),
            weight,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    #[serde(default)]
    pub policy_id: String,
    pub organization_id: String,
    pub model: String,
    pub backends: Vec<BackendWeight>,
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_backends: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_backend: Option<String>,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_failover_threshold() -> u32 {
    3
}

impl RoutingPolicy {
    pub fn new(
        organization_id: impl Into<String>,
        model: impl Into<String>,
        backends: Vec<BackendWeight>,
    ) -> Self {
        Self {
            policy_id: String::new(),
            organization_id: organization_id.into(),
            model: model.into(),
            backends,
            failover_threshold: default_failover_threshold(),
            degraded_backends: Vec::new(),
            pinned_backend: None,
            version: 0,
            updated_at: None,
        }
    }

    pub fn with_failover_threshold(mut self, threshold: u32) -> Self {
        self.failover_threshold = threshold;
        self
    }

    pub fn key(&self) -> PolicyKey {
        PolicyKey::new(&self.organization_id, &self.model)
    }

    pub fn is_global(&self) -> bool {
        self.organization_id == GLOBAL_ORGANIZATION
    }

    /// Backends ordered by descending weight; ties keep declaration order.
    pub fn backends_by_weight(&self) -> Vec<&BackendWeight> {
        let mut out: Vec<&BackendWeight> = self.backends.iter().collect();
        out.sort_by(|a, b| b.weight.cmp(&a.weight));
        out
    }

    pub fn primary(&self) -> Option<&BackendWeight> {
        self.backends_by_weight().into_iter().next()
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        let invalid = |reason: &str| PolicyError::Invalid {
            organization_id: self.organization_id.clone(),
            model: self.model.clone(),
            reason: reason.to_string(),
        };

        if self.organization_id.trim().is_empty() {
            return Err(invalid("organization_id must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(invalid("model must not be empty"));
        }
        if self.backends.is_empty() {
            return Err(invalid("at least one backend is required"));
        }
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.backend_id.trim().is_empty() {
                return Err(invalid("backend_id must not be empty"));
            }
            if !seen.insert(backend.backend_id.as_str()) {
                return Err(invalid(&format!(
                    "backend {} listed more than once",
                    backend.backend_id
                )));
            }
        }
        if self.backends.iter().all(|backend| backend.weight == 0) {
            return Err(invalid("at least one backend needs a positive weight"));
        }
        if self.failover_threshold == 0 {
            return Err(invalid("failover_threshold must be at least 1"));
        }
        if let Some(pinned) = &self.pinned_backend {
            if !seen.contains(pinned.as_str()) {
                return Err(invalid(&format!(
                    "pinned backend {pinned} is not part of the policy"
                )));
            }
        }
        Ok(())
    }

    /// Same routing rules, ignoring bookkeeping fields.
    fn same_rules(&self, other: &Self) -> bool {
        self.backends == other.backends
            && self.failover_threshold == other.failover_threshold
            && self.degraded_backends == other.degraded_backends
            && self.pinned_backend == other.pinned_backend
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyKey {
    pub organization_id: String,
    pub model: String,
}

impl PolicyKey {
    pub fn new(organization_id: &str, model: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct PolicyTable {
    policies: HashMap<PolicyKey, Arc<RoutingPolicy>>,
    /// Keys written through `upsert`. Bulk reloads leave them untouched.
    overlay: HashSet<PolicyKey>,
}

/// Current routing policies. Every update builds a complete new table and
/// swaps it in, so a reader sees either the old or the new version.
///
/// Policies stored with [`Self::upsert`] (the admin API) form an overlay
/// that survives [`Self::replace_all`] (config and policy file reloads).
#[derive(Debug, Default)]
pub struct PolicyCache {
    table: ArcSwap<PolicyTable>,
}

impl PolicyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_policies(policies: Vec<RoutingPolicy>) -> Result<Self, PolicyError> {
        let cache = Self::new();
        cache.replace_all(policies)?;
        Ok(cache)
    }

    /// Exact (org, model) match, else the global policy for the model.
    pub fn get(&self, organization_id: &str, model: &str) -> Option<Arc<RoutingPolicy>> {
        let table = self.table.load();
        table
            .policies
            .get(&PolicyKey::new(organization_id, model))
            .or_else(|| table.policies.get(&PolicyKey::new(GLOBAL_ORGANIZATION, model)))
            .cloned()
    }

    /// Exact lookup without the global fallback.
    pub fn get_exact(&self, organization_id: &str, model: &str) -> Option<Arc<RoutingPolicy>> {
        self.table
            .load()
            .policies
            .get(&PolicyKey::new(organization_id, model))
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<RoutingPolicy>> {
        let table = self.table.load();
        let mut keys: Vec<&PolicyKey> = table.policies.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| table.policies.get(key).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.load().policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().policies.is_empty()
    }

    pub fn upsert(&self, policy: RoutingPolicy) -> Result<Arc<RoutingPolicy>, PolicyError> {
        policy.validate()?;
        let key = policy.key();
        let now = Utc::now();

        let mut stored = None;
        self.table.rcu(|current| {
            let previous = current.policies.get(&key);
            let next_policy = Arc::new(stamp(policy.clone(), previous.map(Arc::as_ref), now));
            stored = Some(Arc::clone(&next_policy));
            let mut next = PolicyTable::clone(current);
            next.policies.insert(key.clone(), next_policy);
            next.overlay.insert(key.clone());
            next
        });

        let stored = stored.ok_or_else(|| PolicyError::Invalid {
            organization_id: key.organization_id.clone(),
            model: key.model.clone(),
            reason: "policy was not stored".to_string(),
        })?;
        tracing::info!(
            organization_id = %stored.organization_id,
            model = %stored.model,
            version = stored.version,
            "routing policy updated"
        );
        Ok(stored)
    }

    /// Swaps in a whole new policy set. Policies whose rules did not change
    /// keep their version; changed ones get the next version. Keys in the
    /// admin overlay keep their upserted policy whatever the new set says.
    pub fn replace_all(&self, policies: Vec<RoutingPolicy>) -> Result<usize, PolicyError> {
        let mut keys = HashSet::new();
        for policy in &policies {
            policy.validate()?;
            if !keys.insert(policy.key()) {
                return Err(PolicyError::Invalid {
                    organization_id: policy.organization_id.clone(),
                    model: policy.model.clone(),
                    reason: "duplicate policy".to_string(),
                });
            }
        }

        let now = Utc::now();
        let mut changed = 0;
        self.table.rcu(|current| {
            changed = 0;
            let mut next = PolicyTable {
                policies: HashMap::with_capacity(policies.len() + current.overlay.len()),
                overlay: current.overlay.clone(),
            };
            for key in &current.overlay {
                if let Some(policy) = current.policies.get(key) {
                    next.policies.insert(key.clone(), Arc::clone(policy));
                }
            }
            for policy in &policies {
                let key = policy.key();
                if next.overlay.contains(&key) {
                    continue;
                }
                let previous = current.policies.get(&key);
                let entry = match previous {
                    Some(previous) if previous.same_rules(policy) => Arc::clone(previous),
                    _ => {
                        changed += 1;
                        Arc::new(stamp(policy.clone(), previous.map(Arc::as_ref), now))
                    }
                };
                next.policies.insert(key, entry);
            }
            next
        });

        if changed > 0 {
            tracing::info!(
                policies = policies.len(),
                changed,
                "routing policies reloaded"
            );
        }
        Ok(changed)
    }

    /// Polls a policy file and applies its contents whenever they change.
    /// Replicas watching the same file converge within one interval.
    pub fn watch_file(self: &Arc<Self>, path: impl Into<PathBuf>, interval: Duration) -> AbortOnDrop {
        let cache = Arc::clone(self);
        let path = path.into();
        let task = tokio::spawn(async move {
            let mut last_contents: Option<String> = None;
            loop {
                match tokio::fs::read_to_string(&path).await {
                    Ok(contents) if last_contents.as_deref() != Some(contents.as_str()) => {
                        match parse_policy_file(&path, &contents)
                            .and_then(|policies| cache.replace_all(policies))
                        {
                            Ok(_) => last_contents = Some(contents),
                            Err(err) => {
                                tracing::warn!(path = %path.display(), error = %err, "ignoring invalid policy file");
                                last_contents = Some(contents);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "failed to read policy file");
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });
        AbortOnDrop::new(task.abort_handle())
    }
}

fn stamp(mut policy: RoutingPolicy, previous: Option<&RoutingPolicy>, now: DateTime<Utc>) -> RoutingPolicy {
    policy.version = previous.map(|p| p.version).unwrap_or(0) + 1;
    policy.updated_at = Some(now);
    if policy.policy_id.trim().is_empty() {
        policy.policy_id = previous
            .map(|p| p.policy_id.clone())
            .unwrap_or_else(|| format!("{}:{}", policy.organization_id, policy.model));
    }
    policy
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: Vec<RoutingPolicy>,
}

/// Parses a policy file: TOML when the extension is `.toml`, JSON
/// otherwise. JSON accepts either a bare array or `{"policies": [...]}`.
pub fn parse_policy_file(path: &Path, contents: &str) -> Result<Vec<RoutingPolicy>, PolicyError> {
    let parse_err = |message: String| PolicyError::Parse {
        path: path.to_path_buf(),
        message,
    };

    if path.extension().and_then(|ext| ext.to_str()) == Some("toml") {
        let file: PolicyFile = toml::from_str(contents).map_err(|err| parse_err(err.to_string()))?;
        return Ok(file.policies);
    }

    let value: serde_json::Value =
        serde_json::from_str(contents).map_err(|err| parse_err(err.to_string()))?;
    if value.is_array() {
        return serde_json::from_value(value).map_err(|err| parse_err(err.to_string()));
    }
    let file: PolicyFile = serde_json::from_value(value).map_err(|err| parse_err(err.to_string()))?;
    Ok(file.policies)
}

pub async fn load_policy_file(path: &Path) -> Result<Vec<RoutingPolicy>, PolicyError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| PolicyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    parse_policy_file(path, &contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(org: &str, model: &str) -> RoutingPolicy {
        RoutingPolicy::new(
            org,
            model,
            vec![BackendWeight::new("a", 70), BackendWeight::new("b", 30)],
        )
    }

    #[test]
    fn get_falls_back_to_global_policy() {
        let cache = PolicyCache::new();
        cache.upsert(policy("*", "gpt-4o")).expect("upsert");
        cache.upsert(policy("org-1", "gpt-4o")).expect("upsert");

        assert_eq!(cache.get("org-1", "gpt-4o").expect("org").organization_id, "org-1");
        assert_eq!(cache.get("org-2", "gpt-4o").expect("global").organization_id, "*");
        assert!(cache.get("org-2", "other").is_none());
        assert!(cache.get_exact("org-2", "gpt-4o").is_none());
    }

    #[test]
    fn upsert_bumps_version_and_keeps_old_snapshot_intact() {
        let cache = PolicyCache::new();
        let first = cache.upsert(policy("org-1", "m")).expect("upsert");
        assert_eq!(first.version, 1);
        assert_eq!(first.policy_id, "org-1:m");

        let mut changed = policy("org-1", "m");
        changed.failover_threshold = 5;
        let second = cache.upsert(changed).expect("upsert");
        assert_eq!(second.version, 2);
        assert_eq!(second.policy_id, "org-1:m");
        assert_eq!(first.failover_threshold, 3);
        assert_eq!(cache.get("org-1", "m").expect("policy").failover_threshold, 5);
    }

    #[test]
    fn validation_rejects_broken_policies() {
        let cache = PolicyCache::new();
        assert!(cache.upsert(RoutingPolicy::new("org", "m", Vec::new())).is_err());

        let zero = RoutingPolicy::new("org", "m", vec![BackendWeight::new("a", 0)]);
        assert!(cache.upsert(zero).is_err());

        let dup = RoutingPolicy::new(
            "org",
            "m",
            vec![BackendWeight::new("a", 1), BackendWeight::new("a", 2)],
        );
        assert!(cache.upsert(dup).is_err());

        let mut pinned = policy("org", "m");
        pinned.pinned_backend = Some("zzz".to_string());
        assert!(cache.upsert(pinned).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn replace_all_keeps_versions_of_unchanged_policies() {
        let cache = PolicyCache::new();
        cache
            .replace_all(vec![policy("org-1", "m"), policy("org-2", "m")])
            .expect("replace");

        let mut changed = policy("org-2", "m");
        changed.degraded_backends = vec!["b".to_string()];
        let count = cache
            .replace_all(vec![policy("org-1", "m"), changed])
            .expect("replace");
        assert_eq!(count, 1);
        assert_eq!(cache.get("org-1", "m").expect("p").version, 1);
        assert_eq!(cache.get("org-2", "m").expect("p").version, 2);

        cache.replace_all(vec![policy("org-1", "m")]).expect("replace");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reload_keeps_admin_upserts() {
        let cache = PolicyCache::from_policies(vec![policy("org-1", "m"), policy("org-2", "m")])
            .expect("cache");

        let mut pinned = policy("org-1", "m");
        pinned.pinned_backend = Some("b".to_string());
        let upserted = cache.upsert(pinned).expect("upsert");
        cache.upsert(policy("org-3", "m")).expect("upsert");

        cache.replace_all(vec![policy("org-1", "m")]).expect("reload");

        let org1 = cache.get_exact("org-1", "m").expect("org-1");
        assert!(Arc::ptr_eq(&org1, &upserted));
        assert_eq!(org1.pinned_backend.as_deref(), Some("b"));
        assert!(cache.get_exact("org-3", "m").is_some());
        assert!(cache.get_exact("org-2", "m").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn parses_json_and_toml_policy_files() {
        let json = r#"{"policies":[{"organization_id":"*","model":"m","backends":[{"backend_id":"a","weight":1}]}]}"#;
        let parsed = parse_policy_file(Path::new("p.json"), json).expect("json");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].failover_threshold, 3);

        let bare = r#"[{"organization_id":"*","model":"m","backends":[{"backend_id":"a","weight":1}]}]"#;
        assert_eq!(parse_policy_file(Path::new("p.json"), bare).expect("bare").len(), 1);

        let toml = r#"
[[policies]]
organization_id = "org-1"
model = "m"
failover_threshold = 2
backends = [{ backend_id = "a", weight = 60 }, { backend_id = "b", weight = 40 }]
"#;
        let parsed = parse_policy_file(Path::new("p.toml"), toml).expect("toml");
        assert_eq!(parsed[0].backends.len(), 2);
        assert_eq!(parsed[0].failover_threshold, 2);
    }

    #[tokio::test]
    async fn watch_file_applies_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("policies.json");
        std::fs::write(
            &path,
            r#"[{"organization_id":"org-1","model":"m","backends":[{"backend_id":"a","weight":1}]}]"#,
        )
        .expect("write");

        let cache = Arc::new(PolicyCache::new());
        let _watch = cache.watch_file(&path, Duration::from_millis(10));
        for _ in 0..100 {
            if cache.get("org-1", "m").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.get("org-1", "m").expect("policy").backends[0].backend_id, "a");

        std::fs::write(
            &path,
            r#"[{"organization_id":"org-1","model":"m","backends":[{"backend_id":"b","weight":1}]}]"#,
        )
        .expect("rewrite");
        for _ in 0..100 {
            if cache.get("org-1", "m").map(|p| p.version) == Some(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let policy = cache.get("org-1", "m").expect("policy");
        assert_eq!(policy.version, 2);
        assert_eq!(policy.backends[0].backend_id, "b");
    }
}
