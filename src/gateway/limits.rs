use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use super::{Clock, SystemClock};

/// Idle buckets expire after an hour without checks.
pub const BUCKET_TTL_SECS: u64 = 60 * 60;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LimitScope {
    Organization(String),
    Credential(String),
}

impl LimitScope {
    pub fn organization(id: impl Into<String>) -> Self {
        Self::Organization(id.into())
    }

    pub fn credential(id: impl Into<String>) -> Self {
        Self::Credential(id.into())
    }

    pub fn key(&self) -> String {
        match self {
            Self::Organization(id) => format!("rate_limit:org:{id}"),
            Self::Credential(id) => format!("rate_limit:key:{id}"),
        }
    }
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketLimit {
    pub rate_per_second: f64,
    pub burst: u32,
}

impl BucketLimit {
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        Self {
            rate_per_second,
            burst,
        }
    }

    fn validate(&self) -> Result<(), LimiterError> {
        if !self.rate_per_second.is_finite() || self.rate_per_second <= 0.0 {
            return Err(LimiterError::InvalidLimit {
                reason: format!("rate_per_second must be > 0, got {}", self.rate_per_second),
            });
        }
        if self.burst == 0 {
            return Err(LimiterError::InvalidLimit {
                reason: "burst must be >= 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn refill_interval_ms(&self) -> f64 {
        1000.0 / self.rate_per_second
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CheckResult {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    #[serde(with = "duration_secs")]
    pub retry_after: Duration,
}

mod duration_secs {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(value.as_secs_f64())
    }
}

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("rate limit store error: {0}")]
    Store(String),
    #[error("rate limit store timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid rate limit: {reason}")]
    InvalidLimit { reason: String },
}

/// Lazily refilled token bucket.
///
/// `last_refill_ms` only advances by whole refill intervals, so partial
/// progress toward the next token survives across checks. A full bucket
/// pins `last_refill_ms` to the current time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TokenBucket {
    pub tokens: u32,
    pub last_refill_ms: f64,
}

impl TokenBucket {
    pub fn full(burst: u32, now_ms: u64) -> Self {
        Self {
            tokens: burst,
            last_refill_ms: now_ms as f64,
        }
    }

    pub fn take(&mut self, limit: BucketLimit, now_ms: u64) -> CheckResult {
        let interval = limit.refill_interval_ms();
        let now = now_ms as f64;
        self.tokens = self.tokens.min(limit.burst);

        let elapsed = (now - self.last_refill_ms).max(0.0);
        let to_add = (elapsed / interval).floor();
        if to_add >= 1.0 {
            let refilled = (f64::from(self.tokens) + to_add).min(f64::from(limit.burst));
            self.tokens = refilled as u32;
            if self.tokens >= limit.burst {
                self.last_refill_ms = now;
            } else {
                self.last_refill_ms += to_add * interval;
            }
        }

        if self.tokens >= 1 {
            self.tokens -= 1;
            return CheckResult {
                allowed: true,
                remaining: self.tokens,
                limit: limit.burst,
                retry_after: Duration::ZERO,
            };
        }

        let since = (now - self.last_refill_ms).max(0.0);
        let retry_ms = interval - (since % interval);
        CheckResult {
            allowed: false,
            remaining: 0,
            limit: limit.burst,
            retry_after: Duration::from_micros((retry_ms.max(0.0) * 1000.0).round() as u64),
        }
    }
}

/// Backing store for token buckets. Implementations must apply
/// refill-and-take atomically per key.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn take(
        &self,
        key: &str,
        limit: BucketLimit,
        now_ms: u64,
    ) -> Result<CheckResult, LimiterError>;

    async fn reset(&self, key: &str) -> Result<(), LimiterError>;
}

/// Single-process bucket store. Buckets idle longer than [`BUCKET_TTL_SECS`]
/// are dropped on the next check.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn peek(&self, key: &str) -> Option<TokenBucket> {
        self.buckets.lock().await.get(key).copied()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn take(
        &self,
        key: &str,
        limit: BucketLimit,
        now_ms: u64,
    ) -> Result<CheckResult, LimiterError> {
        let mut buckets = self.buckets.lock().await;
        let ttl_ms = (BUCKET_TTL_SECS * 1000) as f64;
        buckets.retain(|_, bucket| now_ms as f64 - bucket.last_refill_ms < ttl_ms);

        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(limit.burst, now_ms));
        Ok(bucket.take(limit, now_ms))
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        self.buckets.lock().await.remove(key);
        Ok(())
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            timeout: Duration::from_millis(250),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBucketStore::new()))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn check(
        &self,
        scope: &LimitScope,
        rate_per_second: f64,
        burst: u32,
    ) -> Result<CheckResult, LimiterError> {
        let limit = BucketLimit::new(rate_per_second, burst);
        limit.validate()?;

        let key = scope.key();
        let now_ms = self.clock.now_millis();
        let result = tokio::time::timeout(self.timeout, self.store.take(&key, limit, now_ms))
            .await
            .map_err(|_| LimiterError::Timeout(self.timeout))??;

        if !result.allowed {
            tracing::debug!(
                scope = %scope,
                retry_after_ms = result.retry_after.as_millis() as u64,
                "rate limit bucket empty"
            );
        }
        Ok(result)
    }

    pub async fn check_organization(
        &self,
        org_id: &str,
        rate_per_second: f64,
        burst: u32,
    ) -> Result<CheckResult, LimiterError> {
        self.check(&LimitScope::organization(org_id), rate_per_second, burst)
            .await
    }

    pub async fn check_credential(
        &self,
        credential_id: &str,
        rate_per_second: f64,
        burst: u32,
    ) -> Result<CheckResult, LimiterError> {
        self.check(&LimitScope::credential(credential_id), rate_per_second, burst)
            .await
    }

    pub async fn reset(&self, scope: &LimitScope) -> Result<(), LimiterError> {
        let key = scope.key();
        tokio::time::timeout(self.timeout, self.store.reset(&key))
            .await
            .map_err(|_| LimiterError::Timeout(self.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;

    fn limiter(clock: &Arc<ManualClock>) -> RateLimiter {
        RateLimiter::in_memory().with_clock(clock.clone())
    }

    #[tokio::test]
    async fn burst_drains_then_refills_after_one_interval() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let limiter = limiter(&clock);

        for expected in (0..20).rev() {
            let result = limiter
                .check_organization("org-1", 10.0, 20)
                .await
                .expect("check");
            assert!(result.allowed);
            assert_eq!(result.remaining, expected);
            assert_eq!(result.limit, 20);
        }

        clock.advance_ms(1);
        let denied = limiter
            .check_organization("org-1", 10.0, 20)
            .await
            .expect("check");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after > Duration::ZERO);
        assert!((denied.retry_after.as_secs_f64() - 0.1).abs() < 0.005);

        clock.advance_ms(110);
        let allowed = limiter
            .check_organization("org-1", 10.0, 20)
            .await
            .expect("check");
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, 0);
    }

    #[tokio::test]
    async fn scopes_do_not_share_tokens() {
        let clock = Arc::new(ManualClock::new(5_000));
        let limiter = limiter(&clock);

        for _ in 0..3 {
            limiter.check_organization("a", 1.0, 3).await.expect("check");
        }
        let a = limiter.check_organization("a", 1.0, 3).await.expect("check");
        assert!(!a.allowed);

        let b = limiter.check_organization("b", 1.0, 3).await.expect("check");
        assert!(b.allowed);
        assert_eq!(b.remaining, 2);

        let key = limiter.check_credential("a", 1.0, 3).await.expect("check");
        assert!(key.allowed);
        assert_eq!(key.remaining, 2);
    }

    #[tokio::test]
    async fn tokens_stay_within_zero_and_burst() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryBucketStore::new());
        let limiter = RateLimiter::new(store.clone()).with_clock(clock.clone());

        let steps = [0u64, 3, 250, 7, 1_000, 40, 0, 0, 9_000, 13, 120];
        for (i, step) in steps.iter().cycle().take(200).enumerate() {
            clock.advance_ms(*step);
            let result = limiter.check_credential("k", 5.0, 4).await.expect("check");
            assert!(result.remaining <= 4, "iteration {i}");
            let bucket = store.peek("rate_limit:key:k").await.expect("bucket");
            assert!(bucket.tokens <= 4, "iteration {i}");
        }
    }

    #[tokio::test]
    async fn reset_restores_full_bucket() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(&clock);
        let scope = LimitScope::organization("org-r");

        for _ in 0..5 {
            limiter.check(&scope, 1.0, 5).await.expect("check");
        }
        assert!(!limiter.check(&scope, 1.0, 5).await.expect("check").allowed);

        limiter.reset(&scope).await.expect("reset");
        let result = limiter.check(&scope, 1.0, 5).await.expect("check");
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn partial_refill_progress_is_not_lost() {
        let mut bucket = TokenBucket::full(1, 0);
        let limit = BucketLimit::new(1.0, 1);

        assert!(bucket.take(limit, 0).allowed);
        let denied = bucket.take(limit, 600);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_millis(400));
        assert!(bucket.take(limit, 1_000).allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_exceed_burst() {
        let clock = Arc::new(ManualClock::new(10_000));
        let limiter = limiter(&clock);

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .check_organization("shared", 1.0, 10)
                        .await
                        .expect("check")
                        .allowed
                })
            })
            .collect();

        let mut allowed = 0;
        for task in tasks {
            if task.await.expect("join") {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        struct Stalled;

        #[async_trait]
        impl BucketStore for Stalled {
            async fn take(
                &self,
                _key: &str,
                _limit: BucketLimit,
                _now_ms: u64,
            ) -> Result<CheckResult, LimiterError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Err(LimiterError::Store("unreachable".to_string()))
            }

            async fn reset(&self, _key: &str) -> Result<(), LimiterError> {
                Ok(())
            }
        }

        let limiter = RateLimiter::new(Arc::new(Stalled)).with_timeout(Duration::from_millis(20));
        let err = limiter.check_organization("org", 1.0, 1).await;
        assert!(matches!(err, Err(LimiterError::Timeout(_))));
    }

    #[tokio::test]
    async fn rejects_non_positive_rate() {
        let limiter = RateLimiter::in_memory();
        let err = limiter.check_organization("org", 0.0, 1).await;
        assert!(matches!(err, Err(LimiterError::InvalidLimit { .. })));
    }
}
