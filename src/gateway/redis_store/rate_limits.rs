use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;

use super::{RedisStore, RedisStoreError};
use crate::gateway::limits::{BUCKET_TTL_SECS, BucketLimit, BucketStore, CheckResult, LimiterError};

// Returns {allowed, remaining_tokens, retry_after_ms}. The last element is
// a string because Redis truncates Lua floats to integers.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local interval = 1000 / rate
local state = redis.call("HMGET", KEYS[1], "tokens", "last_refill")
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
  tokens = burst
  last_refill = now
end
if tokens > burst then
  tokens = burst
end

local elapsed = now - last_refill
if elapsed < 0 then
  elapsed = 0
end
local to_add = math.floor(elapsed / interval)
if to_add >= 1 then
  tokens = math.min(burst, tokens + to_add)
  if tokens >= burst then
    last_refill = now
  else
    last_refill = last_refill + to_add * interval
  end
end

local allowed = 0
local retry_after = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
else
  local since = now - last_refill
  if since < 0 then
    since = 0
  end
  retry_after = interval - math.fmod(since, interval)
end

redis.call("HSET", KEYS[1], "tokens", tokens, "last_refill", string.format("%.3f", last_refill))
redis.call("EXPIRE", KEYS[1], ttl)
return {allowed, tokens, string.format("%.3f", retry_after)}
"#;

/// Hashed once; `invoke_async` falls back to `SCRIPT LOAD` on `NOSCRIPT`.
static TOKEN_BUCKET: LazyLock<redis::Script> =
    LazyLock::new(|| redis::Script::new(TOKEN_BUCKET_SCRIPT));

impl RedisStore {
    pub async fn take_token(
        &self,
        key: &str,
        limit: BucketLimit,
        now_ms: u64,
    ) -> Result<CheckResult, RedisStoreError> {
        let mut conn = self.connection().await?;
        let (allowed, remaining, retry_after_ms): (i64, i64, String) = TOKEN_BUCKET
            .key(self.namespaced(key))
            .arg(limit.rate_per_second)
            .arg(limit.burst)
            .arg(now_ms)
            .arg(BUCKET_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;

        let retry_after_ms: f64 = retry_after_ms
            .parse()
            .map_err(|_| RedisStoreError::UnexpectedResponse(retry_after_ms.clone()))?;

        Ok(CheckResult {
            allowed: allowed == 1,
            remaining: u32::try_from(remaining.max(0)).unwrap_or(u32::MAX),
            limit: limit.burst,
            retry_after: Duration::from_micros((retry_after_ms.max(0.0) * 1000.0).round() as u64),
        })
    }

    pub async fn delete_bucket(&self, key: &str) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn take(
        &self,
        key: &str,
        limit: BucketLimit,
        now_ms: u64,
    ) -> Result<CheckResult, LimiterError> {
        self.take_token(key, limit, now_ms)
            .await
            .map_err(|err| LimiterError::Store(err.to_string()))
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        self.delete_bucket(key)
            .await
            .map_err(|err| LimiterError::Store(err.to_string()))
    }
}
