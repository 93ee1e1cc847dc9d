use async_trait::async_trait;

use super::{RedisStore, RedisStoreError};
use crate::gateway::usage::{PublishError, UsageRecord, UsageSink};

pub const DEFAULT_USAGE_STREAM: &str = "usage.records.v1";

/// Publishes usage records to a Redis stream with `XADD`. Each entry carries
/// the identifying fields alongside the full JSON payload so consumers can
/// deduplicate by `record_id` without decoding.
#[derive(Clone, Debug)]
pub struct RedisStreamSink {
    store: RedisStore,
    stream: String,
    max_len: Option<usize>,
}

impl RedisStreamSink {
    pub fn new(store: RedisStore) -> Self {
        Self {
            store,
            stream: DEFAULT_USAGE_STREAM.to_string(),
            max_len: None,
        }
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    /// Approximate trim (`MAXLEN ~`) applied on every append.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn stream_key(&self) -> String {
        self.store.namespaced(&self.stream)
    }

    pub async fn append(&self, record: &UsageRecord) -> Result<String, RedisStoreError> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.store.connection().await?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.stream_key());
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*")
            .arg("record_id")
            .arg(record.record_id.to_string())
            .arg("request_id")
            .arg(&record.request_id)
            .arg("organization_id")
            .arg(&record.organization_id)
            .arg("model")
            .arg(&record.model)
            .arg("backend_id")
            .arg(&record.backend_id)
            .arg("payload")
            .arg(payload);

        let entry_id: String = cmd.query_async(&mut conn).await?;
        Ok(entry_id)
    }
}

#[async_trait]
impl UsageSink for RedisStreamSink {
    async fn publish(&self, record: &UsageRecord) -> Result<(), PublishError> {
        self.append(record)
            .await
            .map(|_| ())
            .map_err(|err| PublishError::Sink(err.to_string()))
    }
}
