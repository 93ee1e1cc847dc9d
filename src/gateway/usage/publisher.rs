use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use super::{BufferError, BufferStore, UsageRecord};
use crate::utils::task::AbortOnDrop;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("usage sink error: {0}")]
    Sink(String),
    #[error("usage publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("usage buffer error: {0}")]
    Buffer(#[from] BufferError),
}

/// Durable stream the usage records are acknowledged by.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn publish(&self, record: &UsageRecord) -> Result<(), PublishError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    Published,
    /// The sink rejected the record; it is safely on disk and will be
    /// retried by the background loop.
    Buffered,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub published: usize,
    pub failed: usize,
    pub dropped: usize,
}

pub struct UsagePublisher {
    sink: Arc<dyn UsageSink>,
    buffer: Arc<BufferStore>,
    timeout: Duration,
}

impl UsagePublisher {
    pub fn new(sink: Arc<dyn UsageSink>, buffer: Arc<BufferStore>) -> Self {
        Self {
            sink,
            buffer,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn buffer(&self) -> &Arc<BufferStore> {
        &self.buffer
    }

    async fn send(&self, record: &UsageRecord) -> Result<(), PublishError> {
        tokio::time::timeout(self.timeout, self.sink.publish(record))
            .await
            .map_err(|_| PublishError::Timeout(self.timeout))?
    }

    /// Publishes synchronously; on any sink failure the record is spooled to
    /// the buffer. Only a failing buffer is reported as an error.
    pub async fn publish(&self, record: &UsageRecord) -> Result<PublishOutcome, PublishError> {
        match self.send(record).await {
            Ok(()) => Ok(PublishOutcome::Published),
            Err(err) => {
                tracing::warn!(
                    record_id = %record.record_id,
                    request_id = %record.request_id,
                    error = %err,
                    "usage publish failed, buffering record"
                );
                self.buffer.store(record).await?;
                Ok(PublishOutcome::Buffered)
            }
        }
    }

    /// One pass of the retry loop: purge expired records, then re-publish
    /// the rest oldest first. A record leaves the buffer only after the sink
    /// acknowledged it. The pass stops at the first failure since the sink
    /// is most likely still down.
    pub async fn retry_buffered(&self) -> Result<RetryReport, PublishError> {
        let mut report = RetryReport {
            dropped: self.buffer.cleanup().await?,
            ..RetryReport::default()
        };

        let records = self.buffer.load().await?;
        let total = records.len();
        for record in records {
            match self.send(&record).await {
                Ok(()) => {
                    self.buffer.remove(&record.record_id).await?;
                    report.published += 1;
                }
                Err(err) => {
                    report.failed = total - report.published;
                    tracing::debug!(
                        record_id = %record.record_id,
                        error = %err,
                        remaining = report.failed,
                        "usage sink still unavailable"
                    );
                    break;
                }
            }
        }

        if report.published > 0 || report.dropped > 0 {
            tracing::info!(
                published = report.published,
                failed = report.failed,
                dropped = report.dropped,
                "usage buffer retry pass finished"
            );
        }
        Ok(report)
    }

    pub fn spawn_retry_loop(self: &Arc<Self>, interval: Duration) -> AbortOnDrop {
        let publisher = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = publisher.retry_buffered().await {
                    tracing::error!(error = %err, "usage buffer retry pass failed");
                }
            }
        });
        AbortOnDrop::new(task.abort_handle())
    }
}

/// In-process sink, used when no stream is configured and by tests. Can be
/// switched into a failing mode to simulate a stream outage.
#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
    failing: AtomicBool,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn publish(&self, record: &UsageRecord) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Sink("memory sink unavailable".to_string()));
        }
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::gateway::usage::{UsageContext, UsageRecordBuilder};

    fn record(request_id: &str) -> UsageRecord {
        UsageRecordBuilder::default().build(&UsageContext {
            request_id: request_id.to_string(),
            organization_id: "org-1".to_string(),
            model: "m".to_string(),
            ..UsageContext::default()
        })
    }

    async fn publisher(dir: &Path) -> (Arc<MemoryUsageSink>, UsagePublisher) {
        let sink = Arc::new(MemoryUsageSink::new());
        let buffer = BufferStore::open(dir, Duration::from_secs(3600))
            .await
            .expect("buffer");
        let publisher = UsagePublisher::new(sink.clone(), Arc::new(buffer));
        (sink, publisher)
    }

    #[tokio::test]
    async fn failed_publish_is_buffered_then_drained_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (sink, publisher) = publisher(dir.path()).await;

        sink.set_failing(true);
        let rec = record("req-1");
        let outcome = publisher.publish(&rec).await.expect("publish");
        assert_eq!(outcome, PublishOutcome::Buffered);
        assert_eq!(publisher.buffer().load().await.expect("load"), vec![rec.clone()]);

        let report = publisher.retry_buffered().await.expect("retry");
        assert_eq!(report.published, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(publisher.buffer().count().await.expect("count"), 1);

        sink.set_failing(false);
        let report = publisher.retry_buffered().await.expect("retry");
        assert_eq!(report.published, 1);
        assert_eq!(publisher.buffer().count().await.expect("count"), 0);

        let report = publisher.retry_buffered().await.expect("retry");
        assert_eq!(report, RetryReport::default());
        let delivered = sink.records().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].record_id, rec.record_id);
    }

    #[tokio::test]
    async fn successful_publish_skips_the_buffer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (sink, publisher) = publisher(dir.path()).await;

        let outcome = publisher.publish(&record("req-2")).await.expect("publish");
        assert_eq!(outcome, PublishOutcome::Published);
        assert_eq!(publisher.buffer().count().await.expect("count"), 0);
        assert_eq!(sink.records().await.len(), 1);
    }

    struct HangingSink;

    #[async_trait]
    impl UsageSink for HangingSink {
        async fn publish(&self, _record: &UsageRecord) -> Result<(), PublishError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_sink_times_out_into_the_buffer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let buffer = BufferStore::open(dir.path(), Duration::from_secs(3600))
            .await
            .expect("buffer");
        let publisher = UsagePublisher::new(Arc::new(HangingSink), Arc::new(buffer))
            .with_timeout(Duration::from_millis(20));

        let outcome = publisher.publish(&record("req-3")).await.expect("publish");
        assert_eq!(outcome, PublishOutcome::Buffered);
        assert_eq!(publisher.buffer().count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn retry_loop_drains_in_background() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (sink, publisher) = publisher(dir.path()).await;
        let publisher = Arc::new(publisher);

        sink.set_failing(true);
        publisher.publish(&record("req-4")).await.expect("publish");
        sink.set_failing(false);

        let _task = publisher.spawn_retry_loop(Duration::from_millis(10));
        for _ in 0..100 {
            if publisher.buffer().count().await.expect("count") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(publisher.buffer().count().await.expect("count"), 0);
        assert_eq!(sink.records().await.len(), 1);
    }
}
