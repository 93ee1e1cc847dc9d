use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::UsageRecord;

const RECORD_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer io error: {0}")]
    Io(#[from] io::Error),
    #[error("buffer json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("usage buffer full ({max_records} records)")]
    Full { max_records: usize },
}

/// Disk spool for usage records that could not be published.
///
/// One file per record at `{dir}/{record_id}.json`; the file's mtime is the
/// buffering time used for expiry. All directory access goes through one
/// read/write lock so concurrent `store` calls never race the retry loop's
/// `load`/`remove`.
#[derive(Debug)]
pub struct BufferStore {
    dir: PathBuf,
    max_age: Duration,
    max_records: Option<usize>,
    lock: RwLock<()>,
}

struct BufferedFile {
    path: PathBuf,
    record_id: String,
    modified: SystemTime,
}

impl BufferStore {
    pub async fn open(dir: impl Into<PathBuf>, max_age: Duration) -> Result<Self, BufferError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            max_age,
            max_records: None,
            lock: RwLock::new(()),
        })
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = Some(max_records);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn path_for(&self, record_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{record_id}.{RECORD_EXTENSION}"))
    }

    /// Writes (or overwrites) the record's file atomically.
    pub async fn store(&self, record: &UsageRecord) -> Result<(), BufferError> {
        let _guard = self.lock.write().await;
        let path = self.path_for(&record.record_id);

        if let Some(max_records) = self.max_records {
            let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
            if !exists && self.list_files().await?.len() >= max_records {
                return Err(BufferError::Full { max_records });
            }
        }

        let payload = serde_json::to_vec(record)?;
        let tmp_path = self.dir.join(format!(".{}.tmp", record.record_id));
        tokio::fs::write(&tmp_path, payload).await?;
        if let Err(err) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        tracing::debug!(record_id = %record.record_id, "usage record buffered to disk");
        Ok(())
    }

    /// Returns unexpired records, oldest first. Unreadable files are skipped.
    pub async fn load(&self) -> Result<Vec<UsageRecord>, BufferError> {
        let _guard = self.lock.read().await;
        let now = SystemTime::now();

        let mut records = Vec::new();
        for file in self.list_files().await? {
            if self.is_expired(&file, now) {
                continue;
            }
            let raw = match tokio::fs::read(&file.path).await {
                Ok(raw) => raw,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            match serde_json::from_slice::<UsageRecord>(&raw) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(
                        path = %file.path.display(),
                        error = %err,
                        "skipping unreadable buffered usage record"
                    );
                }
            }
        }

        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }

    /// Deletes a record's file. A missing file is not an error.
    pub async fn remove(&self, record_id: &Uuid) -> Result<(), BufferError> {
        let _guard = self.lock.write().await;
        match tokio::fs::remove_file(self.path_for(record_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn count(&self) -> Result<usize, BufferError> {
        let _guard = self.lock.read().await;
        Ok(self.list_files().await?.len())
    }

    /// Purges records older than the retention window. Each purge is a lost
    /// billing fact and is logged at error level as `PublishDropped`.
    pub async fn cleanup(&self) -> Result<usize, BufferError> {
        let _guard = self.lock.write().await;
        let now = SystemTime::now();

        let mut removed = 0;
        for file in self.list_files().await? {
            if !self.is_expired(&file, now) {
                continue;
            }
            match tokio::fs::remove_file(&file.path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
            removed += 1;
            tracing::error!(
                alert = "PublishDropped",
                record_id = %file.record_id,
                max_age_secs = self.max_age.as_secs(),
                "buffered usage record expired before it could be published"
            );
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<usize, BufferError> {
        let _guard = self.lock.write().await;
        let mut removed = 0;
        for file in self.list_files().await? {
            match tokio::fs::remove_file(&file.path).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(removed)
    }

    fn is_expired(&self, file: &BufferedFile, now: SystemTime) -> bool {
        now.duration_since(file.modified)
            .map(|age| age > self.max_age)
            .unwrap_or(false)
    }

    async fn list_files(&self) -> Result<Vec<BufferedFile>, BufferError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(record_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let record_id = record_id.to_string();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            if !metadata.is_file() {
                continue;
            }
            out.push(BufferedFile {
                path,
                record_id,
                modified: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
            });
        }
        Ok(out)
    }
}
