// ABOUTME: Per-record lock file guarding read-modify-write cycles in the file store.
// ABOUTME: Uses atomic create-if-absent so processes sharing a directory exclude each other.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::StoreError;

/// A lock older than this is assumed to belong to a crashed process.
const STALE_AFTER: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_millis(5);
const MAX_WAIT: Duration = Duration::from_secs(10);

/// Who holds a record lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    started_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }

    fn is_stale(&self) -> bool {
        (Utc::now() - self.started_at)
            .to_std()
            .is_ok_and(|age| age >= STALE_AFTER)
    }
}

/// A held record lock that releases on drop.
#[derive(Debug)]
pub(super) struct RecordLock {
    path: PathBuf,
}

impl RecordLock {
    /// Lock the record stored at `record_path`, waiting for other holders.
    pub(super) async fn acquire(record_path: &Path) -> Result<Self, StoreError> {
        let path = lock_path(record_path);
        let body = serde_json::to_vec(&LockInfo::current())?;
        let deadline = tokio::time::Instant::now() + MAX_WAIT;

        loop {
            let created = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;

            match created {
                Ok(mut file) => {
                    let lock = Self { path };
                    let written = async {
                        file.write_all(&body).await?;
                        file.flush().await
                    };
                    written
                        .await
                        .map_err(|source| StoreError::Io {
                            path: lock.path.clone(),
                            source,
                        })?;
                    return Ok(lock);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Self::break_if_stale(&path).await {
                        continue;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StoreError::Io {
                            path,
                            source: std::io::Error::new(
                                ErrorKind::WouldBlock,
                                "timed out waiting for record lock",
                            ),
                        });
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(source) => return Err(StoreError::Io { path, source }),
            }
        }
    }

    async fn break_if_stale(path: &Path) -> bool {
        let Ok(bytes) = tokio::fs::read(path).await else {
            return false;
        };
        // Still being written by its creator.
        if bytes.is_empty() {
            return false;
        }
        match serde_json::from_slice::<LockInfo>(&bytes) {
            Ok(info) if info.is_stale() => {
                tracing::warn!(
                    path = %path.display(),
                    pid = info.pid,
                    since = %info.started_at,
                    "Breaking stale record lock"
                );
                tokio::fs::remove_file(path).await.is_ok()
            }
            Ok(_) => false,
            Err(_) => {
                tracing::warn!(path = %path.display(), "Record lock unreadable, breaking it");
                tokio::fs::remove_file(path).await.is_ok()
            }
        }
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release record lock");
        }
    }
}

fn lock_path(record_path: &Path) -> PathBuf {
    let mut name = record_path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}
