// ABOUTME: On-disk record of task phases so handles resolve after a restart.
// ABOUTME: One JSON file per handle, replaced atomically via rename, pruned once released or expired.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::{DispatchError, TaskPhase};
use crate::types::TaskHandle;

const ENTRY_EXT: &str = "json";

/// Reason recorded for jobs that were still queued or running when the
/// previous process stopped.
pub(crate) const LOST_ON_RESTART: &str = "lost on restart";

/// What [`Journal::recover`] did to the entries left by a previous process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Recovery {
    pub(crate) interrupted: usize,
    pub(crate) pruned: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct Journal {
    dir: PathBuf,
}

impl Journal {
    pub(crate) async fn open(dir: &Path) -> Result<Self, DispatchError> {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            DispatchError::Journal(format!("failed to create {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, handle: &TaskHandle) -> PathBuf {
        self.dir.join(format!(
            "{}.{}",
            urlencoding::encode(handle.as_str()),
            ENTRY_EXT
        ))
    }

    pub(crate) async fn write(
        &self,
        handle: &TaskHandle,
        phase: &TaskPhase,
    ) -> Result<(), DispatchError> {
        Self::write_entry(&self.path(handle), phase).await
    }

    async fn write_entry(path: &Path, phase: &TaskPhase) -> Result<(), DispatchError> {
        let json = serde_json::to_vec(phase)
            .map_err(|e| DispatchError::Journal(format!("failed to serialize phase: {}", e)))?;
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));

        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| DispatchError::Journal(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            DispatchError::Journal(format!("failed to rename {}: {}", path.display(), e))
        })
    }

    pub(crate) async fn read(&self, handle: &TaskHandle) -> Result<Option<TaskPhase>, DispatchError> {
        Self::read_entry(&self.path(handle)).await
    }

    async fn read_entry(path: &Path) -> Result<Option<TaskPhase>, DispatchError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DispatchError::Journal(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| DispatchError::Journal(format!("corrupt entry {}: {}", path.display(), e)))
    }

    /// Forget `handle`. Removing an absent entry is not an error.
    pub(crate) async fn remove(&self, handle: &TaskHandle) -> Result<(), DispatchError> {
        let path = self.path(handle);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DispatchError::Journal(format!(
                "failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Settle the entries a previous process left behind.
    ///
    /// Queued or running jobs died with that process and nothing will run
    /// them again, so they are marked failed. Finished entries untouched for
    /// longer than `retention` are deleted, as are leftover temp files.
    pub(crate) async fn recover(&self, retention: Duration) -> Result<Recovery, DispatchError> {
        let io_err = |e: std::io::Error| {
            DispatchError::Journal(format!("failed to scan {}: {}", self.dir.display(), e))
        };
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut recovery = Recovery::default();

        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let is_entry = path.extension().is_some_and(|ext| ext == ENTRY_EXT);
            if !is_entry {
                if path.extension().is_some_and(|ext| ext.to_string_lossy().starts_with("tmp-")) {
                    let _ = tokio::fs::remove_file(&path).await;
                }
                continue;
            }

            let phase = match Self::read_entry(&path).await {
                Ok(Some(phase)) => phase,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable journal entry");
                    continue;
                }
            };

            if !phase.is_finished() {
                let lost = TaskPhase::Failed {
                    reason: LOST_ON_RESTART.to_string(),
                };
                Self::write_entry(&path, &lost).await?;
                recovery.interrupted += 1;
                continue;
            }

            let age = entry
                .metadata()
                .await
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok());
            if age.is_some_and(|age| age > retention) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => recovery.pruned += 1,
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to prune journal entry"),
                }
            }
        }

        Ok(recovery)
    }
}
