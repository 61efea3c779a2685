// ABOUTME: File-backed record store: one JSON document per image key, named by key digest.
// ABOUTME: Creation is atomic across processes via hard links; updates hold a per-record lock file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::lock::RecordLock;
use super::{RecordStore, Replace, StatusUpdate, StoreError, Upsert, sort_records};
use crate::record::{ImageRecord, ImageStatus};
use crate::types::{ImageKey, RecordId};

const RECORD_EXT: &str = "json";
const KEY_SEPARATOR: char = '+';

/// Records stored as `<root>/<system>+<digest>.json`, where the digest is
/// the hex SHA-256 of the full key. File names stay short whatever the tag
/// length; the key parts live in the document itself.
///
/// Processes sharing a root agree on which one created a key: the document
/// is linked into place with `link(2)`, which fails if it exists. Updates and
/// deletes take `<record>.lock` first, so compare-and-swap holds across
/// processes as well.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| StoreError::Io {
                path: root.clone(),
                source,
            })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn system_prefix(system: &str) -> String {
        format!("{}{}", urlencoding::encode(system), KEY_SEPARATOR)
    }

    fn key_digest(key: &ImageKey) -> String {
        let mut hasher = Sha256::new();
        for part in [key.system(), key.itype(), key.tag()] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Where the document for `key` lives.
    pub fn record_path(&self, key: &ImageKey) -> PathBuf {
        self.root.join(format!(
            "{}{}.{}",
            Self::system_prefix(key.system()),
            Self::key_digest(key),
            RECORD_EXT
        ))
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()))
    }

    async fn read_record(path: &Path) -> Result<Option<ImageRecord>, StoreError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    async fn write_temp(&self, record: &ImageRecord) -> Result<PathBuf, StoreError> {
        let json = serde_json::to_vec_pretty(record)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        Ok(tmp)
    }

    async fn overwrite(&self, path: &Path, record: &ImageRecord) -> Result<(), StoreError> {
        let tmp = self.write_temp(record).await?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Delete the document for `key`, if present and (when given) still `id`.
    async fn remove(
        &self,
        key: &ImageKey,
        id: Option<&RecordId>,
    ) -> Result<Option<ImageRecord>, StoreError> {
        let path = self.record_path(key);
        let _lock = RecordLock::acquire(&path).await?;
        let Some(record) = Self::read_record(&path).await? else {
            return Ok(None);
        };
        if id.is_some_and(|id| id != &record.id) {
            return Ok(None);
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(Some(record)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// Every record file whose name starts with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<ImageRecord>, StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.root.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(io_err)?;
        let mut records = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(prefix) || !name.ends_with(RECORD_EXT) || name.starts_with('.') {
                continue;
            }
            // Deleted between listing and reading.
            if let Some(record) = Self::read_record(&entry.path()).await? {
                records.push(record);
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn find_by_key(&self, key: &ImageKey) -> Result<Option<ImageRecord>, StoreError> {
        Self::read_record(&self.record_path(key)).await
    }

    async fn find_by_id(&self, id: &RecordId) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.scan("").await?.into_iter().find(|r| &r.id == id))
    }

    async fn upsert_if_absent(&self, mut record: ImageRecord) -> Result<Upsert, StoreError> {
        let path = self.record_path(&record.key());
        record.revision = 1;
        let tmp = self.write_temp(&record).await?;

        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Created record");
                Ok(Upsert::Created(record))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match Self::read_record(&path).await? {
                    Some(existing) => Ok(Upsert::Existing(existing)),
                    // Deleted right after the failed link; report ours as the winner.
                    None => self.upsert_if_absent(record).await,
                }
            }
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn update_status(
        &self,
        id: &RecordId,
        status: ImageStatus,
    ) -> Result<StatusUpdate, StoreError> {
        let Some(found) = self.find_by_id(id).await? else {
            return Ok(StatusUpdate::Missing);
        };
        let path = self.record_path(&found.key());
        let _lock = RecordLock::acquire(&path).await?;
        let mut record = match Self::read_record(&path).await? {
            Some(record) if &record.id == id => record,
            _ => return Ok(StatusUpdate::Missing),
        };
        if !record.status.can_advance_to(status) {
            return Ok(StatusUpdate::Stale(record));
        }

        record.status = status;
        record.revision += 1;
        self.overwrite(&path, &record).await?;
        Ok(StatusUpdate::Applied(record))
    }

    async fn replace(&self, mut record: ImageRecord) -> Result<Replace, StoreError> {
        let path = self.record_path(&record.key());
        let _lock = RecordLock::acquire(&path).await?;
        let current = match Self::read_record(&path).await? {
            Some(current) if current.id == record.id => current,
            _ => return Ok(Replace::Missing),
        };
        if current.revision != record.revision {
            return Ok(Replace::Conflict(current));
        }

        record.revision += 1;
        self.overwrite(&path, &record).await?;
        Ok(Replace::Applied(record))
    }

    async fn list_by_system(&self, system: &str) -> Result<Vec<ImageRecord>, StoreError> {
        let mut records = self.scan(&Self::system_prefix(system)).await?;
        records.retain(|r| r.system == system);
        sort_records(&mut records);
        Ok(records)
    }

    async fn delete(&self, key: &ImageKey) -> Result<Option<ImageRecord>, StoreError> {
        self.remove(key, None).await
    }

    async fn delete_record(
        &self,
        key: &ImageKey,
        id: &RecordId,
    ) -> Result<Option<ImageRecord>, StoreError> {
        self.remove(key, Some(id)).await
    }
}
