// ABOUTME: Record store contract: durable keyed storage for image records.
// ABOUTME: Exports in-memory and file-backed implementations.

mod file;
mod lock;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::record::{ImageRecord, ImageStatus};
use crate::types::{ImageKey, RecordId};

/// Errors from record store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of [`RecordStore::upsert_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    /// This call created the record.
    Created(ImageRecord),
    /// A record already existed for the key; it is returned unchanged.
    Existing(ImageRecord),
}

impl Upsert {
    pub fn was_created(&self) -> bool {
        matches!(self, Upsert::Created(_))
    }

    pub fn into_record(self) -> ImageRecord {
        match self {
            Upsert::Created(record) | Upsert::Existing(record) => record,
        }
    }
}

/// Outcome of [`RecordStore::update_status`].
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Applied(ImageRecord),
    /// The status would not advance; the stored record is returned unchanged.
    Stale(ImageRecord),
    Missing,
}

/// Outcome of [`RecordStore::replace`].
#[derive(Debug, Clone, PartialEq)]
pub enum Replace {
    Applied(ImageRecord),
    /// The stored revision differs; the current record is returned.
    Conflict(ImageRecord),
    Missing,
}

/// Durable keyed storage for image records. No business logic beyond the
/// key-uniqueness, forward-only status and revision checks.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_by_key(&self, key: &ImageKey) -> Result<Option<ImageRecord>, StoreError>;

    async fn find_by_id(&self, id: &RecordId) -> Result<Option<ImageRecord>, StoreError>;

    /// Insert `record` unless its key already exists.
    ///
    /// Atomic: of any number of concurrent callers for one key, exactly one
    /// observes `Created` and the rest observe `Existing` with that record.
    async fn upsert_if_absent(&self, record: ImageRecord) -> Result<Upsert, StoreError>;

    /// Set the status of `id` if that moves it forward.
    async fn update_status(
        &self,
        id: &RecordId,
        status: ImageStatus,
    ) -> Result<StatusUpdate, StoreError>;

    /// Write `record` if the stored revision still equals `record.revision`.
    async fn replace(&self, record: ImageRecord) -> Result<Replace, StoreError>;

    /// All records of `system`, ordered by image type then tag.
    async fn list_by_system(&self, system: &str) -> Result<Vec<ImageRecord>, StoreError>;

    /// Remove the record for `key`, returning it if it existed.
    async fn delete(&self, key: &ImageKey) -> Result<Option<ImageRecord>, StoreError>;

    /// Remove the record for `key` only while it is still record `id`.
    ///
    /// A key that was expired and pulled again carries a new id, so a caller
    /// holding the old id leaves the new record alone.
    async fn delete_record(
        &self,
        key: &ImageKey,
        id: &RecordId,
    ) -> Result<Option<ImageRecord>, StoreError>;
}

fn sort_records(records: &mut [ImageRecord]) {
    records.sort_by(|a, b| (&a.itype, &a.tag).cmp(&(&b.itype, &b.tag)));
}
