// ABOUTME: In-memory record store guarded by a single RwLock.
// ABOUTME: Suits tests and single-process deployments without durable state.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{RecordStore, Replace, StatusUpdate, StoreError, Upsert, sort_records};
use crate::record::{ImageRecord, ImageStatus};
use crate::types::{ImageKey, RecordId};

#[derive(Default)]
struct Inner {
    records: HashMap<RecordId, ImageRecord>,
    keys: HashMap<ImageKey, RecordId>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.len())
            .finish()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_by_key(&self, key: &ImageKey) -> Result<Option<ImageRecord>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .keys
            .get(key)
            .and_then(|id| inner.records.get(id))
            .cloned())
    }

    async fn find_by_id(&self, id: &RecordId) -> Result<Option<ImageRecord>, StoreError> {
        Ok(self.inner.read().records.get(id).cloned())
    }

    async fn upsert_if_absent(&self, mut record: ImageRecord) -> Result<Upsert, StoreError> {
        let key = record.key();
        let mut inner = self.inner.write();
        if let Some(existing) = inner.keys.get(&key).and_then(|id| inner.records.get(id)) {
            return Ok(Upsert::Existing(existing.clone()));
        }

        record.revision = 1;
        inner.keys.insert(key, record.id.clone());
        inner.records.insert(record.id.clone(), record.clone());
        Ok(Upsert::Created(record))
    }

    async fn update_status(
        &self,
        id: &RecordId,
        status: ImageStatus,
    ) -> Result<StatusUpdate, StoreError> {
        let mut inner = self.inner.write();
        let Some(record) = inner.records.get_mut(id) else {
            return Ok(StatusUpdate::Missing);
        };
        if !record.status.can_advance_to(status) {
            return Ok(StatusUpdate::Stale(record.clone()));
        }

        record.status = status;
        record.revision += 1;
        Ok(StatusUpdate::Applied(record.clone()))
    }

    async fn replace(&self, mut record: ImageRecord) -> Result<Replace, StoreError> {
        let mut inner = self.inner.write();
        let Some(current) = inner.records.get_mut(&record.id) else {
            return Ok(Replace::Missing);
        };
        if current.revision != record.revision {
            return Ok(Replace::Conflict(current.clone()));
        }

        record.revision += 1;
        *current = record.clone();
        Ok(Replace::Applied(record))
    }

    async fn list_by_system(&self, system: &str) -> Result<Vec<ImageRecord>, StoreError> {
        let mut records: Vec<_> = self
            .inner
            .read()
            .records
            .values()
            .filter(|r| r.system == system)
            .cloned()
            .collect();
        sort_records(&mut records);
        Ok(records)
    }

    async fn delete(&self, key: &ImageKey) -> Result<Option<ImageRecord>, StoreError> {
        let mut inner = self.inner.write();
        let Some(id) = inner.keys.remove(key) else {
            return Ok(None);
        };
        Ok(inner.records.remove(&id))
    }

    async fn delete_record(
        &self,
        key: &ImageKey,
        id: &RecordId,
    ) -> Result<Option<ImageRecord>, StoreError> {
        let mut inner = self.inner.write();
        if inner.keys.get(key) != Some(id) {
            return Ok(None);
        }
        inner.keys.remove(key);
        Ok(inner.records.remove(id))
    }
}
