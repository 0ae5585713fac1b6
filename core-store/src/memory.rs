//! In-memory storage backend.
//!
//! Keeps everything in a map behind a read-write lock and persists nothing.
//! Snapshots are clones of the map taken under the lock, which makes this
//! backend the reference implementation of the snapshot/restore contract.

use crate::backend::{BulkOp, BulkOutcome, QueryCriteria, SnapshotId, StorageBackend};
use crate::error::{Result, StorageError};
use crate::model::MetadataRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryInner {
    records: HashMap<String, MetadataRecord>,
    snapshots: HashMap<u64, HashMap<String, MetadataRecord>>,
    next_snapshot: u64,
}

/// Non-persistent backend backed by a `HashMap`.
#[derive(Default)]
pub struct MemoryBackend {
    inner: RwLock<MemoryInner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn save(&self, path: &str, record: &MetadataRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.records.insert(path.to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<MetadataRecord>> {
        Ok(self.inner.read().await.records.get(path).cloned())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        Ok(self.inner.write().await.records.remove(path).is_some())
    }

    async fn query(&self, _criteria: &QueryCriteria) -> Result<Vec<String>> {
        // No pushdown: every path is a valid superset.
        Ok(self.inner.read().await.records.keys().cloned().collect())
    }

    async fn bulk(&self, ops: Vec<BulkOp>) -> Result<Vec<BulkOutcome>> {
        let mut inner = self.inner.write().await;
        let mut staged = inner.records.clone();
        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                BulkOp::Save { path, record } => {
                    staged.insert(path, record);
                    outcomes.push(BulkOutcome::Saved);
                }
                BulkOp::Delete { path } => {
                    outcomes.push(BulkOutcome::Deleted(staged.remove(&path).is_some()));
                }
            }
        }
        inner.records = staged;
        Ok(outcomes)
    }

    async fn iter_all(&self) -> Result<Vec<(String, MetadataRecord)>> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .iter()
            .map(|(path, record)| (path.clone(), record.clone()))
            .collect())
    }

    async fn snapshot(&self) -> Result<SnapshotId> {
        let mut inner = self.inner.write().await;
        let id = inner.next_snapshot;
        inner.next_snapshot += 1;
        let copy = inner.records.clone();
        inner.snapshots.insert(id, copy);
        Ok(SnapshotId(id))
    }

    async fn restore(&self, snapshot: SnapshotId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let records = inner
            .snapshots
            .remove(&snapshot.0)
            .ok_or(StorageError::UnknownSnapshot(snapshot.0))?;
        inner.records = records;
        Ok(())
    }

    async fn discard(&self, snapshot: SnapshotId) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .snapshots
            .remove(&snapshot.0)
            .ok_or(StorageError::UnknownSnapshot(snapshot.0))?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SystemMetadata;

    fn record(path: &str, size: u64) -> MetadataRecord {
        MetadataRecord::new(SystemMetadata {
            path: path.to_string(),
            filename: path.rsplit('/').next().unwrap_or_default().to_string(),
            extension: String::new(),
            size,
            created: 1.0,
            modified: 2.0,
            accessed: 3.0,
        })
    }

    #[tokio::test]
    async fn save_get_delete_round_trip() {
        let backend = MemoryBackend::new();
        backend.save("/a", &record("/a", 1)).await.unwrap();

        assert_eq!(backend.get("/a").await.unwrap().unwrap().system.size, 1);
        assert!(backend.delete("/a").await.unwrap());
        assert!(!backend.delete("/a").await.unwrap());
        assert!(backend.get("/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_is_idempotent() {
        let backend = MemoryBackend::new();
        let rec = record("/a", 1);
        backend.save("/a", &rec).await.unwrap();
        backend.save("/a", &rec).await.unwrap();
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn bulk_applies_as_a_group() {
        let backend = MemoryBackend::new();
        backend.save("/a", &record("/a", 1)).await.unwrap();

        let outcomes = backend
            .bulk(vec![
                BulkOp::Save {
                    path: "/b".to_string(),
                    record: record("/b", 2),
                },
                BulkOp::Delete {
                    path: "/a".to_string(),
                },
                BulkOp::Delete {
                    path: "/missing".to_string(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(
            outcomes,
            vec![
                BulkOutcome::Saved,
                BulkOutcome::Deleted(true),
                BulkOutcome::Deleted(false)
            ]
        );
        assert!(backend.get("/a").await.unwrap().is_none());
        assert!(backend.get("/b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn snapshot_restore_rolls_back() {
        let backend = MemoryBackend::new();
        backend.save("/a", &record("/a", 1)).await.unwrap();

        let snap = backend.snapshot().await.unwrap();
        backend.save("/b", &record("/b", 2)).await.unwrap();
        backend.delete("/a").await.unwrap();

        backend.restore(snap).await.unwrap();
        assert!(backend.get("/a").await.unwrap().is_some());
        assert!(backend.get("/b").await.unwrap().is_none());

        // Handle was consumed by the restore.
        assert!(backend.restore(snap).await.is_err());
    }

    #[tokio::test]
    async fn discard_consumes_the_handle() {
        let backend = MemoryBackend::new();
        let snap = backend.snapshot().await.unwrap();
        backend.discard(snap).await.unwrap();
        assert!(backend.discard(snap).await.is_err());
    }
}
