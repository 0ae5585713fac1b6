//! JSON document storage backend.
//!
//! The whole store is one JSON document (`ExportDocument` shape) loaded at
//! construction. Mutations are applied in memory; `flush` writes the new
//! document to a write-ahead journal file, syncs it, and renames it over the
//! main document so the replace is atomic. A leftover journal whose header
//! tag is intact (it parses and carries the expected version) is replayed at
//! startup; a torn one is discarded.

use crate::backend::{BulkOp, BulkOutcome, QueryCriteria, SnapshotId, StorageBackend};
use crate::error::{Result, StorageError};
use crate::model::{ExportDocument, MetadataRecord};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug)]
struct JsonInner {
    records: HashMap<String, MetadataRecord>,
    indexes: Vec<String>,
    dirty: bool,
    snapshots: HashMap<u64, HashMap<String, MetadataRecord>>,
    next_snapshot: u64,
}

/// File-backed backend persisting a single JSON document.
#[derive(Debug)]
pub struct JsonBackend {
    main_path: PathBuf,
    journal_path: PathBuf,
    inner: RwLock<JsonInner>,
}

impl JsonBackend {
    /// Open (or create) the document at `path`, replaying a pending journal
    /// first if one survived a crash.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let main_path = path.as_ref().to_path_buf();
        let journal_path = journal_path_for(&main_path);

        if let Some(parent) = main_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        replay_journal(&main_path, &journal_path).await?;

        let document = match tokio::fs::read(&main_path).await {
            Ok(bytes) => {
                serde_json::from_slice::<ExportDocument>(&bytes).map_err(|err| {
                    StorageError::CorruptDocument {
                        path: main_path.display().to_string(),
                        message: err.to_string(),
                    }
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ExportDocument::empty(),
            Err(err) => return Err(err.into()),
        };

        if document.version != ExportDocument::VERSION {
            return Err(StorageError::CorruptDocument {
                path: main_path.display().to_string(),
                message: format!("unsupported document version {}", document.version),
            });
        }

        debug!(
            path = %main_path.display(),
            records = document.records.len(),
            "opened json store"
        );

        Ok(Self {
            main_path,
            journal_path,
            inner: RwLock::new(JsonInner {
                records: document.records.into_iter().collect(),
                indexes: document.indexes,
                dirty: false,
                snapshots: HashMap::new(),
                next_snapshot: 0,
            }),
        })
    }

    /// Secondary-index hint carried in the document.
    pub async fn index_hint(&self) -> Vec<String> {
        self.inner.read().await.indexes.clone()
    }

    /// Replace the secondary-index hint written out with the document.
    pub async fn set_index_hint(&self, indexes: Vec<String>) {
        let mut inner = self.inner.write().await;
        if inner.indexes != indexes {
            inner.indexes = indexes;
            inner.dirty = true;
        }
    }
}

fn journal_path_for(main: &Path) -> PathBuf {
    let mut name = main.as_os_str().to_os_string();
    name.push(".journal");
    PathBuf::from(name)
}

/// Complete a commit that crashed between journal write and rename.
async fn replay_journal(main: &Path, journal: &Path) -> Result<()> {
    let bytes = match tokio::fs::read(journal).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let intact = serde_json::from_slice::<ExportDocument>(&bytes)
        .map(|doc| doc.version == ExportDocument::VERSION)
        .unwrap_or(false);

    if intact {
        warn!(journal = %journal.display(), "replaying pending store journal");
        tokio::fs::rename(journal, main).await?;
    } else {
        warn!(journal = %journal.display(), "discarding torn store journal");
        tokio::fs::remove_file(journal).await?;
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for JsonBackend {
    async fn save(&self, path: &str, record: &MetadataRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.records.insert(path.to_string(), record.clone());
        inner.dirty = true;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<MetadataRecord>> {
        Ok(self.inner.read().await.records.get(path).cloned())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let existed = inner.records.remove(path).is_some();
        if existed {
            inner.dirty = true;
        }
        Ok(existed)
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
        inner.dirty = true;
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
        inner.dirty = true;
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
        let mut inner = self.inner.write().await;
        if !inner.dirty {
            return Ok(());
        }

        let document = ExportDocument::new(
            inner
                .records
                .iter()
                .map(|(path, record)| (path.clone(), record.clone()))
                .collect::<BTreeMap<_, _>>(),
            inner.indexes.clone(),
        );
        let bytes = serde_json::to_vec_pretty(&document)?;

        let mut file = tokio::fs::File::create(&self.journal_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&self.journal_path, &self.main_path).await?;
        inner.dirty = false;

        debug!(
            path = %self.main_path.display(),
            records = inner.records.len(),
            "flushed json store"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SystemMetadata;
    use tempfile::tempdir;

    fn record(path: &str) -> MetadataRecord {
        MetadataRecord::new(SystemMetadata {
            path: path.to_string(),
            filename: path.rsplit('/').next().unwrap_or_default().to_string(),
            extension: "txt".to_string(),
            size: 7,
            created: 1.0,
            modified: 2.0,
            accessed: 3.0,
        })
    }

    #[tokio::test]
    async fn flush_then_reopen_preserves_records() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("meta.json");

        let backend = JsonBackend::open(&store_path).await.unwrap();
        backend.save("/a", &record("/a")).await.unwrap();
        backend.save("/b", &record("/b")).await.unwrap();
        backend.delete("/b").await.unwrap();
        backend.flush().await.unwrap();

        let reopened = JsonBackend::open(&store_path).await.unwrap();
        assert!(reopened.get("/a").await.unwrap().is_some());
        assert!(reopened.get("/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flush_leaves_no_journal_behind() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("meta.json");

        let backend = JsonBackend::open(&store_path).await.unwrap();
        backend.save("/a", &record("/a")).await.unwrap();
        backend.flush().await.unwrap();

        assert!(store_path.exists());
        assert!(!journal_path_for(&store_path).exists());
    }

    #[tokio::test]
    async fn intact_journal_is_replayed_on_open() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("meta.json");
        let journal = journal_path_for(&store_path);

        let mut records = BTreeMap::new();
        records.insert("/pending".to_string(), record("/pending"));
        let document = ExportDocument::new(records, Vec::new());
        tokio::fs::write(&journal, serde_json::to_vec(&document).unwrap())
            .await
            .unwrap();

        let backend = JsonBackend::open(&store_path).await.unwrap();
        assert!(backend.get("/pending").await.unwrap().is_some());
        assert!(!journal.exists());
    }

    #[tokio::test]
    async fn torn_journal_is_discarded() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("meta.json");
        let journal = journal_path_for(&store_path);

        tokio::fs::write(&journal, b"{\"version\":1,\"records\":{\"/a\"")
            .await
            .unwrap();

        let backend = JsonBackend::open(&store_path).await.unwrap();
        assert!(backend.get("/a").await.unwrap().is_none());
        assert!(!journal.exists());
    }

    #[tokio::test]
    async fn corrupt_main_document_is_an_error() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("meta.json");
        tokio::fs::write(&store_path, b"not json").await.unwrap();

        let err = JsonBackend::open(&store_path).await.unwrap_err();
        assert!(matches!(err, StorageError::CorruptDocument { .. }));
    }

    #[tokio::test]
    async fn index_hint_round_trips() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("meta.json");

        let backend = JsonBackend::open(&store_path).await.unwrap();
        backend
            .set_index_hint(vec!["user.tags".to_string()])
            .await;
        backend.flush().await.unwrap();

        let reopened = JsonBackend::open(&store_path).await.unwrap();
        assert_eq!(reopened.index_hint().await, vec!["user.tags".to_string()]);
    }

    #[tokio::test]
    async fn snapshot_restore_rolls_back_memory_state() {
        let dir = tempdir().unwrap();
        let backend = JsonBackend::open(dir.path().join("meta.json")).await.unwrap();

        backend.save("/a", &record("/a")).await.unwrap();
        let snap = backend.snapshot().await.unwrap();
        backend.delete("/a").await.unwrap();
        backend.save("/b", &record("/b")).await.unwrap();

        backend.restore(snap).await.unwrap();
        assert!(backend.get("/a").await.unwrap().is_some());
        assert!(backend.get("/b").await.unwrap().is_none());
    }
}
