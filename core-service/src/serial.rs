//! Metadata export and import.
//!
//! The on-disk document is the same shape the JSON backend persists:
//! `version`, `records` keyed by canonical path, and an optional `indexes`
//! hint naming the secondary indexes worth re-declaring on restore. Import
//! runs as one transaction, so a malformed record or a conflict under
//! `Error` mode leaves the manager untouched.

use crate::error::{MetaError, Result};
use crate::manager::FileMetaManager;
use crate::transaction::MetaTransaction;
use core_runtime::events::MetaEvent;
use core_store::{ExportDocument, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// How import treats a path that already has a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    /// Fail the whole import on the first duplicate.
    #[default]
    Error,
    /// Retain the existing record.
    Keep,
    /// Replace the existing record.
    Overwrite,
    /// Higher `system.modified` wins.
    Newer,
}

impl FileMetaManager {
    /// Snapshot every record (and the declared index set) as a document.
    pub async fn export_document(&self) -> Result<ExportDocument> {
        let state = self.shared.registry.read().await;
        let mut records = BTreeMap::new();
        for path in state.paths_in_order() {
            if let Some(record) = self.shared.load_record(&state, &path).await? {
                records.insert(path, record);
            }
        }
        Ok(ExportDocument::new(records, state.declared_indexes()))
    }

    /// Export all metadata to a JSON file; returns the record count.
    pub async fn export_to_path(&self, path: impl AsRef<Path>) -> Result<u64> {
        let document = self.export_document().await?;
        let count = document.records.len() as u64;
        let bytes = serde_json::to_vec_pretty(&document).map_err(StorageError::from)?;
        tokio::fs::write(path.as_ref(), bytes)
            .await
            .map_err(StorageError::from)?;
        info!(records = count, path = %path.as_ref().display(), "exported metadata");
        Ok(count)
    }

    /// Import records from a document; returns how many were written.
    pub async fn import_document(
        &self,
        document: ExportDocument,
        mode: ConflictMode,
    ) -> Result<u64> {
        if document.version != ExportDocument::VERSION {
            return Err(MetaError::Storage(StorageError::CorruptDocument {
                path: "<import>".to_string(),
                message: format!("unsupported document version {}", document.version),
            }));
        }

        let mut txn = self.transaction().await?;
        match import_into(&mut txn, document, mode).await {
            Ok(count) => {
                txn.commit().await?;
                info!(records = count, "imported metadata");
                Ok(count)
            }
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "rollback failed after import error");
                }
                Err(err)
            }
        }
    }

    /// Import records from a JSON file produced by
    /// [`export_to_path`](Self::export_to_path).
    pub async fn import_from_path(
        &self,
        path: impl AsRef<Path>,
        mode: ConflictMode,
    ) -> Result<u64> {
        let bytes = tokio::fs::read(path.as_ref())
            .await
            .map_err(StorageError::from)?;
        let document: ExportDocument =
            serde_json::from_slice(&bytes).map_err(|err| StorageError::CorruptDocument {
                path: path.as_ref().display().to_string(),
                message: err.to_string(),
            })?;
        self.import_document(document, mode).await
    }
}

async fn import_into(
    txn: &mut MetaTransaction,
    document: ExportDocument,
    mode: ConflictMode,
) -> Result<u64> {
    // Hint-on-restore: re-declare indexes carried by the document.
    for field in &document.indexes {
        if !txn.state().is_indexed(field) {
            txn.create_index(field).await?;
        }
    }

    let mut count = 0;
    for (path, record) in document.records {
        if let Err(message) = record.validate() {
            return Err(malformed(&path, message));
        }
        if record.system.path != path {
            return Err(malformed(
                &path,
                format!("system.path '{}' disagrees with the record key", record.system.path),
            ));
        }

        match txn.load_record(&path).await? {
            None => {
                let event = MetaEvent::FileAdded {
                    path: path.clone(),
                    record: record.clone(),
                };
                txn.store_record(&path, record, event).await?;
                count += 1;
            }
            Some(existing) => match mode {
                ConflictMode::Error => return Err(MetaError::DuplicateRecord(path)),
                ConflictMode::Keep => {}
                ConflictMode::Overwrite => {
                    let event = MetaEvent::MetadataChanged {
                        path: path.clone(),
                        old: existing,
                        new: record.clone(),
                    };
                    txn.store_record(&path, record, event).await?;
                    count += 1;
                }
                ConflictMode::Newer => {
                    if record.system.modified > existing.system.modified {
                        let event = MetaEvent::MetadataChanged {
                            path: path.clone(),
                            old: existing,
                            new: record.clone(),
                        };
                        txn.store_record(&path, record, event).await?;
                        count += 1;
                    }
                }
            },
        }
    }
    Ok(count)
}

fn malformed(path: &str, message: String) -> MetaError {
    MetaError::Storage(StorageError::MalformedRecord {
        path: path.to_string(),
        message,
    })
}
