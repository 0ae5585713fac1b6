//! Filesystem reconciliation.
//!
//! Sync makes the index agree with the real filesystem under one
//! transaction: indexed paths whose file disappeared are removed, files
//! whose `modified` timestamp drifted from the stored record are re-probed
//! and re-dispatched with `user` preserved, and unindexed files under the
//! sync roots that pass the inclusion filter are added. Configured roots are
//! walked recursively; without configured roots only the directories
//! containing indexed files are listed, non-recursively.
//!
//! Cancellation is cooperative: the token is polled between records, and a
//! cancelled pass commits the progress made so far.

use crate::error::{MetaError, Result};
use crate::manager::ManagerShared;
use crate::transaction::MetaTransaction;
use core_runtime::events::MetaEvent;
use core_store::MetadataRecord;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
}

pub(crate) async fn run_sync(
    shared: &Arc<ManagerShared>,
    cancel: Option<CancellationToken>,
) -> Result<SyncReport> {
    let mut txn = MetaTransaction::begin(Arc::clone(shared)).await?;
    match sync_pass(shared, &mut txn, &cancel).await {
        Ok(report) => {
            txn.push_event(MetaEvent::SyncComplete {
                added: report.added,
                updated: report.updated,
                removed: report.removed,
            });
            txn.commit().await?;
            info!(
                added = report.added,
                updated = report.updated,
                removed = report.removed,
                "sync complete"
            );
            Ok(report)
        }
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                warn!(error = %rollback_err, "rollback failed after sync error");
            }
            Err(err)
        }
    }
}

async fn sync_pass(
    shared: &Arc<ManagerShared>,
    txn: &mut MetaTransaction,
    cancel: &Option<CancellationToken>,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    let indexed = txn.state().paths_in_order();

    // Reconcile every indexed path against the filesystem.
    for path in &indexed {
        if is_cancelled(cancel) {
            debug!("sync cancelled while reconciling indexed paths");
            return Ok(report);
        }

        if tokio::fs::symlink_metadata(path).await.is_err() {
            if txn.remove_record(path).await? {
                report.removed += 1;
            }
            continue;
        }

        let Some(record) = txn.load_record(path).await? else {
            continue;
        };
        let system = shared.probe.probe(path).await?;
        if system.modified != record.system.modified {
            let outcome = shared.dispatcher.dispatch(path).await.map_err(MetaError::from)?;
            let mut updated = record.clone();
            updated.system = system;
            updated.set_plugin(outcome.metadata);
            txn.store_record(
                path,
                updated.clone(),
                MetaEvent::MetadataChanged {
                    path: path.clone(),
                    old: record,
                    new: updated.clone(),
                },
            )
            .await?;
            report.updated += 1;
        }
    }

    // Discover files that are not indexed yet.
    for file in discover(shared, &indexed).await? {
        if is_cancelled(cancel) {
            debug!("sync cancelled while discovering files");
            return Ok(report);
        }
        if !shared.includes(&file) {
            continue;
        }
        let Some(text) = file.to_str() else {
            continue;
        };
        let Ok(canonical) = shared.normalizer.normalize(text).await else {
            continue;
        };
        if txn.state().contains(&canonical) {
            continue;
        }

        let Ok(system) = shared.probe.probe(&canonical).await else {
            // Vanished or unreadable between listing and probing.
            continue;
        };
        let outcome = shared.dispatcher.dispatch(&canonical).await.map_err(MetaError::from)?;
        let mut record = MetadataRecord::new(system);
        record.set_plugin(outcome.metadata);
        txn.store_record(
            &canonical,
            record.clone(),
            MetaEvent::FileAdded {
                path: canonical.clone(),
                record: record.clone(),
            },
        )
        .await?;
        report.added += 1;
    }

    Ok(report)
}

/// Files under the sync roots. Configured roots walk recursively; derived
/// roots (parents of indexed files) are listed one level deep.
async fn discover(shared: &ManagerShared, indexed: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = if shared.sync_roots.is_empty() {
        let dirs: BTreeSet<PathBuf> = indexed
            .iter()
            .filter_map(|path| Path::new(path).parent().map(Path::to_path_buf))
            .collect();

        let mut files = Vec::new();
        for dir in dirs {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.map(|ft| ft.is_file()).unwrap_or(false) {
                    files.push(entry.path());
                }
            }
        }
        files
    } else {
        let roots = shared.sync_roots.clone();
        tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            for root in roots {
                for entry in WalkDir::new(&root)
                    .follow_links(false)
                    .into_iter()
                    .filter_map(|entry| entry.ok())
                {
                    if entry.file_type().is_file() {
                        files.push(entry.into_path());
                    }
                }
            }
            files
        })
        .await
        .map_err(|err| MetaError::FileAccess(err.to_string()))?
    };

    files.sort();
    Ok(files)
}

/// Remove records whose file no longer exists.
pub(crate) async fn cleanup_orphaned(shared: &Arc<ManagerShared>) -> Result<u64> {
    let mut txn = MetaTransaction::begin(Arc::clone(shared)).await?;
    let result = async {
        let mut count = 0;
        for path in txn.state().paths_in_order() {
            if tokio::fs::symlink_metadata(&path).await.is_err() && txn.remove_record(&path).await? {
                count += 1;
            }
        }
        Ok::<u64, MetaError>(count)
    }
    .await;

    match result {
        Ok(count) => {
            txn.commit().await?;
            Ok(count)
        }
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                warn!(error = %rollback_err, "rollback failed after cleanup error");
            }
            Err(err)
        }
    }
}

fn is_cancelled(cancel: &Option<CancellationToken>) -> bool {
    cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
}
