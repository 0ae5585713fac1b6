//! Transaction scope.
//!
//! A transaction holds the registry's exclusive write lock for its whole
//! lifetime, together with a clone of the registry state and a storage
//! snapshot taken at `begin`. Commit flushes the storage backend, releases
//! the lock, and only then delivers the events collected by the enclosed
//! operations; rollback (explicit, on drop, or after a poisoning failure)
//! restores both the registry and the storage backend to their `begin`
//! state.
//!
//! Grouping several operations on one handle is how atomic multi-operation
//! units are expressed; there is no implicit nesting to flatten.

use crate::error::{MetaError, Result};
use crate::manager::{unknown_record, ManagerShared};
use core_index::{RecordAccess, RegistryState};
use core_runtime::events::MetaEvent;
use core_store::{JsonMap, MetadataRecord, SnapshotId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::warn;

/// An open transaction against the manager's registry and storage backend.
pub struct MetaTransaction {
    shared: Arc<ManagerShared>,
    guard: OwnedRwLockWriteGuard<RegistryState>,
    registry_snapshot: RegistryState,
    storage_snapshot: SnapshotId,
    events: Vec<MetaEvent>,
    poisoned: bool,
    finished: bool,
}

impl MetaTransaction {
    pub(crate) async fn begin(shared: Arc<ManagerShared>) -> Result<Self> {
        let guard = shared.registry.write_owned().await;
        let registry_snapshot = guard.clone();
        let storage_snapshot = shared.storage.snapshot().await?;
        Ok(Self {
            shared,
            guard,
            registry_snapshot,
            storage_snapshot,
            events: Vec::new(),
            poisoned: false,
            finished: false,
        })
    }

    /// Register a file; fails with `DuplicateRecord` if one exists.
    pub async fn add_file(&mut self, path: &str, user_meta: Value) -> Result<MetadataRecord> {
        self.register_file(path, user_meta, false).await
    }

    /// Register a file, replacing any existing record wholesale.
    pub async fn upsert_file(&mut self, path: &str, user_meta: Value) -> Result<MetadataRecord> {
        self.register_file(path, user_meta, true).await
    }

    /// Shallow-merge `patch` into the `user` tier.
    pub async fn update_metadata(&mut self, path: &str, patch: Value) -> Result<MetadataRecord> {
        self.mutate_user(path, patch, false).await
    }

    /// Replace the entire `user` tier.
    pub async fn replace_metadata(
        &mut self,
        path: &str,
        user_meta: Value,
    ) -> Result<MetadataRecord> {
        self.mutate_user(path, user_meta, true).await
    }

    /// Re-run probe and plugins, preserving `user`.
    pub async fn refresh(&mut self, path: &str) -> Result<MetadataRecord> {
        let canonical = self.shared.normalizer.normalize(path).await?;
        let mut record = self
            .load_record(&canonical)
            .await?
            .ok_or_else(|| unknown_record(&canonical))?;
        let old = record.clone();

        record.system = self.shared.probe.probe(&canonical).await?;
        let outcome = self.checked(self.shared.dispatcher.dispatch(&canonical).await)?;
        record.set_plugin(outcome.metadata);

        self.store_record(
            &canonical,
            record.clone(),
            MetaEvent::MetadataChanged {
                path: canonical.clone(),
                old,
                new: record.clone(),
            },
        )
        .await?;
        Ok(record)
    }

    /// Remove a record; returns whether one existed.
    pub async fn delete_metadata(&mut self, path: &str) -> Result<bool> {
        let canonical = self.shared.normalizer.normalize(path).await?;
        self.remove_record(&canonical).await
    }

    /// Declare and backfill a secondary index.
    pub async fn create_index(&mut self, field: &str) -> Result<()> {
        // Stage bodies for evicted entries so the backfill sees every record.
        let mut bodies = HashMap::new();
        for path in self.guard.paths_in_order() {
            if matches!(self.guard.get(&path), RecordAccess::Evicted) {
                if let Some(record) = self.checked(self.shared.storage.get(&path).await)? {
                    bodies.insert(path, record);
                }
            }
        }
        self.guard.create_index(field, &bodies);
        Ok(())
    }

    /// Commit: flush storage, release the write lock, deliver events.
    pub async fn commit(mut self) -> Result<()> {
        if self.poisoned {
            self.rollback_inner().await?;
            return Err(MetaError::TransactionAborted(
                "a failed operation poisoned the transaction".to_string(),
            ));
        }

        if let Err(err) = self.shared.storage.flush().await {
            if let Err(rollback_err) = self.rollback_inner().await {
                warn!(error = %rollback_err, "rollback failed after flush error");
            }
            return Err(err.into());
        }

        if let Err(err) = self.shared.storage.discard(self.storage_snapshot).await {
            warn!(error = %err, "failed to discard storage snapshot");
        }
        self.finished = true;

        let events = std::mem::take(&mut self.events);
        let bus = self.shared.bus.clone();
        drop(self);
        for event in events {
            bus.emit(event);
        }
        Ok(())
    }

    /// Roll back to the state captured at `begin`.
    pub async fn rollback(mut self) -> Result<()> {
        self.rollback_inner().await
    }

    async fn rollback_inner(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        *self.guard = self.registry_snapshot.clone();
        self.events.clear();
        self.finished = true;
        self.shared.storage.restore(self.storage_snapshot).await?;
        Ok(())
    }

    pub(crate) fn state(&self) -> &RegistryState {
        &self.guard
    }

    /// Queue an event for delivery at commit.
    pub(crate) fn push_event(&mut self, event: MetaEvent) {
        self.events.push(event);
    }

    /// Load a record body, reaching into storage for evicted entries.
    pub(crate) async fn load_record(&self, canonical: &str) -> Result<Option<MetadataRecord>> {
        self.shared.load_record(&self.guard, canonical).await
    }

    /// Write a record through registry and storage, queueing `event` for
    /// delivery at commit.
    pub(crate) async fn store_record(
        &mut self,
        canonical: &str,
        record: MetadataRecord,
        event: MetaEvent,
    ) -> Result<()> {
        self.guard.upsert(canonical, record.clone());
        self.checked(self.shared.storage.save(canonical, &record).await)?;
        self.events.push(event);
        Ok(())
    }

    /// Remove a record from registry and storage.
    pub(crate) async fn remove_record(&mut self, canonical: &str) -> Result<bool> {
        let existed = self.guard.remove(canonical);
        if existed {
            self.checked(self.shared.storage.delete(canonical).await)?;
            self.events.push(MetaEvent::FileRemoved {
                path: canonical.to_string(),
            });
        }
        Ok(existed)
    }

    async fn register_file(
        &mut self,
        path: &str,
        user_meta: Value,
        replace: bool,
    ) -> Result<MetadataRecord> {
        let user = to_user_map(user_meta)?;
        let canonical = self.shared.normalizer.normalize(path).await?;

        let existing = self.load_record(&canonical).await?;
        if existing.is_some() && !replace {
            return Err(MetaError::DuplicateRecord(canonical));
        }

        let system = self.shared.probe.probe(&canonical).await?;
        let outcome = self.checked(self.shared.dispatcher.dispatch(&canonical).await)?;

        let mut record = MetadataRecord::new(system).with_user(user);
        record.set_plugin(outcome.metadata);

        let event = match existing {
            Some(old) => MetaEvent::MetadataChanged {
                path: canonical.clone(),
                old,
                new: record.clone(),
            },
            None => MetaEvent::FileAdded {
                path: canonical.clone(),
                record: record.clone(),
            },
        };
        self.store_record(&canonical, record.clone(), event).await?;
        Ok(record)
    }

    async fn mutate_user(
        &mut self,
        path: &str,
        user_meta: Value,
        replace: bool,
    ) -> Result<MetadataRecord> {
        let patch = to_user_map(user_meta)?;
        let canonical = self.shared.normalizer.normalize(path).await?;
        let mut record = self
            .load_record(&canonical)
            .await?
            .ok_or_else(|| unknown_record(&canonical))?;
        let old = record.clone();

        if replace {
            record.replace_user(patch);
        } else {
            record.merge_user(patch);
        }
        if self.shared.refresh_on_write {
            record.system = self.shared.probe.probe(&canonical).await?;
            let outcome = self.checked(self.shared.dispatcher.dispatch(&canonical).await)?;
            record.set_plugin(outcome.metadata);
        }

        self.store_record(
            &canonical,
            record.clone(),
            MetaEvent::MetadataChanged {
                path: canonical.clone(),
                old,
                new: record.clone(),
            },
        )
        .await?;
        Ok(record)
    }

    /// Mark the transaction poisoned when an operation failed after it may
    /// have touched state; commit will refuse and roll back instead.
    fn checked<T, E: Into<MetaError>>(&mut self, result: std::result::Result<T, E>) -> Result<T> {
        result.map_err(|err| {
            self.poisoned = true;
            err.into()
        })
    }
}

impl Drop for MetaTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        *self.guard = self.registry_snapshot.clone();
        let storage = Arc::clone(&self.shared.storage);
        let snapshot = self.storage_snapshot;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = storage.restore(snapshot).await {
                        warn!(error = %err, "storage rollback failed for dropped transaction");
                    }
                });
            }
            Err(_) => {
                warn!("transaction dropped outside a runtime; storage snapshot not restored");
            }
        }
        warn!("transaction dropped without commit; rolled back");
    }
}

fn to_user_map(value: Value) -> Result<JsonMap> {
    match value {
        Value::Null => Ok(JsonMap::new()),
        Value::Object(map) => Ok(map),
        other => Err(MetaError::InvalidMetadata(format!(
            "user metadata must be a JSON object, got {other}"
        ))),
    }
}
