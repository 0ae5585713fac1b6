//! Manager facade.
//!
//! [`FileMetaManager`] is the public entry point: it composes the path
//! normalizer, system attribute probe, plugin dispatcher, index registry,
//! query engine and storage backend, and runs every mutating operation
//! inside a transaction scope. Reads take the registry's shared lock;
//! writers pre-commit against a storage snapshot and roll back on failure.

use crate::config::ManagerConfig;
use crate::error::{MetaError, Result};
use crate::sync::SyncReport;
use crate::transaction::MetaTransaction;
use core_extract::{
    FilePlugin, PathNormalizer, PluginDispatcher, SystemAttributeProbe,
};
use core_index::{
    HandlerRegistry, IndexRegistry, QueryEngine, QueryHandler, RecordAccess, RegistryState,
};
use core_runtime::events::{EventBus, MetaEvent, Receiver};
use core_store::{MemoryBackend, MetadataRecord, StorageBackend};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Component bundle shared between the manager, its transactions and the
/// background auto-sync task.
pub(crate) struct ManagerShared {
    pub(crate) registry: IndexRegistry,
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) engine: QueryEngine,
    pub(crate) dispatcher: Arc<PluginDispatcher>,
    pub(crate) normalizer: PathNormalizer,
    pub(crate) probe: SystemAttributeProbe,
    pub(crate) bus: EventBus,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) refresh_on_write: bool,
    pub(crate) sync_roots: Vec<PathBuf>,
    pub(crate) include_extensions: Option<Vec<String>>,
    pub(crate) shutdown: CancellationToken,
}

impl ManagerShared {
    /// Sync inclusion filter: extension allow-list, or everything.
    pub(crate) fn includes(&self, path: &Path) -> bool {
        match &self.include_extensions {
            None => true,
            Some(extensions) => path
                .extension()
                .map(|ext| ext.to_string_lossy().to_lowercase())
                .is_some_and(|ext| extensions.contains(&ext)),
        }
    }

    /// Load a record body, falling through to storage for evicted entries.
    pub(crate) async fn load_record(
        &self,
        state: &RegistryState,
        canonical: &str,
    ) -> Result<Option<MetadataRecord>> {
        match state.get(canonical) {
            RecordAccess::Resident(record) => Ok(Some(record)),
            RecordAccess::Evicted => Ok(self.storage.get(canonical).await?),
            RecordAccess::Missing => Ok(None),
        }
    }
}

/// Main interface of the library.
///
/// Thread-safe: operations may be invoked from arbitrary tasks and run in
/// parallel; mutations serialize on the registry's exclusive write lock.
pub struct FileMetaManager {
    pub(crate) shared: Arc<ManagerShared>,
}

impl FileMetaManager {
    /// Construct a manager, loading any records already present in the
    /// storage backend into the index registry.
    pub async fn bootstrap(config: ManagerConfig) -> Result<Self> {
        let storage: Arc<dyn StorageBackend> = config
            .storage
            .unwrap_or_else(|| Arc::new(MemoryBackend::new()));

        let registry = IndexRegistry::new(RegistryState::new(
            config.indexed_fields,
            config.max_cache_size,
            config.cache_policy,
        ));
        let handlers = HandlerRegistry::new();
        let engine = QueryEngine::new(registry.clone(), Arc::clone(&storage), handlers.clone());

        let shared = Arc::new(ManagerShared {
            registry,
            storage,
            engine,
            dispatcher: Arc::new(PluginDispatcher::new(config.dispatcher)),
            normalizer: PathNormalizer::new(config.case_insensitive, config.follow_symlinks),
            probe: SystemAttributeProbe::new(config.follow_symlinks),
            bus: EventBus::new(config.event_buffer),
            handlers,
            refresh_on_write: config.refresh_on_write,
            sync_roots: config.sync_roots,
            include_extensions: config.include_extensions,
            shutdown: CancellationToken::new(),
        });

        // Hydrate the registry from the durable copy. Paths are sorted so a
        // fresh bootstrap assigns insertion order deterministically.
        let mut rows = shared.storage.iter_all().await?;
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        {
            let mut state = shared.registry.write().await;
            for (path, record) in rows {
                state.upsert(&path, record);
            }
            info!(records = state.len(), "manager bootstrapped");
        }

        if let Some(interval) = config.auto_sync_interval {
            spawn_auto_sync(&shared, interval);
        }

        Ok(Self { shared })
    }

    /// Open an explicit transaction. Operations invoked on the returned
    /// handle commit or roll back together; dropping the handle without
    /// committing rolls back.
    pub async fn transaction(&self) -> Result<MetaTransaction> {
        MetaTransaction::begin(Arc::clone(&self.shared)).await
    }

    /// Register a file and attach `user_meta`. Fails with `DuplicateRecord`
    /// when a record for the canonical path already exists.
    pub async fn add_file(&self, path: &str, user_meta: Value) -> Result<MetadataRecord> {
        let mut txn = self.transaction().await?;
        match txn.add_file(path, user_meta).await {
            Ok(record) => {
                txn.commit().await?;
                Ok(record)
            }
            Err(err) => {
                abort(txn).await;
                Err(err)
            }
        }
    }

    /// Register a file, replacing any existing record wholesale.
    pub async fn upsert_file(&self, path: &str, user_meta: Value) -> Result<MetadataRecord> {
        let mut txn = self.transaction().await?;
        match txn.upsert_file(path, user_meta).await {
            Ok(record) => {
                txn.commit().await?;
                Ok(record)
            }
            Err(err) => {
                abort(txn).await;
                Err(err)
            }
        }
    }

    /// Fetch the full record for a path. Fails with `FileAccess` when the
    /// record is unknown.
    pub async fn get_metadata(&self, path: &str) -> Result<MetadataRecord> {
        let canonical = self.shared.normalizer.normalize(path).await?;
        let access = self.shared.registry.read().await.get(&canonical);
        match access {
            RecordAccess::Resident(record) => Ok(record),
            RecordAccess::Evicted => {
                let record = self
                    .shared
                    .storage
                    .get(&canonical)
                    .await?
                    .ok_or_else(|| unknown_record(&canonical))?;
                self.shared
                    .registry
                    .write()
                    .await
                    .repopulate(&canonical, record.clone());
                Ok(record)
            }
            RecordAccess::Missing => Err(unknown_record(&canonical)),
        }
    }

    /// Shallow-merge `patch` into the record's `user` tier.
    pub async fn update_metadata(&self, path: &str, patch: Value) -> Result<MetadataRecord> {
        let mut txn = self.transaction().await?;
        match txn.update_metadata(path, patch).await {
            Ok(record) => {
                txn.commit().await?;
                Ok(record)
            }
            Err(err) => {
                abort(txn).await;
                Err(err)
            }
        }
    }

    /// Replace the record's entire `user` tier.
    pub async fn replace_metadata(&self, path: &str, user_meta: Value) -> Result<MetadataRecord> {
        let mut txn = self.transaction().await?;
        match txn.replace_metadata(path, user_meta).await {
            Ok(record) => {
                txn.commit().await?;
                Ok(record)
            }
            Err(err) => {
                abort(txn).await;
                Err(err)
            }
        }
    }

    /// Re-run the probe and plugin dispatch, preserving `user`.
    pub async fn refresh(&self, path: &str) -> Result<MetadataRecord> {
        let mut txn = self.transaction().await?;
        match txn.refresh(path).await {
            Ok(record) => {
                txn.commit().await?;
                Ok(record)
            }
            Err(err) => {
                abort(txn).await;
                Err(err)
            }
        }
    }

    /// Remove a record; returns whether one existed.
    pub async fn delete_metadata(&self, path: &str) -> Result<bool> {
        let mut txn = self.transaction().await?;
        match txn.delete_metadata(path).await {
            Ok(existed) => {
                txn.commit().await?;
                Ok(existed)
            }
            Err(err) => {
                abort(txn).await;
                Err(err)
            }
        }
    }

    /// Execute a declarative query, returning a lazy stream of canonical
    /// paths in primary-insertion order.
    pub async fn search(&self, query: Value) -> Result<BoxStream<'static, Result<String>>> {
        let stream = self.shared.engine.search(&query).await?;
        Ok(Box::pin(stream.map_err(MetaError::from)))
    }

    /// Convenience wrapper collecting [`search`](Self::search) into a `Vec`.
    pub async fn search_collect(&self, query: Value) -> Result<Vec<String>> {
        self.search(query).await?.try_collect().await
    }

    /// Reconcile the index against the filesystem.
    pub async fn sync(&self) -> Result<SyncReport> {
        crate::sync::run_sync(&self.shared, None).await
    }

    /// Like [`sync`](Self::sync), with a cooperative cancellation token
    /// polled between records.
    pub async fn sync_with_cancel(&self, cancel: CancellationToken) -> Result<SyncReport> {
        crate::sync::run_sync(&self.shared, Some(cancel)).await
    }

    /// Remove records whose underlying file no longer exists; returns the
    /// number removed.
    pub async fn cleanup_orphaned(&self) -> Result<u64> {
        crate::sync::cleanup_orphaned(&self.shared).await
    }

    /// Register an extractor plugin.
    pub fn register_plugin(&self, plugin: Arc<dyn FilePlugin>) {
        self.shared.dispatcher.register(plugin);
    }

    /// Register a custom query handler for the post-filter pass.
    pub fn register_query_handler(&self, handler: Arc<dyn QueryHandler>) {
        self.shared.handlers.register(handler);
    }

    /// Declare a secondary index at runtime, backfilling it from existing
    /// records. Blocks writers for the duration of the pass.
    pub async fn create_index(&self, field: &str) -> Result<()> {
        let mut txn = self.transaction().await?;
        match txn.create_index(field).await {
            Ok(()) => txn.commit().await,
            Err(err) => {
                abort(txn).await;
                Err(err)
            }
        }
    }

    /// Register a synchronous listener invoked after each commit.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&MetaEvent) + Send + Sync + 'static,
    {
        self.shared.bus.add_listener(listener);
    }

    /// Broadcast receiver for committed events.
    pub fn subscribe(&self) -> Receiver<MetaEvent> {
        self.shared.bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Stop background work and flush the storage backend.
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.shutdown.cancel();
        self.shared.storage.flush().await?;
        debug!("manager shut down");
        Ok(())
    }
}

/// Roll back an aborted single-operation transaction, surfacing the
/// original error to the caller.
async fn abort(txn: MetaTransaction) {
    if let Err(err) = txn.rollback().await {
        warn!(error = %err, "rollback failed after aborted operation");
    }
}

impl Drop for FileMetaManager {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

fn spawn_auto_sync(shared: &Arc<ManagerShared>, interval: std::time::Duration) {
    let weak = Arc::downgrade(shared);
    let token = shared.shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the loop below waits a full
        // interval before the first sync.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(shared) = weak.upgrade() else { break };
            match crate::sync::run_sync(&shared, Some(token.clone())).await {
                Ok(report) => debug!(?report, "auto-sync pass complete"),
                Err(err) => warn!(error = %err, "auto-sync pass failed"),
            }
        }
    });
}

pub(crate) fn unknown_record(canonical: &str) -> MetaError {
    MetaError::FileAccess(format!("no metadata record for {canonical}"))
}
