//! Manager configuration.
//!
//! A builder-constructed bundle of everything the manager composes: the
//! storage backend handle, normalizer flags, declared secondary indexes,
//! plugin dispatch settings, cache policy, sync roots and filters, and the
//! optional auto-sync interval. Validation is fail-fast: `build()` rejects
//! inconsistent settings before any component is constructed.

use crate::error::{MetaError, Result};
use core_extract::DispatcherConfig;
use core_index::CachePolicy;
use core_store::StorageBackend;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for [`crate::FileMetaManager`].
#[derive(Clone)]
pub struct ManagerConfig {
    /// Storage backend; defaults to the in-memory backend.
    pub storage: Option<Arc<dyn StorageBackend>>,

    /// Case-fold canonical paths (for case-insensitive filesystems).
    pub case_insensitive: bool,

    /// Resolve symlinks during normalization and probing.
    pub follow_symlinks: bool,

    /// Dotted field names to maintain secondary indexes for.
    pub indexed_fields: Vec<String>,

    /// Plugin dispatch settings (pool size, timeout, policies).
    pub dispatcher: DispatcherConfig,

    /// Bound on resident record bodies; `None` keeps everything resident.
    pub max_cache_size: Option<usize>,

    /// Eviction policy applied when `max_cache_size` is set.
    pub cache_policy: CachePolicy,

    /// Re-run the probe and plugin dispatch on `update`/`replace` writes.
    pub refresh_on_write: bool,

    /// Roots walked recursively by sync. Empty means "the directories
    /// containing indexed files", listed non-recursively.
    pub sync_roots: Vec<PathBuf>,

    /// Extension allow-list for files discovered by sync (lowercase, no
    /// leading dot). `None` admits every file.
    pub include_extensions: Option<Vec<String>>,

    /// Run `sync()` on this interval in a background task.
    pub auto_sync_interval: Option<Duration>,

    /// Event bus broadcast buffer size.
    pub event_buffer: usize,
}

impl ManagerConfig {
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("storage", &self.storage.as_ref().map(|_| "StorageBackend { ... }"))
            .field("case_insensitive", &self.case_insensitive)
            .field("follow_symlinks", &self.follow_symlinks)
            .field("indexed_fields", &self.indexed_fields)
            .field("dispatcher", &self.dispatcher)
            .field("max_cache_size", &self.max_cache_size)
            .field("cache_policy", &self.cache_policy)
            .field("refresh_on_write", &self.refresh_on_write)
            .field("sync_roots", &self.sync_roots)
            .field("include_extensions", &self.include_extensions)
            .field("auto_sync_interval", &self.auto_sync_interval)
            .field("event_buffer", &self.event_buffer)
            .finish()
    }
}

/// Builder for [`ManagerConfig`].
#[derive(Default)]
pub struct ManagerConfigBuilder {
    storage: Option<Arc<dyn StorageBackend>>,
    case_insensitive: bool,
    follow_symlinks: bool,
    indexed_fields: Vec<String>,
    dispatcher: Option<DispatcherConfig>,
    max_cache_size: Option<usize>,
    cache_policy: Option<CachePolicy>,
    refresh_on_write: bool,
    sync_roots: Vec<PathBuf>,
    include_extensions: Option<Vec<String>>,
    auto_sync_interval: Option<Duration>,
    event_buffer: Option<usize>,
}

impl ManagerConfigBuilder {
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn case_insensitive(mut self, enabled: bool) -> Self {
        self.case_insensitive = enabled;
        self
    }

    pub fn follow_symlinks(mut self, enabled: bool) -> Self {
        self.follow_symlinks = enabled;
        self
    }

    /// Declare a secondary index on a dotted field name.
    pub fn index(mut self, field: impl Into<String>) -> Self {
        self.indexed_fields.push(field.into());
        self
    }

    pub fn dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn max_cache_size(mut self, size: usize) -> Self {
        self.max_cache_size = Some(size);
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    pub fn refresh_on_write(mut self, enabled: bool) -> Self {
        self.refresh_on_write = enabled;
        self
    }

    /// Add a root directory that sync walks recursively.
    pub fn sync_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sync_roots.push(root.into());
        self
    }

    /// Restrict sync discovery to the given extensions.
    pub fn include_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_extensions = Some(
            extensions
                .into_iter()
                .map(|ext| ext.into().trim_start_matches('.').to_lowercase())
                .collect(),
        );
        self
    }

    pub fn auto_sync(mut self, interval: Duration) -> Self {
        self.auto_sync_interval = Some(interval);
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = Some(capacity);
        self
    }

    pub fn build(self) -> Result<ManagerConfig> {
        if self.event_buffer == Some(0) {
            return Err(MetaError::Config(
                "event_buffer must be at least 1".to_string(),
            ));
        }
        if self.max_cache_size == Some(0) {
            return Err(MetaError::Config(
                "max_cache_size must be at least 1".to_string(),
            ));
        }
        if let Some(interval) = self.auto_sync_interval {
            if interval.is_zero() {
                return Err(MetaError::Config(
                    "auto_sync interval must be non-zero".to_string(),
                ));
            }
        }
        let cache_policy = self.cache_policy.unwrap_or_default();
        if self.max_cache_size.is_some() && cache_policy == CachePolicy::None {
            return Err(MetaError::Config(
                "max_cache_size requires an eviction policy (lru or lfu)".to_string(),
            ));
        }

        Ok(ManagerConfig {
            storage: self.storage,
            case_insensitive: self.case_insensitive,
            follow_symlinks: self.follow_symlinks,
            indexed_fields: self.indexed_fields,
            dispatcher: self.dispatcher.unwrap_or_default(),
            max_cache_size: self.max_cache_size,
            cache_policy,
            refresh_on_write: self.refresh_on_write,
            sync_roots: self.sync_roots,
            include_extensions: self.include_extensions,
            auto_sync_interval: self.auto_sync_interval,
            event_buffer: self.event_buffer.unwrap_or(100),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_cleanly() {
        let config = ManagerConfig::builder().build().unwrap();
        assert!(config.storage.is_none());
        assert!(!config.case_insensitive);
        assert_eq!(config.event_buffer, 100);
        assert_eq!(config.cache_policy, CachePolicy::None);
    }

    #[test]
    fn extensions_are_normalized() {
        let config = ManagerConfig::builder()
            .include_extensions([".PNG", "Txt"])
            .build()
            .unwrap();
        assert_eq!(
            config.include_extensions,
            Some(vec!["png".to_string(), "txt".to_string()])
        );
    }

    #[test]
    fn cache_cap_requires_a_policy() {
        let err = ManagerConfig::builder()
            .max_cache_size(10)
            .build()
            .unwrap_err();
        assert!(matches!(err, MetaError::Config(_)));

        ManagerConfig::builder()
            .max_cache_size(10)
            .cache_policy(CachePolicy::Lru)
            .build()
            .unwrap();
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(ManagerConfig::builder().event_buffer(0).build().is_err());
        assert!(ManagerConfig::builder()
            .auto_sync(Duration::ZERO)
            .build()
            .is_err());
    }
}
