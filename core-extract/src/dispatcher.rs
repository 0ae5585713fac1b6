//! Plugin registry and dispatch pipeline.
//!
//! Plugins are held in a list ordered by descending priority with ties
//! broken by registration order. Dispatch collects every plugin whose
//! `supports` accepts the path, runs their extractions concurrently on a
//! semaphore-bounded worker pool with a per-plugin timeout, joins all
//! results, and combines the outputs under the configured conflict policy.
//!
//! Failures are supervised per `PluginErrorMode`: `Ignore` drops the
//! contribution silently, `Warn` drops it and records the failure, `Raise`
//! fails the containing operation.

use crate::error::{ExtractError, Result};
use crate::plugin::FilePlugin;
use core_store::JsonMap;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// How outputs from multiple supporting plugins are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Higher-priority plugin's keys win.
    #[default]
    Priority,
    /// Shallow union; on collision higher priority wins, but nested
    /// mappings are merged recursively.
    Merge,
    /// Only the first matching plugin runs.
    FirstOnly,
    /// Only the last matching plugin runs.
    LastOnly,
}

/// How plugin failures are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PluginErrorMode {
    /// Drop the failing plugin's contribution silently.
    Ignore,
    /// Drop the contribution and record the failure.
    #[default]
    Warn,
    /// Fail the containing operation.
    Raise,
}

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker pool bound for concurrent extraction.
    pub max_workers: usize,
    /// Per-plugin extraction timeout.
    pub plugin_timeout: Duration,
    pub error_mode: PluginErrorMode,
    pub conflict_policy: ConflictPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            plugin_timeout: Duration::from_secs(30),
            error_mode: PluginErrorMode::default(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

/// One dropped plugin contribution, reported under `Warn` mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginFailure {
    pub plugin: String,
    pub message: String,
}

/// Combined dispatch result for one path.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    /// The record's new `plugin` tier.
    pub metadata: JsonMap,
    /// Failures recorded under `Warn` mode.
    pub failures: Vec<PluginFailure>,
}

/// Ordered plugin registry with a bounded extraction pool.
pub struct PluginDispatcher {
    plugins: RwLock<Vec<Arc<dyn FilePlugin>>>,
    semaphore: Arc<Semaphore>,
    config: DispatcherConfig,
}

impl PluginDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
            semaphore: Arc::new(Semaphore::new(config.max_workers.max(1))),
            config,
        }
    }

    /// Register a plugin, keeping the list sorted by descending priority.
    /// The sort is stable, so equal priorities keep registration order.
    pub fn register(&self, plugin: Arc<dyn FilePlugin>) {
        let mut plugins = self
            .plugins
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        plugins.push(plugin);
        plugins.sort_by_key(|plugin| std::cmp::Reverse(plugin.priority()));
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Run every supporting plugin for `path` and combine the outputs.
    pub async fn dispatch(&self, path: &str) -> Result<DispatchOutcome> {
        let plugins: Vec<Arc<dyn FilePlugin>> = self
            .plugins
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut failures = Vec::new();
        let mut supporting = Vec::new();
        for plugin in plugins {
            match catch_unwind(AssertUnwindSafe(|| plugin.supports(path))) {
                Ok(true) => supporting.push(plugin),
                Ok(false) => {}
                Err(_) => {
                    self.handle_failure(
                        &mut failures,
                        PluginFailure {
                            plugin: plugin.name().to_string(),
                            message: "supports probe panicked".to_string(),
                        },
                    )?;
                }
            }
        }

        let selected: Vec<Arc<dyn FilePlugin>> = match self.config.conflict_policy {
            ConflictPolicy::FirstOnly => supporting.into_iter().take(1).collect(),
            ConflictPolicy::LastOnly => supporting.into_iter().last().into_iter().collect(),
            _ => supporting,
        };

        if selected.is_empty() {
            return Ok(DispatchOutcome {
                metadata: JsonMap::new(),
                failures,
            });
        }

        let tasks: Vec<_> = selected
            .iter()
            .map(|plugin| {
                let plugin = Arc::clone(plugin);
                let path = path.to_string();
                let semaphore = Arc::clone(&self.semaphore);
                let timeout = self.config.plugin_timeout;
                tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return Err(ExtractError::Plugin {
                                plugin: plugin.name().to_string(),
                                message: "worker pool closed".to_string(),
                            })
                        }
                    };
                    match tokio::time::timeout(timeout, plugin.extract(&path)).await {
                        Ok(result) => result,
                        Err(_) => Err(ExtractError::PluginTimeout {
                            plugin: plugin.name().to_string(),
                            timeout_ms: timeout.as_millis() as u64,
                        }),
                    }
                })
            })
            .collect();

        let joined = futures::future::join_all(tasks).await;

        // Contributions in priority order; failed plugins drop out here.
        let mut contributions: Vec<JsonMap> = Vec::new();
        for (plugin, join_result) in selected.iter().zip(joined) {
            let name = plugin.name().to_string();
            match join_result {
                Ok(Ok(map)) => contributions.push(map),
                Ok(Err(err)) => {
                    self.handle_failure(
                        &mut failures,
                        PluginFailure {
                            plugin: name,
                            message: err.to_string(),
                        },
                    )?;
                }
                Err(join_err) => {
                    let message = if join_err.is_panic() {
                        "extract panicked".to_string()
                    } else {
                        join_err.to_string()
                    };
                    self.handle_failure(
                        &mut failures,
                        PluginFailure {
                            plugin: name,
                            message,
                        },
                    )?;
                }
            }
        }

        Ok(DispatchOutcome {
            metadata: combine(contributions, self.config.conflict_policy),
            failures,
        })
    }

    fn handle_failure(
        &self,
        failures: &mut Vec<PluginFailure>,
        failure: PluginFailure,
    ) -> Result<()> {
        match self.config.error_mode {
            PluginErrorMode::Ignore => {
                debug!(plugin = failure.plugin, message = failure.message, "plugin failed; ignoring");
            }
            PluginErrorMode::Warn => {
                warn!(plugin = failure.plugin, message = failure.message, "plugin failed; dropping contribution");
                failures.push(failure);
            }
            PluginErrorMode::Raise => {
                return Err(ExtractError::Plugin {
                    plugin: failure.plugin,
                    message: failure.message,
                });
            }
        }
        Ok(())
    }
}

/// Combine per-plugin outputs, highest priority first.
fn combine(contributions: Vec<JsonMap>, policy: ConflictPolicy) -> JsonMap {
    let mut result = JsonMap::new();
    for map in contributions {
        for (key, value) in map {
            match result.get_mut(&key) {
                None => {
                    result.insert(key, value);
                }
                Some(existing) if policy == ConflictPolicy::Merge => {
                    merge_value(existing, value);
                }
                // Higher-priority value already present wins.
                Some(_) => {}
            }
        }
    }
    result
}

/// Recursive merge for nested mappings; the existing (higher-priority)
/// value wins on scalar collisions.
fn merge_value(existing: &mut Value, incoming: Value) {
    if let (Value::Object(high), Value::Object(low)) = (existing, incoming) {
        for (key, value) in low {
            match high.get_mut(&key) {
                Some(entry) => merge_value(entry, value),
                None => {
                    high.insert(key, value);
                }
            }
        }
    }
}
