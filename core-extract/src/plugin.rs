//! File plugin contract.
//!
//! A plugin is a capability pair: `supports` decides by path name whether
//! the plugin applies, `extract` produces additional metadata for the
//! record's `plugin` tier. No inheritance hierarchy; the dispatcher
//! enumerates registered capabilities at dispatch time.

use crate::error::Result;
use async_trait::async_trait;
use core_store::JsonMap;

/// Capability bundle producing extra metadata for supported files.
#[async_trait]
pub trait FilePlugin: Send + Sync {
    /// Identifier used in logs and failure reports.
    fn name(&self) -> &str;

    /// Dispatch priority; higher runs first, ties break by registration
    /// order.
    fn priority(&self) -> i32 {
        0
    }

    /// Whether this plugin applies to `path`. Must be a pure name check and
    /// must not read the file's contents.
    fn supports(&self, path: &str) -> bool;

    /// Extract metadata from the file. May read the file; must be
    /// re-entrant, since extraction runs concurrently on a worker pool.
    async fn extract(&self, path: &str) -> Result<JsonMap>;
}
