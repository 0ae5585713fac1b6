//! System attribute probe.
//!
//! Reads the fixed-schema `system` tier for an existing file: size, the
//! three timestamps as epoch seconds with the sub-second component the
//! filesystem exposes, filename and lowercased extension. Platforms that
//! omit a timestamp get it populated from `modified`.

use crate::error::{ExtractError, Result};
use core_store::SystemMetadata;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Reads filesystem metadata for canonical paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAttributeProbe {
    follow_symlinks: bool,
}

impl SystemAttributeProbe {
    pub fn new(follow_symlinks: bool) -> Self {
        Self { follow_symlinks }
    }

    /// Probe `canonical`, failing with `FileAccess` when the path does not
    /// exist or cannot be read.
    pub async fn probe(&self, canonical: &str) -> Result<SystemMetadata> {
        let metadata = if self.follow_symlinks {
            tokio::fs::metadata(canonical).await
        } else {
            tokio::fs::symlink_metadata(canonical).await
        }
        .map_err(|err| ExtractError::FileAccess {
            path: canonical.to_string(),
            message: err.to_string(),
        })?;

        let path = Path::new(canonical);
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| ExtractError::FileAccess {
                path: canonical.to_string(),
                message: "path has no filename component".to_string(),
            })?;
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let modified = epoch_seconds(metadata.modified().ok()).unwrap_or(0.0);
        let created = epoch_seconds(metadata.created().ok()).unwrap_or(modified);
        let accessed = epoch_seconds(metadata.accessed().ok()).unwrap_or(modified);

        trace!(path = canonical, size = metadata.len(), "probed system attributes");

        Ok(SystemMetadata {
            path: canonical.to_string(),
            filename,
            extension,
            size: metadata.len(),
            created,
            modified,
            accessed,
        })
    }
}

fn epoch_seconds(time: Option<SystemTime>) -> Option<f64> {
    time?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs_f64())
}
