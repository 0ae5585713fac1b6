//! Path normalization into canonical primary keys.
//!
//! Canonical paths are absolute, use `/` separators internally, and have
//! `.`/`..` segments collapsed lexically. Symlinks are only resolved when the
//! normalizer is configured to follow them; case folding is applied only in
//! case-insensitive mode. Two inputs that normalize to the same canonical
//! path refer to the same record.

use crate::error::{ExtractError, Result};
use std::path::{Component, Path, PathBuf};

/// Canonicalizes file paths into primary keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathNormalizer {
    case_insensitive: bool,
    follow_symlinks: bool,
}

impl PathNormalizer {
    pub fn new(case_insensitive: bool, follow_symlinks: bool) -> Self {
        Self {
            case_insensitive,
            follow_symlinks,
        }
    }

    /// Produce the canonical form of `input`.
    ///
    /// Relative paths resolve against the process working directory at call
    /// time. Fails with `InvalidPath` for empty input or reserved characters
    /// on the host OS.
    pub async fn normalize(&self, input: &str) -> Result<String> {
        if input.is_empty() {
            return Err(ExtractError::InvalidPath("path is empty".to_string()));
        }
        validate_characters(input)?;

        let absolute = if Path::new(input).is_absolute() {
            PathBuf::from(input)
        } else {
            let cwd = std::env::current_dir()
                .map_err(|err| ExtractError::InvalidPath(err.to_string()))?;
            cwd.join(input)
        };

        let resolved = if self.follow_symlinks {
            // Resolution requires the file to exist; fall back to the
            // lexical form for paths that do not (yet).
            match tokio::fs::canonicalize(&absolute).await {
                Ok(real) => real,
                Err(_) => absolute,
            }
        } else {
            absolute
        };

        let mut canonical = collapse_lexically(&resolved);
        if self.case_insensitive {
            canonical = canonical.to_lowercase();
        }
        Ok(canonical)
    }
}

fn validate_characters(input: &str) -> Result<()> {
    if input.contains('\0') {
        return Err(ExtractError::InvalidPath(
            "path contains a NUL byte".to_string(),
        ));
    }
    #[cfg(windows)]
    {
        // Reserved on NTFS/FAT outside the drive designator.
        let body = input.get(2..).unwrap_or(input);
        if body.chars().any(|c| matches!(c, '<' | '>' | '"' | '|' | '?' | '*')) {
            return Err(ExtractError::InvalidPath(
                "path contains a reserved character".to_string(),
            ));
        }
    }
    Ok(())
}

/// Collapse `.` and `..` segments without touching the filesystem and join
/// with `/` separators. `..` at the root stays at the root.
fn collapse_lexically(path: &Path) -> String {
    let mut prefix = String::new();
    let mut segments: Vec<String> = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(p) => {
                prefix = p.as_os_str().to_string_lossy().replace('\\', "/");
            }
            Component::RootDir => {}
            Component::CurDir => {}
            Component::ParentDir => {
                segments.pop();
            }
            Component::Normal(segment) => {
                segments.push(segment.to_string_lossy().into_owned());
            }
        }
    }

    format!("{prefix}/{}", segments.join("/"))
}
