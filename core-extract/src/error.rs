use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("File access error for {path}: {message}")]
    FileAccess { path: String, message: String },

    #[error("Plugin '{plugin}' failed: {message}")]
    Plugin { plugin: String, message: String },

    #[error("Plugin '{plugin}' timed out after {timeout_ms}ms")]
    PluginTimeout { plugin: String, timeout_ms: u64 },
}

pub type Result<T> = std::result::Result<T, ExtractError>;
