use core_extract::ExtractError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("File access error: {0}")]
    FileAccess(String),

    #[error("Duplicate record: {0}")]
    DuplicateRecord(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Storage error: {0}")]
    Storage(#[from] core_store::StorageError),

    #[error("Query error: {0}")]
    Query(#[from] core_index::QueryError),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ExtractError> for MetaError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::InvalidPath(message) => MetaError::InvalidPath(message),
            ExtractError::FileAccess { .. } => MetaError::FileAccess(err.to_string()),
            ExtractError::Plugin { .. } | ExtractError::PluginTimeout { .. } => {
                MetaError::Plugin(err.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, MetaError>;
