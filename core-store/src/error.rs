use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown snapshot handle: {0}")]
    UnknownSnapshot(u64),

    #[error("Malformed record for {path}: {message}")]
    MalformedRecord { path: String, message: String },

    #[error("Corrupt store document at {path}: {message}")]
    CorruptDocument { path: String, message: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;
