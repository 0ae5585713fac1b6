use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    #[error("Invalid operand for {operator}: {message}")]
    InvalidOperand { operator: String, message: String },

    #[error("Invalid regular expression: {0}")]
    InvalidRegex(String),

    #[error("Malformed query: {0}")]
    Malformed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] core_store::StorageError),
}

pub type Result<T> = std::result::Result<T, QueryError>;
