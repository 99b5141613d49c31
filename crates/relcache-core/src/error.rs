use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Not cached: {0}")]
    NotCached(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Materialization error: {0}")]
    Materialization(String),

    #[error("Eviction did not complete within {waited_ms} ms ({remaining} blocks outstanding)")]
    EvictionTimeout { waited_ms: u64, remaining: usize },

    #[error("Encoded value of {bytes} bytes exceeds the {limit} byte guard")]
    EncodingOverflow { bytes: usize, limit: usize },

    #[error("Block unavailable: {0}")]
    BlockUnavailable(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

pub type Result<T> = std::result::Result<T, CacheError>;
