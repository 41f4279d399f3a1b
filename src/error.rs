use thiserror::Error;

/// Errors surfaced by the storage engine.
///
/// Variants map onto the failure classes named in the engine's error
/// handling design: transient I/O, corruption, cancellation, and the
/// handful of invariant violations that are fatal at this layer.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(String),

    #[error("extent corrupt in datafile {datafile} at offset {offset} (size {size}): {reason}")]
    Corruption {
        datafile: u32,
        offset: u64,
        size: u32,
        reason: String,
    },

    #[error("metric {0} not found")]
    MetricNotFound(String),

    #[error("page cache collision for metric {0} at start_time {1}")]
    CacheCollision(String, i64),

    #[error("query cancelled")]
    Cancelled,

    #[error("disk full")]
    DiskFull,

    #[error("invalid page: {0}")]
    InvalidPage(String),

    #[error("invalid extent: {0}")]
    InvalidExtent(String),

    #[error("collection refused: {0}")]
    PastCollection(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for EngineError {
    fn from(e: bincode::error::EncodeError) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for EngineError {
    fn from(e: bincode::error::DecodeError) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
