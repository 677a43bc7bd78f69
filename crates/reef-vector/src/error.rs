use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("Vector store unavailable: {0}")]
    Unavailable(String),

    #[error("write lock timeout after {secs}s on collection '{collection}'")]
    LockTimeout { collection: String, secs: u64 },

    #[error("synchronous add_documents is forbidden; use add_documents_async")]
    SyncWriteForbidden,

    #[error("dimension mismatch: index holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Embedding error: {0}")]
    Embedding(#[from] reef_embed::EmbedError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<VectorError> for reef_core::ReefError {
    fn from(e: VectorError) -> Self {
        match e {
            VectorError::Unavailable(m) => reef_core::ReefError::StoreUnavailable(m),
            VectorError::LockTimeout { collection, secs } => reef_core::ReefError::StoreUnavailable(
                format!("lock timeout after {}s on '{}'", secs, collection),
            ),
            VectorError::Embedding(e) => e.into(),
            other => reef_core::ReefError::StoreUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, VectorError>;
