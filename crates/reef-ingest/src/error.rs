use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported format: {extension}")]
    UnsupportedFormat { extension: String },

    #[error("parse failed: {0}")]
    ParseFailed(String),

    #[error("Store error: {0}")]
    Store(#[from] reef_store::StoreError),

    #[error("Vector error: {0}")]
    Vector(#[from] reef_vector::VectorError),

    #[error("Embedding error: {0}")]
    Embed(#[from] reef_embed::EmbedError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ingestion cancelled")]
    Cancelled,
}

impl From<IngestError> for reef_core::ReefError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::UnsupportedFormat { extension } => {
                reef_core::ReefError::UnsupportedFormat { extension }
            }
            IngestError::ParseFailed(m) => reef_core::ReefError::ParseFailed(m),
            IngestError::Cancelled => reef_core::ReefError::Cancelled,
            IngestError::Store(e) => e.into(),
            IngestError::Vector(e) => e.into(),
            IngestError::Embed(e) => e.into(),
            IngestError::Serialization(e) => reef_core::ReefError::Serialization(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
