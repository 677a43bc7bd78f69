use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Configuration error: {0}")]
    BadConfig(String),

    #[error("Model not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Embedding API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<EmbedError> for reef_core::ReefError {
    fn from(e: EmbedError) -> Self {
        match e {
            EmbedError::BadConfig(m) => reef_core::ReefError::BadConfig(m),
            EmbedError::NotFound(m) => reef_core::ReefError::NotFound(m),
            other => reef_core::ReefError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EmbedError>;
