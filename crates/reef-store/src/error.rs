use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Not found: {kind} {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for reef_core::ReefError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { kind, id } => {
                reef_core::ReefError::NotFound(format!("{} {}", kind, id))
            }
            StoreError::Conflict(msg) => reef_core::ReefError::Conflict(msg),
            StoreError::Serialization(e) => reef_core::ReefError::Serialization(e),
            StoreError::Database(e) => reef_core::ReefError::Database(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
