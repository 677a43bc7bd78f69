use thiserror::Error;

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("member not found: {0}")]
    MemberNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("reply generation failed: {0}")]
    Generation(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<GroupError> for reef_core::ReefError {
    fn from(e: GroupError) -> Self {
        match e {
            GroupError::GroupNotFound(id) => reef_core::ReefError::NotFound(format!("group {}", id)),
            GroupError::MemberNotFound(id) => {
                reef_core::ReefError::NotFound(format!("member {}", id))
            }
            GroupError::Cancelled => reef_core::ReefError::Cancelled,
            GroupError::Serialization(e) => reef_core::ReefError::Serialization(e),
            GroupError::Database(e) => reef_core::ReefError::Database(e.to_string()),
            GroupError::Generation(m) => reef_core::ReefError::Internal(m),
        }
    }
}

pub type Result<T> = std::result::Result<T, GroupError>;
