use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReefError {
    #[error("Configuration error: {0}")]
    BadConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Task queue full: {queued} queued (max {max})")]
    QueueFull { queued: usize, max: usize },

    #[error("Vector store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Document parse failed: {0}")]
    ParseFailed(String),

    #[error("Unsupported document format: {extension}")]
    UnsupportedFormat { extension: String },

    #[error("Tool '{tool}' timed out after {secs}s")]
    ToolTimeout { tool: String, secs: u64 },

    #[error("Tool '{tool}' failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    #[error("LLM call timed out after {secs}s")]
    LlmTimeout { secs: u64 },

    #[error("Model '{model}' does not support tool calls")]
    LlmUnsupportedTools { model: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("retrieval result carried no reference marker")]
    ReferenceEmptyMarker,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReefError {
    /// Short error code string surfaced to clients.
    pub fn code(&self) -> &'static str {
        match self {
            ReefError::BadConfig(_) => "BAD_CONFIG",
            ReefError::NotFound(_) => "NOT_FOUND",
            ReefError::Conflict(_) => "CONFLICT",
            ReefError::QueueFull { .. } => "QUEUE_FULL",
            ReefError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            ReefError::ParseFailed(_) => "PARSE_FAILED",
            ReefError::UnsupportedFormat { .. } => "UNSUPPORTED_FORMAT",
            ReefError::ToolTimeout { .. } => "TOOL_TIMEOUT",
            ReefError::ToolFailed { .. } => "TOOL_FAILED",
            ReefError::LlmTimeout { .. } => "LLM_TIMEOUT",
            ReefError::LlmUnsupportedTools { .. } => "LLM_UNSUPPORTED_TOOLS",
            ReefError::Database(_) => "DATABASE_ERROR",
            ReefError::Serialization(_) => "SERIALIZATION_ERROR",
            ReefError::Io(_) => "IO_ERROR",
            ReefError::Cancelled => "CANCELLED",
            ReefError::ReferenceEmptyMarker => "REFERENCE_EMPTY_MARKER",
            ReefError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ReefError>;
