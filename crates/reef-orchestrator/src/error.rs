use thiserror::Error;

/// Errors surfaced by chat services and the tool loop.
///
/// `ToolsUnsupported` is a dedicated sentinel: only it feeds the negative
/// capability cache, so transient network or API failures can never poison
/// the "model does not support tools" memory.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("model '{model}' does not support tool calls")]
    ToolsUnsupported { model: String },

    #[error("LLM call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ChatError> for reef_core::ReefError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::ToolsUnsupported { model } => {
                reef_core::ReefError::LlmUnsupportedTools { model }
            }
            ChatError::Timeout { secs } => reef_core::ReefError::LlmTimeout { secs },
            ChatError::Cancelled => reef_core::ReefError::Cancelled,
            ChatError::Serialization(e) => reef_core::ReefError::Serialization(e),
            other => reef_core::ReefError::Internal(other.to_string()),
        }
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
