use async_trait::async_trait;
use tokio::sync::mpsc;

use reef_core::types::{Message, ToolCall};
use reef_tools::ToolDecl;

use crate::error::ChatResult;

/// Events emitted while streaming a model response. Exactly one `Done` or
/// one `ToolCalls` terminates a single streaming call.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental answer text, forwarded to the client verbatim.
    ContentDelta { text: String },

    /// The model wants tools executed; the tool loop takes over.
    ToolCalls { calls: Vec<ToolCall> },

    /// Stream completed without further tool calls.
    Done { reason: String },
}

/// Capability seam over concrete model services.
///
/// Implementations answer the capability query instead of relying on
/// inheritance: the orchestrator only attaches tools when both the service
/// and the capability memory say yes.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// Whether this service has a tool-calling entry point at all.
    fn supports_tool_calls(&self) -> bool {
        true
    }

    /// Stream a plain completion (no tools attached).
    async fn stream_plain(
        &self,
        messages: Vec<Message>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> ChatResult<()>;

    /// Stream with tool declarations attached. Services for models that
    /// reject tools return `ChatError::ToolsUnsupported`.
    async fn stream_with_tools(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDecl>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> ChatResult<()>;
}
