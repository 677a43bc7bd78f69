pub mod capability;
pub mod citations;
pub mod error;
pub mod framing;
pub mod orchestrator;
pub mod stats;
pub mod stream;

pub use capability::{CapabilityCache, CapabilityMemory, InMemoryCapabilityCache};
pub use citations::CitationTracker;
pub use error::{ChatError, ChatResult};
pub use orchestrator::{StreamingOrchestrator, StreamingState, TurnOutcome, TurnRequest};
pub use stream::{ChatService, StreamEvent};
