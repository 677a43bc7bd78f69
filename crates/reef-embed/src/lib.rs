pub mod error;
pub mod local;
pub mod provider;
pub mod registry;
pub mod remote;

pub use error::{EmbedError, Result};
pub use provider::EmbeddingProvider;
pub use registry::ModelRegistry;
