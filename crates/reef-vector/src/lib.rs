pub mod backend;
pub mod error;
pub mod locked;
pub mod naming;
pub mod registry;

pub use backend::{SearchHit, SqliteVectorStore, VectorChunk};
pub use error::{Result, VectorError};
pub use locked::LockedVectorStore;
pub use registry::{VectorStoreKey, VectorStoreRegistry};
