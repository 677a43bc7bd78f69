pub mod multi;
pub mod score;
pub mod single;

pub use multi::{MergeStrategy, MultiKbRetriever, RetrievalTarget};
pub use score::score_from_distance;
pub use single::{RetrievalResult, Retriever};
