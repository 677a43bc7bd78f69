pub mod error;
pub mod handler;
pub mod parsers;
pub mod pipeline;
pub mod splitter;

pub use error::{IngestError, Result};
pub use handler::{IngestDocumentHandler, IngestTaskPayload, INGEST_TASK_TYPE};
pub use parsers::{ParsedDocument, ParserFactory, ParserPool};
pub use pipeline::{IngestReport, IngestRequest, IngestionPipeline};
pub use splitter::RecursiveCharacterSplitter;
