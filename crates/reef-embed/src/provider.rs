use async_trait::async_trait;

use crate::error::Result;

/// Common interface for all embedding backends.
///
/// Both methods are safe to call from worker pools; HTTP providers do their
/// own I/O, the local provider is pure CPU.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Output vector dimensionality.
    fn dimensions(&self) -> usize;

    /// Embed a batch of document chunks.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query string.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_documents(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| crate::EmbedError::Parse("empty embedding response".into()))
    }
}
