use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use reef_core::types::DistanceMetric;
use reef_vector::LockedVectorStore;

use crate::score::score_from_distance;

/// One retrieved chunk with its provenance, as surfaced to tools and
/// citations.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub content: String,
    pub score: f64,
    pub distance: f64,
    pub metadata: serde_json::Value,
    pub kb_id: String,
    pub kb_name: String,
    pub chunk_id: Option<String>,
    pub doc_id: Option<String>,
    pub document_name: Option<String>,
}

/// Single-collection similarity search with distance→score conversion and
/// threshold filtering.
pub struct Retriever {
    store: Arc<LockedVectorStore>,
    metric: DistanceMetric,
    kb_id: String,
    kb_name: String,
}

impl Retriever {
    pub fn new(
        store: Arc<LockedVectorStore>,
        metric: DistanceMetric,
        kb_id: impl Into<String>,
        kb_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            metric,
            kb_id: kb_id.into(),
            kb_name: kb_name.into(),
        }
    }

    /// Returns results with `score >= threshold` (when given), sorted by
    /// score descending.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        threshold: Option<f64>,
    ) -> reef_vector::Result<Vec<RetrievalResult>> {
        let hits = self.store.similarity_search_with_score(query, k).await?;
        let mut results: Vec<RetrievalResult> = hits
            .into_iter()
            .map(|hit| {
                let score = score_from_distance(hit.distance, self.metric);
                let meta = &hit.metadata;
                RetrievalResult {
                    content: hit.text,
                    score,
                    distance: hit.distance,
                    kb_id: self.kb_id.clone(),
                    kb_name: self.kb_name.clone(),
                    chunk_id: meta
                        .get("chunk_id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .or(Some(hit.chunk_id)),
                    doc_id: meta
                        .get("doc_id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    document_name: meta
                        .get("filename")
                        .or_else(|| meta.get("source"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    metadata: hit.metadata,
                }
            })
            .filter(|r| threshold.map_or(true, |t| r.score >= t))
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        debug!(
            kb = %self.kb_name,
            k,
            threshold = ?threshold,
            hits = results.len(),
            "retrieval complete"
        );
        Ok(results)
    }
}
