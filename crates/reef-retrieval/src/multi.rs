use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{error, info};

use reef_core::types::DistanceMetric;
use reef_vector::LockedVectorStore;

use crate::single::{RetrievalResult, Retriever};

/// Concurrent single-KB retrievals in flight at once.
const MAX_CONCURRENT_KB: usize = 5;
/// Hard cap on per-KB take regardless of caller input.
const MAX_TOP_K_PER_KB: usize = 10;
/// Last-resort threshold when neither the KB nor the session provides one.
const DEFAULT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    WeightedScore,
    SimpleConcat,
    Interleave,
}

/// One knowledge base to search: its handle plus scoring config.
pub struct RetrievalTarget {
    pub store: Arc<LockedVectorStore>,
    pub metric: DistanceMetric,
    pub kb_id: String,
    pub kb_name: String,
    /// KB-level threshold; overrides the session default.
    pub threshold: Option<f64>,
}

/// Multi-collection retrieval: dispatch per-KB searches concurrently under a
/// semaphore, isolate per-KB failures, and merge with content-hash
/// deduplication.
pub struct MultiKbRetriever {
    permits: Arc<Semaphore>,
}

impl Default for MultiKbRetriever {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiKbRetriever {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_KB)),
        }
    }

    /// `session_threshold` is the fallback when a KB carries no threshold of
    /// its own; 0.5 is the final default.
    pub async fn retrieve(
        &self,
        query: &str,
        targets: &[RetrievalTarget],
        top_k_per_kb: usize,
        session_threshold: Option<f64>,
        strategy: MergeStrategy,
        final_top_k: usize,
    ) -> Vec<RetrievalResult> {
        if targets.is_empty() {
            return Vec::new();
        }
        let top_k = top_k_per_kb.clamp(1, MAX_TOP_K_PER_KB);

        let futures = targets.iter().map(|target| {
            let permits = self.permits.clone();
            let retriever = Retriever::new(
                target.store.clone(),
                target.metric,
                target.kb_id.clone(),
                target.kb_name.clone(),
            );
            let threshold = target
                .threshold
                .or(session_threshold)
                .unwrap_or(DEFAULT_THRESHOLD);
            let kb_name = target.kb_name.clone();
            async move {
                let _permit = permits.acquire_owned().await.unwrap();
                match retriever.search(query, top_k, Some(threshold)).await {
                    Ok(results) => results,
                    Err(e) => {
                        // A single KB failure never fails the whole call.
                        error!(kb = %kb_name, "kb retrieval failed: {e}");
                        Vec::new()
                    }
                }
            }
        });
        let per_kb: Vec<Vec<RetrievalResult>> = join_all(futures).await;

        let merged = match strategy {
            MergeStrategy::WeightedScore => merge_weighted(per_kb, final_top_k),
            MergeStrategy::SimpleConcat => merge_concat(per_kb, final_top_k),
            MergeStrategy::Interleave => merge_interleave(per_kb, final_top_k),
        };
        info!(
            kb_count = targets.len(),
            strategy = ?strategy,
            results = merged.len(),
            "multi-kb retrieval complete"
        );
        merged
    }
}

fn content_hash(content: &str) -> String {
    format!("{:x}", md5::compute(content.as_bytes()))
}

/// Dedup by content hash keeping the max-scoring version.
fn dedup_keep_max(results: Vec<RetrievalResult>) -> Vec<RetrievalResult> {
    let mut by_hash: HashMap<String, RetrievalResult> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for result in results {
        let hash = content_hash(&result.content);
        match by_hash.get(&hash) {
            Some(existing) if existing.score >= result.score => {}
            Some(_) => {
                by_hash.insert(hash, result);
            }
            None => {
                order.push(hash.clone());
                by_hash.insert(hash, result);
            }
        }
    }
    order.into_iter().filter_map(|h| by_hash.remove(&h)).collect()
}

/// Dedup by content hash, first occurrence wins.
fn dedup_keep_first(results: Vec<RetrievalResult>) -> Vec<RetrievalResult> {
    let mut seen = std::collections::HashSet::new();
    results
        .into_iter()
        .filter(|r| seen.insert(content_hash(&r.content)))
        .collect()
}

fn merge_weighted(per_kb: Vec<Vec<RetrievalResult>>, final_top_k: usize) -> Vec<RetrievalResult> {
    let all: Vec<RetrievalResult> = per_kb.into_iter().flatten().collect();
    let mut deduped = dedup_keep_max(all);
    deduped.sort_by(|a, b| b.score.total_cmp(&a.score));
    deduped.truncate(final_top_k);
    deduped
}

fn merge_concat(per_kb: Vec<Vec<RetrievalResult>>, final_top_k: usize) -> Vec<RetrievalResult> {
    let all: Vec<RetrievalResult> = per_kb.into_iter().flatten().collect();
    let mut deduped = dedup_keep_first(all);
    deduped.truncate(final_top_k);
    deduped
}

fn merge_interleave(per_kb: Vec<Vec<RetrievalResult>>, final_top_k: usize) -> Vec<RetrievalResult> {
    let max_len = per_kb.iter().map(|r| r.len()).max().unwrap_or(0);
    let mut round_robin = Vec::new();
    let mut per_kb: Vec<std::vec::IntoIter<RetrievalResult>> =
        per_kb.into_iter().map(|v| v.into_iter()).collect();
    for _ in 0..max_len {
        for iter in per_kb.iter_mut() {
            if let Some(item) = iter.next() {
                round_robin.push(item);
            }
        }
    }
    let mut deduped = dedup_keep_first(round_robin);
    deduped.truncate(final_top_k);
    deduped
}
