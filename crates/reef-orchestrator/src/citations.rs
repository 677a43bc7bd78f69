use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use reef_core::types::{LeanCitation, RichCitation};

/// One emitted increment: the new (rich, lean) pairs for this round, sorted
/// by `ref_marker` ascending.
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceBatch {
    pub rich: Vec<RichCitation>,
    pub lean: Vec<LeanCitation>,
}

/// Per-turn citation state: accumulates knowledge-base search results,
/// deduplicates globally, and assigns stable `ref_marker` numbers.
///
/// Markers are contiguous 1..N over the union of batches for the turn; once
/// a `ref_id` has been emitted its marker never changes, and it is never
/// emitted again.
#[derive(Default)]
pub struct CitationTracker {
    pending: Vec<(RichCitation, LeanCitation)>,
    sent_ref_ids: HashSet<String>,
    sent_hashes: HashSet<String>,
    last_marker: u32,
    emitted_rich: Vec<RichCitation>,
}

impl CitationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `search_knowledge_base` tool result and accumulate citation
    /// pairs. Items without content are dropped with a warning (the
    /// reference would carry no marker target). Returns how many items were
    /// absorbed.
    pub fn absorb_tool_result(&mut self, result_json: &str) -> usize {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(result_json) else {
            warn!("tool result is not JSON; no citations extracted");
            return 0;
        };
        if !value.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
            return 0;
        }
        let Some(items) = value.get("results").and_then(|v| v.as_array()) else {
            return 0;
        };

        let mut absorbed = 0;
        for item in items {
            let content = item
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if content.is_empty() {
                warn!("retrieval item without content dropped");
                continue;
            }
            let meta = item.get("metadata").cloned().unwrap_or(serde_json::json!({}));
            let score = item.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let chunk_id = meta
                .get("chunk_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let ref_id = if chunk_id.is_empty() {
                format!("{:x}", md5::compute(content.as_bytes()))
            } else {
                chunk_id.clone()
            };

            let str_of = |key: &str| {
                meta.get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            let document_name = meta
                .get("source")
                .or_else(|| meta.get("filename"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            let lean = LeanCitation {
                ref_id,
                ref_marker: 0, // placeholder until the global dedup pass
                document_id: if str_of("document_id").is_empty() {
                    document_name.clone()
                } else {
                    str_of("document_id")
                },
                chunk_id,
                score,
                doc_id: str_of("doc_id"),
                kb_id: str_of("kb_id"),
                filename: str_of("filename"),
            };
            let rich = RichCitation {
                lean: lean.clone(),
                document_name,
                content: content.to_string(),
                metadata: meta,
            };
            self.pending.push((rich, lean));
            absorbed += 1;
        }
        debug!(absorbed, pending = self.pending.len(), "citations absorbed");
        absorbed
    }

    /// Global dedup over everything accumulated this round: keep the
    /// highest-scoring version per content hash, sort by score descending,
    /// drop anything already emitted, then number the newcomers with fresh
    /// increasing markers. Clears the pending buffer.
    pub fn take_new_batch(&mut self) -> Option<ReferenceBatch> {
        if self.pending.is_empty() {
            return None;
        }

        let mut dedup: HashMap<String, (RichCitation, LeanCitation)> = HashMap::new();
        for (rich, lean) in self.pending.drain(..) {
            let hash = format!("{:x}", md5::compute(rich.content.as_bytes()));
            match dedup.get(&hash) {
                Some((existing, _)) if existing.lean.score >= rich.lean.score => {}
                _ => {
                    dedup.insert(hash, (rich, lean));
                }
            }
        }
        let mut deduped: Vec<(String, RichCitation, LeanCitation)> = dedup
            .into_iter()
            .map(|(hash, (rich, lean))| (hash, rich, lean))
            .collect();
        deduped.sort_by(|a, b| b.1.lean.score.total_cmp(&a.1.lean.score));

        let mut rich_out = Vec::new();
        let mut lean_out = Vec::new();
        for (hash, mut rich, mut lean) in deduped {
            if self.sent_ref_ids.contains(&lean.ref_id) || self.sent_hashes.contains(&hash) {
                continue;
            }
            self.last_marker += 1;
            rich.lean.ref_marker = self.last_marker;
            lean.ref_marker = self.last_marker;
            self.sent_ref_ids.insert(lean.ref_id.clone());
            self.sent_hashes.insert(hash);
            self.emitted_rich.push(rich.clone());
            rich_out.push(rich);
            lean_out.push(lean);
        }

        if rich_out.is_empty() {
            return None;
        }
        info!(
            new = rich_out.len(),
            markers = ?(rich_out.first().unwrap().lean.ref_marker
                ..=rich_out.last().unwrap().lean.ref_marker),
            "reference batch ready"
        );
        Some(ReferenceBatch {
            rich: rich_out,
            lean: lean_out,
        })
    }

    /// Rebuild the merged, deduped, globally-numbered tool result JSON. Every
    /// `search_knowledge_base` response in the message list is replaced with
    /// this so the model sees the same citation indexing as the client.
    pub fn merged_tool_json(&self, queries: &[String]) -> String {
        let results: Vec<serde_json::Value> = self
            .emitted_rich
            .iter()
            .enumerate()
            .map(|(idx, rich)| {
                serde_json::json!({
                    "index": idx + 1,
                    "ref_marker": rich.lean.ref_marker,
                    "content": rich.content,
                    "score": rich.lean.score,
                    "metadata": {
                        "source": rich.document_name,
                        "chunk_id": rich.lean.chunk_id,
                        "doc_id": rich.lean.doc_id,
                        "kb_id": rich.lean.kb_id,
                        "filename": rich.lean.filename,
                    },
                })
            })
            .collect();
        serde_json::json!({
            "success": true,
            "query": if queries.is_empty() {
                "merged".to_string()
            } else {
                queries.join(" | ")
            },
            "total": results.len(),
            "results": results,
        })
        .to_string()
    }

    /// All lean citations emitted this turn, for persistence on the
    /// assistant message.
    pub fn emitted_lean(&self) -> Vec<LeanCitation> {
        self.emitted_rich.iter().map(|r| r.lean.clone()).collect()
    }

    pub fn has_emitted(&self) -> bool {
        !self.emitted_rich.is_empty()
    }
}
