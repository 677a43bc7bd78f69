//! Built-in tools exposed through the in-process tool registry. The
//! knowledge-base search tool is the one the orchestrator post-processes
//! into citations.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use reef_core::types::SessionId;
use reef_embed::ModelRegistry;
use reef_retrieval::{MergeStrategy, MultiKbRetriever, RetrievalTarget};
use reef_store::{KbStore, SessionStore};
use reef_tools::{Tool, ToolDecl, ToolError, ToolScope, SEARCH_KNOWLEDGE_BASE};
use reef_vector::VectorStoreRegistry;

pub struct KnowledgeSearchTool {
    kb_store: Arc<KbStore>,
    sessions: Arc<SessionStore>,
    models: Arc<ModelRegistry>,
    vectors: Arc<VectorStoreRegistry>,
    retriever: MultiKbRetriever,
}

impl KnowledgeSearchTool {
    pub fn new(
        kb_store: Arc<KbStore>,
        sessions: Arc<SessionStore>,
        models: Arc<ModelRegistry>,
        vectors: Arc<VectorStoreRegistry>,
    ) -> Self {
        Self {
            kb_store,
            sessions,
            models,
            vectors,
            retriever: MultiKbRetriever::new(),
        }
    }
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn decl(&self) -> ToolDecl {
        ToolDecl {
            name: SEARCH_KNOWLEDGE_BASE.into(),
            description: "Search the knowledge bases bound to this session and return the \
                          most relevant chunks with scores."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "what to look for" },
                    "top_k": { "type": "integer", "minimum": 1, "maximum": 10 },
                },
                "required": ["query"],
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        scope: &ToolScope,
    ) -> reef_tools::Result<String> {
        let query = arguments
            .get("query")
            .and_then(|q| q.as_str())
            .ok_or_else(|| ToolError::InvalidArguments {
                tool: SEARCH_KNOWLEDGE_BASE.into(),
                reason: "missing 'query'".into(),
            })?;
        let top_k = arguments
            .get("top_k")
            .and_then(|k| k.as_u64())
            .unwrap_or(3) as usize;

        let Some(session_id) = &scope.session_id else {
            return Ok(json!({ "success": false, "error": "no session" }).to_string());
        };
        let session = self
            .sessions
            .get(&SessionId::from(session_id.as_str()))
            .map_err(|e| ToolError::Failed {
                tool: SEARCH_KNOWLEDGE_BASE.into(),
                reason: e.to_string(),
            })?;

        let mut targets = Vec::new();
        for kb_id in &session.kb_bindings {
            let kb = match self.kb_store.get(kb_id) {
                Ok(kb) => kb,
                Err(e) => {
                    warn!(kb_id = %kb_id, "bound kb unavailable: {e}");
                    continue;
                }
            };
            let embedder = match self.models.get_or_create(&kb.embedding) {
                Ok(e) => e,
                Err(e) => {
                    warn!(kb_id = %kb_id, "embedder unavailable: {e}");
                    continue;
                }
            };
            match self.vectors.get_or_create(&kb.vector, embedder).await {
                Ok(store) => targets.push(RetrievalTarget {
                    store,
                    metric: kb.vector.distance_metric,
                    kb_id: kb.kb_id.to_string(),
                    kb_name: kb.name.clone(),
                    threshold: kb.search.similarity_threshold,
                }),
                Err(e) => warn!(kb_id = %kb_id, "vector store unavailable: {e}"),
            }
        }

        let results = self
            .retriever
            .retrieve(query, &targets, top_k, None, MergeStrategy::WeightedScore, 10)
            .await;

        let items: Vec<serde_json::Value> = results
            .iter()
            .map(|r| {
                json!({
                    "content": r.content,
                    "score": r.score,
                    "distance": r.distance,
                    "metadata": {
                        "chunk_id": r.chunk_id.clone().unwrap_or_default(),
                        "doc_id": r.doc_id.clone().unwrap_or_default(),
                        "kb_id": r.kb_id,
                        "filename": r.document_name.clone().unwrap_or_default(),
                        "source": r.document_name.clone().unwrap_or_default(),
                    },
                })
            })
            .collect();

        Ok(json!({
            "success": true,
            "query": query,
            "total": items.len(),
            "results": items,
        })
        .to_string())
    }
}
