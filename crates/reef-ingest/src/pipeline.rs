use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use reef_core::types::{DocId, KbId, UserId};
use reef_embed::ModelRegistry;
use reef_store::KbStore;
use reef_vector::{VectorChunk, VectorStoreRegistry};

use crate::error::{IngestError, Result};
use crate::splitter::RecursiveCharacterSplitter;

/// Parsed text ready for chunking and embedding.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub kb_id: KbId,
    pub doc_id: DocId,
    pub user_id: UserId,
    pub filename: String,
    pub text: String,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestReport {
    pub chunks_written: usize,
    pub total_in_store: i64,
}

/// Chunks, embeds, and durably writes one document into its KB's vector
/// store, then settles the document row and KB counters.
///
/// Per-batch retries are the task queue's job; this pipeline runs a single
/// attempt and reports cleanly.
pub struct IngestionPipeline {
    kb_store: Arc<KbStore>,
    models: Arc<ModelRegistry>,
    vectors: Arc<VectorStoreRegistry>,
    per_user: DashMap<String, Arc<Semaphore>>,
    per_user_limit: usize,
    batch_size: usize,
}

impl IngestionPipeline {
    pub fn new(
        kb_store: Arc<KbStore>,
        models: Arc<ModelRegistry>,
        vectors: Arc<VectorStoreRegistry>,
        per_user_limit: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            kb_store,
            models,
            vectors,
            per_user: DashMap::new(),
            per_user_limit,
            batch_size: batch_size.max(1),
        }
    }

    /// Progress is reported monotonically in [0.5, 0.9] across batches; the
    /// window below 0.5 belongs to parsing and chunking, the window above to
    /// finalization.
    #[instrument(skip_all, fields(kb_id = %req.kb_id, doc_id = %req.doc_id, filename = %req.filename))]
    pub async fn ingest(
        &self,
        req: IngestRequest,
        cancel: &CancellationToken,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<IngestReport> {
        let _user_slot = self.user_semaphore(&req.user_id).acquire_owned().await.unwrap();

        match self.run(&req, cancel, progress).await {
            Ok(report) => {
                self.kb_store
                    .mark_completed(&req.doc_id, report.chunks_written as i64)?;
                self.kb_store.add_counters(
                    &req.kb_id,
                    1,
                    report.chunks_written as i64,
                    req.size_bytes,
                )?;
                info!(chunks = report.chunks_written, "document ingested");
                Ok(report)
            }
            Err(e) => {
                // Chunks already written stay: they are legitimate content and
                // a retry re-writes them idempotently by chunk id. Counters
                // are only touched on success.
                let reason = e.to_string();
                if let Err(mark_err) = self.kb_store.mark_failed(&req.doc_id, &reason) {
                    warn!("failed to record document failure: {mark_err}");
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        req: &IngestRequest,
        cancel: &CancellationToken,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<IngestReport> {
        let kb = self.kb_store.get(&req.kb_id)?;

        let splitter = RecursiveCharacterSplitter::new(
            kb.chunking.chunk_size,
            kb.chunking.chunk_overlap,
            &kb.chunking.separators,
        );
        let texts = splitter.split(&req.text);
        if texts.is_empty() {
            return Err(IngestError::ParseFailed("no chunks produced".into()));
        }

        let chunks: Vec<VectorChunk> = texts
            .into_iter()
            .enumerate()
            .map(|(index, text)| {
                let chunk_id = Uuid::new_v4().to_string();
                VectorChunk {
                    metadata: serde_json::json!({
                        "kb_id": req.kb_id.as_str(),
                        "doc_id": req.doc_id.as_str(),
                        "chunk_id": chunk_id,
                        "chunk_index": index,
                        "source": req.filename,
                        "filename": req.filename,
                    }),
                    chunk_id,
                    text,
                }
            })
            .collect();
        progress(0.5);

        let embedder = self.models.get_or_create(&kb.embedding)?;
        let handle = self.vectors.get_or_create(&kb.vector, embedder).await?;

        let total = chunks.len();
        let batches: Vec<Vec<VectorChunk>> = chunks
            .chunks(self.batch_size)
            .map(|b| b.to_vec())
            .collect();
        let batch_count = batches.len();

        let mut last_count = 0;
        for (i, batch) in batches.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            last_count = handle.add_documents_async(batch).await?;
            progress(0.5 + ((i + 1) as f64 / batch_count as f64) * 0.4);
            // Bounds how far the WAL can lag during long ingestions; no-ops
            // when called again within the debounce window.
            self.vectors.maybe_compact(&kb.vector.collection_name).await?;
        }

        self.vectors
            .force_global_compaction_wait(&kb.vector.collection_name)
            .await?;

        Ok(IngestReport {
            chunks_written: total,
            total_in_store: last_count,
        })
    }

    fn user_semaphore(&self, user_id: &UserId) -> Arc<Semaphore> {
        self.per_user
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_user_limit)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_store::db::init_db;
    use reef_store::types::{ChunkingSpec, EmbeddingSpec, SearchSpec, VectorSpec};
    use rusqlite::Connection;

    struct Fixture {
        _dir: tempfile::TempDir,
        kb_store: Arc<KbStore>,
        pipeline: IngestionPipeline,
        kb_id: KbId,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model.bin");
        std::fs::write(&model_path, b"stub").unwrap();

        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let kb_store = Arc::new(KbStore::new(conn));
        let kb = kb_store
            .create(
                &UserId::from("u1"),
                "kb",
                EmbeddingSpec::Local {
                    model_path: model_path.to_str().unwrap().to_string(),
                },
                VectorSpec {
                    backend: Default::default(),
                    collection_name: "pipeline-test".into(),
                    distance_metric: Default::default(),
                },
                ChunkingSpec {
                    chunk_size: 500,
                    chunk_overlap: 100,
                    ..Default::default()
                },
                SearchSpec::default(),
            )
            .unwrap();

        let pipeline = IngestionPipeline::new(
            kb_store.clone(),
            Arc::new(ModelRegistry::new()),
            Arc::new(VectorStoreRegistry::new(dir.path().join("data"))),
            5,
            100,
        );
        Fixture {
            _dir: dir,
            kb_store,
            pipeline,
            kb_id: kb.kb_id,
        }
    }

    fn request(f: &Fixture, text: &str) -> IngestRequest {
        let doc = f
            .kb_store
            .create_document(&f.kb_id, "a.txt", text.len() as i64, Some("text/plain"))
            .unwrap();
        IngestRequest {
            kb_id: f.kb_id.clone(),
            doc_id: doc.doc_id,
            user_id: UserId::from("u1"),
            filename: "a.txt".into(),
            text: text.to_string(),
            size_bytes: text.len() as i64,
        }
    }

    #[tokio::test]
    async fn ten_thousand_chars_become_twenty_five_chunks() {
        let f = fixture();
        let req = request(&f, &"a".repeat(10_000));
        let cancel = CancellationToken::new();
        let report = f.pipeline.ingest(req.clone(), &cancel, &|_| {}).await.unwrap();
        assert_eq!(report.chunks_written, 25);
        assert_eq!(report.total_in_store, 25);

        let kb = f.kb_store.get(&f.kb_id).unwrap();
        assert_eq!(kb.document_count, 1);
        assert_eq!(kb.chunk_count, 25);
        let doc = f.kb_store.get_document(&req.doc_id).unwrap();
        assert_eq!(doc.chunk_count, 25);
        assert_eq!(
            doc.status,
            reef_store::types::DocumentStatus::Completed
        );
    }

    #[tokio::test]
    async fn progress_is_monotone_between_half_and_nine_tenths() {
        let f = fixture();
        let req = request(&f, &"b".repeat(2_000));
        let seen = std::sync::Mutex::new(Vec::new());
        let cancel = CancellationToken::new();
        f.pipeline
            .ingest(req, &cancel, &|p| seen.lock().unwrap().push(p))
            .await
            .unwrap();
        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!((seen.last().unwrap() - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cancellation_marks_failed_and_leaves_counters() {
        let f = fixture();
        let req = request(&f, &"c".repeat(2_000));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = f.pipeline.ingest(req.clone(), &cancel, &|_| {}).await;
        assert!(matches!(err, Err(IngestError::Cancelled)));

        let kb = f.kb_store.get(&f.kb_id).unwrap();
        assert_eq!((kb.document_count, kb.chunk_count), (0, 0));
        let doc = f.kb_store.get_document(&req.doc_id).unwrap();
        assert_eq!(doc.status, reef_store::types::DocumentStatus::Failed);
    }
}
