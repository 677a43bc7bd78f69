use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use reef_core::types::{DocId, KbId, UserId};
use reef_store::KbStore;
use reef_tasks::{TaskContext, TaskError, TaskHandler};

use crate::parsers::ParserPool;
use crate::pipeline::{IngestRequest, IngestionPipeline};

/// Task type name this handler registers under.
pub const INGEST_TASK_TYPE: &str = "ingest_document";

/// Task payload: document identity plus raw file bytes.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestTaskPayload {
    pub kb_id: String,
    pub doc_id: String,
    pub user_id: String,
    pub filename: String,
    pub data: Vec<u8>,
}

/// Queue handler gluing the parser pool to the ingestion pipeline.
pub struct IngestDocumentHandler {
    kb_store: Arc<KbStore>,
    pool: Arc<ParserPool>,
    pipeline: Arc<IngestionPipeline>,
}

impl IngestDocumentHandler {
    pub fn new(
        kb_store: Arc<KbStore>,
        pool: Arc<ParserPool>,
        pipeline: Arc<IngestionPipeline>,
    ) -> Self {
        Self {
            kb_store,
            pool,
            pipeline,
        }
    }
}

#[async_trait]
impl TaskHandler for IngestDocumentHandler {
    async fn run(
        &self,
        payload: Vec<u8>,
        ctx: TaskContext,
    ) -> reef_tasks::Result<serde_json::Value> {
        let payload: IngestTaskPayload = serde_json::from_slice(&payload)?;
        let doc_id = DocId::from(payload.doc_id.clone());

        ctx.report_progress(0.1);
        let parsed = match self
            .pool
            .parse(payload.data.clone(), payload.filename.clone())
            .await
        {
            Ok(parsed) => parsed,
            Err(e) => {
                let reason = e.to_string();
                if let Err(mark_err) = self.kb_store.mark_failed(&doc_id, &reason) {
                    warn!("failed to record parse failure: {mark_err}");
                }
                return Err(TaskError::Handler(reason));
            }
        };
        ctx.report_progress(0.3);

        let req = IngestRequest {
            kb_id: KbId::from(payload.kb_id),
            doc_id,
            user_id: UserId::from(payload.user_id),
            filename: payload.filename,
            text: parsed.text,
            size_bytes: payload.data.len() as i64,
        };

        let progress = {
            let ctx = ctx.clone();
            move |fraction: f64| ctx.report_progress(fraction)
        };
        let report = self
            .pipeline
            .ingest(req, &ctx.cancel, &progress)
            .await
            .map_err(|e| match e {
                crate::error::IngestError::Cancelled => TaskError::Cancelled,
                other => TaskError::Handler(other.to_string()),
            })?;

        Ok(serde_json::to_value(report)?)
    }
}
