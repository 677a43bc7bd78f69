use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info};

use reef_core::types::{DocId, KbId, UserId};

use crate::error::{Result, StoreError};
use crate::types::{
    ChunkingSpec, Document, DocumentStatus, EmbeddingSpec, KnowledgeBase, SearchSpec, VectorSpec,
};

/// Thread-safe store for knowledge bases and their documents.
///
/// Counters (`document_count`, `chunk_count`, `total_size`) are updated only
/// through the atomic add/subtract methods tied to document lifecycle events.
pub struct KbStore {
    db: Mutex<Connection>,
}

impl KbStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    pub fn create(
        &self,
        owner_id: &UserId,
        name: &str,
        embedding: EmbeddingSpec,
        vector: VectorSpec,
        chunking: ChunkingSpec,
        search: SearchSpec,
    ) -> Result<KnowledgeBase> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let kb_id = KbId::new();

        // Collection uniqueness per owner is enforced by the unique index;
        // translate the constraint violation into a Conflict.
        let res = db.execute(
            "INSERT INTO knowledge_bases
             (kb_id, owner_id, name, embedding_spec, vector_spec, chunking_spec,
              search_spec, document_count, chunk_count, total_size, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, 0, ?8, ?8)",
            rusqlite::params![
                kb_id.as_str(),
                owner_id.as_str(),
                name,
                serde_json::to_string(&embedding)?,
                serde_json::to_string(&vector)?,
                serde_json::to_string(&chunking)?,
                serde_json::to_string(&search)?,
                now,
            ],
        );
        match res {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::Conflict(format!(
                    "collection '{}' already exists for this owner",
                    vector.collection_name
                )));
            }
            Err(e) => return Err(e.into()),
        }

        info!(kb_id = %kb_id, %name, "knowledge base created");
        Ok(KnowledgeBase {
            kb_id,
            owner_id: owner_id.clone(),
            name: name.to_string(),
            embedding,
            vector,
            chunking,
            search,
            document_count: 0,
            chunk_count: 0,
            total_size: 0,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get(&self, kb_id: &KbId) -> Result<KnowledgeBase> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT kb_id, owner_id, name, embedding_spec, vector_spec, chunking_spec,
                    search_spec, document_count, chunk_count, total_size, created_at, updated_at
             FROM knowledge_bases WHERE kb_id = ?1",
            [kb_id.as_str()],
            row_to_kb,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                kind: "knowledge base",
                id: kb_id.to_string(),
            },
            other => other.into(),
        })
    }

    /// Fetch a KB, verifying ownership. `NotFound` hides existence from
    /// non-owners.
    pub fn get_owned(&self, kb_id: &KbId, owner_id: &UserId) -> Result<KnowledgeBase> {
        let kb = self.get(kb_id)?;
        if kb.owner_id != *owner_id {
            return Err(StoreError::NotFound {
                kind: "knowledge base",
                id: kb_id.to_string(),
            });
        }
        Ok(kb)
    }

    pub fn list_for_owner(&self, owner_id: &UserId) -> Result<Vec<KnowledgeBase>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT kb_id, owner_id, name, embedding_spec, vector_spec, chunking_spec,
                    search_spec, document_count, chunk_count, total_size, created_at, updated_at
             FROM knowledge_bases WHERE owner_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([owner_id.as_str()], row_to_kb)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Delete the KB row and all its document rows. Vector rows and object
    /// blobs are the caller's responsibility (registry `remove` + storage).
    pub fn delete(&self, kb_id: &KbId) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM documents WHERE kb_id = ?1", [kb_id.as_str()])?;
        let n = db.execute(
            "DELETE FROM knowledge_bases WHERE kb_id = ?1",
            [kb_id.as_str()],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                kind: "knowledge base",
                id: kb_id.to_string(),
            });
        }
        info!(kb_id = %kb_id, "knowledge base deleted");
        Ok(())
    }

    /// Atomic counter bump on document completion.
    pub fn add_counters(&self, kb_id: &KbId, docs: i64, chunks: i64, bytes: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE knowledge_bases
             SET document_count = document_count + ?1,
                 chunk_count    = chunk_count + ?2,
                 total_size     = total_size + ?3,
                 updated_at     = ?4
             WHERE kb_id = ?5",
            rusqlite::params![docs, chunks, bytes, now, kb_id.as_str()],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                kind: "knowledge base",
                id: kb_id.to_string(),
            });
        }
        debug!(kb_id = %kb_id, docs, chunks, bytes, "kb counters updated");
        Ok(())
    }

    // --- documents ---------------------------------------------------------

    pub fn create_document(
        &self,
        kb_id: &KbId,
        filename: &str,
        size: i64,
        mime_type: Option<&str>,
    ) -> Result<Document> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let doc_id = DocId::new();
        db.execute(
            "INSERT INTO documents
             (doc_id, kb_id, filename, size, mime_type, status, chunk_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)",
            rusqlite::params![
                doc_id.as_str(),
                kb_id.as_str(),
                filename,
                size,
                mime_type,
                now
            ],
        )?;
        Ok(Document {
            doc_id,
            kb_id: kb_id.clone(),
            filename: filename.to_string(),
            size,
            mime_type: mime_type.map(str::to_string),
            status: DocumentStatus::Pending,
            task_id: None,
            object_url: None,
            chunk_count: 0,
            error: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_document(&self, doc_id: &DocId) -> Result<Document> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT doc_id, kb_id, filename, size, mime_type, status, task_id,
                    object_url, chunk_count, error, created_at, updated_at
             FROM documents WHERE doc_id = ?1",
            [doc_id.as_str()],
            row_to_document,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                kind: "document",
                id: doc_id.to_string(),
            },
            other => other.into(),
        })
    }

    pub fn list_documents(&self, kb_id: &KbId) -> Result<Vec<Document>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT doc_id, kb_id, filename, size, mime_type, status, task_id,
                    object_url, chunk_count, error, created_at, updated_at
             FROM documents WHERE kb_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([kb_id.as_str()], row_to_document)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn mark_uploaded(&self, doc_id: &DocId, object_url: &str) -> Result<()> {
        self.update_status(doc_id, DocumentStatus::Uploaded, |db, now| {
            db.execute(
                "UPDATE documents SET object_url = ?1, updated_at = ?2 WHERE doc_id = ?3",
                rusqlite::params![object_url, now, doc_id.as_str()],
            )
            .map(|_| ())
        })
    }

    pub fn mark_processing(&self, doc_id: &DocId, task_id: &str) -> Result<()> {
        self.update_status(doc_id, DocumentStatus::Processing, |db, now| {
            db.execute(
                "UPDATE documents SET task_id = ?1, updated_at = ?2 WHERE doc_id = ?3",
                rusqlite::params![task_id, now, doc_id.as_str()],
            )
            .map(|_| ())
        })
    }

    pub fn mark_completed(&self, doc_id: &DocId, chunk_count: i64) -> Result<()> {
        self.update_status(doc_id, DocumentStatus::Completed, |db, now| {
            db.execute(
                "UPDATE documents SET chunk_count = ?1, error = NULL, updated_at = ?2
                 WHERE doc_id = ?3",
                rusqlite::params![chunk_count, now, doc_id.as_str()],
            )
            .map(|_| ())
        })
    }

    pub fn mark_failed(&self, doc_id: &DocId, error: &str) -> Result<()> {
        self.update_status(doc_id, DocumentStatus::Failed, |db, now| {
            db.execute(
                "UPDATE documents SET error = ?1, updated_at = ?2 WHERE doc_id = ?3",
                rusqlite::params![error, now, doc_id.as_str()],
            )
            .map(|_| ())
        })
    }

    /// Delete a document row and decrement the KB counters by exactly the
    /// document's recorded values.
    pub fn delete_document(&self, doc_id: &DocId) -> Result<Document> {
        let doc = self.get_document(doc_id)?;
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        db.execute("DELETE FROM documents WHERE doc_id = ?1", [doc_id.as_str()])?;
        let (docs_delta, chunks_delta) = match doc.status {
            DocumentStatus::Completed => (1, doc.chunk_count),
            _ => (0, 0),
        };
        db.execute(
            "UPDATE knowledge_bases
             SET document_count = document_count - ?1,
                 chunk_count    = chunk_count - ?2,
                 total_size     = total_size - ?3,
                 updated_at     = ?4
             WHERE kb_id = ?5",
            rusqlite::params![
                docs_delta,
                chunks_delta,
                if docs_delta > 0 { doc.size } else { 0 },
                now,
                doc.kb_id.as_str()
            ],
        )?;
        Ok(doc)
    }

    fn update_status<F>(&self, doc_id: &DocId, status: DocumentStatus, extra: F) -> Result<()>
    where
        F: FnOnce(&Connection, &str) -> rusqlite::Result<()>,
    {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE documents SET status = ?1, updated_at = ?2 WHERE doc_id = ?3",
            rusqlite::params![status.to_string(), now, doc_id.as_str()],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                kind: "document",
                id: doc_id.to_string(),
            });
        }
        extra(&db, &now)?;
        Ok(())
    }
}

fn row_to_kb(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeBase> {
    let parse = |idx: usize| -> rusqlite::Result<serde_json::Value> {
        let s: String = row.get(idx)?;
        serde_json::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    };
    let embedding: EmbeddingSpec = serde_json::from_value(parse(3)?).map_err(json_err(3))?;
    let vector: VectorSpec = serde_json::from_value(parse(4)?).map_err(json_err(4))?;
    let chunking: ChunkingSpec = serde_json::from_value(parse(5)?).map_err(json_err(5))?;
    let search: SearchSpec = serde_json::from_value(parse(6)?).map_err(json_err(6))?;
    Ok(KnowledgeBase {
        kb_id: KbId::from(row.get::<_, String>(0)?),
        owner_id: UserId::from(row.get::<_, String>(1)?),
        name: row.get(2)?,
        embedding,
        vector,
        chunking,
        search,
        document_count: row.get(7)?,
        chunk_count: row.get(8)?,
        total_size: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn json_err(idx: usize) -> impl Fn(serde_json::Error) -> rusqlite::Error {
    move |e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    }
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let status_str: String = row.get(5)?;
    Ok(Document {
        doc_id: DocId::from(row.get::<_, String>(0)?),
        kb_id: KbId::from(row.get::<_, String>(1)?),
        filename: row.get(2)?,
        size: row.get(3)?,
        mime_type: row.get(4)?,
        status: status_str.parse().unwrap_or(DocumentStatus::Pending),
        task_id: row.get(6)?,
        object_url: row.get(7)?,
        chunk_count: row.get(8)?,
        error: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn store() -> KbStore {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        KbStore::new(conn)
    }

    fn specs(collection: &str) -> (EmbeddingSpec, VectorSpec, ChunkingSpec, SearchSpec) {
        (
            EmbeddingSpec::Ollama {
                model: "nomic-embed-text".into(),
                endpoint: "http://localhost:11434".into(),
            },
            VectorSpec {
                backend: Default::default(),
                collection_name: collection.into(),
                distance_metric: Default::default(),
            },
            ChunkingSpec::default(),
            SearchSpec::default(),
        )
    }

    #[test]
    fn duplicate_collection_for_same_owner_conflicts() {
        let store = store();
        let owner = UserId::from("u1");
        let (e, v, c, s) = specs("notes");
        store
            .create(&owner, "kb1", e.clone(), v.clone(), c.clone(), s.clone())
            .unwrap();
        let err = store.create(&owner, "kb2", e.clone(), v.clone(), c.clone(), s.clone());
        assert!(matches!(err, Err(StoreError::Conflict(_))));

        // Same collection under a different owner is fine.
        let (e2, v2, c2, s2) = specs("notes");
        store.create(&UserId::from("u2"), "kb3", e2, v2, c2, s2).unwrap();
    }

    #[test]
    fn document_lifecycle_updates_counters_exactly_once() {
        let store = store();
        let owner = UserId::from("u1");
        let (e, v, c, s) = specs("docs");
        let kb = store.create(&owner, "kb", e, v, c, s).unwrap();

        let doc = store
            .create_document(&kb.kb_id, "a.txt", 1024, Some("text/plain"))
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);

        store.mark_uploaded(&doc.doc_id, "file:///a.txt").unwrap();
        store.mark_processing(&doc.doc_id, "task-1").unwrap();
        store.mark_completed(&doc.doc_id, 7).unwrap();
        store.add_counters(&kb.kb_id, 1, 7, 1024).unwrap();

        let kb = store.get(&kb.kb_id).unwrap();
        assert_eq!(kb.document_count, 1);
        assert_eq!(kb.chunk_count, 7);
        assert_eq!(kb.total_size, 1024);

        let deleted = store.delete_document(&doc.doc_id).unwrap();
        assert_eq!(deleted.chunk_count, 7);
        let kb = store.get(&kb.kb_id).unwrap();
        assert_eq!(kb.document_count, 0);
        assert_eq!(kb.chunk_count, 0);
        assert_eq!(kb.total_size, 0);
    }

    #[test]
    fn failed_document_does_not_touch_counters_on_delete() {
        let store = store();
        let owner = UserId::from("u1");
        let (e, v, c, s) = specs("docs");
        let kb = store.create(&owner, "kb", e, v, c, s).unwrap();
        let doc = store.create_document(&kb.kb_id, "a.txt", 10, None).unwrap();
        store.mark_failed(&doc.doc_id, "encrypted").unwrap();
        store.delete_document(&doc.doc_id).unwrap();
        let kb = store.get(&kb.kb_id).unwrap();
        assert_eq!((kb.document_count, kb.chunk_count, kb.total_size), (0, 0, 0));
    }

    #[test]
    fn get_owned_hides_foreign_kbs() {
        let store = store();
        let (e, v, c, s) = specs("x");
        let kb = store.create(&UserId::from("u1"), "kb", e, v, c, s).unwrap();
        let err = store.get_owned(&kb.kb_id, &UserId::from("u2"));
        assert!(matches!(err, Err(StoreError::NotFound { .. })));
    }
}
