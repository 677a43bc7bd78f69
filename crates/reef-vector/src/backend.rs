use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use reef_core::types::DistanceMetric;

use crate::error::{Result, VectorError};

/// A chunk as stored by the vector backend. The embedding lives in its own
/// column, never inside the metadata.
#[derive(Debug, Clone)]
pub struct VectorChunk {
    pub chunk_id: String,
    pub text: String,
    pub metadata: serde_json::Value,
}

/// A similarity search hit with the backend's raw distance.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: String,
    pub text: String,
    pub metadata: serde_json::Value,
    pub distance: f64,
}

/// SQLite-backed vector store for one logical collection.
///
/// On-disk layout under `persist_dir`:
///   catalog.sqlite3            name -> segment UUID + distance metric
///   <uuid>/segments.sqlite3    chunk rows with f32-LE embedding BLOBs (WAL)
///
/// The catalog/segment-dir split mirrors the production backend this store
/// stands in for, which is what makes the UUID reconciliation meaningful.
pub struct SqliteVectorStore {
    collection: String,
    persist_dir: PathBuf,
    metric: DistanceMetric,
    segments: Mutex<Connection>,
}

impl SqliteVectorStore {
    pub fn open(persist_dir: &Path, collection: &str, metric: DistanceMetric) -> Result<Self> {
        std::fs::create_dir_all(persist_dir)?;

        let catalog = Connection::open(persist_dir.join("catalog.sqlite3"))?;
        catalog.execute_batch(
            "CREATE TABLE IF NOT EXISTS collections (
                name            TEXT PRIMARY KEY,
                uuid            TEXT NOT NULL,
                distance_metric TEXT NOT NULL,
                created_at      TEXT NOT NULL
            );",
        )?;

        let existing: Option<(String, String)> = catalog
            .query_row(
                "SELECT uuid, distance_metric FROM collections WHERE name = ?1",
                [collection],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let expected_uuid = match existing {
            Some((uuid, stored_metric)) => {
                if stored_metric != metric.to_string() {
                    return Err(VectorError::Unavailable(format!(
                        "collection '{}' was created with metric '{}'; it cannot be reopened as '{}'",
                        collection, stored_metric, metric
                    )));
                }
                uuid
            }
            None => {
                let uuid = Uuid::new_v4().to_string();
                catalog.execute(
                    "INSERT INTO collections (name, uuid, distance_metric, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        collection,
                        uuid,
                        metric.to_string(),
                        chrono::Utc::now().to_rfc3339()
                    ],
                )?;
                uuid
            }
        };

        reconcile_uuid_dirs(persist_dir, &expected_uuid)?;

        let segment_dir = persist_dir.join(&expected_uuid);
        std::fs::create_dir_all(&segment_dir)?;
        let segments = Connection::open(segment_dir.join("segments.sqlite3"))?;
        segments.pragma_update(None, "journal_mode", "WAL")?;
        segments.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunks (
                chunk_id  TEXT PRIMARY KEY,
                text      TEXT NOT NULL,
                metadata  TEXT NOT NULL,
                embedding BLOB NOT NULL,
                dim       INTEGER NOT NULL
            );",
        )?;

        info!(collection, uuid = %expected_uuid, metric = %metric, "vector store opened");
        Ok(Self {
            collection: collection.to_string(),
            persist_dir: persist_dir.to_path_buf(),
            metric,
            segments: Mutex::new(segments),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Insert or replace chunk rows. `chunks` and `embeddings` must be the
    /// same length; all embeddings in one index must share a dimension.
    pub fn add(&self, chunks: &[VectorChunk], embeddings: &[Vec<f32>]) -> Result<usize> {
        debug_assert_eq!(chunks.len(), embeddings.len());
        let mut conn = self.segments.lock().unwrap();

        let existing_dim: Option<usize> = conn
            .query_row("SELECT dim FROM chunks LIMIT 1", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|d| Some(d as usize))
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let tx = conn.transaction()?;
        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            if let Some(expected) = existing_dim {
                if embedding.len() != expected {
                    return Err(VectorError::DimensionMismatch {
                        expected,
                        actual: embedding.len(),
                    });
                }
            }
            let blob = vector_to_blob(embedding);
            tx.execute(
                "INSERT OR REPLACE INTO chunks (chunk_id, text, metadata, embedding, dim)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    chunk.chunk_id,
                    chunk.text,
                    serde_json::to_string(&chunk.metadata)?,
                    blob,
                    embedding.len() as i64
                ],
            )?;
        }
        tx.commit()?;
        Ok(chunks.len())
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.segments.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?)
    }

    /// Brute-force scan returning the `k` nearest chunks with raw distances.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let conn = self.segments.lock().unwrap();
        let mut stmt = conn.prepare("SELECT chunk_id, text, metadata, embedding FROM chunks")?;
        let mut hits: Vec<SearchHit> = stmt
            .query_map([], |row| {
                let blob: Vec<u8> = row.get(3)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    blob,
                ))
            })?
            .filter_map(|r| r.ok())
            .map(|(chunk_id, text, metadata, blob)| {
                let embedding = blob_to_vector(&blob);
                SearchHit {
                    chunk_id,
                    text,
                    metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
                    distance: distance(self.metric, query, &embedding),
                }
            })
            .collect();

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }

    pub fn get_by_ids(&self, ids: &[String]) -> Result<Vec<VectorChunk>> {
        let conn = self.segments.lock().unwrap();
        let mut out = Vec::with_capacity(ids.len());
        let mut stmt =
            conn.prepare("SELECT chunk_id, text, metadata FROM chunks WHERE chunk_id = ?1")?;
        for id in ids {
            let row = stmt
                .query_row([id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(("".into(), "".into(), "".into())),
                    other => Err(other),
                })?;
            if !row.0.is_empty() {
                out.push(VectorChunk {
                    chunk_id: row.0,
                    text: row.1,
                    metadata: serde_json::from_str(&row.2).unwrap_or(serde_json::Value::Null),
                });
            }
        }
        Ok(out)
    }

    /// Remove every chunk belonging to a document. Returns rows deleted.
    pub fn delete_by_doc(&self, doc_id: &str) -> Result<usize> {
        let conn = self.segments.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM chunks WHERE json_extract(metadata, '$.doc_id') = ?1",
            [doc_id],
        )?;
        Ok(n)
    }

    /// Force a WAL checkpoint on the segments database, logging the result.
    /// Returns `(busy, log_pages, checkpointed_pages)`.
    pub fn checkpoint(&self) -> Result<(i64, i64, i64)> {
        let conn = self.segments.lock().unwrap();
        let (busy, log_pages, checkpointed): (i64, i64, i64) = conn.query_row(
            "PRAGMA wal_checkpoint(TRUNCATE)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        if busy == 0 {
            debug!(
                collection = %self.collection,
                log_pages,
                checkpointed,
                "wal checkpoint complete"
            );
        } else {
            warn!(
                collection = %self.collection,
                busy,
                log_pages,
                checkpointed,
                "wal checkpoint incomplete"
            );
        }
        Ok((busy, log_pages, checkpointed))
    }

    /// Final checkpoint, then drop the connection.
    pub fn close(self) -> Result<()> {
        let _ = self.checkpoint();
        info!(collection = %self.collection, "vector store closed");
        Ok(())
    }

    pub fn persist_dir(&self) -> &Path {
        &self.persist_dir
    }
}

/// Repair the known failure mode of concurrent collection creation across
/// processes: the catalog names one segment UUID, but the filesystem holds a
/// directory for another.
///
/// If the expected directory exists, extra UUID directories are deleted. If
/// it is missing and exactly one orphan exists, the orphan is renamed to the
/// expected UUID. Multiple orphans with no expected directory is unrepairable.
fn reconcile_uuid_dirs(persist_dir: &Path, expected_uuid: &str) -> Result<()> {
    let expected_dir = persist_dir.join(expected_uuid);

    let mut uuid_dirs: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(persist_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if Uuid::parse_str(name).is_ok() {
                    uuid_dirs.push(path);
                }
            }
        }
    }

    if expected_dir.exists() {
        for extra in uuid_dirs.iter().filter(|d| **d != expected_dir) {
            warn!(dir = %extra.display(), "removing orphan segment directory");
            std::fs::remove_dir_all(extra)?;
        }
        return Ok(());
    }

    match uuid_dirs.len() {
        0 => Ok(()), // fresh collection; the segment dir is created next
        1 => {
            let orphan = &uuid_dirs[0];
            warn!(
                from = %orphan.display(),
                to = %expected_dir.display(),
                "segment directory does not match catalog; renaming"
            );
            std::fs::rename(orphan, &expected_dir)?;
            Ok(())
        }
        n => Err(VectorError::Unavailable(format!(
            "{} orphan segment directories and no catalog match under {}",
            n,
            persist_dir.display()
        ))),
    }
}

fn vector_to_blob(v: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(v.len() * 4);
    for x in v {
        blob.extend_from_slice(&x.to_le_bytes());
    }
    blob
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f64 {
    match metric {
        DistanceMetric::Cosine => {
            let dot = dot(a, b);
            let na = norm(a);
            let nb = norm(b);
            if na == 0.0 || nb == 0.0 {
                1.0
            } else {
                1.0 - (dot / (na * nb))
            }
        }
        // Negative inner product shifted to [0, 2] for unit vectors.
        DistanceMetric::Ip => 1.0 - dot(a, b),
        // Squared L2, matching the backend contract the score conversion expects.
        DistanceMetric::L2 => a
            .iter()
            .zip(b)
            .map(|(x, y)| {
                let d = (*x - *y) as f64;
                d * d
            })
            .sum(),
    }
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum()
}

fn norm(v: &[f32]) -> f64 {
    dot(v, v).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, text: &str) -> VectorChunk {
        VectorChunk {
            chunk_id: id.to_string(),
            text: text.to_string(),
            metadata: serde_json::json!({ "doc_id": "d1", "chunk_id": id }),
        }
    }

    #[test]
    fn add_search_and_reopen_count() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteVectorStore::open(dir.path(), "notes", DistanceMetric::Cosine).unwrap();
        store
            .add(
                &[chunk("c1", "alpha"), chunk("c2", "beta")],
                &[vec![1.0, 0.0], vec![0.0, 1.0]],
            )
            .unwrap();
        store.checkpoint().unwrap();

        let hits = store.search(&[1.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].chunk_id, "c1");
        assert!(hits[0].distance.abs() < 1e-6);
        store.close().unwrap();

        // Round-trip: reopening counts exactly what was written.
        let store =
            SqliteVectorStore::open(dir.path(), "notes", DistanceMetric::Cosine).unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn metric_is_immutable_after_creation() {
        let dir = tempfile::tempdir().unwrap();
        SqliteVectorStore::open(dir.path(), "notes", DistanceMetric::Cosine).unwrap();
        let err = SqliteVectorStore::open(dir.path(), "notes", DistanceMetric::L2);
        assert!(matches!(err, Err(VectorError::Unavailable(_))));
    }

    #[test]
    fn orphan_uuid_dir_is_renamed_to_catalog_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteVectorStore::open(dir.path(), "notes", DistanceMetric::Cosine).unwrap();
        store.add(&[chunk("c1", "x")], &[vec![1.0]]).unwrap();
        store.close().unwrap();

        // Simulate a concurrent-creation crash: the segment dir carries a
        // UUID the catalog does not know.
        let uuid_dir = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.is_dir())
            .unwrap();
        let rogue = dir.path().join(Uuid::new_v4().to_string());
        std::fs::rename(&uuid_dir, &rogue).unwrap();

        let store =
            SqliteVectorStore::open(dir.path(), "notes", DistanceMetric::Cosine).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn extra_uuid_dirs_are_deleted_when_expected_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteVectorStore::open(dir.path(), "notes", DistanceMetric::Cosine).unwrap();
        store.close().unwrap();

        let extra = dir.path().join(Uuid::new_v4().to_string());
        std::fs::create_dir(&extra).unwrap();

        SqliteVectorStore::open(dir.path(), "notes", DistanceMetric::Cosine).unwrap();
        assert!(!extra.exists());
    }

    #[test]
    fn delete_by_doc_removes_only_that_document() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteVectorStore::open(dir.path(), "notes", DistanceMetric::Cosine).unwrap();
        let other = VectorChunk {
            chunk_id: "c9".into(),
            text: "other".into(),
            metadata: serde_json::json!({ "doc_id": "d2" }),
        };
        store
            .add(&[chunk("c1", "a"), other], &[vec![1.0], vec![0.5]])
            .unwrap();
        assert_eq!(store.delete_by_doc("d1").unwrap(), 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn l2_distance_is_squared() {
        let d = distance(DistanceMetric::L2, &[1.0, 0.0], &[-1.0, 0.0]);
        assert!((d - 4.0).abs() < 1e-9);
    }
}
