use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use reef_embed::EmbeddingProvider;

use crate::backend::{SearchHit, SqliteVectorStore, VectorChunk};
use crate::error::{Result, VectorError};

/// Write-lock acquisition timeout.
const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(300);
/// Polling interval while waiting for the cross-process lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// Permits for the shared read pool; reads never block the async runtime.
const READ_POOL_PERMITS: usize = 4;

/// Vector-store handle wrapping a named cross-process file lock.
///
/// All writes must go through [`add_documents_async`]: it embeds the batch,
/// takes the file lock, writes, forces a WAL checkpoint, and re-reads the
/// count so the on-disk state is verified before the lock is released.
/// Writes to one collection are therefore totally ordered across processes.
///
/// [`add_documents_async`]: LockedVectorStore::add_documents_async
pub struct LockedVectorStore {
    store: Arc<SqliteVectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    lock_path: PathBuf,
    read_permits: Arc<Semaphore>,
}

impl LockedVectorStore {
    pub fn new(
        store: SqliteVectorStore,
        embedder: Arc<dyn EmbeddingProvider>,
        lock_path: PathBuf,
    ) -> Self {
        Self {
            store: Arc::new(store),
            embedder,
            lock_path,
            read_permits: Arc::new(Semaphore::new(READ_POOL_PERMITS)),
        }
    }

    pub fn collection(&self) -> &str {
        self.store.collection()
    }

    /// The only write path. Embeds `chunks`, then performs the locked write
    /// and persistence discipline on the blocking pool.
    ///
    /// Returns the post-write document count.
    pub async fn add_documents_async(&self, chunks: Vec<VectorChunk>) -> Result<i64> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        // Embedding does its own I/O; keep it outside the file lock so slow
        // providers don't extend the cross-process critical section.
        let embeddings = self.embedder.embed_documents(&texts).await?;

        let store = self.store.clone();
        let lock_path = self.lock_path.clone();
        let collection = self.store.collection().to_string();
        let count = tokio::task::spawn_blocking(move || -> Result<i64> {
            let _lock = acquire_write_lock(&lock_path, &collection, WRITE_LOCK_TIMEOUT)?;
            debug!(collection = %collection, chunks = chunks.len(), "write lock held");

            store.add(&chunks, &embeddings)?;
            store.checkpoint()?;
            let count = store.count()?;
            debug!(collection = %collection, count, "write verified");
            Ok(count)
        })
        .await
        .map_err(|e| VectorError::Unavailable(format!("write task panicked: {}", e)))??;

        Ok(count)
    }

    /// Synchronous writes are forbidden: every caller must go through the
    /// lock-protected async path.
    pub fn add_documents(&self, _chunks: &[VectorChunk]) -> Result<i64> {
        Err(VectorError::SyncWriteForbidden)
    }

    /// Non-locking read, dispatched to the shared read pool.
    pub async fn similarity_search_with_score(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        let query_vec = self.embedder.embed_query(query).await?;
        let _permit = self.read_permits.clone().acquire_owned().await.unwrap();
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.search(&query_vec, k))
            .await
            .map_err(|e| VectorError::Unavailable(format!("read task panicked: {}", e)))?
    }

    /// Non-locking read, dispatched to the shared read pool.
    pub async fn get_by_ids(&self, ids: Vec<String>) -> Result<Vec<VectorChunk>> {
        let _permit = self.read_permits.clone().acquire_owned().await.unwrap();
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.get_by_ids(&ids))
            .await
            .map_err(|e| VectorError::Unavailable(format!("read task panicked: {}", e)))?
    }

    pub async fn count(&self) -> Result<i64> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.count())
            .await
            .map_err(|e| VectorError::Unavailable(format!("read task panicked: {}", e)))?
    }

    /// Delete a document's chunks under the write lock, then checkpoint.
    pub async fn delete_by_doc(&self, doc_id: String) -> Result<usize> {
        let store = self.store.clone();
        let lock_path = self.lock_path.clone();
        let collection = self.store.collection().to_string();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let _lock = acquire_write_lock(&lock_path, &collection, WRITE_LOCK_TIMEOUT)?;
            let n = store.delete_by_doc(&doc_id)?;
            store.checkpoint()?;
            Ok(n)
        })
        .await
        .map_err(|e| VectorError::Unavailable(format!("write task panicked: {}", e)))?
    }

    /// Terminal checkpoint plus a verifying re-count. Called at the end of a
    /// batch ingestion so a restart immediately afterwards is safe.
    pub async fn force_compaction(&self) -> Result<i64> {
        let store = self.store.clone();
        let collection = self.store.collection().to_string();
        tokio::task::spawn_blocking(move || -> Result<i64> {
            store.checkpoint()?;
            let count = store.count()?;
            info!(collection = %collection, count, "global compaction checkpoint complete");
            Ok(count)
        })
        .await
        .map_err(|e| VectorError::Unavailable(format!("checkpoint task panicked: {}", e)))?
    }

    pub(crate) fn backend(&self) -> Arc<SqliteVectorStore> {
        self.store.clone()
    }
}

/// Acquire an exclusive cross-process lock on `path`, retrying until
/// `timeout`. The lock is released when the returned `File` drops.
pub(crate) fn acquire_write_lock(path: &Path, collection: &str, timeout: Duration) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;

    let deadline = Instant::now() + timeout;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(_) => {
                return Err(VectorError::LockTimeout {
                    collection: collection.to_string(),
                    secs: timeout.as_secs(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_core::types::DistanceMetric;
    use reef_embed::local::LocalEmbedding;

    fn local_embedder(dir: &Path) -> Arc<dyn EmbeddingProvider> {
        let model = dir.join("model.bin");
        std::fs::write(&model, b"stub").unwrap();
        Arc::new(LocalEmbedding::new(model.to_str().unwrap()).unwrap())
    }

    fn chunk(id: &str, text: &str) -> VectorChunk {
        VectorChunk {
            chunk_id: id.to_string(),
            text: text.to_string(),
            metadata: serde_json::json!({ "doc_id": "d1" }),
        }
    }

    #[tokio::test]
    async fn sync_writes_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteVectorStore::open(&dir.path().join("kb"), "kb", DistanceMetric::Cosine).unwrap();
        let locked = LockedVectorStore::new(
            store,
            local_embedder(dir.path()),
            dir.path().join("locks/chroma_kb.lock"),
        );
        assert!(matches!(
            locked.add_documents(&[]),
            Err(VectorError::SyncWriteForbidden)
        ));
    }

    #[tokio::test]
    async fn locked_write_then_search() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteVectorStore::open(&dir.path().join("kb"), "kb", DistanceMetric::Cosine).unwrap();
        let locked = LockedVectorStore::new(
            store,
            local_embedder(dir.path()),
            dir.path().join("locks/chroma_kb.lock"),
        );

        let count = locked
            .add_documents_async(vec![
                chunk("c1", "coral reefs shelter fish"),
                chunk("c2", "volcanic rock forms islands"),
            ])
            .await
            .unwrap();
        assert_eq!(count, 2);

        let hits = locked
            .similarity_search_with_score("coral reefs shelter fish", 1)
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, "c1");
        assert!(hits[0].distance < 0.1);
    }

    #[tokio::test]
    async fn concurrent_writers_serialize_without_loss() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteVectorStore::open(&dir.path().join("kb"), "kb", DistanceMetric::Cosine).unwrap();
        let locked = Arc::new(LockedVectorStore::new(
            store,
            local_embedder(dir.path()),
            dir.path().join("locks/chroma_kb.lock"),
        ));

        let mut handles = Vec::new();
        for i in 0..8 {
            let locked = locked.clone();
            handles.push(tokio::spawn(async move {
                locked
                    .add_documents_async(vec![chunk(&format!("c{}", i), &format!("text {}", i))])
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(locked.count().await.unwrap(), 8);
    }
}
