use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use reef_core::types::DistanceMetric;
use reef_embed::EmbeddingProvider;
use reef_store::types::VectorSpec;

use crate::backend::SqliteVectorStore;
use crate::error::{Result, VectorError};
use crate::locked::LockedVectorStore;
use crate::naming::{lock_file_name, sanitize_collection_name, sanitize_folder_name};

/// Timeout for the creation-time lock; shorter than the write lock because
/// creation only touches the catalog.
const CREATE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
/// Minimum spacing between debounced global compactions per collection.
const COMPACTION_DEBOUNCE: Duration = Duration::from_secs(60);

/// Identity of a vector-store handle. Opening the same collection with a
/// different metric is a different key (and will fail against the catalog).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VectorStoreKey {
    pub collection: String,
    pub persist_dir: PathBuf,
    pub metric: DistanceMetric,
}

/// Process-wide registry of locked vector-store handles, shared across
/// users. One handle per (collection, persist_dir, metric); creation is
/// guarded by the collection's cross-process file lock.
pub struct VectorStoreRegistry {
    data_root: PathBuf,
    instances: Mutex<HashMap<VectorStoreKey, Arc<LockedVectorStore>>>,
    last_compaction: Mutex<HashMap<String, Instant>>,
}

impl VectorStoreRegistry {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            instances: Mutex::new(HashMap::new()),
            last_compaction: Mutex::new(HashMap::new()),
        }
    }

    fn locks_dir(&self) -> PathBuf {
        self.data_root.join("locks")
    }

    fn key_for(&self, spec: &VectorSpec) -> VectorStoreKey {
        let folder = sanitize_folder_name(&spec.collection_name);
        VectorStoreKey {
            collection: sanitize_collection_name(&spec.collection_name),
            persist_dir: self
                .data_root
                .join(spec.backend.to_string())
                .join(folder),
            metric: spec.distance_metric,
        }
    }

    fn lock_path(&self, spec: &VectorSpec, key: &VectorStoreKey) -> PathBuf {
        self.locks_dir()
            .join(lock_file_name(&spec.backend.to_string(), &key.collection))
    }

    /// Get or create the locked handle for `spec`.
    ///
    /// The creation path holds the collection's file lock so two processes
    /// racing on first open cannot both construct the backend; the in-memory
    /// map is double-checked inside the lock. A failed handle is never
    /// cached.
    pub async fn get_or_create(
        &self,
        spec: &VectorSpec,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Arc<LockedVectorStore>> {
        let key = self.key_for(spec);

        if let Some(existing) = self.instances.lock().unwrap().get(&key) {
            return Ok(existing.clone());
        }

        let lock_path = self.lock_path(spec, &key);
        let creation_key = key.clone();
        let store = tokio::task::spawn_blocking(move || -> Result<SqliteVectorStore> {
            let _create_lock = crate::locked::acquire_write_lock(
                &lock_path,
                &creation_key.collection,
                CREATE_LOCK_TIMEOUT,
            )?;
            SqliteVectorStore::open(
                &creation_key.persist_dir,
                &creation_key.collection,
                creation_key.metric,
            )
        })
        .await
        .map_err(|e| VectorError::Unavailable(format!("create task panicked: {}", e)))??;

        let mut instances = self.instances.lock().unwrap();
        if let Some(existing) = instances.get(&key) {
            // Another task finished construction first; the extra backend is
            // dropped and its connection closed.
            return Ok(existing.clone());
        }
        let handle = Arc::new(LockedVectorStore::new(
            store,
            embedder,
            self.lock_path(spec, &key),
        ));
        info!(
            collection = %key.collection,
            metric = %key.metric,
            total = instances.len() + 1,
            "vector store handle created"
        );
        instances.insert(key, handle.clone());
        Ok(handle)
    }

    /// Final WAL checkpoint, then drop the handle. Used on KB deletion.
    pub async fn remove(&self, spec: &VectorSpec) -> Result<bool> {
        let key = self.key_for(spec);
        let handle = self.instances.lock().unwrap().remove(&key);
        match handle {
            Some(handle) => {
                let backend = handle.backend();
                tokio::task::spawn_blocking(move || backend.checkpoint())
                    .await
                    .map_err(|e| VectorError::Unavailable(format!("checkpoint panicked: {}", e)))??;
                info!(collection = %key.collection, "vector store handle removed");
                Ok(true)
            }
            None => {
                warn!(collection = %key.collection, "remove: handle not loaded");
                Ok(false)
            }
        }
    }

    /// Terminal checkpoint plus re-count for a collection, guaranteeing
    /// crash-safety before a restart. Called at the end of batch ingestion.
    pub async fn force_global_compaction_wait(&self, collection_raw: &str) -> Result<Option<i64>> {
        let collection = sanitize_collection_name(collection_raw);
        let handle = {
            let instances = self.instances.lock().unwrap();
            instances
                .iter()
                .find(|(k, _)| k.collection == collection)
                .map(|(_, v)| v.clone())
        };
        match handle {
            Some(handle) => Ok(Some(handle.force_compaction().await?)),
            None => {
                warn!(%collection, "compaction requested for unloaded collection");
                Ok(None)
            }
        }
    }

    /// Debounced variant: runs the global compaction at most once per
    /// 60 seconds per collection, bounding how far the WAL can lag during a
    /// long ingestion.
    pub async fn maybe_compact(&self, collection_raw: &str) -> Result<()> {
        let collection = sanitize_collection_name(collection_raw);
        {
            let mut last = self.last_compaction.lock().unwrap();
            if let Some(at) = last.get(&collection) {
                if at.elapsed() < COMPACTION_DEBOUNCE {
                    return Ok(());
                }
            }
            last.insert(collection.clone(), Instant::now());
        }
        self.force_global_compaction_wait(&collection).await?;
        Ok(())
    }

    pub fn active_handles(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Drop all handles after a terminal checkpoint on each. Tests/shutdown.
    pub async fn clear(&self) {
        let drained: Vec<_> = {
            let mut instances = self.instances.lock().unwrap();
            instances.drain().collect()
        };
        for (key, handle) in drained {
            let backend = handle.backend();
            let res = tokio::task::spawn_blocking(move || backend.checkpoint()).await;
            if res.is_err() {
                warn!(collection = %key.collection, "checkpoint on clear failed");
            }
        }
    }
}
