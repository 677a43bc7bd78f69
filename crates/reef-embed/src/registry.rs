use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use reef_store::types::EmbeddingSpec;

use crate::error::Result;
use crate::local::LocalEmbedding;
use crate::provider::EmbeddingProvider;
use crate::remote::{OllamaEmbedding, OpenAiCompatEmbedding};

const REMOTE_DIMENSIONS: usize = 1024;

/// Composite key deduplicating embedding handles process-wide.
///
/// For local providers the key is the absolute model path; for HTTP-backed
/// providers it is (provider, model, endpoint). API keys are deliberately
/// not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EmbeddingKey {
    provider: &'static str,
    model: String,
    endpoint: Option<String>,
}

impl EmbeddingKey {
    fn from_spec(spec: &EmbeddingSpec) -> Self {
        match spec {
            EmbeddingSpec::OpenAiCompat { model, endpoint, .. } => Self {
                provider: "openai_compat",
                model: model.trim().to_lowercase(),
                endpoint: Some(endpoint.trim_end_matches('/').to_string()),
            },
            EmbeddingSpec::Ollama { model, endpoint } => Self {
                provider: "ollama",
                model: model.trim().to_lowercase(),
                endpoint: Some(endpoint.trim_end_matches('/').to_string()),
            },
            EmbeddingSpec::Local { model_path } => Self {
                provider: "local",
                model: model_path.clone(),
                endpoint: None,
            },
        }
    }
}

/// Process-wide registry of embedding handles.
///
/// `get_or_create` is double-checked under a mutex and returns the same
/// handle for equal keys. Handles are never reloaded within a process; only
/// `clear` (tests) destroys them.
pub struct ModelRegistry {
    instances: Mutex<HashMap<EmbeddingKey, Arc<dyn EmbeddingProvider>>>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, spec: &EmbeddingSpec) -> Result<Arc<dyn EmbeddingProvider>> {
        let key = EmbeddingKey::from_spec(spec);

        // Fast path without constructing anything.
        if let Some(existing) = self.instances.lock().unwrap().get(&key) {
            return Ok(existing.clone());
        }

        // Construction may do filesystem or config validation; build outside
        // the map lock, then double-check before inserting.
        let built: Arc<dyn EmbeddingProvider> = match spec {
            EmbeddingSpec::OpenAiCompat {
                model,
                endpoint,
                api_key,
            } => Arc::new(OpenAiCompatEmbedding::new(
                endpoint,
                model,
                api_key.as_deref(),
                REMOTE_DIMENSIONS,
            )?),
            EmbeddingSpec::Ollama { model, endpoint } => {
                Arc::new(OllamaEmbedding::new(endpoint, model, REMOTE_DIMENSIONS))
            }
            EmbeddingSpec::Local { model_path } => Arc::new(LocalEmbedding::new(model_path)?),
        };

        let mut instances = self.instances.lock().unwrap();
        if let Some(existing) = instances.get(&key) {
            return Ok(existing.clone());
        }
        info!(provider = built.name(), model = %key.model, "embedding handle created");
        instances.insert(key, built.clone());
        Ok(built)
    }

    pub fn len(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all handles. Tests only.
    pub fn clear(&self) {
        self.instances.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_specs_share_a_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.bin");
        std::fs::write(&path, b"x").unwrap();
        let spec = EmbeddingSpec::Local {
            model_path: path.to_str().unwrap().to_string(),
        };

        let registry = ModelRegistry::new();
        let a = registry.get_or_create(&spec).unwrap();
        let b = registry.get_or_create(&spec).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn endpoint_is_part_of_the_key() {
        let registry = ModelRegistry::new();
        let a = registry
            .get_or_create(&EmbeddingSpec::Ollama {
                model: "nomic-embed-text".into(),
                endpoint: "http://localhost:11434".into(),
            })
            .unwrap();
        let b = registry
            .get_or_create(&EmbeddingSpec::Ollama {
                model: "nomic-embed-text".into(),
                endpoint: "http://other:11434".into(),
            })
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn missing_credentials_fail_fast() {
        let registry = ModelRegistry::new();
        let err = registry.get_or_create(&EmbeddingSpec::OpenAiCompat {
            model: "text-embedding-3-small".into(),
            endpoint: "https://api.example.com/v1".into(),
            api_key: None,
        });
        assert!(matches!(err, Err(crate::EmbedError::BadConfig(_))));
        // A failed handle is never cached.
        assert!(registry.is_empty());
    }

    #[test]
    fn clear_destroys_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.bin");
        std::fs::write(&path, b"x").unwrap();
        let registry = ModelRegistry::new();
        registry
            .get_or_create(&EmbeddingSpec::Local {
                model_path: path.to_str().unwrap().to_string(),
            })
            .unwrap();
        registry.clear();
        assert!(registry.is_empty());
    }
}
