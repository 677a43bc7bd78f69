use std::path::Path;

use async_trait::async_trait;

use crate::error::{EmbedError, Result};
use crate::provider::EmbeddingProvider;

const DEFAULT_DIMENSIONS: usize = 384;

/// Local embedding provider keyed by model path.
///
/// Uses feature hashing: each whitespace/punctuation-separated token is
/// hashed into one of `dimensions` buckets and the resulting count vector is
/// L2-normalised. Deterministic, dependency-free, and good enough for the
/// registry/ingestion/retrieval contracts this crate exists to serve; swap
/// in a real model behind the same trait when one is wired up.
pub struct LocalEmbedding {
    model_path: String,
    dimensions: usize,
}

impl LocalEmbedding {
    /// Fails with `NotFound` when `model_path` does not exist.
    pub fn new(model_path: &str) -> Result<Self> {
        if !Path::new(model_path).exists() {
            return Err(EmbedError::NotFound(format!(
                "local model path missing: {}",
                model_path
            )));
        }
        Ok(Self {
            model_path: model_path.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
        })
    }

    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dimensions];
        for token in tokenize(text) {
            let bucket = fnv1a(token) as usize % self.dimensions;
            // Alternate sign by a second hash bit to reduce bucket collisions
            // cancelling out into pure counts.
            let sign = if fnv1a(token) & 1 == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .filter(|t| !t.is_empty())
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in s.to_lowercase().bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedding {
    fn name(&self) -> &str {
        "local"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
