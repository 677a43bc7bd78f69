use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{EmbedError, Result};
use crate::provider::EmbeddingProvider;

/// Embeddings over an OpenAI-compatible `/v1/embeddings` endpoint.
pub struct OpenAiCompatEmbedding {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    dimensions: usize,
}

impl OpenAiCompatEmbedding {
    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: Option<&str>,
        dimensions: usize,
    ) -> Result<Self> {
        let api_key = api_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                EmbedError::BadConfig(format!("provider for '{}' requires an api key", model))
            })?
            .to_string();
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            dimensions,
        })
    }
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingItem>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingItem {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatEmbedding {
    fn name(&self) -> &str {
        "openai_compat"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.endpoint);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "model": self.model, "input": texts }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(EmbedError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: OpenAiEmbeddingResponse = resp.json().await?;
        if body.data.len() != texts.len() {
            return Err(EmbedError::Parse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.data.len()
            )));
        }
        debug!(model = %self.model, count = texts.len(), "embedded batch");
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Embeddings from a local Ollama server (`/api/embeddings`, one text per call).
pub struct OllamaEmbedding {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimensions: usize,
}

impl OllamaEmbedding {
    pub fn new(endpoint: &str, model: &str, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimensions,
        }
    }
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    fn name(&self) -> &str {
        "ollama"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embeddings", self.endpoint);
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let resp = self
                .client
                .post(&url)
                .json(&serde_json::json!({ "model": self.model, "prompt": text }))
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let message = resp.text().await.unwrap_or_default();
                return Err(EmbedError::Api {
                    status: status.as_u16(),
                    message,
                });
            }
            let body: OllamaEmbeddingResponse = resp.json().await?;
            out.push(body.embedding);
        }
        Ok(out)
    }
}
