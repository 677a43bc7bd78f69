use reef_core::types::{DistanceMetric, DocId, KbId, SessionId, UserId, VectorBackend};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a knowledge base embeds its chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum EmbeddingSpec {
    /// OpenAI-compatible HTTP endpoint.
    OpenAiCompat {
        model: String,
        endpoint: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
    /// Local Ollama server.
    Ollama {
        model: String,
        #[serde(default = "default_ollama_endpoint")]
        endpoint: String,
    },
    /// Local model identified by its absolute path.
    Local { model_path: String },
}

fn default_ollama_endpoint() -> String {
    "http://localhost:11434".to_string()
}

/// Where and how a knowledge base stores its vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSpec {
    #[serde(default)]
    pub backend: VectorBackend,
    pub collection_name: String,
    #[serde(default)]
    pub distance_metric: DistanceMetric,
}

/// How documents are split into chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingSpec {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_separators")]
    pub separators: Vec<String>,
}

impl Default for ChunkingSpec {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            separators: default_separators(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_separators() -> Vec<String> {
    ["\n\n", "\n", "。", "！", "？", "，", " ", ""]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Per-KB search defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpec {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_threshold: Option<f64>,
}

impl Default for SearchSpec {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: None,
        }
    }
}

fn default_top_k() -> usize {
    3
}

/// A knowledge base row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub kb_id: KbId,
    pub owner_id: UserId,
    pub name: String,
    pub embedding: EmbeddingSpec,
    pub vector: VectorSpec,
    pub chunking: ChunkingSpec,
    pub search: SearchSpec,
    pub document_count: i64,
    pub chunk_count: i64,
    pub total_size: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Document lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "uploaded" => Ok(DocumentStatus::Uploaded),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(format!("unknown document status: {}", other)),
        }
    }
}

/// A document row, owned by exactly one KB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: DocId,
    pub kb_id: KbId,
    pub filename: String,
    pub size: i64,
    pub mime_type: Option<String>,
    pub status: DocumentStatus,
    pub task_id: Option<String>,
    pub object_url: Option<String>,
    pub chunk_count: i64,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Persisted session settings plus KB bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub model_settings: ModelSettings,
    pub system_prompt: Option<String>,
    pub kb_bindings: Vec<KbId>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub provider: String,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Durable record of a model's tool-calling capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapability {
    pub model_name: String,
    pub supports_tools: bool,
    pub last_checked: String,
    pub error_message: Option<String>,
    pub notes: Option<String>,
    pub first_seen: String,
    pub check_count: i64,
}
