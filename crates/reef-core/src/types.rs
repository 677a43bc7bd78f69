use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

id_type!(
    /// Unique identifier for a user.
    UserId
);
id_type!(
    /// Unique identifier for a knowledge base.
    KbId
);
id_type!(
    /// Unique identifier for a document within a knowledge base.
    DocId
);
id_type!(
    /// Unique identifier for a chunk (random, stable for the chunk's lifetime).
    ChunkId
);
id_type!(
    /// Unique identifier for a chat session.
    SessionId
);
id_type!(
    /// Unique identifier for a group chat.
    GroupId
);
id_type!(
    /// Unique identifier for a group member (human or AI persona).
    MemberId
);

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A single message in a session's history.
///
/// `tool_calls` is set on assistant messages that requested tools;
/// `tool_call_id`/`tool_name` on tool responses; `references` only on
/// assistant messages that cited knowledge-base chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<LeanCitation>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn tool_response(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            references: Vec::new(),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            references: Vec::new(),
        }
    }
}

/// Lean citation: the persisted form tying an assistant reply to a chunk.
///
/// `ref_marker` is the number the user sees (1..N, assigned after dedup);
/// `ref_id` is the stable dedup key (chunk id, else content hash).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeanCitation {
    pub ref_id: String,
    pub ref_marker: u32,
    pub document_id: String,
    pub chunk_id: String,
    pub score: f64,
    pub doc_id: String,
    pub kb_id: String,
    pub filename: String,
}

/// Rich citation: lean fields plus the content shown in the citation panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RichCitation {
    #[serde(flatten)]
    pub lean: LeanCitation,
    pub document_name: String,
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Distance metric of a vector collection. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    L2,
    Ip,
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Cosine => write!(f, "cosine"),
            DistanceMetric::L2 => write!(f, "l2"),
            DistanceMetric::Ip => write!(f, "ip"),
        }
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(DistanceMetric::Cosine),
            "l2" => Ok(DistanceMetric::L2),
            "ip" => Ok(DistanceMetric::Ip),
            other => Err(format!("unknown distance metric: {}", other)),
        }
    }
}

/// Which vector backend holds the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Chroma,
    Faiss,
}

impl fmt::Display for VectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VectorBackend::Chroma => write!(f, "chroma"),
            VectorBackend::Faiss => write!(f, "faiss"),
        }
    }
}
