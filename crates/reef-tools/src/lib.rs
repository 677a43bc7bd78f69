//! Tool runtime seam: declarations, the runtime trait the orchestrator
//! consumes, and an in-process registry implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Knowledge-base search gets citation post-processing in the orchestrator.
pub const SEARCH_KNOWLEDGE_BASE: &str = "search_knowledge_base";
/// The graph-search family marks the session for visualization extraction.
pub const GRAPH_SEARCH_TOOLS: &[&str] = &["graph_search_knowledge", "flexible_graph_query"];

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("tool '{tool}' failed: {reason}")]
    Failed { tool: String, reason: String },

    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },
}

impl From<ToolError> for reef_core::ReefError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::Unknown(name) => reef_core::ReefError::NotFound(format!("tool {}", name)),
            ToolError::Failed { tool, reason } => reef_core::ReefError::ToolFailed { tool, reason },
            ToolError::InvalidArguments { tool, reason } => {
                reef_core::ReefError::ToolFailed { tool, reason }
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ToolError>;

/// Tool declaration sent to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDecl {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Scope of a tool invocation: which session/user is asking.
#[derive(Debug, Clone, Default)]
pub struct ToolScope {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

/// The runtime is the source of truth for which tools exist and what they
/// return. Results are opaque strings, typically JSON.
#[async_trait]
pub trait ToolRuntime: Send + Sync {
    /// Tools available to this scope. May be user-filtered.
    async fn list_tools(&self, scope: &ToolScope) -> Vec<ToolDecl>;

    /// Invoke a tool by name. Unknown names fail the call, never the server.
    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        scope: &ToolScope,
    ) -> Result<String>;
}

/// A single tool implementation for the in-process runtime.
#[async_trait]
pub trait Tool: Send + Sync {
    fn decl(&self) -> ToolDecl;
    async fn execute(&self, arguments: serde_json::Value, scope: &ToolScope) -> Result<String>;
}

/// In-process registry runtime with per-user disabled-tool filtering.
pub struct ToolRegistry {
    tools: Mutex<HashMap<String, Arc<dyn Tool>>>,
    disabled: Mutex<HashMap<String, HashSet<String>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Mutex::new(HashMap::new()),
            disabled: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.decl().name;
        debug!(tool = %name, "tool registered");
        self.tools.lock().unwrap().insert(name, tool);
    }

    /// Record a user's disabled tool set; these are hidden from `list_tools`
    /// and rejected by `call_tool` for that user.
    pub fn set_disabled_for_user(&self, user_id: &str, tools: HashSet<String>) {
        self.disabled
            .lock()
            .unwrap()
            .insert(user_id.to_string(), tools);
    }

    fn is_disabled(&self, scope: &ToolScope, tool_name: &str) -> bool {
        let Some(user_id) = &scope.user_id else {
            return false;
        };
        self.disabled
            .lock()
            .unwrap()
            .get(user_id)
            .is_some_and(|set| set.contains(tool_name))
    }
}

#[async_trait]
impl ToolRuntime for ToolRegistry {
    async fn list_tools(&self, scope: &ToolScope) -> Vec<ToolDecl> {
        let tools = self.tools.lock().unwrap();
        let mut decls: Vec<ToolDecl> = tools
            .iter()
            .filter(|(name, _)| !self.is_disabled(scope, name))
            .map(|(_, tool)| tool.decl())
            .collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        scope: &ToolScope,
    ) -> Result<String> {
        if self.is_disabled(scope, tool_name) {
            return Err(ToolError::Unknown(tool_name.to_string()));
        }
        let tool = self
            .tools
            .lock()
            .unwrap()
            .get(tool_name)
            .cloned()
            .ok_or_else(|| ToolError::Unknown(tool_name.to_string()))?;
        tool.execute(arguments, scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn decl(&self) -> ToolDecl {
            ToolDecl {
                name: "echo".into(),
                description: "echo arguments back".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }
        }

        async fn execute(
            &self,
            arguments: serde_json::Value,
            _scope: &ToolScope,
        ) -> Result<String> {
            Ok(arguments.to_string())
        }
    }

    #[tokio::test]
    async fn unknown_tool_fails_the_call() {
        let registry = ToolRegistry::new();
        let err = registry
            .call_tool("nope", serde_json::json!({}), &ToolScope::default())
            .await;
        assert!(matches!(err, Err(ToolError::Unknown(_))));
    }

    #[tokio::test]
    async fn disabled_tools_are_hidden_per_user() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));

        let scope = ToolScope {
            session_id: None,
            user_id: Some("u1".into()),
        };
        assert_eq!(registry.list_tools(&scope).await.len(), 1);

        registry.set_disabled_for_user("u1", ["echo".to_string()].into());
        assert!(registry.list_tools(&scope).await.is_empty());
        assert!(registry
            .call_tool("echo", serde_json::json!({}), &scope)
            .await
            .is_err());

        // Other users are unaffected.
        let other = ToolScope {
            session_id: None,
            user_id: Some("u2".into()),
        };
        assert_eq!(registry.list_tools(&other).await.len(), 1);
    }
}
