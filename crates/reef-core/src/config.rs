use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18920;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Top-level config (reef.toml + REEF_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReefConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub tools: ToolLoopConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub tasks: TaskQueueConfig,
}

impl ReefConfig {
    /// Load from `path` (if present) with environment overrides: the
    /// well-known knob names (`TOOL_MAX_ITERATIONS`, …) plus generic
    /// `REEF_*` variables, e.g. `REEF_TOOLS__MAX_ITERATIONS=4`.
    pub fn load(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(knob_env())
            .merge(Env::prefixed("REEF_").split("__"))
            .extract()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Static bearer token; `None` disables auth (local development only).
    pub token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            token: None,
        }
    }
}

/// Filesystem layout: vector stores, locks, and task records live under `root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_root")]
    pub root: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: default_data_root(),
        }
    }
}

impl DataConfig {
    pub fn locks_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.root).join("locks")
    }

    pub fn tasks_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.root).join("tasks")
    }

    pub fn backend_dir(&self, backend: &str) -> std::path::PathBuf {
        std::path::Path::new(&self.root).join(backend)
    }
}

/// Tool-loop knobs. Env overrides: REEF_TOOLS__MAX_ITERATIONS etc.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolLoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Per-tool execution timeout (seconds). Long-running tools get 10 min.
    #[serde(default = "default_tool_execution_timeout")]
    pub tool_execution_timeout: u64,
    /// Wall-clock budget for the whole tool loop (seconds).
    #[serde(default = "default_tool_total_timeout")]
    pub total_timeout: u64,
    /// Single LLM call timeout (seconds).
    #[serde(default = "default_llm_call_timeout")]
    pub llm_call_timeout: u64,
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
    #[serde(default = "default_max_tool_result_size")]
    pub max_tool_result_size: usize,
    #[serde(default = "default_true")]
    pub allow_continue_on_error: bool,
    #[serde(default = "default_true")]
    pub force_reply_on_max_iterations: bool,
    #[serde(default = "default_true")]
    pub enable_tool_cache: bool,
    #[serde(default = "default_true")]
    pub enable_tool_stats: bool,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tool_execution_timeout: default_tool_execution_timeout(),
            total_timeout: default_tool_total_timeout(),
            llm_call_timeout: default_llm_call_timeout(),
            max_concurrent_tools: default_max_concurrent_tools(),
            max_tool_result_size: default_max_tool_result_size(),
            allow_continue_on_error: true,
            force_reply_on_max_iterations: true,
            enable_tool_cache: true,
            enable_tool_stats: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Idle session timeout (seconds).
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
    /// Repacketization chunk size in characters, used only when
    /// `enable_smart_chunking` is on.
    #[serde(default = "default_chunk_size_chars")]
    pub chunk_size: usize,
    #[serde(default)]
    pub enable_smart_chunking: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_concurrent_sessions(),
            session_timeout: default_session_timeout(),
            chunk_size: default_chunk_size_chars(),
            enable_smart_chunking: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Documents a single user may process concurrently.
    #[serde(default = "default_per_user_concurrency")]
    pub per_user_concurrency: usize,
    /// Chunks per embed+write batch.
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
    /// Minimum spacing between global compaction checks per KB (seconds).
    #[serde(default = "default_compaction_debounce")]
    pub compaction_debounce_secs: u64,
    /// Parser worker pool size.
    #[serde(default = "default_parser_workers")]
    pub parser_workers: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            per_user_concurrency: default_per_user_concurrency(),
            embed_batch_size: default_embed_batch_size(),
            compaction_debounce_secs: default_compaction_debounce(),
            parser_workers: default_parser_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    #[serde(default = "default_task_workers")]
    pub workers: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Default per-task timeout (seconds).
    #[serde(default = "default_task_timeout")]
    pub task_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub enable_persistence: bool,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            workers: default_task_workers(),
            max_queue_size: default_max_queue_size(),
            task_timeout: default_task_timeout(),
            max_retries: default_max_retries(),
            enable_persistence: true,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_data_root() -> String {
    "data".to_string()
}
fn default_max_iterations() -> u32 {
    10
}
fn default_tool_execution_timeout() -> u64 {
    600
}
fn default_tool_total_timeout() -> u64 {
    900
}
fn default_llm_call_timeout() -> u64 {
    300
}
fn default_max_concurrent_tools() -> usize {
    5
}
fn default_max_tool_result_size() -> usize {
    1024 * 1024
}
fn default_max_concurrent_sessions() -> usize {
    100
}
fn default_session_timeout() -> u64 {
    3600
}
fn default_chunk_size_chars() -> usize {
    24
}
fn default_per_user_concurrency() -> usize {
    5
}
fn default_embed_batch_size() -> usize {
    100
}
fn default_compaction_debounce() -> u64 {
    60
}
fn default_parser_workers() -> usize {
    4
}
fn default_task_workers() -> usize {
    4
}
fn default_max_queue_size() -> usize {
    1000
}
fn default_task_timeout() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

/// The flat knob names operators already know, mapped onto their config
/// paths.
fn knob_env() -> Env {
    Env::raw()
        .only(&[
            "TOOL_MAX_ITERATIONS",
            "TOOL_EXECUTION_TIMEOUT",
            "TOOL_TOTAL_TIMEOUT",
            "LLM_CALL_TIMEOUT",
            "STREAMING_MAX_CONCURRENT_SESSIONS",
            "STREAMING_SESSION_TIMEOUT",
            "STREAMING_CHUNK_SIZE",
            "STREAMING_ENABLE_SMART_CHUNKING",
        ])
        .map(|key| {
            let mapped: String = match key.as_str() {
                "TOOL_MAX_ITERATIONS" => "tools.max_iterations".into(),
                "TOOL_EXECUTION_TIMEOUT" => "tools.tool_execution_timeout".into(),
                "TOOL_TOTAL_TIMEOUT" => "tools.total_timeout".into(),
                "LLM_CALL_TIMEOUT" => "tools.llm_call_timeout".into(),
                "STREAMING_MAX_CONCURRENT_SESSIONS" => "streaming.max_concurrent_sessions".into(),
                "STREAMING_SESSION_TIMEOUT" => "streaming.session_timeout".into(),
                "STREAMING_CHUNK_SIZE" => "streaming.chunk_size".into(),
                "STREAMING_ENABLE_SMART_CHUNKING" => "streaming.enable_smart_chunking".into(),
                other => other.to_string(),
            };
            mapped.into()
        })
        .split(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = ReefConfig::default();
        assert_eq!(cfg.tools.max_iterations, 10);
        assert_eq!(cfg.tools.tool_execution_timeout, 600);
        assert_eq!(cfg.tools.total_timeout, 900);
        assert_eq!(cfg.tools.max_tool_result_size, 1024 * 1024);
        assert_eq!(cfg.ingestion.embed_batch_size, 100);
        assert_eq!(cfg.tasks.workers, 4);
        assert!(!cfg.streaming.enable_smart_chunking);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = ReefConfig::load("does-not-exist.toml").unwrap();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
    }
}
