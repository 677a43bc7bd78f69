use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use futures_util::future::join_all;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use reef_core::config::{StreamingConfig, ToolLoopConfig};
use reef_core::types::{LeanCitation, Message, ToolCall};
use reef_tools::{ToolRuntime, ToolScope, GRAPH_SEARCH_TOOLS, SEARCH_KNOWLEDGE_BASE};

use crate::capability::CapabilityMemory;
use crate::citations::CitationTracker;
use crate::error::{ChatError, ChatResult};
use crate::framing;
use crate::stats::ToolStats;
use crate::stream::{ChatService, StreamEvent};

/// Separator between tool-call narration and the final answer.
const ITERATION_SEPARATOR: &str = "\n\n---\n\n";

/// Per-session streaming state, observable by status endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    Idle,
    Thinking,
    ToolCalling,
    Generating,
    Completed,
    Error,
}

/// Input for one user turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub user_id: Option<String>,
    pub model_name: String,
    /// System prompt + history + the current user message.
    pub messages: Vec<Message>,
}

/// What the turn produced, for persistence by the caller.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub content: String,
    pub citations: Vec<LeanCitation>,
    pub used_tools: bool,
    pub iterations: u32,
}

/// Per-session state machine driving a tool loop around the LLM with
/// streaming, parallel tool execution, caching, quotas, and incremental
/// de-duplicated citation emission.
pub struct StreamingOrchestrator {
    config: ToolLoopConfig,
    streaming: StreamingConfig,
    capability: Arc<CapabilityMemory>,
    runtime: Arc<dyn ToolRuntime>,
    tool_cache: DashMap<String, String>,
    tool_semaphores: DashMap<String, Arc<Semaphore>>,
    states: DashMap<String, StreamingState>,
    /// Sessions whose turn used a graph-search tool; the boundary layer
    /// extracts visualization payloads for these after the turn.
    graph_sessions: DashSet<String>,
}

impl StreamingOrchestrator {
    pub fn new(
        config: ToolLoopConfig,
        streaming: StreamingConfig,
        capability: Arc<CapabilityMemory>,
        runtime: Arc<dyn ToolRuntime>,
    ) -> Self {
        Self {
            config,
            streaming,
            capability,
            runtime,
            tool_cache: DashMap::new(),
            tool_semaphores: DashMap::new(),
            states: DashMap::new(),
            graph_sessions: DashSet::new(),
        }
    }

    pub fn state(&self, session_id: &str) -> StreamingState {
        self.states
            .get(session_id)
            .map(|s| *s)
            .unwrap_or(StreamingState::Idle)
    }

    /// True once per turn if a graph-search tool ran for the session.
    pub fn take_graph_session(&self, session_id: &str) -> bool {
        self.graph_sessions.remove(session_id).is_some()
    }

    pub fn clear_tool_cache(&self) {
        let size = self.tool_cache.len();
        self.tool_cache.clear();
        info!(size, "tool cache cleared");
    }

    /// Drive one user turn. Text chunks and sentinel frames are pushed to
    /// `out`; the returned outcome carries the accumulated answer and
    /// citations for persistence.
    #[instrument(skip_all, fields(session_id = %req.session_id, model = %req.model_name))]
    pub async fn stream_turn(
        &self,
        service: Arc<dyn ChatService>,
        req: TurnRequest,
        out: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> ChatResult<TurnOutcome> {
        self.set_state(&req.session_id, StreamingState::Thinking);
        let result = self.run_turn(service, &req, &out, &cancel).await;
        match &result {
            Ok(_) => self.set_state(&req.session_id, StreamingState::Completed),
            Err(_) => self.set_state(&req.session_id, StreamingState::Error),
        }
        result
    }

    async fn run_turn(
        &self,
        service: Arc<dyn ChatService>,
        req: &TurnRequest,
        out: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> ChatResult<TurnOutcome> {
        let scope = ToolScope {
            session_id: Some(req.session_id.clone()),
            user_id: req.user_id.clone(),
        };
        let tools = self.runtime.list_tools(&scope).await;

        let use_tools = service.supports_tool_calls()
            && !tools.is_empty()
            && self.capability.check_supports_tools(&req.model_name);
        if !use_tools {
            debug!("tool loop skipped; plain streaming");
            let content = self
                .stream_plain(&service, req.messages.clone(), req, out, cancel)
                .await?;
            return Ok(TurnOutcome {
                content,
                citations: Vec::new(),
                used_tools: false,
                iterations: 0,
            });
        }

        let mut messages = req.messages.clone();
        let mut tracker = CitationTracker::new();
        let mut stats = ToolStats::default();
        let mut answer = String::new();
        let started = Instant::now();
        let max_iter = self.config.max_iterations;
        let mut iteration = 0u32;
        let mut reached_limit = false;
        let mut prev_iteration_narrated = false;

        'turn: while iteration < max_iter {
            iteration += 1;

            if started.elapsed().as_secs() > self.config.total_timeout {
                warn!(
                    elapsed = started.elapsed().as_secs(),
                    "tool loop total timeout; forcing final reply"
                );
                messages.push(Message::system(
                    "Tool calling has timed out. Produce the final reply from the \
                     information gathered so far.",
                ));
                let tail = self
                    .stream_plain(&service, messages.clone(), req, out, cancel)
                    .await?;
                answer.push_str(&tail);
                break 'turn;
            }

            debug!(iteration, max_iter, "tool loop iteration");
            let (content, calls) = match self
                .stream_once(
                    &service,
                    messages.clone(),
                    Some(tools.clone()),
                    req,
                    out,
                    cancel,
                    prev_iteration_narrated,
                )
                .await
            {
                Ok(pair) => pair,
                Err(ChatError::ToolsUnsupported { .. }) => {
                    // Persist the fact, then retry this turn once without
                    // tools.
                    warn!(model = %req.model_name, "model rejected tools; falling back");
                    self.capability
                        .mark_unsupported(&req.model_name, Some("tool call rejected"));
                    let content = self
                        .stream_plain(&service, req.messages.clone(), req, out, cancel)
                        .await?;
                    return Ok(TurnOutcome {
                        content,
                        citations: Vec::new(),
                        used_tools: false,
                        iterations: iteration,
                    });
                }
                Err(e) => return Err(e),
            };
            answer.push_str(&content);

            let Some(calls) = calls else {
                // `done` with no tool calls; stream already forwarded.
                break 'turn;
            };

            prev_iteration_narrated = !content.trim().is_empty();
            self.set_state(&req.session_id, StreamingState::ToolCalling);

            let mut assistant = Message::assistant(content);
            assistant.tool_calls = calls.clone();
            messages.push(assistant);

            let mut tool_msgs = self
                .execute_tools_parallel(&calls, &scope, &mut stats, &mut tracker, cancel)
                .await?;

            if let Some(batch) = tracker.take_new_batch() {
                let _ = out.send(framing::encode_references(&batch)).await;
            }
            if tracker.has_emitted() {
                let queries = kb_queries(&calls);
                let merged = tracker.merged_tool_json(&queries);
                for msg in &mut tool_msgs {
                    if msg.tool_name.as_deref() == Some(SEARCH_KNOWLEDGE_BASE) {
                        msg.content = merged.clone();
                    }
                }
            }
            messages.extend(tool_msgs);

            if iteration >= max_iter {
                reached_limit = true;
            }
        }

        if reached_limit {
            if self.config.force_reply_on_max_iterations {
                warn!(max_iter, "max tool iterations reached; forcing final reply");
                let hint = "\n\nMaximum tool iterations reached, producing the final reply...\n\n";
                answer.push_str(hint);
                let _ = out.send(hint.to_string()).await;
                messages.push(Message::system(
                    "The tool call budget is exhausted. Produce the final reply from \
                     the information gathered so far.",
                ));
                let tail = self
                    .stream_plain(&service, messages.clone(), req, out, cancel)
                    .await?;
                answer.push_str(&tail);
            } else {
                let hint = "\n[hint] Maximum tool iterations reached; please re-ask.\n";
                answer.push_str(hint);
                let _ = out.send(hint.to_string()).await;
            }
        }

        if self.config.enable_tool_stats && stats.total_calls > 0 {
            info!(session_id = %req.session_id, "tool stats: {}", stats.summary());
        }

        Ok(TurnOutcome {
            content: answer,
            citations: tracker.emitted_lean(),
            used_tools: true,
            iterations: iteration,
        })
    }

    /// One streaming call. Returns the content produced and the tool calls,
    /// if any. Content deltas are forwarded as they arrive, with the
    /// narration separator inserted before the first non-empty delta when
    /// the previous iteration produced both narration and tool calls.
    #[allow(clippy::too_many_arguments)]
    async fn stream_once(
        &self,
        service: &Arc<dyn ChatService>,
        messages: Vec<Message>,
        tools: Option<Vec<reef_tools::ToolDecl>>,
        req: &TurnRequest,
        out: &mpsc::Sender<String>,
        cancel: &CancellationToken,
        separator_pending: bool,
    ) -> ChatResult<(String, Option<Vec<ToolCall>>)> {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
        let svc = service.clone();
        let call = tokio::spawn(async move {
            match tools {
                Some(tools) => svc.stream_with_tools(messages, tools, tx).await,
                None => svc.stream_plain(messages, tx).await,
            }
        });

        let idle_timeout = Duration::from_secs(self.config.llm_call_timeout);
        let mut content = String::new();
        let mut first_content = true;
        let mut calls: Option<Vec<ToolCall>> = None;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    call.abort();
                    return Err(ChatError::Cancelled);
                }
                event = tokio::time::timeout(idle_timeout, rx.recv()) => match event {
                    Ok(event) => event,
                    Err(_) => {
                        call.abort();
                        return Err(ChatError::Timeout {
                            secs: self.config.llm_call_timeout,
                        });
                    }
                },
            };
            match event {
                Some(StreamEvent::ContentDelta { text }) => {
                    self.set_state(&req.session_id, StreamingState::Generating);
                    if separator_pending && first_content && !text.trim().is_empty() {
                        content.push_str(ITERATION_SEPARATOR);
                        let _ = out.send(ITERATION_SEPARATOR.to_string()).await;
                    }
                    if !text.trim().is_empty() {
                        first_content = false;
                    }
                    content.push_str(&text);
                    self.forward_text(out, text).await;
                }
                Some(StreamEvent::ToolCalls { calls: c }) => {
                    calls = Some(c);
                    break;
                }
                Some(StreamEvent::Done { reason }) => {
                    debug!(%reason, "stream done");
                    break;
                }
                None => break,
            }
        }

        match call.await {
            Ok(Ok(())) => Ok((content, calls)),
            Ok(Err(e)) => Err(e),
            Err(e) if e.is_cancelled() => Err(ChatError::Cancelled),
            Err(e) => Err(ChatError::Provider(format!("stream task failed: {}", e))),
        }
    }

    async fn stream_plain(
        &self,
        service: &Arc<dyn ChatService>,
        messages: Vec<Message>,
        req: &TurnRequest,
        out: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> ChatResult<String> {
        let (content, _) = self
            .stream_once(service, messages, None, req, out, cancel, false)
            .await?;
        Ok(content)
    }

    /// Forward a content delta, optionally repacketized into small chunks.
    async fn forward_text(&self, out: &mpsc::Sender<String>, text: String) {
        if !self.streaming.enable_smart_chunking || text.chars().count() <= self.streaming.chunk_size
        {
            let _ = out.send(text).await;
            return;
        }
        let chars: Vec<char> = text.chars().collect();
        for piece in chars.chunks(self.streaming.chunk_size.max(1)) {
            let _ = out.send(piece.iter().collect()).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Execute all tool calls of one step in parallel under the session's
    /// semaphore, with cache, timeout, truncation, stats, and permissive
    /// error translation. Knowledge-base results are absorbed into the
    /// citation tracker afterwards; graph tools mark the session.
    async fn execute_tools_parallel(
        &self,
        calls: &[ToolCall],
        scope: &ToolScope,
        stats: &mut ToolStats,
        tracker: &mut CitationTracker,
        cancel: &CancellationToken,
    ) -> ChatResult<Vec<Message>> {
        let session_key = scope.session_id.clone().unwrap_or_default();
        let semaphore = self
            .tool_semaphores
            .entry(session_key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_concurrent_tools)))
            .clone();

        let futures = calls.iter().map(|call| {
            let semaphore = semaphore.clone();
            let scope = scope.clone();
            let cancel = cancel.clone();
            let call = call.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.unwrap();
                let started = Instant::now();

                let cache_key = self.cache_key(&call.name, &call.arguments);
                if self.config.enable_tool_cache {
                    if let Some(hit) = self.tool_cache.get(&cache_key) {
                        debug!(tool = %call.name, "tool cache hit");
                        return ToolOutcome {
                            call,
                            content: hit.clone(),
                            success: true,
                            cached: true,
                            secs: started.elapsed().as_secs_f64(),
                        };
                    }
                }

                let timeout = Duration::from_secs(self.config.tool_execution_timeout);
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(ChatError::Cancelled),
                    res = tokio::time::timeout(
                        timeout,
                        self.runtime.call_tool(&call.name, call.arguments.clone(), &scope),
                    ) => match res {
                        Ok(Ok(content)) => Ok(content),
                        Ok(Err(e)) => Err(ChatError::Provider(e.to_string())),
                        Err(_) => Err(ChatError::Timeout {
                            secs: self.config.tool_execution_timeout,
                        }),
                    },
                };

                let secs = started.elapsed().as_secs_f64();
                match result {
                    Ok(content) => {
                        let content = self.truncate_tool_result(content, &call.name);
                        if self.config.enable_tool_cache {
                            self.tool_cache.insert(cache_key, content.clone());
                        }
                        debug!(tool = %call.name, secs, "tool succeeded");
                        ToolOutcome {
                            call,
                            content,
                            success: true,
                            cached: false,
                            secs,
                        }
                    }
                    Err(ChatError::Cancelled) => ToolOutcome {
                        call,
                        content: String::new(),
                        success: false,
                        cached: false,
                        secs,
                    },
                    Err(e) => {
                        error!(tool = %call.name, "tool failed: {e}");
                        ToolOutcome {
                            call,
                            content: format!("tool execution failed: {}", e),
                            success: false,
                            cached: false,
                            secs,
                        }
                    }
                }
            }
        });
        let outcomes: Vec<ToolOutcome> = join_all(futures).await;

        if cancel.is_cancelled() {
            return Err(ChatError::Cancelled);
        }

        let mut messages = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            stats.record(
                &outcome.call.name,
                outcome.success,
                outcome.secs,
                outcome.cached,
            );

            if !outcome.success && !self.config.allow_continue_on_error {
                return Err(ChatError::Provider(outcome.content));
            }

            if outcome.success && outcome.call.name == SEARCH_KNOWLEDGE_BASE {
                tracker.absorb_tool_result(&outcome.content);
            }
            if GRAPH_SEARCH_TOOLS.contains(&outcome.call.name.as_str()) {
                if let Some(session_id) = &scope.session_id {
                    self.graph_sessions.insert(session_id.clone());
                }
            }

            messages.push(Message::tool_response(
                outcome.call.id.clone(),
                outcome.call.name.clone(),
                outcome.content,
            ));
        }
        Ok(messages)
    }

    fn cache_key(&self, tool_name: &str, arguments: &serde_json::Value) -> String {
        // Canonical form: serde_json::Value maps preserve insertion order,
        // so re-serialize through a BTreeMap for key stability.
        let canonical = canonicalize(arguments);
        format!(
            "{:x}",
            md5::compute(format!("{}:{}", tool_name, canonical).as_bytes())
        )
    }

    fn truncate_tool_result(&self, result: String, tool_name: &str) -> String {
        let max = self.config.max_tool_result_size;
        if result.len() <= max {
            return result;
        }
        warn!(
            tool = tool_name,
            bytes = result.len(),
            max,
            "tool result truncated"
        );
        let mut end = max;
        while end > 0 && !result.is_char_boundary(end) {
            end -= 1;
        }
        format!(
            "{}\n\n[result truncated: {} of {} bytes]",
            &result[..end],
            end,
            result.len()
        )
    }

    fn set_state(&self, session_id: &str, state: StreamingState) {
        self.states.insert(session_id.to_string(), state);
    }
}

struct ToolOutcome {
    call: ToolCall,
    content: String,
    success: bool,
    cached: bool,
    secs: f64,
}

/// Queries carried by this step's knowledge-base search calls, for the
/// merged tool JSON header.
fn kb_queries(calls: &[ToolCall]) -> Vec<String> {
    calls
        .iter()
        .filter(|c| c.name == SEARCH_KNOWLEDGE_BASE)
        .filter_map(|c| {
            c.arguments
                .get("query")
                .and_then(|q| q.as_str())
                .map(str::to_string)
        })
        .collect()
}

fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let inner: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("\"{}\":{}", k, v))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reef_store::db::init_db;
    use reef_store::CapabilityStore;
    use rusqlite::Connection;
    use std::sync::Mutex;

    use crate::capability::InMemoryCapabilityCache;

    /// Scripted service: each entry is one streaming call's event list.
    struct ScriptedService {
        script: Mutex<Vec<Vec<StreamEvent>>>,
        supports_tools: bool,
        reject_tools: bool,
    }

    impl ScriptedService {
        fn new(script: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                supports_tools: true,
                reject_tools: false,
            })
        }
    }

    #[async_trait]
    impl ChatService for ScriptedService {
        fn supports_tool_calls(&self) -> bool {
            self.supports_tools
        }

        async fn stream_plain(
            &self,
            _messages: Vec<Message>,
            tx: mpsc::Sender<StreamEvent>,
        ) -> ChatResult<()> {
            let events = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    vec![
                        StreamEvent::ContentDelta {
                            text: "fallback answer".into(),
                        },
                        StreamEvent::Done {
                            reason: "stop".into(),
                        },
                    ]
                } else {
                    script.remove(0)
                }
            };
            for event in events {
                let _ = tx.send(event).await;
            }
            Ok(())
        }

        async fn stream_with_tools(
            &self,
            messages: Vec<Message>,
            _tools: Vec<reef_tools::ToolDecl>,
            tx: mpsc::Sender<StreamEvent>,
        ) -> ChatResult<()> {
            if self.reject_tools {
                return Err(ChatError::ToolsUnsupported {
                    model: "scripted".into(),
                });
            }
            // Hand the message list to the scripted step via tx so tests can
            // assert on the rewritten history if they want to.
            let _ = messages;
            self.stream_plain(Vec::new(), tx).await
        }
    }

    struct FakeRuntime {
        responses: Mutex<std::collections::HashMap<String, Vec<String>>>,
    }

    #[async_trait]
    impl ToolRuntime for FakeRuntime {
        async fn list_tools(&self, _scope: &ToolScope) -> Vec<reef_tools::ToolDecl> {
            vec![reef_tools::ToolDecl {
                name: SEARCH_KNOWLEDGE_BASE.into(),
                description: "search".into(),
                input_schema: serde_json::json!({}),
            }]
        }

        async fn call_tool(
            &self,
            tool_name: &str,
            _arguments: serde_json::Value,
            _scope: &ToolScope,
        ) -> reef_tools::Result<String> {
            let mut responses = self.responses.lock().unwrap();
            let queue = responses
                .get_mut(tool_name)
                .ok_or_else(|| reef_tools::ToolError::Unknown(tool_name.to_string()))?;
            if queue.is_empty() {
                return Err(reef_tools::ToolError::Failed {
                    tool: tool_name.to_string(),
                    reason: "script exhausted".into(),
                });
            }
            Ok(queue.remove(0))
        }
    }

    fn kb_result(items: &[(&str, &str, f64)]) -> String {
        let results: Vec<serde_json::Value> = items
            .iter()
            .map(|(id, content, score)| {
                serde_json::json!({
                    "content": content,
                    "score": score,
                    "metadata": {"chunk_id": id, "doc_id": "d", "kb_id": "k", "filename": "f"},
                })
            })
            .collect();
        serde_json::json!({"success": true, "query": "q", "results": results}).to_string()
    }

    fn orchestrator(runtime: Arc<dyn ToolRuntime>, max_iterations: u32) -> StreamingOrchestrator {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let capability = Arc::new(CapabilityMemory::new(
            Arc::new(InMemoryCapabilityCache::default()),
            Arc::new(CapabilityStore::new(conn)),
        ));
        StreamingOrchestrator::new(
            ToolLoopConfig {
                max_iterations,
                llm_call_timeout: 5,
                tool_execution_timeout: 5,
                total_timeout: 60,
                ..Default::default()
            },
            StreamingConfig::default(),
            capability,
            runtime,
        )
    }

    fn tool_call(id: &str, query: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: SEARCH_KNOWLEDGE_BASE.into(),
            arguments: serde_json::json!({"query": query}),
        }
    }

    fn request() -> TurnRequest {
        TurnRequest {
            session_id: "s1".into(),
            user_id: Some("u1".into()),
            model_name: "test-model".into(),
            messages: vec![Message::user("hello")],
        }
    }

    async fn drain(mut rx: mpsc::Receiver<String>) -> String {
        let mut all = String::new();
        while let Some(chunk) = rx.recv().await {
            all.push_str(&chunk);
        }
        all
    }

    #[tokio::test]
    async fn citations_dedup_across_rounds_with_stable_markers() {
        let runtime = Arc::new(FakeRuntime {
            responses: Mutex::new(
                [(
                    SEARCH_KNOWLEDGE_BASE.to_string(),
                    vec![
                        kb_result(&[("h1", "one", 0.9), ("h2", "two", 0.8), ("h3", "three", 0.7)]),
                        kb_result(&[("h1", "one", 0.9), ("h4", "four", 0.6)]),
                    ],
                )]
                .into(),
            ),
        });
        let orch = orchestrator(runtime, 10);
        let service = ScriptedService::new(vec![
            vec![StreamEvent::ToolCalls {
                calls: vec![tool_call("c1", "alpha")],
            }],
            vec![StreamEvent::ToolCalls {
                calls: vec![tool_call("c2", "beta")],
            }],
            vec![
                StreamEvent::ContentDelta {
                    text: "final".into(),
                },
                StreamEvent::Done {
                    reason: "stop".into(),
                },
            ],
        ]);

        let (tx, rx) = mpsc::channel(256);
        let outcome = orch
            .stream_turn(service, request(), tx, CancellationToken::new())
            .await
            .unwrap();
        let stream = drain(rx).await;

        // Each ref_id appears exactly once across all batches; markers are
        // contiguous 1..4 over the union.
        let frames = crate::framing::split_frames(&stream);
        let mut all_markers = Vec::new();
        let mut all_ids = Vec::new();
        for frame in &frames {
            if let crate::framing::Frame::References(v) = frame {
                for lean in v["lean"].as_array().unwrap() {
                    all_markers.push(lean["ref_marker"].as_u64().unwrap());
                    all_ids.push(lean["ref_id"].as_str().unwrap().to_string());
                }
            }
        }
        assert_eq!(all_markers, vec![1, 2, 3, 4]);
        let unique: std::collections::HashSet<_> = all_ids.iter().collect();
        assert_eq!(unique.len(), all_ids.len());

        assert_eq!(outcome.citations.len(), 4);
        assert!(outcome.used_tools);
        assert_eq!(crate::framing::answer_body(&stream), "final");
    }

    #[tokio::test]
    async fn narration_separator_appears_between_iterations() {
        let runtime = Arc::new(FakeRuntime {
            responses: Mutex::new(
                [(
                    SEARCH_KNOWLEDGE_BASE.to_string(),
                    vec![kb_result(&[("h1", "one", 0.9)])],
                )]
                .into(),
            ),
        });
        let orch = orchestrator(runtime, 10);
        let service = ScriptedService::new(vec![
            vec![
                StreamEvent::ContentDelta {
                    text: "Let me search...".into(),
                },
                StreamEvent::ToolCalls {
                    calls: vec![tool_call("c1", "q")],
                },
            ],
            vec![
                StreamEvent::ContentDelta {
                    text: "The answer is 42.".into(),
                },
                StreamEvent::Done {
                    reason: "stop".into(),
                },
            ],
        ]);

        let (tx, rx) = mpsc::channel(256);
        orch.stream_turn(service, request(), tx, CancellationToken::new())
            .await
            .unwrap();
        let body = crate::framing::answer_body(&drain(rx).await);
        assert_eq!(body, "Let me search...\n\n---\n\nThe answer is 42.");
    }

    #[tokio::test]
    async fn max_iterations_forces_a_final_reply_without_tools() {
        // The model asks for tools every time; max_iterations = 2.
        let runtime = Arc::new(FakeRuntime {
            responses: Mutex::new(
                [(
                    SEARCH_KNOWLEDGE_BASE.to_string(),
                    vec![
                        kb_result(&[("h1", "one", 0.9)]),
                        kb_result(&[("h2", "two", 0.8)]),
                    ],
                )]
                .into(),
            ),
        });
        let orch = orchestrator(runtime, 2);
        let service = ScriptedService::new(vec![
            vec![StreamEvent::ToolCalls {
                calls: vec![tool_call("c1", "q1")],
            }],
            vec![StreamEvent::ToolCalls {
                calls: vec![tool_call("c2", "q2")],
            }],
            // This script entry serves the forced no-tools final call.
            vec![
                StreamEvent::ContentDelta {
                    text: "forced summary".into(),
                },
                StreamEvent::Done {
                    reason: "stop".into(),
                },
            ],
        ]);

        let (tx, rx) = mpsc::channel(256);
        let outcome = orch
            .stream_turn(service, request(), tx, CancellationToken::new())
            .await
            .unwrap();
        let stream = drain(rx).await;

        assert_eq!(outcome.iterations, 2);
        assert!(outcome.content.contains("forced summary"));
        // No references frame may follow the forced final call; both batches
        // were emitted during the loop.
        let frames = crate::framing::split_frames(&stream);
        let last_ref_pos = frames
            .iter()
            .rposition(|f| matches!(f, crate::framing::Frame::References(_)))
            .unwrap();
        let summary_pos = frames
            .iter()
            .position(|f| matches!(f, crate::framing::Frame::Text(t) if t.contains("forced summary")))
            .unwrap();
        assert!(last_ref_pos < summary_pos);
    }

    #[tokio::test]
    async fn tools_unsupported_marks_model_and_falls_back() {
        let runtime = Arc::new(FakeRuntime {
            responses: Mutex::new([(SEARCH_KNOWLEDGE_BASE.to_string(), vec![])].into()),
        });
        let orch = orchestrator(runtime, 10);
        let service = Arc::new(ScriptedService {
            script: Mutex::new(vec![]),
            supports_tools: true,
            reject_tools: true,
        });

        let (tx, rx) = mpsc::channel(256);
        let outcome = orch
            .stream_turn(service, request(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.used_tools);
        assert_eq!(outcome.content, "fallback answer");
        drop(rx);

        // The negative cache now short-circuits the next turn.
        assert!(!orch.capability.check_supports_tools("test-model"));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_stream() {
        let runtime = Arc::new(FakeRuntime {
            responses: Mutex::new([(SEARCH_KNOWLEDGE_BASE.to_string(), vec![])].into()),
        });
        let orch = orchestrator(runtime, 10);

        // A service that never sends anything.
        struct Silent;
        #[async_trait]
        impl ChatService for Silent {
            async fn stream_plain(
                &self,
                _messages: Vec<Message>,
                tx: mpsc::Sender<StreamEvent>,
            ) -> ChatResult<()> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                drop(tx);
                Ok(())
            }

            async fn stream_with_tools(
                &self,
                messages: Vec<Message>,
                _tools: Vec<reef_tools::ToolDecl>,
                tx: mpsc::Sender<StreamEvent>,
            ) -> ChatResult<()> {
                let _ = messages;
                self.stream_plain(Vec::new(), tx).await
            }
        }

        let orch = Arc::new(orch);
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(16);
        let handle = {
            let orch = orch.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { orch.stream_turn(Arc::new(Silent), request(), tx, cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let err = handle.await.unwrap();
        assert!(matches!(err, Err(ChatError::Cancelled)));
        assert_eq!(orch.state("s1"), StreamingState::Error);
    }

    #[tokio::test]
    async fn tool_failures_become_tool_text_when_permissive() {
        let runtime = Arc::new(FakeRuntime {
            responses: Mutex::new([(SEARCH_KNOWLEDGE_BASE.to_string(), vec![])].into()),
        });
        let orch = orchestrator(runtime, 10);
        let service = ScriptedService::new(vec![
            vec![StreamEvent::ToolCalls {
                calls: vec![tool_call("c1", "q")],
            }],
            vec![
                StreamEvent::ContentDelta { text: "ok".into() },
                StreamEvent::Done {
                    reason: "stop".into(),
                },
            ],
        ]);

        let (tx, rx) = mpsc::channel(256);
        let outcome = orch
            .stream_turn(service, request(), tx, CancellationToken::new())
            .await
            .unwrap();
        drop(rx);
        // The failed tool did not abort the turn.
        assert!(outcome.content.contains("ok"));
        assert!(outcome.citations.is_empty());
    }

    #[test]
    fn cache_key_is_order_insensitive() {
        let runtime = Arc::new(FakeRuntime {
            responses: Mutex::new(Default::default()),
        });
        let orch = orchestrator(runtime, 10);
        let a = orch.cache_key("t", &serde_json::json!({"a": 1, "b": [1, 2]}));
        let b = orch.cache_key("t", &serde_json::json!({"b": [1, 2], "a": 1}));
        assert_eq!(a, b);
        let c = orch.cache_key("t", &serde_json::json!({"a": 2, "b": [1, 2]}));
        assert_ne!(a, c);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let runtime = Arc::new(FakeRuntime {
            responses: Mutex::new(Default::default()),
        });
        let mut orch = orchestrator(runtime, 10);
        orch.config.max_tool_result_size = 7;
        let out = orch.truncate_tool_result("日本語テキスト".to_string(), "t");
        assert!(out.contains("[result truncated"));
        assert!(out.starts_with("日本"));
    }
}
