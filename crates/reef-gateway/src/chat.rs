//! OpenAI-compatible streaming chat client implementing the orchestrator's
//! `ChatService` seam. SSE lines arrive as `data: {json}`, terminated by
//! `data: [DONE]`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use reef_core::types::{Message, Role, ToolCall};
use reef_orchestrator::{ChatError, ChatResult, ChatService, StreamEvent};
use reef_tools::ToolDecl;

pub struct OpenAiCompatChat {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatChat {
    pub fn new(endpoint: &str, api_key: Option<&str>, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.map(str::to_string),
            model: model.to_string(),
        }
    }

    async fn stream(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDecl>>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> ChatResult<()> {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "stream": true,
        });
        if let Some(tools) = &tools {
            body["tools"] = json!(tools
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    },
                }))
                .collect::<Vec<_>>());
        }

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ChatError::Provider(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            // Providers without tool support reject the request with a 4xx
            // naming the `tools` field; that is the sentinel, not an outage.
            if tools.is_some()
                && status.as_u16() < 500
                && (message.contains("tool") || message.contains("function"))
            {
                return Err(ChatError::ToolsUnsupported {
                    model: self.model.clone(),
                });
            }
            return Err(ChatError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        // Tool-call fragments accumulate by index until the stream finishes.
        let mut partial_calls: BTreeMap<u64, (String, String, String)> = BTreeMap::new();
        let mut finish_reason = String::from("stop");

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| ChatError::Provider(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                    warn!("unparsable SSE data line skipped");
                    continue;
                };
                let delta = &value["choices"][0]["delta"];
                if let Some(text) = delta["content"].as_str() {
                    if !text.is_empty() {
                        let _ = tx
                            .send(StreamEvent::ContentDelta {
                                text: text.to_string(),
                            })
                            .await;
                    }
                }
                if let Some(calls) = delta["tool_calls"].as_array() {
                    for call in calls {
                        let index = call["index"].as_u64().unwrap_or(0);
                        let entry = partial_calls.entry(index).or_default();
                        if let Some(id) = call["id"].as_str() {
                            entry.0 = id.to_string();
                        }
                        if let Some(name) = call["function"]["name"].as_str() {
                            entry.1.push_str(name);
                        }
                        if let Some(args) = call["function"]["arguments"].as_str() {
                            entry.2.push_str(args);
                        }
                    }
                }
                if let Some(reason) = value["choices"][0]["finish_reason"].as_str() {
                    finish_reason = reason.to_string();
                }
            }
        }

        if !partial_calls.is_empty() {
            let calls: Vec<ToolCall> = partial_calls
                .into_values()
                .map(|(id, name, args)| ToolCall {
                    id,
                    name,
                    arguments: serde_json::from_str(&args).unwrap_or(json!({})),
                })
                .collect();
            debug!(count = calls.len(), "tool calls assembled from stream");
            let _ = tx.send(StreamEvent::ToolCalls { calls }).await;
        } else {
            let _ = tx
                .send(StreamEvent::Done {
                    reason: finish_reason,
                })
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl ChatService for OpenAiCompatChat {
    async fn stream_plain(
        &self,
        messages: Vec<Message>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> ChatResult<()> {
        self.stream(messages, None, tx).await
    }

    async fn stream_with_tools(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDecl>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> ChatResult<()> {
        self.stream(messages, Some(tools), tx).await
    }
}

fn wire_message(msg: &Message) -> serde_json::Value {
    let mut value = json!({
        "role": msg.role.to_string(),
        "content": msg.content,
    });
    if !msg.tool_calls.is_empty() {
        value["tool_calls"] = json!(msg
            .tool_calls
            .iter()
            .map(|c| json!({
                "id": c.id,
                "type": "function",
                "function": {
                    "name": c.name,
                    "arguments": c.arguments.to_string(),
                },
            }))
            .collect::<Vec<_>>());
        if msg.content.trim().is_empty() {
            value["content"] = serde_json::Value::Null;
        }
    }
    if msg.role == Role::Tool {
        if let Some(id) = &msg.tool_call_id {
            value["tool_call_id"] = json!(id);
        }
        if let Some(name) = &msg.tool_name {
            value["name"] = json!(name);
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_calls_serialize_with_null_content() {
        let mut msg = Message::assistant("");
        msg.tool_calls.push(ToolCall {
            id: "c1".into(),
            name: "search_knowledge_base".into(),
            arguments: json!({"query": "reef"}),
        });
        let wire = wire_message(&msg);
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "search_knowledge_base");
    }

    #[test]
    fn tool_responses_carry_ids() {
        let msg = Message::tool_response("c1", "search_knowledge_base", "{}");
        let wire = wire_message(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "c1");
        assert_eq!(wire["name"], "search_knowledge_base");
    }
}
