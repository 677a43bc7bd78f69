//! Bridges the group-chat dispatcher to the streaming orchestrator: each
//! AI persona's reply is one orchestrated turn over its backing session.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use reef_core::types::{Message, SessionId};
use reef_groupchat::dispatcher::ReplyGenerator;
use reef_groupchat::store::Group;
use reef_groupchat::{GroupError, GroupMember, GroupMessage};
use reef_orchestrator::{framing, ChatService, StreamingOrchestrator, TurnRequest};
use reef_store::SessionStore;

use crate::chat::OpenAiCompatChat;

pub struct OrchestratorReplyGenerator {
    orchestrator: Arc<StreamingOrchestrator>,
    sessions: Arc<SessionStore>,
}

impl OrchestratorReplyGenerator {
    pub fn new(orchestrator: Arc<StreamingOrchestrator>, sessions: Arc<SessionStore>) -> Self {
        Self {
            orchestrator,
            sessions,
        }
    }
}

#[async_trait]
impl ReplyGenerator for OrchestratorReplyGenerator {
    async fn generate(
        &self,
        group: &Group,
        member: &GroupMember,
        context: &[GroupMessage],
        cancel: &CancellationToken,
    ) -> reef_groupchat::Result<String> {
        let session_id = member
            .ai_session_id
            .as_deref()
            .ok_or_else(|| GroupError::Generation("member has no backing session".into()))?;
        let session = self
            .sessions
            .get(&SessionId::from(session_id))
            .map_err(|e| GroupError::Generation(e.to_string()))?;

        let mut messages = Vec::new();
        let mut system = String::new();
        if let Some(group_prompt) = &group.system_prompt {
            system.push_str(group_prompt);
            system.push('\n');
        }
        if let Some(persona) = &session.system_prompt {
            system.push_str(persona);
            system.push('\n');
        }
        system.push_str(&format!(
            "You are {} in the group chat \"{}\". Reply once, in character, \
             to the ongoing conversation.",
            member.display_name, group.name
        ));
        messages.push(Message::system(system));
        messages.push(Message::user(format_context(context)));

        let service: Arc<dyn ChatService> = Arc::new(OpenAiCompatChat::new(
            session
                .model_settings
                .endpoint
                .as_deref()
                .unwrap_or("https://api.openai.com/v1"),
            session
                .model_settings
                .params
                .get("api_key")
                .and_then(|k| k.as_str()),
            &session.model_settings.model_name,
        ));

        let (tx, mut rx) = mpsc::channel::<String>(256);
        let drain = tokio::spawn(async move {
            let mut all = String::new();
            while let Some(chunk) = rx.recv().await {
                all.push_str(&chunk);
            }
            all
        });

        let outcome = self
            .orchestrator
            .stream_turn(
                service,
                TurnRequest {
                    session_id: session.session_id.to_string(),
                    user_id: Some(session.user_id.to_string()),
                    model_name: session.model_settings.model_name.clone(),
                    messages,
                },
                tx,
                cancel.clone(),
            )
            .await
            .map_err(|e| match e {
                reef_orchestrator::ChatError::Cancelled => GroupError::Cancelled,
                other => GroupError::Generation(other.to_string()),
            })?;
        let streamed = drain.await.unwrap_or_default();
        debug!(member_id = %member.member_id, chars = streamed.len(), "group reply generated");

        // Group replies are persisted as plain text; strip any aux frames.
        Ok(framing::answer_body(&outcome.content))
    }
}

/// The conversation window as a single prompt block:
/// `Name: message` per line, newest last.
fn format_context(context: &[GroupMessage]) -> String {
    let mut out = String::from("Recent group messages:\n");
    for msg in context {
        out.push_str(&format!("{}: {}\n", msg.sender_name, msg.content));
    }
    out
}
