use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use reef_core::types::{KbId, Message, SessionId, UserId};
use reef_core::ReefConfig;
use reef_groupchat::{GroupChatService, GroupMessage, GroupStore, MemberType};
use reef_hub::{GroupEvent, Hubs};
use reef_ingest::{IngestTaskPayload, INGEST_TASK_TYPE};
use reef_orchestrator::{ChatService, StreamingOrchestrator, TurnRequest};
use reef_store::types::ModelSettings;
use reef_store::{KbStore, SessionStore};
use reef_tasks::{TaskPriority, TaskQueue};

use crate::chat::OpenAiCompatChat;

pub struct AppState {
    pub config: ReefConfig,
    pub kb_store: Arc<KbStore>,
    pub sessions: Arc<SessionStore>,
    pub groups: Arc<GroupStore>,
    pub group_service: Arc<GroupChatService>,
    pub orchestrator: Arc<StreamingOrchestrator>,
    pub hubs: Arc<Hubs>,
    pub queue: Arc<TaskQueue>,
    pub models: Arc<reef_embed::ModelRegistry>,
    pub vectors: Arc<reef_vector::VectorStoreRegistry>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/ws/chat/{session_id}", get(ws_chat))
        .route("/ws/groups/{group_id}", get(ws_group))
        .route("/api/groups/{group_id}/messages", post(post_group_message))
        .route("/api/kb/{kb_id}/documents", post(upload_document))
        .route("/api/kb/{kb_id}", axum::routing::delete(delete_kb))
        .route(
            "/api/kb/{kb_id}/documents/{doc_id}",
            axum::routing::delete(delete_document),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Constant-time-ish token check: compare SHA-256 digests rather than the
/// raw strings.
fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.config.gateway.token else {
        return true;
    };
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
}

// --- chat --------------------------------------------------------------

async fn ws_chat(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| chat_socket(state, session_id, socket))
        .into_response()
}

/// Each inbound text frame is one user turn; outbound frames are the
/// orchestrator's stream (answer text plus sentinel-framed aux events).
async fn chat_socket(state: Arc<AppState>, session_id: String, mut socket: WebSocket) {
    let cancel = CancellationToken::new();
    loop {
        let inbound = match socket.recv().await {
            Some(Ok(WsMessage::Text(text))) => text.to_string(),
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(session_id = %session_id, "chat socket error: {e}");
                break;
            }
        };

        let session = match state.sessions.get(&SessionId::from(session_id.as_str())) {
            Ok(s) => s,
            Err(e) => {
                let _ = socket
                    .send(WsMessage::Text(format!("[error] {}", e).into()))
                    .await;
                continue;
            }
        };

        // Persist the user message, then build the turn's message list.
        let user_msg = Message::user(inbound);
        if let Err(e) = state.sessions.append_message(&session.session_id, &user_msg) {
            warn!(session_id = %session_id, "failed to persist user message: {e}");
        }
        let mut messages = Vec::new();
        if let Some(system) = &session.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        match state.sessions.history(&session.session_id, Some(50)) {
            Ok(history) => messages.extend(history),
            Err(e) => warn!(session_id = %session_id, "history load failed: {e}"),
        }

        let service: Arc<dyn ChatService> = Arc::new(chat_service_for(&session.model_settings));
        let (tx, mut rx) = mpsc::channel::<String>(256);
        let turn = state.orchestrator.stream_turn(
            service,
            TurnRequest {
                session_id: session.session_id.to_string(),
                user_id: Some(session.user_id.to_string()),
                model_name: session.model_settings.model_name.clone(),
                messages,
            },
            tx,
            cancel.clone(),
        );
        tokio::pin!(turn);

        // Forward stream chunks while the turn runs.
        let outcome = loop {
            tokio::select! {
                chunk = rx.recv() => {
                    if let Some(chunk) = chunk {
                        if socket.send(WsMessage::Text(chunk.into())).await.is_err() {
                            cancel.cancel();
                        }
                    }
                }
                outcome = &mut turn => break outcome,
            }
        };
        // Drain whatever the turn pushed after completion.
        while let Ok(chunk) = rx.try_recv() {
            let _ = socket.send(WsMessage::Text(chunk.into())).await;
        }

        match outcome {
            Ok(outcome) => {
                let mut assistant = Message::assistant(outcome.content);
                assistant.references = outcome.citations;
                if let Err(e) = state
                    .sessions
                    .append_message(&session.session_id, &assistant)
                {
                    warn!(session_id = %session_id, "failed to persist assistant message: {e}");
                }
            }
            Err(e) => {
                let _ = socket
                    .send(WsMessage::Text(format!("[error] {}", e).into()))
                    .await;
            }
        }
    }
    cancel.cancel();
    info!(session_id = %session_id, "chat socket closed");
}

fn chat_service_for(settings: &ModelSettings) -> OpenAiCompatChat {
    OpenAiCompatChat::new(
        settings.endpoint.as_deref().unwrap_or("https://api.openai.com/v1"),
        settings.params.get("api_key").and_then(|k| k.as_str()),
        &settings.model_name,
    )
}

// --- groups ------------------------------------------------------------

#[derive(Deserialize)]
struct GroupWsQuery {
    member_id: String,
}

async fn ws_group(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    Query(query): Query<GroupWsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| group_socket(state, group_id, query.member_id, socket))
        .into_response()
}

async fn group_socket(
    state: Arc<AppState>,
    group_id: String,
    member_id: String,
    mut socket: WebSocket,
) {
    let mut events = state.hubs.groups.join(&group_id, &member_id);
    if let Err(e) = state
        .groups
        .set_presence(&group_id, &member_id, reef_groupchat::Presence::Online)
    {
        warn!(group_id = %group_id, member_id = %member_id, "presence update failed: {e}");
    }
    state.hubs.groups.publish(
        &group_id,
        GroupEvent::MemberStatus {
            group_id: group_id.clone(),
            member_id: member_id.clone(),
            presence: "online".into(),
        },
        Some(&member_id),
    );

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Ok(payload) = serde_json::to_string(&event) else { continue };
                if socket.send(WsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        let message = human_message(&group_id, &member_id, text.to_string());
                        if let Err(e) = state.group_service.handle_message(message).await {
                            warn!(group_id = %group_id, "group message failed: {e}");
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(group_id = %group_id, "group socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    state.hubs.groups.leave(&group_id, &member_id);
    let _ = state
        .groups
        .set_presence(&group_id, &member_id, reef_groupchat::Presence::Offline);
    info!(group_id = %group_id, member_id = %member_id, "group socket closed");
}

#[derive(Deserialize)]
struct PostMessageBody {
    sender_id: String,
    sender_name: String,
    content: String,
    #[serde(default)]
    mentions: Vec<String>,
}

async fn post_group_message(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PostMessageBody>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut message = human_message(&group_id, &body.sender_id, body.content);
    message.sender_name = body.sender_name;
    message.mentions = body.mentions;
    let message_id = message.message_id.clone();
    match state.group_service.handle_message(message).await {
        Ok(()) => Json(serde_json::json!({ "message_id": message_id })).into_response(),
        Err(e) => {
            let err: reef_core::ReefError = e.into();
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": err.code(), "detail": err.to_string() })),
            )
                .into_response()
        }
    }
}

fn human_message(group_id: &str, sender_id: &str, content: String) -> GroupMessage {
    GroupMessage {
        message_id: uuid::Uuid::new_v4().to_string(),
        group_id: group_id.to_string(),
        sender_id: sender_id.to_string(),
        sender_type: MemberType::Human,
        sender_name: sender_id.to_string(),
        msg_type: "text".into(),
        content,
        images: vec![],
        mentions: vec![],
        reply_to: None,
        read_by: vec![],
        ai_session_id: None,
        references: vec![],
        timestamp: chrono::Utc::now(),
    }
}

// --- knowledge base uploads --------------------------------------------

#[derive(Deserialize)]
struct UploadQuery {
    filename: String,
    user_id: String,
}

async fn upload_document(
    State(state): State<Arc<AppState>>,
    Path(kb_id): Path<String>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let kb_id = KbId::from(kb_id);
    let owner = UserId::from(query.user_id.as_str());
    let kb = match state.kb_store.get_owned(&kb_id, &owner) {
        Ok(kb) => kb,
        Err(e) => {
            let err: reef_core::ReefError = e.into();
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": err.code() })),
            )
                .into_response();
        }
    };

    let doc = match state
        .kb_store
        .create_document(&kb.kb_id, &query.filename, body.len() as i64, None)
    {
        Ok(doc) => doc,
        Err(e) => {
            let err: reef_core::ReefError = e.into();
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": err.code() })),
            )
                .into_response();
        }
    };
    let _ = state
        .kb_store
        .mark_uploaded(&doc.doc_id, &format!("local://{}", doc.doc_id));

    let payload = IngestTaskPayload {
        kb_id: kb.kb_id.to_string(),
        doc_id: doc.doc_id.to_string(),
        user_id: owner.to_string(),
        filename: query.filename.clone(),
        data: body.to_vec(),
    };
    let payload_bytes = match serde_json::to_vec(&payload) {
        Ok(b) => b,
        Err(e) => {
            let _ = state.kb_store.mark_failed(&doc.doc_id, &e.to_string());
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match state.queue.submit(
        INGEST_TASK_TYPE,
        payload_bytes,
        TaskPriority::Normal,
        state.config.tasks.task_timeout,
        state.config.tasks.max_retries,
        serde_json::json!({ "kb_id": kb.kb_id.as_str(), "doc_id": doc.doc_id.as_str() }),
    ) {
        Ok(task_id) => {
            let _ = state.kb_store.mark_processing(&doc.doc_id, &task_id);
            Json(serde_json::json!({ "doc_id": doc.doc_id.as_str(), "task_id": task_id }))
                .into_response()
        }
        Err(e) => {
            let err: reef_core::ReefError = e.into();
            let _ = state.kb_store.mark_failed(&doc.doc_id, &err.to_string());
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": err.code() })),
            )
                .into_response()
        }
    }
}

/// Delete one document: vector rows first (under the write lock), then the
/// DB row with its exact counter decrements.
async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path((kb_id, doc_id)): Path<(String, String)>,
    Query(query): Query<OwnerQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let kb = match state
        .kb_store
        .get_owned(&KbId::from(kb_id), &UserId::from(query.user_id.as_str()))
    {
        Ok(kb) => kb,
        Err(e) => {
            let err: reef_core::ReefError = e.into();
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": err.code() })),
            )
                .into_response();
        }
    };

    if let Ok(embedder) = state.models.get_or_create(&kb.embedding) {
        match state.vectors.get_or_create(&kb.vector, embedder).await {
            Ok(store) => {
                if let Err(e) = store.delete_by_doc(doc_id.clone()).await {
                    warn!(doc_id = %doc_id, "vector row deletion failed: {e}");
                }
            }
            Err(e) => warn!(doc_id = %doc_id, "vector store unavailable for delete: {e}"),
        }
    }

    match state
        .kb_store
        .delete_document(&reef_core::types::DocId::from(doc_id))
    {
        Ok(doc) => Json(serde_json::json!({
            "deleted": doc.doc_id.as_str(),
            "chunks_removed": doc.chunk_count,
        }))
        .into_response(),
        Err(e) => {
            let err: reef_core::ReefError = e.into();
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": err.code() })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct OwnerQuery {
    user_id: String,
}

/// Delete a knowledge base: unmap the vector handle with a final
/// checkpoint, remove its persist directory, then drop the KB and document
/// rows.
async fn delete_kb(
    State(state): State<Arc<AppState>>,
    Path(kb_id): Path<String>,
    Query(query): Query<OwnerQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let kb_id = KbId::from(kb_id);
    let kb = match state
        .kb_store
        .get_owned(&kb_id, &UserId::from(query.user_id.as_str()))
    {
        Ok(kb) => kb,
        Err(e) => {
            let err: reef_core::ReefError = e.into();
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": err.code() })),
            )
                .into_response();
        }
    };

    if let Err(e) = state.vectors.remove(&kb.vector).await {
        warn!(kb_id = %kb_id, "vector handle removal failed: {e}");
    }
    let folder = reef_vector::naming::sanitize_folder_name(&kb.vector.collection_name);
    let dir = state
        .config
        .data
        .backend_dir(&kb.vector.backend.to_string())
        .join(folder);
    if dir.exists() {
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(kb_id = %kb_id, "persist directory removal failed: {e}");
        }
    }

    match state.kb_store.delete(&kb_id) {
        Ok(()) => Json(serde_json::json!({ "deleted": kb_id.as_str() })).into_response(),
        Err(e) => {
            let err: reef_core::ReefError = e.into();
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": err.code() })),
            )
                .into_response()
        }
    }
}
