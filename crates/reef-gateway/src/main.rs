mod app;
mod chat;
mod generator;
mod tools;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rusqlite::Connection;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reef_core::ReefConfig;
use reef_embed::ModelRegistry;
use reef_groupchat::{ConversationController, GroupChatService, GroupStore};
use reef_hub::Hubs;
use reef_ingest::{IngestDocumentHandler, IngestionPipeline, ParserPool, INGEST_TASK_TYPE};
use reef_orchestrator::{CapabilityMemory, InMemoryCapabilityCache, StreamingOrchestrator};
use reef_store::{CapabilityStore, KbStore, SessionStore};
use reef_tasks::persistence::TaskPersistence;
use reef_tasks::TaskQueue;
use reef_tools::ToolRegistry;
use reef_vector::VectorStoreRegistry;

use crate::generator::OrchestratorReplyGenerator;
use crate::tools::KnowledgeSearchTool;

#[derive(Parser)]
#[command(name = "reef-gateway", about = "Reef chat backend gateway")]
struct Args {
    /// Path to reef.toml.
    #[arg(long, default_value = "reef.toml")]
    config: String,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = ReefConfig::load(&args.config).context("loading config")?;
    if let Some(port) = args.port {
        config.gateway.port = port;
    }

    std::fs::create_dir_all(&config.data.root).context("creating data root")?;
    let db_path = std::path::Path::new(&config.data.root).join("reef.sqlite3");
    let open = || -> anyhow::Result<Connection> {
        let conn = Connection::open(&db_path).context("opening database")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(conn)
    };

    // Stores share one sqlite file through independent connections.
    let init_conn = open()?;
    reef_store::db::init_db(&init_conn)?;
    reef_groupchat::db::init_db(&init_conn)?;
    drop(init_conn);

    let kb_store = Arc::new(KbStore::new(open()?));
    let sessions = Arc::new(SessionStore::new(open()?));
    let groups = Arc::new(GroupStore::new(open()?));
    let capability_store = Arc::new(CapabilityStore::new(open()?));

    let models = Arc::new(ModelRegistry::new());
    let vectors = Arc::new(VectorStoreRegistry::new(config.data.root.clone()));
    let hubs = Arc::new(Hubs::default());

    // Capability memory warms its caches from the durable table.
    let capability = Arc::new(CapabilityMemory::new(
        Arc::new(InMemoryCapabilityCache::default()),
        capability_store,
    ));
    capability.initialize();

    // Tool runtime with the built-in knowledge search.
    let tool_registry = Arc::new(ToolRegistry::new());
    tool_registry.register(Arc::new(KnowledgeSearchTool::new(
        kb_store.clone(),
        sessions.clone(),
        models.clone(),
        vectors.clone(),
    )));

    let orchestrator = Arc::new(StreamingOrchestrator::new(
        config.tools.clone(),
        config.streaming.clone(),
        capability,
        tool_registry,
    ));

    // Ingestion: parser pool + pipeline behind the task queue.
    let pipeline = Arc::new(IngestionPipeline::new(
        kb_store.clone(),
        models.clone(),
        vectors.clone(),
        config.ingestion.per_user_concurrency,
        config.ingestion.embed_batch_size,
    ));
    let parser_pool = Arc::new(ParserPool::new(config.ingestion.parser_workers));
    let persistence = if config.tasks.enable_persistence {
        Some(TaskPersistence::new(config.data.tasks_dir())?)
    } else {
        None
    };
    let queue = TaskQueue::new(config.tasks.workers, config.tasks.max_queue_size, persistence);
    queue.register_handler(
        INGEST_TASK_TYPE,
        Arc::new(IngestDocumentHandler::new(
            kb_store.clone(),
            parser_pool,
            pipeline,
        )),
    );
    queue.start();

    // Group chat core wired to the orchestrator through the generator seam.
    let group_service = GroupChatService::new(
        groups.clone(),
        Arc::new(ConversationController::new()),
        hubs.clone(),
        Arc::new(OrchestratorReplyGenerator::new(
            orchestrator.clone(),
            sessions.clone(),
        )),
    );

    let bind = format!("{}:{}", config.gateway.bind, config.gateway.port);
    let state = Arc::new(app::AppState {
        config,
        kb_store,
        sessions,
        groups,
        group_service,
        orchestrator,
        hubs,
        queue: queue.clone(),
        models,
        vectors,
    });

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!(%bind, "reef gateway listening");
    axum::serve(listener, app::router(state)).await?;

    queue.stop();
    Ok(())
}
