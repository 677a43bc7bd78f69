use rusqlite::{Connection, Result};

/// Initialise all tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_kb_tables(conn)?;
    create_session_tables(conn)?;
    create_capability_table(conn)?;
    Ok(())
}

fn create_kb_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS knowledge_bases (
            kb_id           TEXT PRIMARY KEY,
            owner_id        TEXT NOT NULL,
            name            TEXT NOT NULL,
            embedding_spec  TEXT NOT NULL,
            vector_spec     TEXT NOT NULL,
            chunking_spec   TEXT NOT NULL,
            search_spec     TEXT NOT NULL,
            document_count  INTEGER NOT NULL DEFAULT 0,
            chunk_count     INTEGER NOT NULL DEFAULT 0,
            total_size      INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_kb_owner
            ON knowledge_bases(owner_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_kb_owner_collection
            ON knowledge_bases(owner_id, json_extract(vector_spec, '$.collection_name'));

        CREATE TABLE IF NOT EXISTS documents (
            doc_id      TEXT PRIMARY KEY,
            kb_id       TEXT NOT NULL,
            filename    TEXT NOT NULL,
            size        INTEGER NOT NULL DEFAULT 0,
            mime_type   TEXT,
            status      TEXT NOT NULL DEFAULT 'pending',
            task_id     TEXT,
            object_url  TEXT,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            error       TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_doc_kb
            ON documents(kb_id);",
    )
}

fn create_session_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_id     TEXT PRIMARY KEY,
            user_id        TEXT NOT NULL,
            model_settings TEXT NOT NULL,
            system_prompt  TEXT,
            kb_bindings    TEXT NOT NULL DEFAULT '[]',
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_session_user
            ON sessions(user_id, updated_at DESC);

        CREATE TABLE IF NOT EXISTS messages (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id   TEXT NOT NULL,
            role         TEXT NOT NULL,
            content      TEXT NOT NULL,
            tool_calls   TEXT,
            tool_call_id TEXT,
            tool_name    TEXT,
            refs         TEXT,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_msg_session
            ON messages(session_id, id);",
    )
}

fn create_capability_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS model_capabilities (
            model_name     TEXT PRIMARY KEY,
            supports_tools INTEGER NOT NULL,
            last_checked   TEXT NOT NULL,
            error_message  TEXT,
            notes          TEXT,
            first_seen     TEXT NOT NULL,
            check_count    INTEGER NOT NULL DEFAULT 1
        );",
    )
}
