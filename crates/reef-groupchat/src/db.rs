use rusqlite::{Connection, Result};

/// Initialise group-chat tables. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS groups (
            group_id        TEXT PRIMARY KEY,
            owner_id        TEXT NOT NULL,
            name            TEXT NOT NULL,
            system_prompt   TEXT,
            strategy_config TEXT NOT NULL,
            message_count   INTEGER NOT NULL DEFAULT 0,
            last_message_at TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_group_owner
            ON groups(owner_id);

        CREATE TABLE IF NOT EXISTS group_members (
            member_id       TEXT NOT NULL,
            group_id        TEXT NOT NULL,
            display_name    TEXT NOT NULL,
            member_type     TEXT NOT NULL,
            role            TEXT NOT NULL DEFAULT 'member',
            presence        TEXT NOT NULL DEFAULT 'offline',
            ai_session_id   TEXT,
            behavior        TEXT,
            consecutive_replies INTEGER NOT NULL DEFAULT 0,
            last_reply_at   TEXT,
            joined_at       TEXT NOT NULL,
            PRIMARY KEY (group_id, member_id)
        );
        CREATE INDEX IF NOT EXISTS idx_member_group
            ON group_members(group_id);

        CREATE TABLE IF NOT EXISTS group_messages (
            message_id    TEXT PRIMARY KEY,
            group_id      TEXT NOT NULL,
            sender_id     TEXT NOT NULL,
            sender_type   TEXT NOT NULL,
            sender_name   TEXT NOT NULL,
            msg_type      TEXT NOT NULL DEFAULT 'text',
            content       TEXT NOT NULL,
            images        TEXT NOT NULL DEFAULT '[]',
            mentions      TEXT NOT NULL DEFAULT '[]',
            reply_to      TEXT,
            read_by       TEXT NOT NULL DEFAULT '[]',
            ai_session_id TEXT,
            refs          TEXT,
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_gmsg_group
            ON group_messages(group_id, created_at);",
    )
}
