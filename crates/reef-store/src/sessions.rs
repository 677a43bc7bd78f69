use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use tracing::debug;

use reef_core::types::{KbId, Message, Role, SessionId, ToolCall, UserId};

use crate::error::{Result, StoreError};
use crate::types::{ModelSettings, Session};

/// Thread-safe store for sessions and their ordered message history.
pub struct SessionStore {
    db: Mutex<Connection>,
}

impl SessionStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    pub fn create(
        &self,
        user_id: &UserId,
        model_settings: ModelSettings,
        system_prompt: Option<String>,
    ) -> Result<Session> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let session_id = SessionId::new();
        db.execute(
            "INSERT INTO sessions
             (session_id, user_id, model_settings, system_prompt, kb_bindings, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, '[]', ?5, ?5)",
            rusqlite::params![
                session_id.as_str(),
                user_id.as_str(),
                serde_json::to_string(&model_settings)?,
                system_prompt,
                now
            ],
        )?;
        Ok(Session {
            session_id,
            user_id: user_id.clone(),
            model_settings,
            system_prompt,
            kb_bindings: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get(&self, session_id: &SessionId) -> Result<Session> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT session_id, user_id, model_settings, system_prompt, kb_bindings,
                    created_at, updated_at
             FROM sessions WHERE session_id = ?1",
            [session_id.as_str()],
            row_to_session,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                kind: "session",
                id: session_id.to_string(),
            },
            other => other.into(),
        })
    }

    pub fn set_kb_bindings(&self, session_id: &SessionId, kb_ids: &[KbId]) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let bindings: Vec<&str> = kb_ids.iter().map(|k| k.as_str()).collect();
        let n = db.execute(
            "UPDATE sessions SET kb_bindings = ?1, updated_at = ?2 WHERE session_id = ?3",
            rusqlite::params![serde_json::to_string(&bindings)?, now, session_id.as_str()],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                kind: "session",
                id: session_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn update_model_settings(
        &self,
        session_id: &SessionId,
        settings: &ModelSettings,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE sessions SET model_settings = ?1, updated_at = ?2 WHERE session_id = ?3",
            rusqlite::params![serde_json::to_string(settings)?, now, session_id.as_str()],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                kind: "session",
                id: session_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn append_message(&self, session_id: &SessionId, msg: &Message) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let tool_calls = if msg.tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&msg.tool_calls)?)
        };
        let refs = if msg.references.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&msg.references)?)
        };
        db.execute(
            "INSERT INTO messages
             (session_id, role, content, tool_calls, tool_call_id, tool_name, refs, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                session_id.as_str(),
                msg.role.to_string(),
                msg.content,
                tool_calls,
                msg.tool_call_id,
                msg.tool_name,
                refs,
                now
            ],
        )?;
        db.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE session_id = ?2",
            rusqlite::params![now, session_id.as_str()],
        )?;
        debug!(session_id = %session_id, role = %msg.role, "message appended");
        Ok(())
    }

    /// Message history in insertion order.
    pub fn history(&self, session_id: &SessionId, limit: Option<usize>) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let limit = limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let mut stmt = db.prepare(
            "SELECT role, content, tool_calls, tool_call_id, tool_name, refs
             FROM (SELECT id, role, content, tool_calls, tool_call_id, tool_name, refs
                   FROM messages WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2)
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_id.as_str(), limit], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn delete(&self, session_id: &SessionId) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            [session_id.as_str()],
        )?;
        let n = db.execute(
            "DELETE FROM sessions WHERE session_id = ?1",
            [session_id.as_str()],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                kind: "session",
                id: session_id.to_string(),
            });
        }
        Ok(())
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let settings_str: String = row.get(2)?;
    let bindings_str: String = row.get(4)?;
    let model_settings: ModelSettings = serde_json::from_str(&settings_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let kb_bindings: Vec<String> = serde_json::from_str(&bindings_str).unwrap_or_default();
    Ok(Session {
        session_id: SessionId::from(row.get::<_, String>(0)?),
        user_id: UserId::from(row.get::<_, String>(1)?),
        model_settings,
        system_prompt: row.get(3)?,
        kb_bindings: kb_bindings.into_iter().map(KbId::from).collect(),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(0)?;
    let tool_calls: Vec<ToolCall> = row
        .get::<_, Option<String>>(2)?
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let references = row
        .get::<_, Option<String>>(5)?
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    Ok(Message {
        role: role_str.parse().unwrap_or(Role::User),
        content: row.get(1)?,
        tool_calls,
        tool_call_id: row.get(3)?,
        tool_name: row.get(4)?,
        references,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn store() -> SessionStore {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        SessionStore::new(conn)
    }

    fn settings() -> ModelSettings {
        ModelSettings {
            provider: "openai_compat".into(),
            model_name: "qwen-plus".into(),
            endpoint: None,
            params: serde_json::json!({}),
        }
    }

    #[test]
    fn history_preserves_insertion_order() {
        let store = store();
        let s = store.create(&UserId::from("u1"), settings(), None).unwrap();
        store.append_message(&s.session_id, &Message::user("one")).unwrap();
        store
            .append_message(&s.session_id, &Message::assistant("two"))
            .unwrap();
        store.append_message(&s.session_id, &Message::user("three")).unwrap();

        let hist = store.history(&s.session_id, None).unwrap();
        let contents: Vec<_> = hist.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);

        // `limit` keeps the most recent N, still oldest-first.
        let tail = store.history(&s.session_id, Some(2)).unwrap();
        let contents: Vec<_> = tail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three"]);
    }

    #[test]
    fn tool_calls_round_trip() {
        let store = store();
        let s = store.create(&UserId::from("u1"), settings(), None).unwrap();
        let mut msg = Message::assistant("");
        msg.tool_calls.push(ToolCall {
            id: "call_1".into(),
            name: "search_knowledge_base".into(),
            arguments: serde_json::json!({"query": "reef"}),
        });
        store.append_message(&s.session_id, &msg).unwrap();
        let hist = store.history(&s.session_id, None).unwrap();
        assert_eq!(hist[0].tool_calls.len(), 1);
        assert_eq!(hist[0].tool_calls[0].name, "search_knowledge_base");
    }
}
