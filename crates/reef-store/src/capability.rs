use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::types::ModelCapability;

/// Durable layer of the model-capability memory: one row per model name,
/// authoritative over the in-process and shared-cache mirrors.
pub struct CapabilityStore {
    db: Mutex<Connection>,
}

impl CapabilityStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Upsert an "unsupported" record. Bumps `check_count` on conflict.
    pub fn mark_unsupported(
        &self,
        model_name: &str,
        error_message: Option<&str>,
        notes: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO model_capabilities
             (model_name, supports_tools, last_checked, error_message, notes, first_seen, check_count)
             VALUES (?1, 0, ?2, ?3, ?4, ?2, 1)
             ON CONFLICT(model_name) DO UPDATE SET
                supports_tools = 0,
                last_checked   = excluded.last_checked,
                error_message  = excluded.error_message,
                notes          = excluded.notes,
                check_count    = check_count + 1",
            rusqlite::params![model_name, now, error_message, notes],
        )?;
        info!(model = %model_name, "model marked as not supporting tools");
        Ok(())
    }

    /// Manual antidote: flip a model back to supported.
    pub fn mark_supported(&self, model_name: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE model_capabilities
             SET supports_tools = 1, last_checked = ?1, error_message = NULL,
                 check_count = check_count + 1
             WHERE model_name = ?2",
            rusqlite::params![now, model_name],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                kind: "model capability",
                id: model_name.to_string(),
            });
        }
        info!(model = %model_name, "model marked as supporting tools");
        Ok(())
    }

    pub fn get(&self, model_name: &str) -> Result<Option<ModelCapability>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT model_name, supports_tools, last_checked, error_message, notes,
                    first_seen, check_count
             FROM model_capabilities WHERE model_name = ?1",
            [model_name],
            row_to_capability,
        ) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All model names currently recorded as not supporting tools.
    /// Used to warm the cache layers at startup.
    pub fn unsupported_models(&self) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db
            .prepare("SELECT model_name FROM model_capabilities WHERE supports_tools = 0")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_capability(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelCapability> {
    Ok(ModelCapability {
        model_name: row.get(0)?,
        supports_tools: row.get::<_, i64>(1)? != 0,
        last_checked: row.get(2)?,
        error_message: row.get(3)?,
        notes: row.get(4)?,
        first_seen: row.get(5)?,
        check_count: row.get(6)?,
    })
}
