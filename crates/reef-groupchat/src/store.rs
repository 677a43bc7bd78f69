use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

use crate::error::{GroupError, Result};
use crate::types::{
    AiBehaviorConfig, GroupMember, GroupMessage, GroupRole, GroupStrategyConfig, MemberType,
    Presence,
};

/// A group row.
#[derive(Debug, Clone)]
pub struct Group {
    pub group_id: String,
    pub owner_id: String,
    pub name: String,
    pub system_prompt: Option<String>,
    pub strategy: GroupStrategyConfig,
    pub message_count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Thread-safe store for groups, members, and group messages.
pub struct GroupStore {
    db: Mutex<Connection>,
}

impl GroupStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    pub fn create_group(
        &self,
        owner_id: &str,
        name: &str,
        system_prompt: Option<&str>,
        strategy: GroupStrategyConfig,
    ) -> Result<Group> {
        let db = self.db.lock().unwrap();
        let now = Utc::now();
        let group_id = Uuid::new_v4().to_string();
        db.execute(
            "INSERT INTO groups
             (group_id, owner_id, name, system_prompt, strategy_config,
              message_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
            rusqlite::params![
                group_id,
                owner_id,
                name,
                system_prompt,
                serde_json::to_string(&strategy)?,
                now.to_rfc3339()
            ],
        )?;
        info!(group_id = %group_id, %name, "group created");
        Ok(Group {
            group_id,
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            system_prompt: system_prompt.map(str::to_string),
            strategy,
            message_count: 0,
            last_message_at: None,
        })
    }

    pub fn get_group(&self, group_id: &str) -> Result<Group> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT group_id, owner_id, name, system_prompt, strategy_config,
                    message_count, last_message_at
             FROM groups WHERE group_id = ?1",
            [group_id],
            row_to_group,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                GroupError::GroupNotFound(group_id.to_string())
            }
            other => other.into(),
        })
    }

    pub fn update_strategy(&self, group_id: &str, strategy: &GroupStrategyConfig) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE groups SET strategy_config = ?1, updated_at = ?2 WHERE group_id = ?3",
            rusqlite::params![
                serde_json::to_string(strategy)?,
                Utc::now().to_rfc3339(),
                group_id
            ],
        )?;
        if n == 0 {
            return Err(GroupError::GroupNotFound(group_id.to_string()));
        }
        Ok(())
    }

    pub fn delete_group(&self, group_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM group_members WHERE group_id = ?1", [group_id])?;
        db.execute("DELETE FROM group_messages WHERE group_id = ?1", [group_id])?;
        let n = db.execute("DELETE FROM groups WHERE group_id = ?1", [group_id])?;
        if n == 0 {
            return Err(GroupError::GroupNotFound(group_id.to_string()));
        }
        Ok(())
    }

    // --- members -----------------------------------------------------------

    pub fn add_member(&self, member: &GroupMember) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO group_members
             (member_id, group_id, display_name, member_type, role, presence,
              ai_session_id, behavior, consecutive_replies, last_reply_at, joined_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                member.member_id,
                member.group_id,
                member.display_name,
                member.member_type.to_string(),
                member.role.to_string(),
                member.presence.to_string(),
                member.ai_session_id,
                member
                    .behavior
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                member.consecutive_reply_count,
                member.last_reply_at.map(|t| t.to_rfc3339()),
                member.joined_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn remove_member(&self, group_id: &str, member_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND member_id = ?2",
            [group_id, member_id],
        )?;
        if n == 0 {
            return Err(GroupError::MemberNotFound(member_id.to_string()));
        }
        Ok(())
    }

    pub fn members(&self, group_id: &str) -> Result<Vec<GroupMember>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT member_id, group_id, display_name, member_type, role, presence,
                    ai_session_id, behavior, consecutive_replies, last_reply_at, joined_at
             FROM group_members WHERE group_id = ?1 ORDER BY joined_at",
        )?;
        let rows = stmt.query_map([group_id], row_to_member)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn set_presence(&self, group_id: &str, member_id: &str, presence: Presence) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE group_members SET presence = ?1
             WHERE group_id = ?2 AND member_id = ?3",
            rusqlite::params![presence.to_string(), group_id, member_id],
        )?;
        if n == 0 {
            return Err(GroupError::MemberNotFound(member_id.to_string()));
        }
        Ok(())
    }

    /// Record a member's reply: bump consecutive count, stamp the time.
    pub fn record_reply(&self, group_id: &str, member_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE group_members
             SET consecutive_replies = consecutive_replies + 1, last_reply_at = ?1
             WHERE group_id = ?2 AND member_id = ?3",
            rusqlite::params![Utc::now().to_rfc3339(), group_id, member_id],
        )?;
        Ok(())
    }

    /// Reset consecutive counts for everyone except `sender_id` — a new
    /// message interrupts every other member's streak.
    pub fn reset_consecutive_except(&self, group_id: &str, sender_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE group_members SET consecutive_replies = 0
             WHERE group_id = ?1 AND member_id != ?2",
            [group_id, sender_id],
        )?;
        Ok(())
    }

    // --- messages ----------------------------------------------------------

    pub fn save_message(&self, msg: &GroupMessage) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO group_messages
             (message_id, group_id, sender_id, sender_type, sender_name, msg_type,
              content, images, mentions, reply_to, read_by, ai_session_id, refs, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            rusqlite::params![
                msg.message_id,
                msg.group_id,
                msg.sender_id,
                msg.sender_type.to_string(),
                msg.sender_name,
                msg.msg_type,
                msg.content,
                serde_json::to_string(&msg.images)?,
                serde_json::to_string(&msg.mentions)?,
                msg.reply_to,
                serde_json::to_string(&msg.read_by)?,
                msg.ai_session_id,
                if msg.references.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&msg.references)?)
                },
                msg.timestamp.to_rfc3339()
            ],
        )?;
        db.execute(
            "UPDATE groups
             SET message_count = message_count + 1, last_message_at = ?1, updated_at = ?1
             WHERE group_id = ?2",
            rusqlite::params![msg.timestamp.to_rfc3339(), msg.group_id],
        )?;
        Ok(())
    }

    /// The most recent `limit` messages, oldest first.
    pub fn recent_messages(&self, group_id: &str, limit: usize) -> Result<Vec<GroupMessage>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT message_id, group_id, sender_id, sender_type, sender_name, msg_type,
                    content, images, mentions, reply_to, read_by, ai_session_id, refs, created_at
             FROM (SELECT * FROM group_messages WHERE group_id = ?1
                   ORDER BY created_at DESC LIMIT ?2)
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![group_id, limit as i64],
            row_to_message,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn mark_read(&self, message_id: &str, member_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let read_by: Option<String> = db
            .query_row(
                "SELECT read_by FROM group_messages WHERE message_id = ?1",
                [message_id],
                |row| row.get(0),
            )
            .ok();
        let Some(read_by) = read_by else {
            return Ok(());
        };
        let mut readers: Vec<String> = serde_json::from_str(&read_by).unwrap_or_default();
        if !readers.iter().any(|r| r == member_id) {
            readers.push(member_id.to_string());
            db.execute(
                "UPDATE group_messages SET read_by = ?1 WHERE message_id = ?2",
                rusqlite::params![serde_json::to_string(&readers)?, message_id],
            )?;
        }
        Ok(())
    }
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let strategy_str: String = row.get(4)?;
    let strategy: GroupStrategyConfig = serde_json::from_str(&strategy_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let last_message_at: Option<String> = row.get(6)?;
    Ok(Group {
        group_id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        system_prompt: row.get(3)?,
        strategy,
        message_count: row.get(5)?,
        last_message_at: last_message_at.and_then(|s| s.parse().ok()),
    })
}

fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupMember> {
    let member_type: String = row.get(3)?;
    let role: String = row.get(4)?;
    let presence: String = row.get(5)?;
    let behavior: Option<String> = row.get(7)?;
    let last_reply_at: Option<String> = row.get(9)?;
    let joined_at: String = row.get(10)?;
    Ok(GroupMember {
        member_id: row.get(0)?,
        group_id: row.get(1)?,
        display_name: row.get(2)?,
        member_type: member_type.parse().unwrap_or(MemberType::Human),
        role: role.parse().unwrap_or(GroupRole::Member),
        presence: presence.parse().unwrap_or(Presence::Offline),
        ai_session_id: row.get(6)?,
        behavior: behavior
            .and_then(|b| serde_json::from_str::<AiBehaviorConfig>(&b).ok()),
        consecutive_reply_count: row.get(8)?,
        last_reply_at: last_reply_at.and_then(|s| s.parse().ok()),
        joined_at: joined_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupMessage> {
    let sender_type: String = row.get(3)?;
    let images: String = row.get(7)?;
    let mentions: String = row.get(8)?;
    let read_by: String = row.get(10)?;
    let refs: Option<String> = row.get(12)?;
    let created_at: String = row.get(13)?;
    Ok(GroupMessage {
        message_id: row.get(0)?,
        group_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_type: sender_type.parse().unwrap_or(MemberType::Human),
        sender_name: row.get(4)?,
        msg_type: row.get(5)?,
        content: row.get(6)?,
        images: serde_json::from_str(&images).unwrap_or_default(),
        mentions: serde_json::from_str(&mentions).unwrap_or_default(),
        reply_to: row.get(9)?,
        read_by: serde_json::from_str(&read_by).unwrap_or_default(),
        ai_session_id: row.get(11)?,
        references: refs
            .and_then(|r| serde_json::from_str(&r).ok())
            .unwrap_or_default(),
        timestamp: created_at.parse().unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn store() -> GroupStore {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        GroupStore::new(conn)
    }

    fn member(group_id: &str, member_id: &str, member_type: MemberType) -> GroupMember {
        GroupMember {
            member_id: member_id.to_string(),
            group_id: group_id.to_string(),
            display_name: member_id.to_uppercase(),
            member_type,
            role: GroupRole::Member,
            presence: Presence::Online,
            ai_session_id: matches!(member_type, MemberType::Ai)
                .then(|| format!("session-{}", member_id)),
            behavior: matches!(member_type, MemberType::Ai).then(AiBehaviorConfig::default),
            consecutive_reply_count: 0,
            last_reply_at: None,
            joined_at: Utc::now(),
        }
    }

    fn message(group_id: &str, sender: &str, content: &str) -> GroupMessage {
        GroupMessage {
            message_id: Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            sender_id: sender.to_string(),
            sender_type: MemberType::Human,
            sender_name: sender.to_string(),
            msg_type: "text".into(),
            content: content.to_string(),
            images: vec![],
            mentions: vec![],
            reply_to: None,
            read_by: vec![],
            ai_session_id: None,
            references: vec![],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn group_round_trips_with_strategy() {
        let store = store();
        let mut strategy = GroupStrategyConfig::default();
        strategy.unrestricted_mode = true;
        let group = store.create_group("u1", "reef chat", None, strategy).unwrap();
        let loaded = store.get_group(&group.group_id).unwrap();
        assert!(loaded.strategy.unrestricted_mode);
        assert_eq!(loaded.name, "reef chat");
    }

    #[test]
    fn members_and_replies() {
        let store = store();
        let group = store
            .create_group("u1", "g", None, GroupStrategyConfig::default())
            .unwrap();
        store.add_member(&member(&group.group_id, "alice", MemberType::Human)).unwrap();
        store.add_member(&member(&group.group_id, "bot1", MemberType::Ai)).unwrap();
        store.add_member(&member(&group.group_id, "bot2", MemberType::Ai)).unwrap();

        store.record_reply(&group.group_id, "bot1").unwrap();
        store.record_reply(&group.group_id, "bot1").unwrap();
        store.reset_consecutive_except(&group.group_id, "alice").unwrap();

        let members = store.members(&group.group_id).unwrap();
        let bot1 = members.iter().find(|m| m.member_id == "bot1").unwrap();
        assert_eq!(bot1.consecutive_reply_count, 0);
        assert!(bot1.last_reply_at.is_some());
        assert!(bot1.behavior.is_some());
    }

    #[test]
    fn recent_messages_are_oldest_first_and_bump_counter() {
        let store = store();
        let group = store
            .create_group("u1", "g", None, GroupStrategyConfig::default())
            .unwrap();
        for i in 0..5 {
            let mut m = message(&group.group_id, "alice", &format!("m{}", i));
            m.timestamp = Utc::now() + chrono::Duration::milliseconds(i as i64);
            store.save_message(&m).unwrap();
        }
        let recent = store.recent_messages(&group.group_id, 3).unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
        assert_eq!(store.get_group(&group.group_id).unwrap().message_count, 5);
    }

    #[test]
    fn mark_read_is_idempotent() {
        let store = store();
        let group = store
            .create_group("u1", "g", None, GroupStrategyConfig::default())
            .unwrap();
        let m = message(&group.group_id, "alice", "hello");
        store.save_message(&m).unwrap();
        store.mark_read(&m.message_id, "bob").unwrap();
        store.mark_read(&m.message_id, "bob").unwrap();
        let recent = store.recent_messages(&group.group_id, 10).unwrap();
        assert_eq!(recent[0].read_by, vec!["bob".to_string()]);
    }
}
