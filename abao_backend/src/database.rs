use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Name shown for the AI persona in rosters and message DTOs.
pub const AI_DISPLAY_NAME: &str = "A宝";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    User,
    Ai,
    System,
}

impl MessageType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MessageType::User => "USER",
            MessageType::Ai => "AI",
            MessageType::System => "SYSTEM",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "AI" => MessageType::Ai,
            "SYSTEM" => MessageType::System,
            _ => MessageType::User,
        }
    }
}

/// A persisted message joined with its sender's profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub id: String,
    pub group_id: String,
    pub sender_id: Option<String>,
    pub content: String,
    pub message_type: MessageType,
    pub reply_to_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sender_nickname: Option<String>,
    pub sender_email: Option<String>,
}

impl MessageRecord {
    /// Nickname, else the local part of the email, else "Unknown".
    pub fn sender_display_name(&self) -> String {
        if self.message_type == MessageType::Ai {
            return AI_DISPLAY_NAME.to_string();
        }
        display_name(self.sender_nickname.as_deref(), self.sender_email.as_deref())
    }

    pub fn to_dto(&self, reply_to: Option<&MessageRecord>) -> MessageDto {
        MessageDto {
            id: self.id.clone(),
            group_id: self.group_id.clone(),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_display_name(),
            content: self.content.clone(),
            message_type: self.message_type,
            reply_to_id: self.reply_to_id.clone(),
            reply_to_content: reply_to.map(|target| preview(&target.content, 50)),
            created_at: self.created_at,
        }
    }
}

pub fn display_name(nickname: Option<&str>, email: Option<&str>) -> String {
    if let Some(nickname) = nickname.map(str::trim).filter(|n| !n.is_empty()) {
        return nickname.to_string();
    }
    if let Some(local) = email
        .and_then(|email| email.split('@').next())
        .map(str::trim)
        .filter(|local| !local.is_empty())
    {
        return local.to_string();
    }
    "Unknown".to_string()
}

fn preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let head: String = content.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

/// Wire form of a message, shared with clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub id: String,
    pub group_id: String,
    pub sender_id: Option<String>,
    pub sender_name: String,
    pub content: String,
    pub message_type: MessageType,
    pub reply_to_id: Option<String>,
    pub reply_to_content: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub group_id: String,
    pub sender_id: Option<String>,
    pub content: String,
    pub message_type: MessageType,
    pub reply_to_id: Option<String>,
}

impl NewMessage {
    pub fn user(group_id: &str, sender_id: &str, content: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            sender_id: Some(sender_id.to_string()),
            content: content.to_string(),
            message_type: MessageType::User,
            reply_to_id: None,
        }
    }

    pub fn ai_reply(group_id: &str, content: &str, reply_to_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            sender_id: None,
            content: content.to_string(),
            message_type: MessageType::Ai,
            reply_to_id: Some(reply_to_id.to_string()),
        }
    }

    pub fn replying_to(mut self, reply_to_id: &str) -> Self {
        self.reply_to_id = Some(reply_to_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberActivity {
    pub display_name: String,
    pub is_ai: bool,
    pub recent_message_count: u32,
}

impl MemberActivity {
    pub fn activity_label(&self) -> &'static str {
        match self.recent_message_count {
            n if n >= 20 => "active",
            n if n >= 5 => "occasional",
            n if n > 0 => "low",
            _ => "lurker",
        }
    }
}

/// Message persistence the pipeline depends on.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_message(&self, message: NewMessage) -> Result<MessageRecord>;
    async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>>;
    /// The newest `limit` messages created at or after `since`, returned oldest first.
    async fn messages_in_window(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>>;
    /// Specific messages of any age, oldest first.
    async fn messages_by_ids(&self, ids: &[String]) -> Result<Vec<MessageRecord>>;
    /// Members in join order with their USER message count since `since`.
    async fn group_roster(&self, group_id: &str, since: DateTime<Utc>)
        -> Result<Vec<MemberActivity>>;
}

const MESSAGE_COLUMNS: &str = "m.id, m.group_id, m.sender_id, m.content, m.message_type,
     m.reply_to_id, m.created_at, u.nickname, u.email";

fn db_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let message_type: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        group_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        message_type: MessageType::from_db(&message_type),
        reply_to_id: row.get(5)?,
        created_at: parse_timestamp(&created_at),
        sender_nickname: row.get(7)?,
        sender_email: row.get(8)?,
    })
}

pub struct ChatDatabase {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl ChatDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
            path,
        };
        db.ensure_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                nickname TEXT,
                email TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS chat_groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL,
                user_id TEXT,
                is_ai INTEGER NOT NULL DEFAULT 0,
                joined_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_group_members_unique
                ON group_members(group_id, user_id);
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                group_id TEXT NOT NULL,
                sender_id TEXT,
                content TEXT NOT NULL,
                message_type TEXT NOT NULL,
                reply_to_id TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_group_created
                ON messages(group_id, created_at);
            "#,
        )
        .context("Failed to create chat schema")?;

        Ok(())
    }

    pub fn create_user(&self, nickname: Option<&str>, email: Option<&str>) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO users (id, nickname, email, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, nickname, email, db_timestamp(Utc::now())],
        )?;
        Ok(id)
    }

    /// Create a group; the AI persona joins it as the first member.
    pub fn create_group(&self, name: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = db_timestamp(Utc::now());
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO chat_groups (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![id, name, now],
        )?;
        conn.execute(
            "INSERT INTO group_members (group_id, user_id, is_ai, joined_at) VALUES (?1, NULL, 1, ?2)",
            params![id, now],
        )?;
        Ok(id)
    }

    pub fn group_exists(&self, group_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM chat_groups WHERE id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn add_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, is_ai, joined_at)
             VALUES (?1, ?2, 0, ?3)",
            params![group_id, user_id, db_timestamp(Utc::now())],
        )?;
        Ok(())
    }

    pub fn is_member(&self, group_id: &str, user_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Insert with an explicit creation time.
    pub fn insert_message_at(
        &self,
        message: NewMessage,
        created_at: DateTime<Utc>,
    ) -> Result<MessageRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let conn = self.lock_conn()?;
            conn.execute(
                "INSERT INTO messages (id, group_id, sender_id, content, message_type, reply_to_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    message.group_id,
                    message.sender_id,
                    message.content,
                    message.message_type.as_db_str(),
                    message.reply_to_id,
                    db_timestamp(created_at),
                ],
            )
            .context("Failed to insert message")?;
        }
        self.load_message(&id)?
            .ok_or_else(|| anyhow::anyhow!("Inserted message {} not found", id))
    }

    fn load_message(&self, id: &str) -> Result<Option<MessageRecord>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM messages m LEFT JOIN users u ON m.sender_id = u.id WHERE m.id = ?1",
            MESSAGE_COLUMNS
        );
        let record = conn
            .query_row(&sql, params![id], row_to_message)
            .optional()?;
        Ok(record)
    }

    /// Newest `limit` messages of a group, returned oldest first.
    pub fn recent_messages(&self, group_id: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM messages m LEFT JOIN users u ON m.sender_id = u.id
             WHERE m.group_id = ?1
             ORDER BY m.created_at DESC, m.seq DESC
             LIMIT ?2",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt
            .query_map(params![group_id, limit as i64], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }
}

#[async_trait]
impl MessageStore for ChatDatabase {
    async fn insert_message(&self, message: NewMessage) -> Result<MessageRecord> {
        self.insert_message_at(message, Utc::now())
    }

    async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>> {
        self.load_message(id)
    }

    async fn messages_in_window(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM messages m LEFT JOIN users u ON m.sender_id = u.id
             WHERE m.group_id = ?1 AND m.created_at >= ?2
             ORDER BY m.created_at DESC, m.seq DESC
             LIMIT ?3",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt
            .query_map(
                params![group_id, db_timestamp(since), limit as i64],
                row_to_message,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    async fn messages_by_ids(&self, ids: &[String]) -> Result<Vec<MessageRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock_conn()?;
        let placeholders = (1..=ids.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM messages m LEFT JOIN users u ON m.sender_id = u.id
             WHERE m.id IN ({})
             ORDER BY m.created_at ASC, m.seq ASC",
            MESSAGE_COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn group_roster(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MemberActivity>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT u.nickname, u.email, gm.is_ai,
                    (SELECT COUNT(*) FROM messages m
                     WHERE m.group_id = gm.group_id
                       AND m.sender_id = gm.user_id
                       AND m.message_type = 'USER'
                       AND m.created_at >= ?2)
             FROM group_members gm
             LEFT JOIN users u ON gm.user_id = u.id
             WHERE gm.group_id = ?1
             ORDER BY gm.joined_at ASC, gm.rowid ASC",
        )?;
        let roster = stmt
            .query_map(params![group_id, db_timestamp(since)], |row| {
                let nickname: Option<String> = row.get(0)?;
                let email: Option<String> = row.get(1)?;
                let is_ai: i64 = row.get(2)?;
                let count: i64 = row.get(3)?;
                Ok(MemberActivity {
                    display_name: if is_ai != 0 {
                        AI_DISPLAY_NAME.to_string()
                    } else {
                        display_name(nickname.as_deref(), email.as_deref())
                    },
                    is_ai: is_ai != 0,
                    recent_message_count: count.max(0) as u32,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(roster)
    }
}
