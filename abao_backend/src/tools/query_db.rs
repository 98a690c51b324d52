//! Read-only SQL access to the chat database.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Value};
use std::path::PathBuf;

use super::{required_str, Tool, ToolCategory, ToolContext, ToolOutput};

const MAX_ROWS: usize = 50;

pub struct QueryDbTool {
    database_path: PathBuf,
}

impl QueryDbTool {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }
}

#[async_trait]
impl Tool for QueryDbTool {
    fn name(&self) -> &str {
        "query_db"
    }

    fn description(&self) -> &str {
        "Run one read-only SELECT against the chat database. Tables: \
         users(id, nickname, email, created_at), chat_groups(id, name, created_at), \
         group_members(group_id, user_id, is_ai, joined_at), \
         messages(id, group_id, sender_id, content, message_type, reply_to_id, created_at). \
         At most 50 rows are returned."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "sql": {
                    "type": "string",
                    "description": "A single SELECT statement"
                }
            },
            "required": ["sql"]
        })
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let sql = match required_str(&params, "sql") {
            Ok(sql) => sql.trim().trim_end_matches(';').trim().to_string(),
            Err(output) => return Ok(output),
        };

        if let Err(reason) = check_select(&sql) {
            return Ok(ToolOutput::Error(reason));
        }

        tracing::info!(group_id = %ctx.group_id, sql = %sql, "query_db executing");

        let path = self.database_path.clone();
        let outcome = tokio::task::spawn_blocking(move || run_query(&path, &sql))
            .await
            .context("query_db worker panicked")?;

        match outcome {
            Ok((total, rows)) if rows.is_empty() => {
                Ok(ToolOutput::Text(format!("Query returned {} rows: (no results)", total)))
            }
            Ok((total, rows)) => Ok(ToolOutput::Text(format!(
                "Query returned {} rows{}:\n{}",
                total,
                if total > MAX_ROWS {
                    format!(" (showing first {})", MAX_ROWS)
                } else {
                    String::new()
                },
                serde_json::to_string_pretty(&Value::Array(rows))?
            ))),
            Err(e) => Ok(ToolOutput::Error(format!("SQL error: {:#}", e))),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Database
    }
}

fn check_select(sql: &str) -> std::result::Result<(), String> {
    let leading = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if leading != "SELECT" {
        return Err("Only SELECT queries are allowed".to_string());
    }
    if sql.contains(';') {
        return Err("Only a single statement is allowed".to_string());
    }
    Ok(())
}

fn run_query(path: &std::path::Path, sql: &str) -> Result<(usize, Vec<Value>)> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("Failed to open {:?} read-only", path))?;

    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query([])?;

    let mut total = 0;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        total += 1;
        if out.len() >= MAX_ROWS {
            continue;
        }
        let mut object = Map::new();
        for (idx, name) in columns.iter().enumerate() {
            let value = match row.get_ref(idx)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(i) => Value::from(i),
                ValueRef::Real(f) => Value::from(f),
                ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).to_string()),
                ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
            };
            object.insert(name.clone(), value);
        }
        out.push(Value::Object(object));
    }
    Ok((total, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ChatDatabase, NewMessage};

    fn seeded() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        let db = ChatDatabase::new(&path).unwrap();
        let group = db.create_group("book club").unwrap();
        let alice = db.create_user(Some("Alice"), None).unwrap();
        db.add_member(&group, &alice).unwrap();
        for i in 0..60 {
            db.insert_message_at(
                NewMessage::user(&group, &alice, &format!("message {}", i)),
                chrono::Utc::now(),
            )
            .unwrap();
        }
        (dir, path)
    }

    fn ctx() -> ToolContext {
        ToolContext::new("g1", std::env::temp_dir())
    }

    #[tokio::test]
    async fn select_returns_json_rows_capped_at_fifty() {
        let (_dir, path) = seeded();
        let tool = QueryDbTool::new(&path);
        let result = tool
            .execute(
                serde_json::json!({"sql": "SELECT content FROM messages ORDER BY seq;"}),
                &ctx(),
            )
            .await
            .unwrap();
        let text = result.to_llm_string();
        assert!(text.starts_with("Query returned 60 rows (showing first 50)"));
        assert!(text.contains("\"content\": \"message 0\""));
        assert!(!text.contains("message 55"));
    }

    #[tokio::test]
    async fn non_select_and_stacked_statements_are_refused() {
        let (_dir, path) = seeded();
        let tool = QueryDbTool::new(&path);
        for sql in [
            "DELETE FROM messages",
            "select 1; DROP TABLE messages",
            "UPDATE users SET nickname = 'x'",
        ] {
            let result = tool
                .execute(serde_json::json!({ "sql": sql }), &ctx())
                .await
                .unwrap();
            assert!(!result.is_success(), "{sql}");
        }
        let count = tool
            .execute(serde_json::json!({"sql": "SELECT COUNT(*) AS n FROM messages"}), &ctx())
            .await
            .unwrap();
        assert!(count.to_llm_string().contains("\"n\": 60"));
    }

    #[tokio::test]
    async fn sql_errors_are_reported_to_the_model() {
        let (_dir, path) = seeded();
        let result = QueryDbTool::new(&path)
            .execute(serde_json::json!({"sql": "SELECT * FROM nowhere"}), &ctx())
            .await
            .unwrap();
        assert!(result.to_llm_string().contains("SQL error"));
    }
}
