use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionEntry {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Long-lived per-group memory plus an append-only session log.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn get_permanent_memories(&self, group_id: &str) -> Result<String>;
    async fn save_permanent_memory(&self, group_id: &str, content: &str) -> Result<()>;
    async fn append_session_history(&self, group_id: &str, entry: &SessionEntry) -> Result<()>;
    async fn session_history(&self, group_id: &str, limit: Option<usize>)
        -> Result<Vec<SessionEntry>>;
}

/// `memories/<group>/MEMORY.md` and `sessions/<group>/history.jsonl` under a base dir.
pub struct FileMemoryStore {
    base_dir: PathBuf,
}

impl FileMemoryStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn group_dir(&self, kind: &str, group_id: &str) -> Result<PathBuf> {
        if !is_storage_safe_id(group_id) {
            anyhow::bail!("Invalid group id for storage path: {:?}", group_id);
        }
        Ok(self.base_dir.join(kind).join(group_id))
    }

    fn memory_path(&self, group_id: &str) -> Result<PathBuf> {
        Ok(self.group_dir("memories", group_id)?.join("MEMORY.md"))
    }

    fn history_path(&self, group_id: &str) -> Result<PathBuf> {
        Ok(self.group_dir("sessions", group_id)?.join("history.jsonl"))
    }
}

/// Group ids become directory names; only `[A-Za-z0-9_-]` is accepted.
pub fn is_storage_safe_id(group_id: &str) -> bool {
    !group_id.is_empty()
        && group_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn append_to(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {:?}", path))?;
    file.write_all(text.as_bytes())
        .await
        .with_context(|| format!("Failed to append to {:?}", path))?;
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl MemoryStore for FileMemoryStore {
    async fn get_permanent_memories(&self, group_id: &str) -> Result<String> {
        let path = self.memory_path(group_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", path)),
        }
    }

    async fn save_permanent_memory(&self, group_id: &str, content: &str) -> Result<()> {
        let path = self.memory_path(group_id)?;
        let entry = format!("\n- [{}] {}\n", Utc::now().format("%Y-%m-%d"), content.trim());
        append_to(&path, &entry).await
    }

    async fn append_session_history(&self, group_id: &str, entry: &SessionEntry) -> Result<()> {
        let path = self.history_path(group_id)?;
        let mut line = serde_json::to_string(entry).context("Failed to encode session entry")?;
        line.push('\n');
        append_to(&path, &line).await
    }

    async fn session_history(
        &self,
        group_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SessionEntry>> {
        let path = self.history_path(group_id)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };
        let mut entries: Vec<SessionEntry> = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(error) => {
                    tracing::warn!("Skipping malformed session line in {:?}: {}", path, error);
                    None
                }
            })
            .collect();
        if let Some(limit) = limit {
            if limit < entries.len() {
                entries.drain(..entries.len() - limit);
            }
        }
        Ok(entries)
    }
}
