//! File tools (read, edit) confined to the workspace root.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{required_str, Tool, ToolCategory, ToolContext, ToolOutput};

const MAX_READ_BYTES: u64 = 100 * 1024;

const MAX_LIST_ENTRIES: usize = 500;

/// Environment files hold credentials; neither tool touches them.
const PROTECTED_FILE_NAMES: &[&str] = &[".env", ".env.local", ".env.production"];

// ============================================================================
// ReadFileTool
// ============================================================================

pub struct ReadFileTool;

impl ReadFileTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file (code, config, logs), optionally a line range. \
         Reading a directory lists its entries. Paths are relative to the workspace."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace or absolute inside it"
                },
                "start_line": {
                    "type": "integer",
                    "description": "First line to show (1-indexed, default: 1)"
                },
                "end_line": {
                    "type": "integer",
                    "description": "Last line to show, inclusive (default: end of file)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let path_str = match required_str(&params, "path") {
            Ok(p) => p,
            Err(output) => return Ok(output),
        };
        let path = match confine(path_str, &ctx.workspace_root) {
            Ok(path) => path,
            Err(output) => return Ok(output),
        };

        tracing::info!(group_id = %ctx.group_id, path = %path.display(), "read_file executing");

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ToolOutput::Error(format!("File not found: {}", path_str)));
            }
            Err(e) => {
                return Ok(ToolOutput::Error(format!(
                    "Cannot access '{}': {}",
                    path_str, e
                )))
            }
        };

        if metadata.is_dir() {
            return list_directory(&path, path_str).await;
        }

        let start = params["start_line"].as_u64().unwrap_or(1).max(1) as usize;
        let end_line = params["end_line"].as_u64().map(|e| e as usize);

        if metadata.len() > MAX_READ_BYTES {
            let ranged = params["start_line"].is_u64() || end_line.is_some();
            if !ranged {
                return Ok(ToolOutput::Error(format!(
                    "File too large ({:.1}KB, max {}KB). Use start_line/end_line to read part of it.",
                    metadata.len() as f64 / 1024.0,
                    MAX_READ_BYTES / 1024
                )));
            }
            return read_range_streaming(&path, path_str, start, end_line).await;
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => {
                return Ok(ToolOutput::Text(format!(
                    "[Binary file: {} bytes]",
                    metadata.len()
                )));
            }
        };

        let lines: Vec<&str> = content.split('\n').collect();
        let end = end_line.map(|e| e.min(lines.len())).unwrap_or(lines.len());

        let numbered: Vec<String> = if start <= end {
            lines[start - 1..end]
                .iter()
                .enumerate()
                .map(|(i, line)| format!("{:>4} | {}", start + i, line))
                .collect()
        } else {
            Vec::new()
        };

        Ok(ToolOutput::Text(format!(
            "File: {} ({} lines, showing {}-{})\n{}",
            path_str,
            lines.len(),
            start,
            end,
            numbered.join("\n")
        )))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FileSystem
    }
}

/// Line-by-line read for files over the size cap; only the range is kept.
async fn read_range_streaming(
    path: &Path,
    shown_as: &str,
    start: usize,
    end: Option<usize>,
) -> Result<ToolOutput> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => {
            return Ok(ToolOutput::Error(format!(
                "Cannot open '{}': {}",
                shown_as, e
            )))
        }
    };

    let mut lines = BufReader::new(file).lines();
    let mut total = 0usize;
    let mut kept_bytes = 0u64;
    let mut capped = false;
    let mut numbered = Vec::new();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(_) => return Ok(ToolOutput::Text(format!("[Binary file: {}]", shown_as))),
        };
        total += 1;
        let in_range = total >= start && end.map_or(true, |e| total <= e);
        if !in_range || capped {
            continue;
        }
        kept_bytes += line.len() as u64 + 1;
        if kept_bytes > MAX_READ_BYTES {
            capped = true;
            continue;
        }
        numbered.push(format!("{:>4} | {}", total, line));
    }

    let shown_end = if numbered.is_empty() {
        start.saturating_sub(1)
    } else {
        start + numbered.len() - 1
    };
    let mut text = format!(
        "File: {} ({} lines, showing {}-{})\n{}",
        shown_as,
        total,
        start,
        shown_end,
        numbered.join("\n")
    );
    if capped {
        text.push_str(&format!(
            "\n[Output capped at {}KB; request a narrower range]",
            MAX_READ_BYTES / 1024
        ));
    }
    Ok(ToolOutput::Text(text))
}

async fn list_directory(path: &Path, shown_as: &str) -> Result<ToolOutput> {
    let mut reader = match tokio::fs::read_dir(path).await {
        Ok(reader) => reader,
        Err(e) => {
            return Ok(ToolOutput::Error(format!(
                "Cannot list '{}': {}",
                shown_as, e
            )))
        }
    };

    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        let name = entry.file_name().to_string_lossy().to_string();
        entries.push(if is_dir { format!("{}/", name) } else { name });
        if entries.len() >= MAX_LIST_ENTRIES {
            entries.push(format!("[listing capped at {} entries]", MAX_LIST_ENTRIES));
            break;
        }
    }
    entries.sort();

    Ok(ToolOutput::Text(format!(
        "Directory {}:\n{}",
        shown_as,
        entries.join("\n")
    )))
}

// ============================================================================
// EditFileTool
// ============================================================================

pub struct EditFileTool;

impl EditFileTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by exact text replacement. old_text must match exactly once. \
         To create a new file pass an empty old_text and the full content as new_text. \
         Only files inside the workspace can be edited."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace or absolute inside it"
                },
                "old_text": {
                    "type": "string",
                    "description": "Exact text to replace, including whitespace (empty to create the file)"
                },
                "new_text": {
                    "type": "string",
                    "description": "Replacement text"
                }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let (path_str, old_text, new_text) = match (
            required_str(&params, "path"),
            required_str(&params, "old_text"),
            required_str(&params, "new_text"),
        ) {
            (Ok(p), Ok(o), Ok(n)) => (p, o, n),
            (Err(output), _, _) | (_, Err(output), _) | (_, _, Err(output)) => {
                return Ok(output)
            }
        };
        let path = match confine(path_str, &ctx.workspace_root) {
            Ok(path) => path,
            Err(output) => return Ok(output),
        };

        tracing::info!(group_id = %ctx.group_id, path = %path.display(), "edit_file executing");

        if old_text.is_empty() {
            if let Some(parent) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return Ok(ToolOutput::Error(format!(
                        "Failed to create directories: {}",
                        e
                    )));
                }
            }
            if let Err(e) = tokio::fs::write(&path, new_text).await {
                return Ok(ToolOutput::Error(format!("Failed to write file: {}", e)));
            }
            return Ok(ToolOutput::Text(format!(
                "Created {} ({} lines)",
                path_str,
                new_text.split('\n').count()
            )));
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ToolOutput::Error(format!(
                    "File not found: {}. To create it, pass an empty old_text.",
                    path_str
                )));
            }
            Err(e) => return Ok(ToolOutput::Error(format!("Cannot read file: {}", e))),
        };

        let count = content.matches(old_text).count();
        if count == 0 {
            return Ok(ToolOutput::Error(
                "old_text not found in file. It must match exactly, including whitespace and line breaks."
                    .to_string(),
            ));
        }
        if count > 1 {
            return Ok(ToolOutput::Error(format!(
                "old_text matches {} places. Include more surrounding context to make it unique.",
                count
            )));
        }

        let updated = content.replacen(old_text, new_text, 1);
        if let Err(e) = tokio::fs::write(&path, &updated).await {
            return Ok(ToolOutput::Error(format!("Failed to write file: {}", e)));
        }

        Ok(ToolOutput::Text(format!(
            "Edited {}: replaced {} lines with {} lines",
            path_str,
            old_text.split('\n').count(),
            new_text.split('\n').count()
        )))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FileSystem
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Resolve `path` against the workspace and refuse anything outside it or protected.
fn confine(path: &str, workspace_root: &Path) -> std::result::Result<PathBuf, ToolOutput> {
    let root = std::fs::canonicalize(workspace_root)
        .map(|p| normalize(&p))
        .unwrap_or_else(|_| normalize(workspace_root));
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let resolved = normalize(&joined);

    if let Some(name) = resolved.file_name().and_then(|n| n.to_str()) {
        if PROTECTED_FILE_NAMES.contains(&name) {
            return Err(ToolOutput::Error(format!(
                "Access to {} is not allowed (it holds credentials)",
                name
            )));
        }
    }

    // Symlinks inside the workspace may point elsewhere; check the real target when it exists.
    let real = std::fs::canonicalize(&resolved).unwrap_or_else(|_| resolved.clone());
    if !resolved.starts_with(&root) || !real.starts_with(&root) {
        return Err(ToolOutput::Error(format!(
            "Only files inside the workspace ({}) are accessible",
            root.display()
        )));
    }
    Ok(resolved)
}

/// Lexical `.`/`..` resolution; never climbs above the filesystem root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
