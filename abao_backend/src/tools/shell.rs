//! Shell command execution for quick lookups: dates, arithmetic, listings.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use super::safety::{check_command, SafetyVerdict};
use super::{required_str, Tool, ToolCategory, ToolContext, ToolOutput};

const TIMEOUT_SECS: u64 = 30;

/// Maximum output size before truncation (bytes)
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

pub struct ShellTool;

impl ShellTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command and return its real output. Useful for the current date (date), \
         calculations (bc/python3), listing files (ls) and system facts. Never use echo to \
         fabricate information."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute (passed to /bin/sh -c)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let command = match required_str(&params, "command") {
            Ok(cmd) => cmd.trim(),
            Err(output) => return Ok(output),
        };

        if let SafetyVerdict::Block(reason) = check_command(command) {
            tracing::warn!(group_id = %ctx.group_id, command, "Dangerous command blocked");
            return Ok(ToolOutput::Error(format!("Safety restriction: {}", reason)));
        }

        tracing::info!(group_id = %ctx.group_id, command, "ShellTool executing");

        let result = tokio::time::timeout(
            Duration::from_secs(TIMEOUT_SECS),
            tokio::process::Command::new("/bin/sh")
                .arg("-c")
                .arg(command)
                .current_dir(&ctx.workspace_root)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                let stdout = truncate_bytes(&output.stdout, "stdout");
                let stderr = truncate_bytes(&output.stderr, "stderr");

                if output.status.success() {
                    if stdout.trim().is_empty() {
                        return Ok(ToolOutput::Text("(no output)".to_string()));
                    }
                    return Ok(ToolOutput::Text(stdout));
                }

                let exit_code = output.status.code().unwrap_or(-1);
                let mut text = format!("Exit code: {}\n", exit_code);
                if !stdout.is_empty() {
                    text.push_str(&format!("\n--- stdout ---\n{}", stdout));
                }
                if !stderr.is_empty() {
                    text.push_str(&format!("\n--- stderr ---\n{}", stderr));
                }
                Ok(ToolOutput::Text(text))
            }
            Ok(Err(e)) => Ok(ToolOutput::Error(format!(
                "Failed to execute command: {}",
                e
            ))),
            Err(_) => Ok(ToolOutput::Error(format!(
                "Command timed out after {} seconds",
                TIMEOUT_SECS
            ))),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Shell
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_bytes(raw: &[u8], stream: &str) -> String {
    if raw.len() <= MAX_OUTPUT_BYTES {
        return String::from_utf8_lossy(raw).to_string();
    }
    let mut text = String::from_utf8_lossy(&raw[..MAX_OUTPUT_BYTES]).to_string();
    text.push_str(&format!("\n[{} truncated]", stream));
    text
}
