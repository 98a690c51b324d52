//! Tools the response agent may call while composing a reply.
//!
//! Each tool declares a JSON Schema for its parameters so it can be offered
//! through OpenAI-style function calling. A per-group `ToolRegistry` holds the
//! built-in tools plus whatever the group's learned skills contribute.

pub mod agentic;
pub mod files;
pub mod query_db;
pub mod remember;
pub mod safety;
pub mod shell;
pub mod skills;
pub mod web;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolCategory {
    FileSystem,
    Shell,
    Network,
    Memory,
    Database,
    /// Contributed by a learned skill.
    Skill,
    General,
}

/// The result of executing a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToolOutput {
    Text(String),
    Json(serde_json::Value),
    /// A user-facing failure the model should see and recover from.
    Error(String),
}

impl ToolOutput {
    /// Convert to a string representation suitable for feeding back to the LLM
    pub fn to_llm_string(&self) -> String {
        match self {
            ToolOutput::Text(s) => s.clone(),
            ToolOutput::Json(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
            ToolOutput::Error(e) => format!("[ERROR] {}", e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutput::Text(_) | ToolOutput::Json(_))
    }
}

/// Context passed to tools during execution
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Group the invocation is answering.
    pub group_id: String,
    /// Root that file and shell tools are confined to.
    pub workspace_root: PathBuf,
}

impl ToolContext {
    pub fn new(group_id: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            group_id: group_id.into(),
            workspace_root: workspace_root.into(),
        }
    }
}

/// A capability the agent can invoke during its reasoning loop.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used in function-calling (e.g., "shell", "read_file")
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    ///
    /// Example:
    /// ```json
    /// {
    ///   "type": "object",
    ///   "properties": {
    ///     "command": { "type": "string", "description": "Shell command to execute" }
    ///   },
    ///   "required": ["command"]
    /// }
    /// ```
    fn parameters_schema(&self) -> serde_json::Value;

    /// `Err` is reserved for infrastructure failures; bad input is `ToolOutput::Error`.
    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput>;

    fn category(&self) -> ToolCategory {
        ToolCategory::General
    }
}

/// OpenAI-format function definition for LLM function-calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// OpenAI-format tool definition (wraps FunctionDef)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

/// A tool call parsed from LLM output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub name: String,
    pub output: ToolOutput,
}

/// Thread-safe registry of tools available to one group's agent.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. Overwrites any existing tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!(
            "Registered tool: {} (category: {:?})",
            name,
            tool.category()
        );
        self.tools.write().await.insert(name, tool);
    }

    pub async fn deregister(&self, name: &str) -> bool {
        self.tools.write().await.remove(name).is_some()
    }

    /// Drop every tool in the given category. Returns how many were removed.
    pub async fn deregister_category(&self, category: ToolCategory) -> usize {
        let mut tools = self.tools.write().await;
        let before = tools.len();
        tools.retain(|_, tool| tool.category() != category);
        before - tools.len()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every registered tool as a function definition, sorted by name.
    pub async fn tool_definitions(&self) -> Vec<ToolDef> {
        let tools = self.tools.read().await;
        let mut defs: Vec<ToolDef> = tools
            .values()
            .map(|tool| ToolDef {
                tool_type: "function".to_string(),
                function: FunctionDef {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    pub async fn execute_call(&self, call: &ToolCall, ctx: &ToolContext) -> ToolCallResult {
        let tool = match self.get(&call.name).await {
            Some(t) => t,
            None => {
                return ToolCallResult {
                    name: call.name.clone(),
                    output: ToolOutput::Error(format!("Unknown tool: {}", call.name)),
                };
            }
        };

        match tool.execute(call.arguments.clone(), ctx).await {
            Ok(output) => ToolCallResult {
                name: call.name.clone(),
                output,
            },
            Err(e) => {
                tracing::warn!(group_id = %ctx.group_id, "Tool {} failed: {:#}", call.name, e);
                ToolCallResult {
                    name: call.name.clone(),
                    output: ToolOutput::Error(format!("Tool execution failed: {}", e)),
                }
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull a required string parameter or produce the tool-facing error.
pub(crate) fn required_str<'a>(
    params: &'a serde_json::Value,
    key: &str,
) -> std::result::Result<&'a str, ToolOutput> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolOutput::Error(format!("Missing '{}' parameter", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes back the input message"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string" }
                },
                "required": ["message"]
            })
        }

        async fn execute(
            &self,
            params: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput> {
            match required_str(&params, "message") {
                Ok(message) => Ok(ToolOutput::Text(message.to_string())),
                Err(output) => Ok(output),
            }
        }
    }

    struct BrokenSkill;

    #[async_trait]
    impl Tool for BrokenSkill {
        fn name(&self) -> &str {
            "weather"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object", "properties": {} })
        }

        async fn execute(
            &self,
            _params: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput> {
            anyhow::bail!("upstream exploded")
        }

        fn category(&self) -> ToolCategory {
            ToolCategory::Skill
        }
    }

    fn test_ctx() -> ToolContext {
        ToolContext::new("g1", "/tmp")
    }

    #[tokio::test]
    async fn executes_registered_tool() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;

        let call = ToolCall {
            name: "echo".to_string(),
            arguments: serde_json::json!({"message": "hello"}),
        };
        let result = registry.execute_call(&call, &test_ctx()).await;
        assert!(result.output.is_success());
        assert_eq!(result.output.to_llm_string(), "hello");

        let missing = ToolCall {
            name: "echo".to_string(),
            arguments: serde_json::json!({}),
        };
        let result = registry.execute_call(&missing, &test_ctx()).await;
        assert!(result.output.to_llm_string().contains("Missing 'message'"));
    }

    #[tokio::test]
    async fn unknown_and_failing_tools_become_error_output() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(BrokenSkill)).await;

        let unknown = ToolCall {
            name: "nonexistent".to_string(),
            arguments: serde_json::json!({}),
        };
        let result = registry.execute_call(&unknown, &test_ctx()).await;
        assert!(result.output.to_llm_string().contains("Unknown tool"));

        let broken = ToolCall {
            name: "weather".to_string(),
            arguments: serde_json::json!({}),
        };
        let result = registry.execute_call(&broken, &test_ctx()).await;
        assert!(!result.output.is_success());
        assert!(result.output.to_llm_string().contains("upstream exploded"));
    }

    #[tokio::test]
    async fn definitions_cover_every_tool_sorted_by_name() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        registry.register(Arc::new(BrokenSkill)).await;

        let defs = registry.tool_definitions().await;
        let names: Vec<&str> = defs.iter().map(|d| d.function.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "weather"]);
        assert!(defs.iter().all(|d| d.tool_type == "function"));
    }

    #[tokio::test]
    async fn deregister_category_drops_only_skills() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        registry.register(Arc::new(BrokenSkill)).await;

        assert_eq!(registry.deregister_category(ToolCategory::Skill).await, 1);
        assert_eq!(registry.list_names().await, vec!["echo".to_string()]);
        assert!(registry.deregister("echo").await);
        assert!(!registry.deregister("echo").await);
    }
}
