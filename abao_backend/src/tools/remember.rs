use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::{required_str, Tool, ToolCategory, ToolContext, ToolOutput};
use crate::memory::MemoryStore;

/// Appends a fact to the group's permanent memory.
pub struct RememberTool {
    memory: Arc<dyn MemoryStore>,
}

impl RememberTool {
    pub fn new(memory: Arc<dyn MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for RememberTool {
    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Save something important to this group's permanent memory. It will be available in \
         every future conversation. Use it for preferences, agreements and facts worth keeping."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "What to remember, as one short sentence"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let content = match required_str(&params, "content") {
            Ok(c) if !c.trim().is_empty() => c.trim(),
            Ok(_) => return Ok(ToolOutput::Error("Nothing to remember".to_string())),
            Err(output) => return Ok(output),
        };

        tracing::info!(group_id = %ctx.group_id, content, "remember executing");
        match self.memory.save_permanent_memory(&ctx.group_id, content).await {
            Ok(()) => Ok(ToolOutput::Text(format!("Remembered: {}", content))),
            Err(e) => Ok(ToolOutput::Error(format!("Failed to save memory: {:#}", e))),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FileMemoryStore;

    #[tokio::test]
    async fn saves_into_the_calling_group() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileMemoryStore::new(dir.path()));
        let tool = RememberTool::new(store.clone());

        let result = tool
            .execute(
                serde_json::json!({"content": "Bob is allergic to peanuts"}),
                &ToolContext::new("g1", dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(result.to_llm_string(), "Remembered: Bob is allergic to peanuts");
        assert!(store
            .get_permanent_memories("g1")
            .await
            .unwrap()
            .contains("Bob is allergic to peanuts"));
        assert!(store.get_permanent_memories("g2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_content_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tool = RememberTool::new(Arc::new(FileMemoryStore::new(dir.path())));
        let result = tool
            .execute(serde_json::json!({"content": "   "}), &ToolContext::new("g1", dir.path()))
            .await
            .unwrap();
        assert!(!result.is_success());
    }
}
