use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::config::BackendConfig;
use crate::memory::{is_storage_safe_id, MemoryStore};
use crate::tools::files::{EditFileTool, ReadFileTool};
use crate::tools::query_db::QueryDbTool;
use crate::tools::remember::RememberTool;
use crate::tools::shell::ShellTool;
use crate::tools::skills::{CreateSkillTool, SkillEvent, SkillLoader, SKILL_POLL_INTERVAL};
use crate::tools::web::{WebFetchTool, WebSearchTool, WebShared};
use crate::tools::{ToolContext, ToolRegistry};

/// Where a session's tools read and write.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub workspace_root: PathBuf,
    pub database_path: PathBuf,
    pub skills_dir: PathBuf,
    pub searxng_url: String,
    pub searxng_auth: Option<String>,
}

impl SessionSettings {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            workspace_root: PathBuf::from(&config.workspace_root),
            database_path: PathBuf::from(&config.database_path),
            skills_dir: config.skills_dir(),
            searxng_url: config.searxng_url.clone(),
            searxng_auth: config.searxng_auth.clone(),
        }
    }
}

/// One group's long-lived agent: its tool registry and hot-reloaded skills.
pub struct AgentSession {
    registry: Arc<ToolRegistry>,
    skills: Arc<SkillLoader>,
    tool_ctx: ToolContext,
}

impl AgentSession {
    pub async fn open(
        group_id: &str,
        settings: &SessionSettings,
        memory: Arc<dyn MemoryStore>,
        web: Arc<WebShared>,
    ) -> Result<Self> {
        if !is_storage_safe_id(group_id) {
            anyhow::bail!("Group id {:?} cannot own a skill directory", group_id);
        }

        let registry = Arc::new(ToolRegistry::new());
        let skills = Arc::new(SkillLoader::new(
            settings.skills_dir.join(group_id),
            web.clone(),
        ));

        registry.register(Arc::new(ShellTool::new())).await;
        registry.register(Arc::new(ReadFileTool::new())).await;
        registry.register(Arc::new(EditFileTool::new())).await;
        registry
            .register(Arc::new(QueryDbTool::new(&settings.database_path)))
            .await;
        registry.register(Arc::new(RememberTool::new(memory))).await;
        registry
            .register(Arc::new(WebSearchTool::new(
                web.clone(),
                &settings.searxng_url,
                settings.searxng_auth.clone(),
            )))
            .await;
        registry.register(Arc::new(WebFetchTool::new(web))).await;
        registry
            .register(Arc::new(CreateSkillTool::new(
                skills.clone(),
                Arc::downgrade(&registry),
            )))
            .await;

        let failed = skills
            .load_all()
            .await
            .iter()
            .filter(|event| matches!(event, SkillEvent::Error { .. }))
            .count();
        let skill_tools = skills.sync_registry(&registry).await;
        skills.start_watching(SKILL_POLL_INTERVAL).await;

        tracing::info!(
            group_id,
            skill_tools,
            failed_skills = failed,
            "Agent session created"
        );

        Ok(Self {
            registry,
            skills,
            tool_ctx: ToolContext::new(group_id, settings.workspace_root.clone()),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.tool_ctx.group_id
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tool_ctx(&self) -> &ToolContext {
        &self.tool_ctx
    }

    pub fn skills(&self) -> &SkillLoader {
        &self.skills
    }

    /// Bring skill tools in line with disk and return their prompt fragments.
    pub async fn refresh(&self) -> String {
        for event in self.skills.refresh().await {
            tracing::debug!(group_id = %self.group_id(), ?event, "Skill change picked up");
        }
        self.skills.sync_registry(&self.registry).await;
        self.skills.prompt_fragment().await
    }

    /// Stop the skill watcher. The session is unusable for new skills afterwards.
    pub async fn dispose(&self) {
        self.skills.dispose().await;
        tracing::info!(group_id = %self.group_id(), "Agent session disposed");
    }
}
