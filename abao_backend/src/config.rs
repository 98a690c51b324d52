use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    // LLM configuration (OpenAI-compatible chat completions)
    #[serde(default = "default_llm_provider")]
    pub llm_provider: String,
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    /// Cheaper model for the speak/stay-quiet judge. Falls back to `llm_model`.
    #[serde(default)]
    pub judge_model: Option<String>,

    // Decision and agent bounds
    #[serde(default = "default_judge_timeout_ms")]
    pub judge_timeout_ms: u64,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    #[serde(default = "default_agent_max_iterations")]
    pub agent_max_iterations: usize,
    #[serde(default = "default_true")]
    pub enable_streaming: bool,
    #[serde(default = "default_true")]
    pub context_time_tags: bool,

    // Storage
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,
    #[serde(default)]
    pub persona_path: Option<String>,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,

    // Web tools
    #[serde(default = "default_searxng_url")]
    pub searxng_url: String,
    /// `user:password` for a SearXNG instance behind basic auth.
    #[serde(default)]
    pub searxng_auth: Option<String>,

    // Host server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_auth_mode")]
    pub auth_mode: String,
}

fn default_llm_provider() -> String {
    "deepseek".to_string()
}

fn default_llm_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_llm_model() -> String {
    "deepseek-chat".to_string()
}

fn default_judge_timeout_ms() -> u64 {
    3000
}

fn default_agent_timeout_secs() -> u64 {
    120
}

fn default_agent_max_iterations() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_database_path() -> String {
    "abao_chat.db".to_string()
}

fn default_storage_dir() -> String {
    "storage".to_string()
}

fn default_workspace_root() -> String {
    ".".to_string()
}

fn default_searxng_url() -> String {
    "http://localhost:8888".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_auth_mode() -> String {
    "required".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            llm_provider: default_llm_provider(),
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            judge_model: None,
            judge_timeout_ms: default_judge_timeout_ms(),
            agent_timeout_secs: default_agent_timeout_secs(),
            agent_max_iterations: default_agent_max_iterations(),
            enable_streaming: true,
            context_time_tags: true,
            database_path: default_database_path(),
            storage_dir: default_storage_dir(),
            persona_path: None,
            workspace_root: default_workspace_root(),
            searxng_url: default_searxng_url(),
            searxng_auth: None,
            bind_addr: default_bind_addr(),
            auth_token: None,
            auth_mode: default_auth_mode(),
        }
    }
}

/// Environment variable holding the API key for a provider.
pub fn provider_key_var(provider: &str) -> &'static str {
    match provider.trim().to_ascii_lowercase().as_str() {
        "deepseek" => "DEEPSEEK_API_KEY",
        "anthropic" | "claude" => "ANTHROPIC_API_KEY",
        "kimi" | "moonshot" => "KIMI_API_KEY",
        "openai" => "OPENAI_API_KEY",
        "intern" | "internlm" => "INTERN_API_KEY",
        _ => "LLM_API_KEY",
    }
}

fn env_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
}

impl BackendConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("abao_config.toml")
    }

    /// Load config from abao_config.toml (next to executable), then apply env overrides.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<BackendConfig>(&contents) {
                Ok(mut config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config.apply_env_overrides();
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(provider) = env::var("AI_PROVIDER") {
            if !provider.trim().is_empty() {
                self.llm_provider = provider.trim().to_ascii_lowercase();
            }
        }

        if let Ok(url) = env::var("AI_BASE_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("AI_MODEL") {
            self.llm_model = model;
        }

        if let Ok(model) = env::var("ABAO_JUDGE_MODEL") {
            if !model.trim().is_empty() {
                self.judge_model = Some(model);
            }
        }

        if self.llm_api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            self.llm_api_key = resolve_api_key(&self.llm_provider);
        }

        if let Ok(ms) = env::var("ABAO_JUDGE_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                self.judge_timeout_ms = ms;
            }
        }

        if let Ok(secs) = env::var("ABAO_AGENT_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.agent_timeout_secs = secs;
            }
        }

        if let Ok(enabled) = env::var("ABAO_ENABLE_STREAMING") {
            self.enable_streaming = env_flag(&enabled);
        }

        if let Ok(path) = env::var("ABAO_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Ok(dir) = env::var("ABAO_STORAGE_DIR") {
            if !dir.trim().is_empty() {
                self.storage_dir = dir;
            }
        }

        if let Ok(path) = env::var("ABAO_PERSONA_PATH") {
            if !path.trim().is_empty() {
                self.persona_path = Some(path);
            }
        }

        if let Ok(root) = env::var("ABAO_WORKSPACE_ROOT") {
            if !root.trim().is_empty() {
                self.workspace_root = root;
            }
        }

        if let Ok(url) = env::var("SEARXNG_URL") {
            if !url.trim().is_empty() {
                self.searxng_url = url;
            }
        }

        if let Ok(auth) = env::var("SEARXNG_AUTH") {
            if !auth.trim().is_empty() {
                self.searxng_auth = Some(auth);
            }
        }

        if let Ok(addr) = env::var("ABAO_BACKEND_BIND") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr;
            }
        }

        if let Ok(token) = env::var("ABAO_BACKEND_TOKEN") {
            if !token.trim().is_empty() {
                self.auth_token = Some(token);
            }
        }

        if let Ok(mode) = env::var("ABAO_BACKEND_AUTH_MODE") {
            self.auth_mode = mode;
        }
    }

    pub fn has_llm_credential(&self) -> bool {
        self.llm_api_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn judge_model(&self) -> &str {
        self.judge_model.as_deref().unwrap_or(&self.llm_model)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_millis(self.judge_timeout_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn memories_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage_dir).join("memories")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage_dir).join("sessions")
    }

    pub fn skills_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage_dir).join("skills")
    }
}

/// Look up the provider's key, falling back to the generic `LLM_API_KEY`.
pub fn resolve_api_key(provider: &str) -> Option<String> {
    [provider_key_var(provider), "LLM_API_KEY"]
        .into_iter()
        .filter_map(|var| env::var(var).ok())
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty())
}
