//! Learned skills: TOML manifests in a per-group directory, hot-reloaded.
//!
//! A manifest looks like:
//!
//! ```toml
//! name = "weather"
//! description = "Current weather lookups"
//! prompt = "For weather questions call get_weather."
//!
//! [[tools]]
//! name = "get_weather"
//! description = "Current weather for a city"
//! kind = "http_get"
//! url = "https://wttr.in/{city}?format=3"
//! parameters = { city = "City name" }
//! ```
//!
//! `kind = "shell"` tools carry a `command` template instead of `url`.
//! Placeholder values are shell-quoted or URL-encoded before substitution;
//! declared parameters missing from an `http_get` template become query
//! parameters.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::shell::ShellTool;
use super::web::{WebFetchTool, WebShared};
use super::{required_str, Tool, ToolCategory, ToolContext, ToolOutput, ToolRegistry};

pub const SKILL_EXTENSION: &str = "toml";
pub const SKILL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Built-in names a skill may not shadow.
pub const RESERVED_TOOL_NAMES: &[&str] = &[
    "shell",
    "read_file",
    "edit_file",
    "query_db",
    "remember",
    "web_search",
    "web_fetch",
    "create_skill",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub tools: Vec<SkillToolSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub action: SkillAction,
    /// Parameter name to description; every parameter is a required string.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkillAction {
    Shell { command: String },
    HttpGet { url: String },
}

impl SkillAction {
    fn template(&self) -> &str {
        match self {
            SkillAction::Shell { command } => command,
            SkillAction::HttpGet { url } => url,
        }
    }
}

fn placeholder_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
        .as_ref()
}

fn placeholders(template: &str) -> Vec<String> {
    placeholder_pattern()
        .map(|re| {
            re.captures_iter(template)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl SkillManifest {
    pub fn parse(raw: &str) -> Result<Self> {
        let manifest: SkillManifest = toml::from_str(raw).context("Invalid skill manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Skill is missing a name");
        }
        for tool in &self.tools {
            if !valid_identifier(&tool.name) {
                anyhow::bail!(
                    "Tool name '{}' must be 1-64 letters, digits, '_' or '-'",
                    tool.name
                );
            }
            if RESERVED_TOOL_NAMES.contains(&tool.name.as_str()) {
                anyhow::bail!("Tool name '{}' is reserved for a built-in tool", tool.name);
            }
            if let Some(bad) = tool.parameters.keys().find(|p| !valid_identifier(p)) {
                anyhow::bail!("Parameter name '{}' in tool '{}' is invalid", bad, tool.name);
            }
            let template = tool.action.template();
            if template.trim().is_empty() {
                anyhow::bail!("Tool '{}' has an empty template", tool.name);
            }
            for used in placeholders(template) {
                if !tool.parameters.contains_key(&used) {
                    anyhow::bail!(
                        "Tool '{}' uses {{{}}} but does not declare it in parameters",
                        tool.name,
                        used
                    );
                }
            }
            if let SkillAction::HttpGet { url } = &tool.action {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    anyhow::bail!("Tool '{}' url must start with http:// or https://", tool.name);
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// SkillTool
// ============================================================================

/// One manifest tool, exposed through the regular `Tool` trait.
pub struct SkillTool {
    skill_name: String,
    spec: SkillToolSpec,
    description: String,
    web: Arc<WebShared>,
}

impl SkillTool {
    fn new(skill_name: &str, spec: SkillToolSpec, web: Arc<WebShared>) -> Self {
        let description = if spec.description.trim().is_empty() {
            format!("Learned skill '{}'", skill_name)
        } else {
            spec.description.clone()
        };
        Self {
            skill_name: skill_name.to_string(),
            spec,
            description,
            web,
        }
    }

    fn collect_args(
        &self,
        params: &Value,
    ) -> std::result::Result<BTreeMap<String, String>, ToolOutput> {
        let mut args = BTreeMap::new();
        for name in self.spec.parameters.keys() {
            let value = match params.get(name) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                _ => return Err(ToolOutput::Error(format!("Missing '{}' parameter", name))),
            };
            args.insert(name.clone(), value);
        }
        Ok(args)
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn fill(template: &str, args: &BTreeMap<String, String>, encode: fn(&str) -> String) -> String {
    let Some(re) = placeholder_pattern() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &regex_lite::Captures<'_>| {
        let key = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        args.get(key).map(|v| encode(v)).unwrap_or_default()
    })
    .into_owned()
}

#[async_trait]
impl Tool for SkillTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .spec
            .parameters
            .iter()
            .map(|(name, description)| {
                (
                    name.clone(),
                    json!({ "type": "string", "description": description }),
                )
            })
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": self.spec.parameters.keys().collect::<Vec<_>>(),
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let args = match self.collect_args(&params) {
            Ok(args) => args,
            Err(output) => return Ok(output),
        };
        tracing::info!(
            group_id = %ctx.group_id,
            skill = %self.skill_name,
            tool = %self.spec.name,
            "Skill tool executing"
        );

        match &self.spec.action {
            SkillAction::Shell { command } => {
                let command = fill(command, &args, shell_quote);
                ShellTool::new()
                    .execute(json!({ "command": command }), ctx)
                    .await
            }
            SkillAction::HttpGet { url } => {
                let in_template = placeholders(url);
                let filled = fill(url, &args, url_encode);
                let mut target = match url::Url::parse(&filled) {
                    Ok(target) => target,
                    Err(e) => {
                        return Ok(ToolOutput::Error(format!("Skill produced a bad URL: {}", e)))
                    }
                };
                {
                    let extra: Vec<(&String, &String)> = args
                        .iter()
                        .filter(|(name, _)| !in_template.contains(name))
                        .collect();
                    if !extra.is_empty() {
                        let mut pairs = target.query_pairs_mut();
                        for (name, value) in extra {
                            pairs.append_pair(name, value);
                        }
                    }
                }
                WebFetchTool::new(self.web.clone())
                    .execute(json!({ "url": target.as_str() }), ctx)
                    .await
            }
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Skill
    }
}

// ============================================================================
// SkillLoader
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkillEvent {
    Loaded { skill_name: String, file_name: String },
    Unloaded { skill_name: String, file_name: String },
    Error { file_name: String, error: String },
}

struct LoadedSkill {
    manifest: SkillManifest,
    modified: Option<SystemTime>,
}

/// Keeps one group's skill directory loaded and in sync with disk.
pub struct SkillLoader {
    skills_dir: PathBuf,
    web: Arc<WebShared>,
    skills: RwLock<HashMap<PathBuf, LoadedSkill>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn is_skill_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(SKILL_EXTENSION)
}

impl SkillLoader {
    pub fn new(skills_dir: impl Into<PathBuf>, web: Arc<WebShared>) -> Self {
        Self {
            skills_dir: skills_dir.into(),
            web,
            skills: RwLock::new(HashMap::new()),
            watcher: Mutex::new(None),
        }
    }

    pub fn skills_dir(&self) -> &Path {
        &self.skills_dir
    }

    pub async fn load_skill(&self, path: &Path) -> SkillEvent {
        let file_name = file_name_of(path);
        let parsed = async {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {:?}", path))?;
            let modified = tokio::fs::metadata(path)
                .await
                .ok()
                .and_then(|m| m.modified().ok());
            Ok::<_, anyhow::Error>((SkillManifest::parse(&raw)?, modified))
        }
        .await;

        match parsed {
            Ok((manifest, modified)) => {
                let skill_name = manifest.name.clone();
                self.skills
                    .write()
                    .await
                    .insert(path.to_path_buf(), LoadedSkill { manifest, modified });
                tracing::info!(skill = %skill_name, file = %file_name, "Skill loaded");
                SkillEvent::Loaded {
                    skill_name,
                    file_name,
                }
            }
            Err(e) => {
                tracing::warn!(file = %file_name, "Skill load failed: {:#}", e);
                SkillEvent::Error {
                    file_name,
                    error: format!("{:#}", e),
                }
            }
        }
    }

    pub async fn unload_skill(&self, path: &Path) -> Option<SkillEvent> {
        let removed = self.skills.write().await.remove(path)?;
        tracing::info!(skill = %removed.manifest.name, "Skill unloaded");
        Some(SkillEvent::Unloaded {
            skill_name: removed.manifest.name,
            file_name: file_name_of(path),
        })
    }

    pub async fn load_all(&self) -> Vec<SkillEvent> {
        if let Err(e) = tokio::fs::create_dir_all(&self.skills_dir).await {
            tracing::warn!("Cannot create skills dir {:?}: {}", self.skills_dir, e);
            return Vec::new();
        }
        let mut events = Vec::new();
        for path in self.scan().await {
            events.push(self.load_skill(&path).await);
        }
        events
    }

    async fn scan(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let Ok(mut reader) = tokio::fs::read_dir(&self.skills_dir).await else {
            return found;
        };
        while let Ok(Some(entry)) = reader.next_entry().await {
            let path = entry.path();
            if is_skill_file(&path) {
                found.push(path);
            }
        }
        found.sort();
        found
    }

    /// One polling pass: load new or modified files, unload deleted ones.
    pub async fn refresh(&self) -> Vec<SkillEvent> {
        let on_disk = self.scan().await;
        let mut events = Vec::new();

        let known: Vec<PathBuf> = self.skills.read().await.keys().cloned().collect();
        for path in known.iter().filter(|p| !on_disk.contains(p)) {
            if let Some(event) = self.unload_skill(path).await {
                events.push(event);
            }
        }

        for path in on_disk {
            let modified = tokio::fs::metadata(&path)
                .await
                .ok()
                .and_then(|m| m.modified().ok());
            let current = self
                .skills
                .read()
                .await
                .get(&path)
                .map(|skill| skill.modified);
            let stale = match current {
                Some(seen) => seen != modified,
                None => true,
            };
            if stale {
                events.push(self.load_skill(&path).await);
            }
        }
        events
    }

    /// Poll the directory until `dispose` is called or the loader is dropped.
    pub async fn start_watching(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(loader) = weak.upgrade() else {
                    break;
                };
                for event in loader.refresh().await {
                    tracing::debug!(dir = ?loader.skills_dir, ?event, "Skill directory changed");
                }
            }
        });
        if let Some(previous) = self.watcher.lock().await.replace(handle) {
            previous.abort();
        }
    }

    pub async fn dispose(&self) {
        if let Some(handle) = self.watcher.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn loaded_skill_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .skills
            .read()
            .await
            .values()
            .map(|s| s.manifest.name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn tools(&self) -> Vec<Arc<dyn Tool>> {
        let skills = self.skills.read().await;
        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
        for skill in skills.values() {
            for spec in &skill.manifest.tools {
                tools.push(Arc::new(SkillTool::new(
                    &skill.manifest.name,
                    spec.clone(),
                    self.web.clone(),
                )));
            }
        }
        tools
    }

    /// Prompt fragments of every loaded skill, one per line.
    pub async fn prompt_fragment(&self) -> String {
        let skills = self.skills.read().await;
        let mut fragments: Vec<(&str, &str)> = skills
            .values()
            .filter_map(|s| {
                s.manifest
                    .prompt
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .map(|p| (s.manifest.name.as_str(), p.trim()))
            })
            .collect();
        fragments.sort();
        fragments
            .into_iter()
            .map(|(_, p)| p)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Replace the registry's skill tools with the currently loaded set.
    pub async fn sync_registry(&self, registry: &ToolRegistry) -> usize {
        registry.deregister_category(ToolCategory::Skill).await;
        let tools = self.tools().await;
        let count = tools.len();
        for tool in tools {
            registry.register(tool).await;
        }
        count
    }
}

// ============================================================================
// CreateSkillTool
// ============================================================================

pub struct CreateSkillTool {
    loader: Arc<SkillLoader>,
    registry: Weak<ToolRegistry>,
}

impl CreateSkillTool {
    pub fn new(loader: Arc<SkillLoader>, registry: Weak<ToolRegistry>) -> Self {
        Self { loader, registry }
    }
}

#[async_trait]
impl Tool for CreateSkillTool {
    fn name(&self) -> &str {
        "create_skill"
    }

    fn description(&self) -> &str {
        "Create a new skill (a set of tools) that stays available in this group. Explain to the \
         group what you want to learn and get agreement before calling this. The manifest is \
         TOML: name, description, optional prompt, and [[tools]] entries each with name, \
         description, kind (\"shell\" with a command template or \"http_get\" with a url \
         template) and parameters (a table of parameter name to description). Use {param} \
         placeholders in templates. New tools are usable immediately."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_name": {
                    "type": "string",
                    "description": "Manifest file name without a path, e.g. weather.toml"
                },
                "manifest": {
                    "type": "string",
                    "description": "Complete TOML manifest"
                },
                "reason": {
                    "type": "string",
                    "description": "Why this skill is being created (for the log)"
                }
            },
            "required": ["file_name", "manifest", "reason"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let (file_name, manifest) = match (
            required_str(&params, "file_name"),
            required_str(&params, "manifest"),
        ) {
            (Ok(f), Ok(m)) => (f.trim(), m),
            (Err(output), _) | (_, Err(output)) => return Ok(output),
        };
        let reason = params.get("reason").and_then(Value::as_str).unwrap_or("");

        if !file_name.ends_with(".toml") {
            return Ok(ToolOutput::Error("file_name must end with .toml".to_string()));
        }
        if file_name.contains('/') || file_name.contains('\\') || file_name.starts_with('.') {
            return Ok(ToolOutput::Error(
                "file_name must be a plain file name without path separators".to_string(),
            ));
        }

        tracing::info!(group_id = %ctx.group_id, file_name, reason, "create_skill executing");

        // A rejected manifest must never replace a working skill of the same name.
        if let Err(e) = SkillManifest::parse(manifest) {
            return Ok(rejected(&format!("{:#}", e)));
        }

        let dir = self.loader.skills_dir();
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {:?}", dir))?;
        let path = dir.join(file_name);
        // The staging name has no skill extension, so the watcher never sees it half-written.
        let staging = dir.join(format!(".{}.partial", file_name));
        tokio::fs::write(&staging, manifest)
            .await
            .with_context(|| format!("Failed to write {:?}", staging))?;
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            tokio::fs::remove_file(&staging).await.ok();
            return Err(e).with_context(|| format!("Failed to move skill into {:?}", path));
        }

        match self.loader.load_skill(&path).await {
            SkillEvent::Loaded { skill_name, .. } => {
                let tool_count = match self.registry.upgrade() {
                    Some(registry) => self.loader.sync_registry(&registry).await,
                    None => self.loader.tools().await.len(),
                };
                let loaded = self.loader.loaded_skill_names().await;
                Ok(ToolOutput::Text(format!(
                    "Skill \"{}\" created and loaded.\nLoaded skills: {}\nSkill tools available: {}",
                    skill_name,
                    loaded.join(", "),
                    tool_count
                )))
            }
            SkillEvent::Error { error, .. } => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!("Failed to remove rejected skill {:?}: {}", path, e);
                }
                self.loader.unload_skill(&path).await;
                Ok(rejected(&error))
            }
            SkillEvent::Unloaded { .. } => Ok(ToolOutput::Error(
                "Skill was unloaded while being created".to_string(),
            )),
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::General
    }
}

fn rejected(error: &str) -> ToolOutput {
    ToolOutput::Error(format!(
        "Skill file was rejected: {}. Fix the manifest and try again.",
        error
    ))
}
