//! Web search (SearXNG) and page fetching, sharing one rate limiter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use lru::LruCache;
use nonzero_ext::nonzero;
use reqwest::Url;
use scraper::node::Element;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::http_client::build_http_client_with_timeout;

use super::{required_str, Tool, ToolCategory, ToolContext, ToolOutput};

const RATE_LIMIT_PER_MINUTE: NonZeroU32 = nonzero!(10u32);

const SEARCH_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const SEARCH_CACHE_CAPACITY: NonZeroUsize = nonzero!(200usize);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const SEARCH_MAX_RESULTS: usize = 10;
const SEARCH_LANGUAGE: &str = "zh-CN";

const FETCH_CACHE_TTL: Duration = Duration::from_secs(15 * 60);
const FETCH_CACHE_CAPACITY: NonZeroUsize = nonzero!(100usize);
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const FETCH_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
const FETCH_MAX_TEXT_CHARS: usize = 500 * 1024;

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// LRU of rendered tool output; entries older than `ttl` count as misses.
pub struct TtlCache {
    ttl: Duration,
    entries: Mutex<LruCache<String, (String, Instant)>>,
}

impl TtlCache {
    pub fn new(ttl: Duration, capacity: NonZeroUsize) -> Self {
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, (String, Instant)>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.lock();
        let fresh = entries
            .get(key)
            .map(|(value, at)| (value.clone(), at.elapsed() <= self.ttl));
        match fresh {
            Some((value, true)) => Some(value),
            Some((_, false)) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, value: String) {
        self.lock().put(key, (value, Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

/// State shared by every group's web tools.
pub struct WebShared {
    limiter: DirectRateLimiter,
    pub search_cache: TtlCache,
    pub fetch_cache: TtlCache,
}

impl WebShared {
    pub fn new() -> Self {
        Self::with_quota(Quota::per_minute(RATE_LIMIT_PER_MINUTE))
    }

    pub fn with_quota(quota: Quota) -> Self {
        Self {
            limiter: RateLimiter::direct(quota),
            search_cache: TtlCache::new(SEARCH_CACHE_TTL, SEARCH_CACHE_CAPACITY),
            fetch_cache: TtlCache::new(FETCH_CACHE_TTL, FETCH_CACHE_CAPACITY),
        }
    }

    /// Take one outbound request from the shared budget, without waiting.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl Default for WebShared {
    fn default() -> Self {
        Self::new()
    }
}

fn rate_limited() -> ToolOutput {
    ToolOutput::Error(format!(
        "Too many web requests, try again shortly (limit: {} per minute)",
        RATE_LIMIT_PER_MINUTE
    ))
}

// ============================================================================
// WebSearchTool
// ============================================================================

#[derive(Debug, Deserialize)]
struct SearxngResponse {
    #[serde(default)]
    results: Vec<SearxngResult>,
}

#[derive(Debug, Deserialize)]
struct SearxngResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    engine: Option<String>,
    #[serde(default)]
    engines: Vec<String>,
}

pub struct WebSearchTool {
    shared: Arc<WebShared>,
    searxng_url: String,
    searxng_auth: Option<String>,
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(shared: Arc<WebShared>, searxng_url: &str, searxng_auth: Option<String>) -> Self {
        Self {
            shared,
            searxng_url: searxng_url.trim_end_matches('/').to_string(),
            searxng_auth,
            client: build_http_client_with_timeout(Some(SEARCH_TIMEOUT)),
        }
    }

    async fn search(&self, query: &str, time_range: Option<&str>) -> Result<String> {
        let mut params = vec![
            ("q", query.to_string()),
            ("format", "json".to_string()),
            ("language", SEARCH_LANGUAGE.to_string()),
        ];
        if let Some(range) = time_range {
            params.push(("time_range", range.to_string()));
        }

        let mut request = self
            .client
            .get(format!("{}/search", self.searxng_url))
            .query(&params);
        if let Some(auth) = self.searxng_auth.as_deref() {
            let (user, pass) = auth.split_once(':').unwrap_or((auth, ""));
            request = request.basic_auth(user, Some(pass));
        }

        let response = request.send().await.context("SearXNG request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("SearXNG returned {}", status);
        }
        let body: SearxngResponse = response
            .json()
            .await
            .context("SearXNG returned malformed JSON")?;

        if body.results.is_empty() {
            return Ok("No results found.".to_string());
        }

        Ok(body
            .results
            .iter()
            .take(SEARCH_MAX_RESULTS)
            .enumerate()
            .map(|(i, r)| {
                let engines = if !r.engines.is_empty() {
                    r.engines.join(", ")
                } else {
                    r.engine.clone().unwrap_or_else(|| "unknown".to_string())
                };
                let summary = if r.content.trim().is_empty() {
                    "(no summary)"
                } else {
                    r.content.trim()
                };
                format!(
                    "{}. {}\n   {}\n   {} [source: {}]",
                    i + 1,
                    r.title,
                    summary,
                    r.url,
                    engines
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the internet for current information: news, people, events, weather, technical \
         questions. For \"today\" or \"recently\" set time_range to day or week. Use specific \
         keywords with concrete dates. Several results are returned; weigh how recent they are."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search keywords"
                },
                "time_range": {
                    "type": "string",
                    "enum": ["day", "week", "month", "year"],
                    "description": "Optional recency filter"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let query = match required_str(&params, "query") {
            Ok(q) if !q.trim().is_empty() => q.trim(),
            Ok(_) => return Ok(ToolOutput::Error("Empty search query".to_string())),
            Err(output) => return Ok(output),
        };
        let time_range = params
            .get("time_range")
            .and_then(Value::as_str)
            .filter(|r| matches!(*r, "day" | "week" | "month" | "year"));

        let cache_key = match time_range {
            Some(range) => format!("{}__tr:{}", query, range),
            None => query.to_string(),
        };
        if let Some(hit) = self.shared.search_cache.get(&cache_key) {
            tracing::debug!(group_id = %ctx.group_id, query, "web_search cache hit");
            return Ok(ToolOutput::Text(hit));
        }

        if !self.shared.try_acquire() {
            return Ok(rate_limited());
        }

        tracing::info!(group_id = %ctx.group_id, query, ?time_range, "web_search executing");
        match self.search(query, time_range).await {
            Ok(text) => {
                self.shared.search_cache.insert(cache_key, text.clone());
                Ok(ToolOutput::Text(text))
            }
            Err(e) => {
                tracing::warn!(group_id = %ctx.group_id, query, "web_search failed: {:#}", e);
                Ok(ToolOutput::Error(format!("Search failed: {:#}", e)))
            }
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Network
    }
}

// ============================================================================
// WebFetchTool
// ============================================================================

pub struct WebFetchTool {
    shared: Arc<WebShared>,
    client: reqwest::Client,
    allow_private_hosts: bool,
}

impl WebFetchTool {
    pub fn new(shared: Arc<WebShared>) -> Self {
        Self {
            shared,
            client: build_http_client_with_timeout(Some(FETCH_TIMEOUT)),
            allow_private_hosts: false,
        }
    }

    #[cfg(test)]
    fn allowing_private_hosts(mut self) -> Self {
        self.allow_private_hosts = true;
        self
    }

    async fn fetch(&self, url: &Url, selector: Option<&str>) -> Result<ToolOutput> {
        let mut response = match self.client.get(url.clone()).send().await {
            Ok(resp) => resp,
            Err(e) => return Ok(ToolOutput::Error(format!("Fetch failed: {}", e))),
        };

        let status = response.status();
        if status.as_u16() >= 400 {
            return Ok(ToolOutput::Error(format!(
                "Request failed: HTTP {}",
                status.as_u16()
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed reading response body")?
        {
            let room = FETCH_MAX_BODY_BYTES.saturating_sub(body.len());
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= FETCH_MAX_BODY_BYTES {
                break;
            }
        }
        let raw = String::from_utf8_lossy(&body).to_string();

        let text = if content_type.contains("application/json") {
            serde_json::from_str::<Value>(&raw)
                .ok()
                .and_then(|v| serde_json::to_string_pretty(&v).ok())
                .unwrap_or(raw)
        } else if content_type.contains("text/html") || content_type.contains("application/xhtml") {
            extract_html_text(&raw, selector)
        } else {
            raw
        };

        if text.trim().is_empty() {
            return Ok(ToolOutput::Text(
                "The page is empty or no readable text could be extracted.".to_string(),
            ));
        }
        Ok(ToolOutput::Text(truncate_text(&text)))
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch the text of a URL: links people share, documentation pages, API responses. \
         HTML is reduced to its main content (optionally a CSS selector), JSON is pretty-printed, \
         plain text is returned as-is. At most 500KB of text."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "http:// or https:// URL"
                },
                "selector": {
                    "type": "string",
                    "description": "Optional CSS selector, e.g. \"article\" or \"#main-content\""
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let url_input = match required_str(&params, "url") {
            Ok(u) => u.trim(),
            Err(output) => return Ok(output),
        };
        let selector = params
            .get("selector")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let url = match Url::parse(url_input) {
            Ok(url) => url,
            Err(_) => return Ok(ToolOutput::Error(format!("Invalid URL: {}", url_input))),
        };
        if !matches!(url.scheme(), "http" | "https") {
            return Ok(ToolOutput::Error(format!(
                "Unsupported scheme '{}', only http and https",
                url.scheme()
            )));
        }
        if !self.allow_private_hosts {
            if let Err(reason) = validate_destination(&url).await {
                return Ok(ToolOutput::Error(reason));
            }
        }

        let cache_key = format!("{}#sel:{}", url, selector.unwrap_or(""));
        if let Some(hit) = self.shared.fetch_cache.get(&cache_key) {
            tracing::debug!(group_id = %ctx.group_id, url = %url, "web_fetch cache hit");
            return Ok(ToolOutput::Text(hit));
        }

        if !self.shared.try_acquire() {
            return Ok(rate_limited());
        }

        tracing::info!(group_id = %ctx.group_id, url = %url, ?selector, "web_fetch executing");
        let output = self.fetch(&url, selector).await?;
        if let ToolOutput::Text(text) = &output {
            self.shared.fetch_cache.insert(cache_key, text.clone());
        }
        Ok(output)
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Network
    }
}

async fn validate_destination(url: &Url) -> std::result::Result<(), String> {
    let host = url
        .host_str()
        .ok_or_else(|| "URL is missing a host".to_string())?;
    let host_lower = host.to_ascii_lowercase();
    if host_lower == "localhost"
        || host_lower.ends_with(".localhost")
        || host_lower.ends_with(".local")
    {
        return Err(format!("Blocked local/private host '{}'", host));
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_private_or_local_ip(ip) {
            return Err(format!("Blocked private/local IP destination '{}'", host));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(80);
    match tokio::net::lookup_host((host, port)).await {
        Ok(resolved) => {
            for addr in resolved {
                if is_private_or_local_ip(addr.ip()) {
                    return Err(format!(
                        "Blocked destination '{}' resolved to private/local address {}",
                        host,
                        addr.ip()
                    ));
                }
            }
            Ok(())
        }
        Err(e) => Err(format!("Could not resolve host '{}': {}", host, e)),
    }
}

fn is_private_or_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
                || v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

// ============================================================================
// HTML extraction
// ============================================================================

const NOISE_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "iframe", "noscript", "svg",
];

const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "main",
    "[role='main']",
    ".post-content",
    ".article-content",
    ".entry-content",
    "#content",
    ".content",
];

const MIN_MAIN_CONTENT_CHARS: usize = 100;

fn is_noise(element: &Element) -> bool {
    NOISE_TAGS.contains(&element.name())
        || matches!(element.attr("role"), Some("navigation") | Some("banner"))
        || element.attr("aria-hidden") == Some("true")
}

/// Text under `root` with noise subtrees dropped and whitespace collapsed.
fn visible_text(root: ElementRef<'_>) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .take_while(|a| a.id() != root.id())
            .any(|a| a.value().as_element().map_or(false, is_noise));
        if !hidden {
            parts.push(&**text);
        }
    }
    parts.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn main_content(document: &Html) -> String {
    for raw in CONTENT_SELECTORS {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            let text = visible_text(element);
            if text.chars().count() > MIN_MAIN_CONTENT_CHARS {
                return text;
            }
        }
    }
    if let Ok(body) = Selector::parse("body") {
        if let Some(element) = document.select(&body).next() {
            return visible_text(element);
        }
    }
    visible_text(document.root_element())
}

pub fn extract_html_text(html: &str, selector: Option<&str>) -> String {
    let document = Html::parse_document(html);
    let Some(raw) = selector else {
        return main_content(&document);
    };

    match Selector::parse(raw) {
        Ok(selector) => {
            let matched: Vec<String> = document
                .select(&selector)
                .map(visible_text)
                .filter(|t| !t.is_empty())
                .collect();
            if !matched.is_empty() {
                return matched.join(" ");
            }
        }
        Err(e) => tracing::debug!("Invalid CSS selector {:?}: {:?}", raw, e),
    }
    format!(
        "No element matches selector \"{}\". Main page content:\n\n{}",
        raw,
        main_content(&document)
    )
}

fn truncate_text(text: &str) -> String {
    if text.chars().count() <= FETCH_MAX_TEXT_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(FETCH_MAX_TEXT_CHARS).collect();
    format!("{}\n\n[content truncated, the page is too long]", head)
}
