//! Agentic tool-calling loop behind the response agent.
//!
//! 1. Build context (system prompt + flattened group conversation + tool definitions)
//! 2. Call the LLM with function-calling format, streaming when enabled
//! 3. If the LLM returns tool calls, execute them and feed results back
//! 4. Loop until the LLM returns plain text or the iteration limit is reached
//!
//! Visible text and tool activity are reported as `AgentStreamEvent`s on a
//! flume channel while the loop runs. `<think>` blocks never leave this module.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::safety;
use super::{ToolCall, ToolContext, ToolDef, ToolOutput, ToolRegistry};
use crate::agent::{ConversationModel, ConversationRequest};
use crate::config::BackendConfig;
use crate::http_client::build_http_client;

const THINK_TAGS: &[(&str, &str)] = &[("<thinking>", "</thinking>"), ("<think>", "</think>")];
const SEGMENT_SEPARATOR: &str = "\n\n";

/// Incremental output of one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentStreamEvent {
    TextDelta(String),
    ToolStart { name: String },
    ToolEnd { name: String, success: bool },
}

#[derive(Debug, Clone)]
pub struct AgenticConfig {
    pub max_iterations: usize,
    pub api_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Use SSE streaming, falling back to a plain request if it fails early.
    pub streaming: bool,
}

impl Default for AgenticConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            api_url: "https://api.deepseek.com/v1".to_string(),
            model: "deepseek-chat".to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 4096,
            streaming: true,
        }
    }
}

impl AgenticConfig {
    pub fn from_backend(config: &BackendConfig) -> Self {
        Self {
            max_iterations: config.agent_max_iterations.max(1),
            api_url: config.llm_api_url.trim_end_matches('/').to_string(),
            model: config.llm_model.clone(),
            api_key: config
                .llm_api_key
                .clone()
                .filter(|key| !key.trim().is_empty()),
            streaming: config.enable_streaming,
            ..Self::default()
        }
    }
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<LlmToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn tool_result(tool_call_id: &str, content: String) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }
}

/// Tool call as returned by the LLM (OpenAI format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: LlmFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmFunctionCall {
    pub name: String,
    pub arguments: String, // JSON string
}

#[derive(Debug, Clone)]
pub struct AgenticResult {
    /// Visible reply text, think blocks removed. May be empty.
    pub response: String,
    pub tool_calls_made: Vec<ToolCallRecord>,
    pub iterations: usize,
    pub hit_limit: bool,
}

#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub output: ToolOutput,
}

/// Tracks what part of a growing completion is safe to show.
#[derive(Debug, Default)]
struct VisibleStream {
    raw: String,
    sent: usize,
}

impl VisibleStream {
    /// Append raw model output; returns newly visible text, if any.
    fn push(&mut self, delta: &str) -> Option<String> {
        self.raw.push_str(delta);
        let visible = visible_prefix(&self.raw);
        if visible.len() <= self.sent {
            return None;
        }
        let fresh = visible[self.sent..].to_string();
        self.sent = visible.len();
        Some(fresh)
    }

    fn has_emitted(&self) -> bool {
        self.sent > 0
    }
}

/// Collects visible text across loop iterations and mirrors it onto the channel.
struct ReplyStream<'a> {
    events: &'a flume::Sender<AgentStreamEvent>,
    segments: Vec<String>,
    current: VisibleStream,
}

impl<'a> ReplyStream<'a> {
    fn new(events: &'a flume::Sender<AgentStreamEvent>) -> Self {
        Self {
            events,
            segments: Vec::new(),
            current: VisibleStream::default(),
        }
    }

    fn push(&mut self, delta: &str) {
        let had_emitted = self.current.has_emitted();
        if let Some(mut fresh) = self.current.push(delta) {
            if !had_emitted && !self.segments.is_empty() {
                fresh.insert_str(0, SEGMENT_SEPARATOR);
            }
            self.emit(AgentStreamEvent::TextDelta(fresh));
        }
    }

    fn emit(&self, event: AgentStreamEvent) {
        // The consumer may have stopped listening; the run still completes.
        let _ = self.events.send(event);
    }

    /// Close the current completion, keeping its visible text.
    fn finish_segment(&mut self, content: Option<&str>) {
        let (visible, thoughts) = split_visible_and_thinking(content.unwrap_or_default());
        if !thoughts.is_empty() {
            tracing::debug!("Dropped {} private reasoning block(s)", thoughts.len());
        }
        if !visible.is_empty() {
            self.segments.push(visible);
        }
        self.current = VisibleStream::default();
    }

    fn text(&self) -> String {
        self.segments.join(SEGMENT_SEPARATOR)
    }
}

pub struct AgenticLoop {
    config: AgenticConfig,
    client: reqwest::Client,
}

impl AgenticLoop {
    pub fn new(config: AgenticConfig) -> Self {
        Self {
            config,
            client: build_http_client(),
        }
    }

    pub fn config(&self) -> &AgenticConfig {
        &self.config
    }

    /// Run the loop to completion. Tool definitions are re-read from the
    /// registry every iteration so tools registered mid-run become callable.
    pub async fn run(
        &self,
        system_prompt: &str,
        user_message: &str,
        registry: &ToolRegistry,
        tool_ctx: &ToolContext,
        events: &flume::Sender<AgentStreamEvent>,
    ) -> Result<AgenticResult> {
        let mut messages = vec![
            Message::text("system", system_prompt),
            Message::text("user", user_message),
        ];
        let mut reply = ReplyStream::new(events);
        let mut tool_calls_made = Vec::new();
        let mut iterations = 0;

        loop {
            if iterations >= self.config.max_iterations {
                tracing::warn!(
                    group_id = %tool_ctx.group_id,
                    "Agentic loop hit iteration limit ({})",
                    self.config.max_iterations
                );
                return Ok(AgenticResult {
                    response: reply.text(),
                    tool_calls_made,
                    iterations,
                    hit_limit: true,
                });
            }
            iterations += 1;

            let tool_defs = registry.tool_definitions().await;
            tracing::debug!(
                group_id = %tool_ctx.group_id,
                tools = tool_defs.len(),
                "Agentic loop iteration {}",
                iterations
            );
            let llm_response = self
                .call_llm(&messages, &tool_defs, &mut reply)
                .await
                .context("LLM call failed in agentic loop")?;
            reply.finish_segment(llm_response.content.as_deref());

            let tool_calls = match llm_response.tool_calls.clone() {
                Some(calls) if !calls.is_empty() => calls,
                _ => {
                    tracing::debug!("Agentic loop completed in {} iteration(s)", iterations);
                    return Ok(AgenticResult {
                        response: reply.text(),
                        tool_calls_made,
                        iterations,
                        hit_limit: false,
                    });
                }
            };

            tracing::debug!("LLM requested {} tool call(s)", tool_calls.len());
            messages.push(llm_response);

            for tc in &tool_calls {
                let record = self.execute_tool_call(tc, registry, tool_ctx, &reply).await;
                let content = safe_tool_output(&record);
                tool_calls_made.push(record);
                messages.push(Message::tool_result(&tc.id, content));
            }
        }
    }

    async fn execute_tool_call(
        &self,
        tc: &LlmToolCall,
        registry: &ToolRegistry,
        tool_ctx: &ToolContext,
        reply: &ReplyStream<'_>,
    ) -> ToolCallRecord {
        let name = tc.function.name.clone();
        let arguments: serde_json::Value = serde_json::from_str(&tc.function.arguments)
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to parse arguments for {} as JSON: {}", name, e);
                serde_json::json!({})
            });

        reply.emit(AgentStreamEvent::ToolStart { name: name.clone() });

        let output = match safety::validate_input(&arguments) {
            safety::SafetyVerdict::Block(reason) => {
                ToolOutput::Error(format!("Input validation failed: {}", reason))
            }
            safety::SafetyVerdict::Allow => {
                let call = ToolCall {
                    name: name.clone(),
                    arguments: arguments.clone(),
                };
                registry.execute_call(&call, tool_ctx).await.output
            }
        };

        tracing::info!(
            group_id = %tool_ctx.group_id,
            tool = %name,
            success = output.is_success(),
            "Tool call finished"
        );
        reply.emit(AgentStreamEvent::ToolEnd {
            name: name.clone(),
            success: output.is_success(),
        });

        ToolCallRecord {
            tool_name: name,
            arguments,
            output,
        }
    }

    async fn call_llm(
        &self,
        messages: &[Message],
        tool_defs: &[ToolDef],
        reply: &mut ReplyStream<'_>,
    ) -> Result<Message> {
        if self.config.streaming {
            match self.call_llm_streaming(messages, tool_defs, reply).await {
                Ok(message) => return Ok(message),
                Err(e) if !reply.current.has_emitted() => {
                    tracing::warn!(
                        "Streaming LLM call failed, falling back to non-streaming: {:#}",
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let message = self.call_llm_non_streaming(messages, tool_defs).await?;
        if let Some(content) = message.content.as_deref() {
            reply.push(content);
        }
        Ok(message)
    }

    fn request_body(
        &self,
        messages: &[Message],
        tool_defs: &[ToolDef],
        stream: bool,
    ) -> Result<serde_json::Value> {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });
        if stream {
            body["stream"] = serde_json::Value::Bool(true);
        }
        if !tool_defs.is_empty() {
            body["tools"] = serde_json::to_value(tool_defs)?;
        }
        Ok(body)
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.config.api_url);
        let mut req = self.client.post(&url).json(body);
        if let Some(ref key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error {}: {}", status, body);
        }
        Ok(response)
    }

    async fn call_llm_non_streaming(
        &self,
        messages: &[Message],
        tool_defs: &[ToolDef],
    ) -> Result<Message> {
        let body = self.request_body(messages, tool_defs, false)?;
        let response_json: serde_json::Value = self
            .send(&body)
            .await?
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let choice = response_json["choices"]
            .as_array()
            .and_then(|arr| arr.first())
            .context("Empty choices in LLM response")?;
        let message = &choice["message"];

        let content = message["content"].as_str().map(String::from);
        let tool_calls: Option<Vec<LlmToolCall>> = message
            .get("tool_calls")
            .and_then(|tc| serde_json::from_value(tc.clone()).ok());

        Ok(Message {
            role: "assistant".to_string(),
            content,
            tool_calls,
            tool_call_id: None,
        })
    }

    async fn call_llm_streaming(
        &self,
        messages: &[Message],
        tool_defs: &[ToolDef],
        reply: &mut ReplyStream<'_>,
    ) -> Result<Message> {
        #[derive(Debug, Clone, Default)]
        struct ToolCallAccumulator {
            id: String,
            call_type: String,
            name: String,
            arguments: String,
        }

        let body = self.request_body(messages, tool_defs, true)?;
        let mut response = self.send(&body).await?;

        let mut content = String::new();
        let mut tool_calls: Vec<ToolCallAccumulator> = Vec::new();
        let mut line_buffer: Vec<u8> = Vec::new();
        let mut saw_done = false;

        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed reading streaming chunk")?
        {
            line_buffer.extend_from_slice(&chunk);

            while let Some(line) = take_line(&mut line_buffer) {
                if line.is_empty() || line.starts_with(':') || !line.starts_with("data:") {
                    continue;
                }

                let payload = line[5..].trim();
                if payload == "[DONE]" {
                    saw_done = true;
                    break;
                }

                let chunk_json: serde_json::Value = serde_json::from_str(payload)
                    .with_context(|| format!("Failed to parse stream payload: {}", payload))?;

                let Some(choice) = chunk_json["choices"].as_array().and_then(|arr| arr.first())
                else {
                    continue;
                };

                if let Some(delta_content) = choice["delta"]["content"].as_str() {
                    content.push_str(delta_content);
                    reply.push(delta_content);
                }

                if let Some(tc_deltas) = choice["delta"]["tool_calls"].as_array() {
                    for tc_delta in tc_deltas {
                        let idx = tc_delta
                            .get("index")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(tool_calls.len() as u64)
                            as usize;

                        while tool_calls.len() <= idx {
                            tool_calls.push(ToolCallAccumulator::default());
                        }
                        let acc = &mut tool_calls[idx];

                        if let Some(id) = tc_delta.get("id").and_then(|v| v.as_str()) {
                            acc.id = id.to_string();
                        }
                        if let Some(call_type) = tc_delta.get("type").and_then(|v| v.as_str()) {
                            acc.call_type = call_type.to_string();
                        }
                        let function = tc_delta.get("function");
                        if let Some(name_part) = function
                            .and_then(|f| f.get("name"))
                            .and_then(|v| v.as_str())
                        {
                            acc.name.push_str(name_part);
                        }
                        if let Some(args_part) = function
                            .and_then(|f| f.get("arguments"))
                            .and_then(|v| v.as_str())
                        {
                            acc.arguments.push_str(args_part);
                        }
                    }
                }
            }

            if saw_done {
                break;
            }
        }

        let parsed_tool_calls = tool_calls
            .into_iter()
            .enumerate()
            .filter_map(|(idx, tc)| {
                let name = tc.name.trim().to_string();
                if name.is_empty() {
                    return None;
                }
                Some(LlmToolCall {
                    id: if tc.id.trim().is_empty() {
                        format!("stream_tool_call_{}", idx)
                    } else {
                        tc.id
                    },
                    call_type: if tc.call_type.trim().is_empty() {
                        "function".to_string()
                    } else {
                        tc.call_type
                    },
                    function: LlmFunctionCall {
                        name,
                        arguments: if tc.arguments.trim().is_empty() {
                            "{}".to_string()
                        } else {
                            tc.arguments
                        },
                    },
                })
            })
            .collect::<Vec<_>>();

        Ok(Message {
            role: "assistant".to_string(),
            content: (!content.is_empty()).then_some(content),
            tool_calls: (!parsed_tool_calls.is_empty()).then_some(parsed_tool_calls),
            tool_call_id: None,
        })
    }
}

#[async_trait]
impl ConversationModel for AgenticLoop {
    async fn converse(
        &self,
        request: &ConversationRequest,
        registry: &ToolRegistry,
        events: flume::Sender<AgentStreamEvent>,
    ) -> Result<String> {
        let result = self
            .run(
                &request.system_prompt,
                &request.prompt,
                registry,
                &request.tool_ctx,
                &events,
            )
            .await?;
        tracing::debug!(
            group_id = %request.tool_ctx.group_id,
            iterations = result.iterations,
            tool_calls = result.tool_calls_made.len(),
            hit_limit = result.hit_limit,
            "Agent run finished"
        );
        Ok(result.response)
    }
}

/// Text fed back to the model for one tool call, after the leak check.
fn safe_tool_output(record: &ToolCallRecord) -> String {
    let text = match &record.output {
        ToolOutput::Text(text) => text.clone(),
        ToolOutput::Json(val) => {
            serde_json::to_string_pretty(val).unwrap_or_else(|_| val.to_string())
        }
        other => return other.to_llm_string(),
    };
    match safety::check_output(&record.tool_name, &text) {
        Ok(sanitized) => sanitized,
        Err(reason) => format!("[BLOCKED] {}", reason),
    }
}

/// Visible part of a possibly incomplete completion: closed think blocks
/// removed, everything after an unclosed one hidden, and a trailing partial
/// opening tag held back until it resolves.
fn visible_prefix(raw: &str) -> String {
    let mut out = String::new();
    let mut rest = raw;
    loop {
        let next_tag = THINK_TAGS
            .iter()
            .filter_map(|(open, close)| rest.find(open).map(|pos| (pos, *open, *close)))
            .min_by_key(|(pos, _, _)| *pos);
        match next_tag {
            Some((start, open, close)) => {
                out.push_str(&rest[..start]);
                let inner = &rest[start + open.len()..];
                match inner.find(close) {
                    Some(end) => rest = &inner[end + close.len()..],
                    None => break,
                }
            }
            None => {
                out.push_str(without_partial_tag(rest));
                break;
            }
        }
    }
    out.trim_start().to_string()
}

fn without_partial_tag(text: &str) -> &str {
    if let Some(pos) = text.rfind('<') {
        let tail = &text[pos..];
        let partial = THINK_TAGS
            .iter()
            .any(|(open, _)| open.len() > tail.len() && open.starts_with(tail));
        if partial {
            return &text[..pos];
        }
    }
    text
}

fn split_visible_and_thinking(input: &str) -> (String, Vec<String>) {
    fn extract_tag(text: String, open_tag: &str, close_tag: &str) -> (String, Vec<String>) {
        let mut rest = text;
        let mut thoughts = Vec::new();

        while let Some(start) = rest.find(open_tag) {
            let content_start = start + open_tag.len();
            if let Some(rel_end) = rest[content_start..].find(close_tag) {
                let end = content_start + rel_end;
                let thought = rest[content_start..end].trim();
                if !thought.is_empty() {
                    thoughts.push(thought.to_string());
                }
                let remove_end = end + close_tag.len();
                rest.replace_range(start..remove_end, "");
            } else {
                let thought = rest[content_start..].trim();
                if !thought.is_empty() {
                    thoughts.push(thought.to_string());
                }
                rest.replace_range(start..rest.len(), "");
            }
        }

        (rest, thoughts)
    }

    let mut text = input.to_string();
    let mut thoughts = Vec::new();
    for (open, close) in THINK_TAGS {
        let (remaining, mut found) = extract_tag(text, open, close);
        text = remaining;
        thoughts.append(&mut found);
    }

    (text.trim().to_string(), thoughts)
}

/// Pop one complete line off the front of `buffer`, trimmed. Bytes after the
/// last newline stay buffered so a character split across network chunks is
/// decoded only once it is whole.
fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    let newline_idx = buffer.iter().position(|b| *b == b'\n')?;
    let raw: Vec<u8> = buffer.drain(..=newline_idx).collect();
    Some(String::from_utf8_lossy(&raw).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_stub_server;
    use crate::tools::{Tool, ToolCategory};
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Arc;

    struct DiceTool;

    #[async_trait]
    impl Tool for DiceTool {
        fn name(&self) -> &str {
            "roll_dice"
        }
        fn description(&self) -> &str {
            "Roll a die"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"sides": {"type": "integer"}}})
        }
        async fn execute(
            &self,
            params: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput> {
            let sides = params["sides"].as_u64().unwrap_or(6);
            Ok(ToolOutput::Text(format!("rolled {} on a d{}", sides, sides)))
        }
        fn category(&self) -> ToolCategory {
            ToolCategory::General
        }
    }

    fn sse(chunks: &[serde_json::Value]) -> String {
        let mut body = String::new();
        for chunk in chunks {
            body.push_str(&format!("data: {}\n\n", chunk));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn has_tool_result(body: &serde_json::Value) -> bool {
        body["messages"]
            .as_array()
            .map(|msgs| msgs.iter().any(|m| m["role"] == "tool"))
            .unwrap_or(false)
    }

    async fn streaming_stub() -> String {
        let app = Router::new().route(
            "/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["stream"], true);
                let chunks = if has_tool_result(&body) {
                    let tool_msg = body["messages"]
                        .as_array()
                        .and_then(|m| m.iter().find(|m| m["role"] == "tool"))
                        .cloned()
                        .unwrap_or_default();
                    assert_eq!(tool_msg["tool_call_id"], "call_1");
                    assert!(tool_msg["content"]
                        .as_str()
                        .unwrap_or_default()
                        .contains("rolled 20 on a d20"));
                    vec![
                        serde_json::json!({"choices": [{"delta": {"content": "<thi"}}]}),
                        serde_json::json!({"choices": [{"delta": {"content": "nk>it was 20</think>"}}]}),
                        serde_json::json!({"choices": [{"delta": {"content": "You rolled "}}]}),
                        serde_json::json!({"choices": [{"delta": {"content": "a 20!"}}]}),
                    ]
                } else {
                    assert!(body["tools"][0]["function"]["name"] == "roll_dice");
                    vec![
                        serde_json::json!({"choices": [{"delta": {"tool_calls": [
                            {"index": 0, "id": "call_1", "type": "function",
                             "function": {"name": "roll_dice", "arguments": "{\"sid"}}
                        ]}}]}),
                        serde_json::json!({"choices": [{"delta": {"tool_calls": [
                            {"index": 0, "function": {"arguments": "es\": 20}"}}
                        ]}}]}),
                    ]
                };
                ([(header::CONTENT_TYPE, "text/event-stream")], sse(&chunks)).into_response()
            }),
        );
        spawn_stub_server(app).await
    }

    fn config_for(base: String, streaming: bool) -> AgenticConfig {
        AgenticConfig {
            api_url: base,
            api_key: Some("sk-test".to_string()),
            streaming,
            ..AgenticConfig::default()
        }
    }

    async fn dice_registry() -> ToolRegistry {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(DiceTool)).await;
        registry
    }

    #[tokio::test]
    async fn streams_tool_events_then_visible_text() {
        let base = streaming_stub().await;
        let agent = AgenticLoop::new(config_for(base, true));
        let registry = dice_registry().await;
        let ctx = ToolContext::new("g1", std::env::temp_dir());
        let (tx, rx) = flume::unbounded();

        let result = agent
            .run("system", "roll a d20", &registry, &ctx, &tx)
            .await
            .expect("agent run");
        drop(tx);

        assert_eq!(result.response, "You rolled a 20!");
        assert_eq!(result.iterations, 2);
        assert_eq!(result.tool_calls_made.len(), 1);
        assert_eq!(result.tool_calls_made[0].arguments["sides"], 20);

        let events: Vec<AgentStreamEvent> = rx.drain().collect();
        assert_eq!(
            events,
            vec![
                AgentStreamEvent::ToolStart {
                    name: "roll_dice".into()
                },
                AgentStreamEvent::ToolEnd {
                    name: "roll_dice".into(),
                    success: true
                },
                AgentStreamEvent::TextDelta("You rolled ".into()),
                AgentStreamEvent::TextDelta("a 20!".into()),
            ]
        );
    }

    #[tokio::test]
    async fn non_streaming_mode_returns_plain_completion() {
        let app = Router::new().route(
            "/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert!(body.get("stream").is_none());
                assert!(body.get("tools").is_none());
                Json(serde_json::json!({
                    "choices": [{"message": {"role": "assistant",
                        "content": "<think>short</think>Morning, everyone."}}]
                }))
            }),
        );
        let base = spawn_stub_server(app).await;
        let agent = AgenticLoop::new(config_for(base, false));
        let (tx, rx) = flume::unbounded();

        let result = agent
            .run(
                "system",
                "hi",
                &ToolRegistry::new(),
                &ToolContext::new("g1", std::env::temp_dir()),
                &tx,
            )
            .await
            .expect("agent run");
        assert_eq!(result.response, "Morning, everyone.");
        assert_eq!(
            rx.try_recv().ok(),
            Some(AgentStreamEvent::TextDelta("Morning, everyone.".into()))
        );
    }

    #[tokio::test]
    async fn iteration_limit_stops_a_tool_happy_model() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                Json(serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": null,
                        "tool_calls": [{"id": "c", "type": "function",
                            "function": {"name": "roll_dice", "arguments": "{}"}}]}}]
                }))
            }),
        );
        let base = spawn_stub_server(app).await;
        let mut config = config_for(base, false);
        config.max_iterations = 3;
        let agent = AgenticLoop::new(config);
        let (tx, _rx) = flume::unbounded();

        let result = agent
            .run(
                "system",
                "roll forever",
                &dice_registry().await,
                &ToolContext::new("g1", std::env::temp_dir()),
                &tx,
            )
            .await
            .expect("agent run");
        assert!(result.hit_limit);
        assert_eq!(result.iterations, 3);
        assert_eq!(result.tool_calls_made.len(), 3);
        assert!(result.response.is_empty());
    }

    #[tokio::test]
    async fn api_errors_propagate() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async { (axum::http::StatusCode::UNAUTHORIZED, "bad key") }),
        );
        let base = spawn_stub_server(app).await;
        let agent = AgenticLoop::new(config_for(base, true));
        let (tx, _rx) = flume::unbounded();
        let err = agent
            .run(
                "system",
                "hi",
                &ToolRegistry::new(),
                &ToolContext::new("g1", std::env::temp_dir()),
                &tx,
            )
            .await
            .expect_err("401 should fail");
        assert!(format!("{:#}", err).contains("401"));
    }

    #[test]
    fn visible_stream_hides_think_blocks_across_chunk_boundaries() {
        let mut stream = VisibleStream::default();
        assert_eq!(stream.push("<th"), None);
        assert_eq!(stream.push("ink>plan"), None);
        assert_eq!(stream.push(" more</thi"), None);
        assert_eq!(stream.push("nk>\nHel"), Some("Hel".to_string()));
        assert_eq!(stream.push("lo <b>"), Some("lo <b>".to_string()));
        assert_eq!(stream.push(" <thinking>x"), Some(" ".to_string()));
        assert_eq!(stream.push("</thinking>bye"), Some("bye".to_string()));
    }

    #[test]
    fn visible_stream_releases_lookalike_tags() {
        let mut stream = VisibleStream::default();
        assert_eq!(stream.push("a <thi"), Some("a ".to_string()));
        assert_eq!(stream.push("s is fine"), Some("<this is fine".to_string()));
    }

    #[test]
    fn test_tool_call_message_serialization() {
        let msg = Message {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(vec![LlmToolCall {
                id: "call_123".to_string(),
                call_type: "function".to_string(),
                function: LlmFunctionCall {
                    name: "shell".to_string(),
                    arguments: r#"{"command": "ls"}"#.to_string(),
                },
            }]),
            tool_call_id: None,
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("content").is_none());
        assert_eq!(json["tool_calls"][0]["function"]["name"], "shell");
    }

    #[test]
    fn strips_both_think_tag_variants() {
        let (visible, thoughts) =
            split_visible_and_thinking("<thinking>plan</thinking>\n<think>detail</think>\nDone");
        assert_eq!(visible, "Done");
        assert_eq!(thoughts, vec!["plan", "detail"]);
    }

    #[test]
    fn leaked_secrets_are_withheld_from_the_model() {
        let record = ToolCallRecord {
            tool_name: "shell".into(),
            arguments: serde_json::json!({}),
            output: ToolOutput::Text("key=sk-abcdefghijklmnopqrstuvwxyz".into()),
        };
        assert!(safe_tool_output(&record).starts_with("[BLOCKED]"));

        let ok = ToolCallRecord {
            output: ToolOutput::Text("fine".into()),
            ..record
        };
        assert!(safe_tool_output(&ok).contains("<tool_output name=\"shell\">"));
    }

    #[test]
    fn lines_wait_for_split_multibyte_characters() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n";
        let bytes = line.as_bytes();
        let split = line.find("好").unwrap() + 1;

        let mut buffer = bytes[..split].to_vec();
        assert_eq!(take_line(&mut buffer), None);
        buffer.extend_from_slice(&bytes[split..]);
        let decoded = take_line(&mut buffer).unwrap();
        assert!(decoded.contains("你好"));
        assert!(!decoded.contains('\u{FFFD}'));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn cjk_split_across_chunks_is_streamed_intact() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                let body = sse(&[serde_json::json!({"choices": [{"delta": {"content": "你好"}}]})]);
                let split = body.find("好").unwrap() + 1;
                let (head, tail) = body.as_bytes().split_at(split);
                let frames = vec![
                    Ok::<_, std::convert::Infallible>(axum::body::Bytes::copy_from_slice(head)),
                    Ok(axum::body::Bytes::copy_from_slice(tail)),
                ];
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    axum::body::Body::from_stream(futures_util::stream::iter(frames)),
                )
                    .into_response()
            }),
        );
        let base = spawn_stub_server(app).await;
        let agent = AgenticLoop::new(config_for(base, true));
        let registry = ToolRegistry::new();
        let ctx = ToolContext::new("g1", std::env::temp_dir());
        let (tx, rx) = flume::unbounded();

        let result = agent
            .run("system", "say hi", &registry, &ctx, &tx)
            .await
            .expect("agent run");
        drop(tx);

        assert_eq!(result.response, "你好");
        let deltas: String = rx
            .drain()
            .filter_map(|event| match event {
                AgentStreamEvent::TextDelta(text) => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "你好");
    }
}
