use anyhow::{Context, Result};
use abao_backend::broadcast::{GroupEvent, GroupEventEnvelope, ToolPhase};
use abao_backend::database::{MessageDto, MessageType};
use flume::Sender;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header as ws_header;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn from_env() -> Self {
        let base = std::env::var("ABAO_BACKEND_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8787".to_string());
        let token = std::env::var("ABAO_BACKEND_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self::new(base, token)
    }

    pub fn new(base_url: String, token: Option<String>) -> Self {
        let normalized_base = normalize_base_url(&base_url);
        let ws_url = normalize_ws_url(&normalized_base);

        Self {
            http: reqwest::Client::new(),
            base_url: normalized_base,
            ws_url,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub async fn create_user(&self, nickname: &str) -> Result<String> {
        #[derive(Serialize)]
        struct CreateUserRequest<'a> {
            nickname: &'a str,
        }

        self.request(reqwest::Method::POST, "/v1/users")
            .json(&CreateUserRequest { nickname })
            .send()
            .await?
            .error_for_status()
            .context("POST /v1/users failed")?
            .json::<CreatedResponse>()
            .await
            .map(|created| created.id)
            .context("Failed to decode created user")
    }

    pub async fn create_group(&self, name: &str) -> Result<String> {
        #[derive(Serialize)]
        struct CreateGroupRequest<'a> {
            name: &'a str,
        }

        self.request(reqwest::Method::POST, "/v1/groups")
            .json(&CreateGroupRequest { name })
            .send()
            .await?
            .error_for_status()
            .context("POST /v1/groups failed")?
            .json::<CreatedResponse>()
            .await
            .map(|created| created.id)
            .context("Failed to decode created group")
    }

    pub async fn join_group(&self, group_id: &str, user_id: &str) -> Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct AddMemberRequest<'a> {
            user_id: &'a str,
        }

        self.request(
            reqwest::Method::POST,
            &format!("/v1/groups/{}/members", group_id),
        )
        .json(&AddMemberRequest { user_id })
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("POST /v1/groups/{}/members failed", group_id))?;
        Ok(())
    }

    pub async fn list_messages(&self, group_id: &str, limit: usize) -> Result<Vec<MessageDto>> {
        self.request(
            reqwest::Method::GET,
            &format!("/v1/groups/{}/messages", group_id),
        )
        .query(&[("limit", limit)])
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("GET /v1/groups/{}/messages failed", group_id))?
        .json::<Vec<MessageDto>>()
        .await
        .context("Failed to decode message history")
    }

    pub async fn send_message(
        &self,
        group_id: &str,
        sender_id: &str,
        content: &str,
        reply_to_id: Option<&str>,
    ) -> Result<MessageDto> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct SendMessageRequest<'a> {
            sender_id: &'a str,
            content: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            reply_to_id: Option<&'a str>,
        }

        self.request(
            reqwest::Method::POST,
            &format!("/v1/groups/{}/messages", group_id),
        )
        .json(&SendMessageRequest {
            sender_id,
            content,
            reply_to_id,
        })
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("POST /v1/groups/{}/messages failed", group_id))?
        .json::<MessageDto>()
        .await
        .context("Failed to decode sent message")
    }

    /// Follow the group's event stream, reconnecting until `tx` is dropped.
    pub async fn stream_group_events(self, group_id: String, tx: Sender<GroupEvent>) {
        loop {
            match self.stream_group_events_once(&group_id, &tx).await {
                Ok(()) => {
                    tracing::info!("Event stream disconnected; reconnecting in 2s");
                }
                Err(error) => {
                    tracing::warn!("Event stream failed: {:#}; reconnecting in 2s", error);
                }
            }
            if tx.is_disconnected() {
                break;
            }
            sleep(Duration::from_secs(2)).await;
        }
    }

    async fn stream_group_events_once(&self, group_id: &str, tx: &Sender<GroupEvent>) -> Result<()> {
        let ws_endpoint = format!("{}/v1/groups/{}/ws", self.ws_url, group_id);
        let mut request = ws_endpoint
            .into_client_request()
            .context("Invalid websocket endpoint URL")?;

        if let Some(token) = self.token.as_deref() {
            let value = WsHeaderValue::from_str(&format!("Bearer {}", token))
                .context("Invalid bearer token for websocket auth")?;
            request
                .headers_mut()
                .insert(ws_header::AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .context("Failed to connect websocket event stream")?;
        let (_write, mut read) = stream.split();

        while let Some(message) = read.next().await {
            let text = match message.context("Websocket read error")? {
                Message::Text(text) => text.to_string(),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            let envelope = parse_event_envelope(&text)?;
            if tx.send(envelope.event).is_err() {
                return Ok(());
            }
        }

        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

fn parse_event_envelope(text: &str) -> Result<GroupEventEnvelope> {
    serde_json::from_str(text).with_context(|| {
        format!(
            "Failed to decode group event. Payload preview: {}",
            text.chars().take(200).collect::<String>()
        )
    })
}

/// Turns group events into terminal output. A reply that was already shown
/// as a live stream is not printed a second time when it is persisted.
#[derive(Debug, Default)]
pub struct EventRenderer {
    streaming: Option<String>,
    streamed_reply_to: Option<String>,
}

impl EventRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text to write for `event`, without a trailing newline on deltas.
    pub fn render(&mut self, event: &GroupEvent) -> Option<String> {
        match event {
            GroupEvent::AiStreamStart {
                stream_id,
                reply_to_id,
            } => {
                self.streaming = Some(stream_id.clone());
                self.streamed_reply_to = Some(reply_to_id.clone());
                Some(format!("{} ", speaker_label(abao_backend::database::AI_DISPLAY_NAME)))
            }
            GroupEvent::AiStreamDelta { stream_id, delta } if self.is_current(stream_id) => {
                Some(delta.clone())
            }
            GroupEvent::AiStreamTool {
                stream_id,
                tool_name,
                phase,
            } if self.is_current(stream_id) => match phase {
                ToolPhase::Start => Some(format!("\n  [using {}...]\n", tool_name)),
                ToolPhase::End => None,
            },
            GroupEvent::AiStreamEnd { stream_id } if self.is_current(stream_id) => {
                self.streaming = None;
                Some("\n".to_string())
            }
            GroupEvent::NewMessage(message) => {
                if message.message_type == MessageType::Ai
                    && message.reply_to_id.is_some()
                    && message.reply_to_id == self.streamed_reply_to
                {
                    self.streamed_reply_to = None;
                    return None;
                }
                Some(format!("{}\n", format_message(message)))
            }
            _ => None,
        }
    }

    fn is_current(&self, stream_id: &str) -> bool {
        self.streaming.as_deref() == Some(stream_id)
    }
}

pub fn format_message(message: &MessageDto) -> String {
    let time = message.created_at.format("%H:%M");
    let mut line = format!("[{}] {} {}", time, speaker_label(&message.sender_name), message.content);
    if let Some(preview) = &message.reply_to_content {
        line.push_str(&format!("  (re: {})", preview));
    }
    line
}

fn speaker_label(name: &str) -> String {
    format!("{}:", name)
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "http://127.0.0.1:8787".to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_ws_url(base_http_url: &str) -> String {
    if let Some(rest) = base_http_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_http_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_http_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(message_type: MessageType, content: &str, reply_to: Option<&str>) -> MessageDto {
        MessageDto {
            id: "m2".into(),
            group_id: "g1".into(),
            sender_id: None,
            sender_name: "A宝".into(),
            content: content.into(),
            message_type,
            reply_to_id: reply_to.map(str::to_string),
            reply_to_content: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn normalizes_base_url() {
        assert_eq!(normalize_base_url("http://x:1/"), "http://x:1");
        assert_eq!(normalize_base_url(""), "http://127.0.0.1:8787");
    }

    #[test]
    fn maps_http_to_ws_url() {
        assert_eq!(
            normalize_ws_url("http://127.0.0.1:8787"),
            "ws://127.0.0.1:8787"
        );
        assert_eq!(normalize_ws_url("https://example.com"), "wss://example.com");
    }

    #[test]
    fn parses_backend_envelopes() {
        let text = r#"{
            "groupId": "g1",
            "emittedAt": "2026-02-18T06:17:38.096788Z",
            "event": {"type": "AI_STREAM_DELTA", "payload": {"streamId": "s1", "delta": "hi"}}
        }"#;
        let envelope = parse_event_envelope(text).unwrap();
        assert_eq!(envelope.group_id, "g1");
        assert_eq!(
            envelope.event,
            GroupEvent::AiStreamDelta {
                stream_id: "s1".into(),
                delta: "hi".into()
            }
        );
        assert!(parse_event_envelope("{not json").is_err());
    }

    #[test]
    fn streamed_reply_is_not_printed_twice() {
        let mut renderer = EventRenderer::new();
        let mut out = String::new();
        for event in [
            GroupEvent::AiStreamStart {
                stream_id: "s1".into(),
                reply_to_id: "m1".into(),
            },
            GroupEvent::AiStreamTool {
                stream_id: "s1".into(),
                tool_name: "web_search".into(),
                phase: ToolPhase::Start,
            },
            GroupEvent::AiStreamDelta {
                stream_id: "s1".into(),
                delta: "Check ".into(),
            },
            GroupEvent::AiStreamDelta {
                stream_id: "other".into(),
                delta: "ignored".into(),
            },
            GroupEvent::AiStreamDelta {
                stream_id: "s1".into(),
                delta: "the lockfile.".into(),
            },
            GroupEvent::AiStreamEnd {
                stream_id: "s1".into(),
            },
        ] {
            out.extend(renderer.render(&event));
        }
        assert_eq!(out, "A宝: \n  [using web_search...]\nCheck the lockfile.\n");

        let persisted = message(MessageType::Ai, "Check the lockfile.", Some("m1"));
        assert_eq!(renderer.render(&GroupEvent::NewMessage(persisted.clone())), None);
        assert!(renderer
            .render(&GroupEvent::NewMessage(persisted))
            .is_some());
    }

    #[test]
    fn human_messages_show_reply_preview() {
        let mut dto = message(MessageType::User, "same here", Some("m1"));
        dto.sender_name = "Bob".into();
        dto.reply_to_content = Some("my build fails".into());
        let line = format_message(&dto);
        assert!(line.ends_with("Bob: same here  (re: my build fails)"));
    }

    #[test]
    fn api_client_trims_trailing_slash() {
        let client = ApiClient::new("http://127.0.0.1:8787/".to_string(), None);
        assert_eq!(client.base_url(), "http://127.0.0.1:8787");
        assert!(!client.has_token());
    }
}
