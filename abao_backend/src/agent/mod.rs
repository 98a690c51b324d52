//! Full response agent (Layer 3).
//!
//! Given a triggering message, composes a reply through the per-group
//! conversational agent, streams it to subscribers, persists it as an AI
//! message and logs it to the session history. Every failure ends in the
//! fixed apology reply so the trigger is never left unanswered.

pub mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

pub use session::{AgentSession, SessionSettings};

use crate::broadcast::{Broadcaster, GroupEvent, ToolPhase};
use crate::config::BackendConfig;
use crate::context::{flatten_prompt, ContextAssembler};
use crate::database::{MessageRecord, MessageStore, NewMessage};
use crate::memory::{MemoryStore, SessionEntry};
use crate::persona::{PersonaPrompt, PromptContext};
use crate::tools::agentic::AgentStreamEvent;
use crate::tools::{ToolContext, ToolRegistry};

/// Delivered whenever the agent fails or has nothing to say.
pub const FALLBACK_REPLY: &str = "抱歉，我暂时无法回复，请稍后再试。";

#[derive(Debug, Clone)]
pub struct ConversationRequest {
    pub system_prompt: String,
    /// Flattened group conversation.
    pub prompt: String,
    pub tool_ctx: ToolContext,
}

/// Tool-using, streaming model behind Layer 3.
///
/// Implementations send incremental output on `events` and return the final
/// visible text. The channel closes when `events` and its clones are dropped.
#[async_trait]
pub trait ConversationModel: Send + Sync {
    async fn converse(
        &self,
        request: &ConversationRequest,
        registry: &ToolRegistry,
        events: flume::Sender<AgentStreamEvent>,
    ) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct ReplyOutcome {
    /// Text that was delivered, the fallback included.
    pub content: String,
    pub used_fallback: bool,
    /// `None` when even persisting the reply failed.
    pub message: Option<MessageRecord>,
}

pub struct ResponseAgent {
    store: Arc<dyn MessageStore>,
    memory: Arc<dyn MemoryStore>,
    broadcaster: Arc<dyn Broadcaster>,
    model: Arc<dyn ConversationModel>,
    persona: PersonaPrompt,
    context: ContextAssembler,
    streaming: bool,
    timeout: Duration,
}

impl ResponseAgent {
    pub fn new(
        store: Arc<dyn MessageStore>,
        memory: Arc<dyn MemoryStore>,
        broadcaster: Arc<dyn Broadcaster>,
        model: Arc<dyn ConversationModel>,
        config: &BackendConfig,
    ) -> Self {
        Self {
            context: ContextAssembler::new(store.clone(), config.context_time_tags),
            persona: PersonaPrompt::new(config.persona_path.as_ref().map(PathBuf::from)),
            streaming: config.enable_streaming,
            timeout: config.agent_timeout(),
            store,
            memory,
            broadcaster,
            model,
        }
    }

    /// Produce, persist and broadcast a reply to `trigger`. Never fails; the
    /// caller records that the AI spoke regardless of the outcome.
    pub async fn respond(&self, session: &AgentSession, trigger: &MessageRecord) -> ReplyOutcome {
        let group_id = trigger.group_id.as_str();
        let stream_id = self.streaming.then(|| uuid::Uuid::new_v4().to_string());
        if let Some(stream_id) = &stream_id {
            self.broadcaster.broadcast(
                group_id,
                GroupEvent::AiStreamStart {
                    stream_id: stream_id.clone(),
                    reply_to_id: trigger.id.clone(),
                },
            );
        }

        let generated = tokio::time::timeout(
            self.timeout,
            self.generate(session, trigger, stream_id.as_deref()),
        )
        .await;

        let (content, used_fallback) = match generated {
            Ok(Ok(text)) if !text.trim().is_empty() => (text, false),
            Ok(Ok(_)) => {
                tracing::warn!(group_id, message_id = %trigger.id, "Agent returned no visible text");
                (FALLBACK_REPLY.to_string(), true)
            }
            Ok(Err(error)) => {
                tracing::error!(
                    group_id,
                    message_id = %trigger.id,
                    "AI processing failed: {:#}",
                    error
                );
                (FALLBACK_REPLY.to_string(), true)
            }
            Err(_) => {
                tracing::error!(
                    group_id,
                    message_id = %trigger.id,
                    "AI processing timed out after {}s",
                    self.timeout.as_secs()
                );
                (FALLBACK_REPLY.to_string(), true)
            }
        };

        if let Some(stream_id) = stream_id {
            self.broadcaster
                .broadcast(group_id, GroupEvent::AiStreamEnd { stream_id });
        }

        let message = self.deliver(trigger, &content).await;
        ReplyOutcome {
            content,
            used_fallback,
            message,
        }
    }

    /// Apology path for failures before the agent could even start.
    pub async fn deliver_fallback(&self, trigger: &MessageRecord) -> ReplyOutcome {
        let message = self.deliver(trigger, FALLBACK_REPLY).await;
        ReplyOutcome {
            content: FALLBACK_REPLY.to_string(),
            used_fallback: true,
            message,
        }
    }

    async fn generate(
        &self,
        session: &AgentSession,
        trigger: &MessageRecord,
        stream_id: Option<&str>,
    ) -> Result<String> {
        let group_id = trigger.group_id.as_str();
        let now = Utc::now();

        let memories = self
            .memory
            .get_permanent_memories(group_id)
            .await
            .unwrap_or_else(|error| {
                tracing::warn!(group_id, "Permanent memory unavailable: {:#}", error);
                String::new()
            });
        let roster = self
            .context
            .build_group_roster(group_id, now)
            .await
            .unwrap_or_else(|error| {
                tracing::warn!(group_id, "Group roster unavailable: {:#}", error);
                String::new()
            });
        let skill_prompts = session.refresh().await;

        let system_prompt = self
            .persona
            .build_system_prompt(
                &PromptContext {
                    group_id,
                    permanent_memories: &memories,
                    group_roster: &roster,
                    skill_prompts: &skill_prompts,
                },
                now,
            )
            .await;

        let window = self.context.build_context_window(group_id, now).await?;
        let request = ConversationRequest {
            system_prompt,
            prompt: flatten_prompt(&window),
            tool_ctx: session.tool_ctx().clone(),
        };
        tracing::debug!(
            group_id,
            message_id = %trigger.id,
            context_messages = window.len(),
            "Invoking response agent"
        );

        let (tx, rx) = flume::unbounded();
        let run = self.model.converse(&request, session.registry(), tx);
        let relay = self.relay(group_id, stream_id, rx);
        let (result, ()) = tokio::join!(run, relay);
        result
    }

    /// Forward agent events to subscribers until the model drops its sender.
    async fn relay(
        &self,
        group_id: &str,
        stream_id: Option<&str>,
        events: flume::Receiver<AgentStreamEvent>,
    ) {
        while let Ok(event) = events.recv_async().await {
            if let AgentStreamEvent::ToolStart { name } = &event {
                tracing::info!(group_id, tool = %name, "Agent using tool");
            }
            let Some(stream_id) = stream_id else {
                continue;
            };
            let stream_id = stream_id.to_string();
            let group_event = match event {
                AgentStreamEvent::TextDelta(delta) => GroupEvent::AiStreamDelta { stream_id, delta },
                AgentStreamEvent::ToolStart { name } => GroupEvent::AiStreamTool {
                    stream_id,
                    tool_name: name,
                    phase: ToolPhase::Start,
                },
                AgentStreamEvent::ToolEnd { name, .. } => GroupEvent::AiStreamTool {
                    stream_id,
                    tool_name: name,
                    phase: ToolPhase::End,
                },
            };
            self.broadcaster.broadcast(group_id, group_event);
        }
    }

    async fn deliver(&self, trigger: &MessageRecord, content: &str) -> Option<MessageRecord> {
        let group_id = trigger.group_id.as_str();
        let record = match self
            .store
            .insert_message(NewMessage::ai_reply(group_id, content, &trigger.id))
            .await
        {
            Ok(record) => record,
            Err(error) => {
                tracing::error!(
                    group_id,
                    message_id = %trigger.id,
                    "Failed to persist AI reply: {:#}",
                    error
                );
                return None;
            }
        };

        self.broadcaster
            .broadcast(group_id, GroupEvent::NewMessage(record.to_dto(Some(trigger))));

        let entry = SessionEntry {
            role: "assistant".to_string(),
            content: content.to_string(),
            reply_to_id: Some(trigger.id.clone()),
            recorded_at: Some(record.created_at),
        };
        if let Err(error) = self.memory.append_session_history(group_id, &entry).await {
            tracing::warn!(group_id, "Failed to append session history: {:#}", error);
        }

        Some(record)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedModel;
    use super::*;
    use crate::broadcast::{GroupEventEnvelope, GroupHub};
    use crate::database::{ChatDatabase, MessageType};
    use crate::memory::FileMemoryStore;
    use crate::tools::web::WebShared;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<ChatDatabase>,
        memory: Arc<FileMemoryStore>,
        hub: Arc<GroupHub>,
        session: AgentSession,
        group: String,
        config: BackendConfig,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ChatDatabase::new(dir.path().join("chat.db")).unwrap());
        let group = db.create_group("builders").unwrap();
        let memory = Arc::new(FileMemoryStore::new(dir.path()));
        let mut config = BackendConfig::default();
        config.database_path = dir.path().join("chat.db").to_string_lossy().to_string();
        config.storage_dir = dir.path().to_string_lossy().to_string();
        config.workspace_root = dir.path().to_string_lossy().to_string();
        let session = AgentSession::open(
            &group,
            &SessionSettings::from_config(&config),
            memory.clone(),
            Arc::new(WebShared::new()),
        )
        .await
        .unwrap();
        Fixture {
            _dir: dir,
            db,
            memory,
            hub: Arc::new(GroupHub::new()),
            session,
            group,
            config,
        }
    }

    impl Fixture {
        fn agent(&self, model: Arc<dyn ConversationModel>) -> ResponseAgent {
            ResponseAgent::new(
                self.db.clone(),
                self.memory.clone(),
                self.hub.clone(),
                model,
                &self.config,
            )
        }

        async fn human(&self, content: &str) -> MessageRecord {
            let alice = self.db.create_user(Some("Alice"), None).unwrap();
            self.db.add_member(&self.group, &alice).unwrap();
            self.db
                .insert_message(NewMessage::user(&self.group, &alice, content))
                .await
                .unwrap()
        }
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<GroupEventEnvelope>) -> Vec<GroupEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            events.push(envelope.event);
        }
        events
    }

    #[tokio::test]
    async fn reply_is_streamed_persisted_and_logged() {
        let fx = fixture().await;
        let trigger = fx.human("Does anyone know why my build fails?").await;
        let mut rx = fx.hub.subscribe(&fx.group);
        let model = Arc::new(ScriptedModel {
            events: vec![
                AgentStreamEvent::ToolStart {
                    name: "web_search".into(),
                },
                AgentStreamEvent::ToolEnd {
                    name: "web_search".into(),
                    success: true,
                },
                AgentStreamEvent::TextDelta("Check the ".into()),
                AgentStreamEvent::TextDelta("lockfile.".into()),
            ],
            reply: Ok("Check the lockfile.".into()),
            ..ScriptedModel::replying("")
        });

        let outcome = fx.agent(model.clone()).respond(&fx.session, &trigger).await;

        assert!(!outcome.used_fallback);
        let record = outcome.message.expect("persisted");
        assert_eq!(record.content, "Check the lockfile.");
        assert_eq!(record.message_type, MessageType::Ai);
        assert_eq!(record.sender_id, None);
        assert_eq!(record.reply_to_id.as_deref(), Some(trigger.id.as_str()));
        assert_eq!(
            model.prompts(),
            vec!["[just now] Alice: Does anyone know why my build fails?".to_string()]
        );

        let events = drain(&mut rx);
        let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "AI_STREAM_START",
                "AI_STREAM_TOOL",
                "AI_STREAM_TOOL",
                "AI_STREAM_DELTA",
                "AI_STREAM_DELTA",
                "AI_STREAM_END",
                "NEW_MESSAGE",
            ]
        );
        match events.last() {
            Some(GroupEvent::NewMessage(dto)) => {
                assert_eq!(dto.sender_name, crate::database::AI_DISPLAY_NAME);
                assert_eq!(dto.reply_to_id.as_deref(), Some(trigger.id.as_str()));
            }
            other => panic!("unexpected last event {:?}", other),
        }

        let history = fx.memory.session_history(&fx.group, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "assistant");
        assert_eq!(history[0].reply_to_id.as_deref(), Some(trigger.id.as_str()));
    }

    #[tokio::test]
    async fn model_failure_delivers_the_fallback() {
        let fx = fixture().await;
        let trigger = fx.human("@AI what's the plan?").await;
        let mut rx = fx.hub.subscribe(&fx.group);

        let outcome = fx
            .agent(Arc::new(ScriptedModel::failing("upstream 500")))
            .respond(&fx.session, &trigger)
            .await;

        assert!(outcome.used_fallback);
        assert_eq!(outcome.content, FALLBACK_REPLY);
        let record = outcome.message.expect("fallback persisted");
        assert_eq!(record.content, FALLBACK_REPLY);
        assert_eq!(record.reply_to_id.as_deref(), Some(trigger.id.as_str()));

        let types: Vec<&str> = drain(&mut rx).iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["AI_STREAM_START", "AI_STREAM_END", "NEW_MESSAGE"]);
    }

    #[tokio::test]
    async fn blank_reply_is_replaced_by_the_fallback() {
        let fx = fixture().await;
        let trigger = fx.human("@ai hello").await;
        let outcome = fx
            .agent(Arc::new(ScriptedModel::replying("   \n")))
            .respond(&fx.session, &trigger)
            .await;
        assert!(outcome.used_fallback);
        assert_eq!(outcome.content, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn slow_model_times_out_into_the_fallback() {
        let mut fx = fixture().await;
        fx.config.agent_timeout_secs = 1;
        let trigger = fx.human("@AI take your time").await;
        let model = ScriptedModel {
            delay: Some(Duration::from_secs(5)),
            ..ScriptedModel::replying("too late")
        };

        let outcome = fx.agent(Arc::new(model)).respond(&fx.session, &trigger).await;
        assert!(outcome.used_fallback);
        assert_eq!(outcome.content, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn non_streaming_deployment_only_sends_the_final_message() {
        let mut fx = fixture().await;
        fx.config.enable_streaming = false;
        let trigger = fx.human("@AI ping").await;
        let mut rx = fx.hub.subscribe(&fx.group);

        fx.agent(Arc::new(ScriptedModel::replying("pong")))
            .respond(&fx.session, &trigger)
            .await;

        let types: Vec<&str> = drain(&mut rx).iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["NEW_MESSAGE"]);
    }

    #[tokio::test]
    async fn permanent_memory_reaches_the_system_prompt() {
        let fx = fixture().await;
        fx.memory
            .save_permanent_memory(&fx.group, "Standup is at 10:00")
            .await
            .unwrap();
        let trigger = fx.human("@AI when is standup?").await;
        let model = Arc::new(ScriptedModel::replying("10:00"));

        fx.agent(model.clone()).respond(&fx.session, &trigger).await;

        let requests = model.requests.lock().unwrap();
        assert!(requests[0].system_prompt.contains("Standup is at 10:00"));
        assert!(requests[0].system_prompt.contains("Alice"));
        assert_eq!(requests[0].tool_ctx.group_id, fx.group);
    }
}
