//! Entry point for every persisted group message.
//!
//! Layer 1 always runs so the group's counters stay current. A direct
//! trigger (@AI or a reply to the AI) goes straight to Layer 3; otherwise a
//! Layer 1 candidate must also pass the Layer 2 judge.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::agent::{ResponseAgent, SessionSettings};
use crate::broadcast::GroupHub;
use crate::config::BackendConfig;
use crate::database::{MessageRecord, MessageStore, MessageType};
use crate::llm_client::LlmClient;
use crate::memory::MemoryStore;
use crate::proactive::{ProactiveJudge, DIGEST_MESSAGES};
use crate::registry::GroupRegistry;
use crate::tools::agentic::{AgenticConfig, AgenticLoop};
use crate::trigger::{detect_direct_trigger, DirectTrigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTrigger {
    Direct(DirectTrigger),
    Proactive,
}

/// What the pipeline did with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Layer 1 found nothing worth evaluating.
    Ignored { reason: String },
    /// No model credential; only counters were updated.
    NoCredential,
    /// Layer 2 chose silence.
    Declined { reason: String },
    Replied {
        trigger: ReplyTrigger,
        used_fallback: bool,
    },
}

pub struct AiPipeline {
    store: Arc<dyn MessageStore>,
    registry: Arc<GroupRegistry>,
    judge: ProactiveJudge,
    agent: ResponseAgent,
    credential_configured: bool,
}

impl AiPipeline {
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: Arc<GroupRegistry>,
        judge: ProactiveJudge,
        agent: ResponseAgent,
        credential_configured: bool,
    ) -> Self {
        Self {
            store,
            registry,
            judge,
            agent,
            credential_configured,
        }
    }

    /// Wire the production collaborators from configuration.
    pub fn from_config(
        config: &BackendConfig,
        store: Arc<dyn MessageStore>,
        memory: Arc<dyn MemoryStore>,
        hub: Arc<GroupHub>,
    ) -> Self {
        let llm = Arc::new(LlmClient::from_config(config));
        let judge = ProactiveJudge::new(
            llm,
            Some(config.judge_model().to_string()),
            config.judge_timeout(),
            config.has_llm_credential(),
        );
        let model = Arc::new(AgenticLoop::new(AgenticConfig::from_backend(config)));
        let agent = ResponseAgent::new(store.clone(), memory.clone(), hub.clone(), model, config);
        let registry = Arc::new(
            GroupRegistry::new(SessionSettings::from_config(config), memory).with_hub(hub),
        );
        Self::new(store, registry, judge, agent, config.has_llm_credential())
    }

    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    /// Fire-and-forget: the caller's request path never waits on AI work.
    pub fn dispatch(self: &Arc<Self>, message: MessageRecord) -> JoinHandle<PipelineOutcome> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.handle_message(message).await })
    }

    pub async fn handle_message(&self, message: MessageRecord) -> PipelineOutcome {
        let group_id = message.group_id.as_str();
        let decision = self.registry.observe(
            group_id,
            &message.content,
            message.sender_id.as_deref(),
            message.message_type,
            Utc::now(),
        );

        if message.message_type != MessageType::User {
            return PipelineOutcome::Ignored {
                reason: decision.reason,
            };
        }

        if !self.credential_configured {
            tracing::warn!(
                group_id,
                message_id = %message.id,
                "No AI API key configured, skipping AI processing"
            );
            return PipelineOutcome::NoCredential;
        }

        let direct = match detect_direct_trigger(self.store.as_ref(), &message).await {
            Ok(direct) => direct,
            Err(error) => {
                tracing::warn!(
                    group_id,
                    message_id = %message.id,
                    "Reply target lookup failed: {:#}",
                    error
                );
                None
            }
        };
        if let Some(kind) = direct {
            tracing::info!(group_id, message_id = %message.id, ?kind, "Direct trigger");
            return self.reply(&message, ReplyTrigger::Direct(kind)).await;
        }

        if !decision.should_evaluate {
            tracing::debug!(group_id, reason = %decision.reason, "Prefilter declined");
            return PipelineOutcome::Ignored {
                reason: decision.reason,
            };
        }

        let digest = self.registry.recent_context(group_id, DIGEST_MESSAGES);
        let evaluation = self.judge.evaluate(group_id, &digest, &decision.reason).await;
        if !evaluation.speak {
            tracing::debug!(group_id, reason = %evaluation.reason, "Judge declined");
            return PipelineOutcome::Declined {
                reason: evaluation.reason,
            };
        }

        tracing::info!(
            group_id,
            message_id = %message.id,
            trigger_reason = %decision.reason,
            judge_reason = %evaluation.reason,
            "Speaking proactively"
        );
        self.reply(&message, ReplyTrigger::Proactive).await
    }

    async fn reply(&self, message: &MessageRecord, trigger: ReplyTrigger) -> PipelineOutcome {
        let group_id = message.group_id.as_str();
        let outcome = match self.registry.session(group_id, Utc::now()).await {
            Ok(session) => {
                let session = session.lock().await;
                self.agent.respond(&session, message).await
            }
            Err(error) => {
                tracing::error!(
                    group_id,
                    message_id = %message.id,
                    "AI processing failed: {:#}",
                    error
                );
                self.agent.deliver_fallback(message).await
            }
        };

        self.registry
            .record_ai_spoke(group_id, Utc::now(), Some(&outcome.content));

        PipelineOutcome::Replied {
            trigger,
            used_fallback: outcome.used_fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedModel;
    use crate::agent::{ConversationModel, FALLBACK_REPLY};
    use crate::database::{ChatDatabase, NewMessage};
    use crate::llm_client::{CompletionOptions, CompletionService, Message};
    use crate::memory::FileMemoryStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedJudge {
        reply: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionService for FixedJudge {
        async fn complete(
            &self,
            _system_prompt: &str,
            _messages: &[Message],
            _options: &CompletionOptions,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        db: Arc<ChatDatabase>,
        judge: Arc<FixedJudge>,
        pipeline: Arc<AiPipeline>,
        group: String,
        alice: String,
    }

    fn harness(judge_reply: &str, model: Arc<dyn ConversationModel>, credential: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BackendConfig::default();
        config.database_path = dir.path().join("chat.db").to_string_lossy().to_string();
        config.storage_dir = dir.path().to_string_lossy().to_string();
        config.workspace_root = dir.path().to_string_lossy().to_string();

        let db = Arc::new(ChatDatabase::new(&config.database_path).unwrap());
        let group = db.create_group("builders").unwrap();
        let alice = db.create_user(Some("Alice"), None).unwrap();
        db.add_member(&group, &alice).unwrap();

        let memory = Arc::new(FileMemoryStore::new(dir.path()));
        let hub = Arc::new(GroupHub::new());
        let judge = Arc::new(FixedJudge {
            reply: judge_reply.to_string(),
            calls: AtomicUsize::new(0),
        });
        let pipeline = AiPipeline::new(
            db.clone(),
            Arc::new(GroupRegistry::new(
                SessionSettings::from_config(&config),
                memory.clone(),
            )),
            ProactiveJudge::new(judge.clone(), None, Duration::from_secs(3), credential),
            ResponseAgent::new(db.clone(), memory, hub, model, &config),
            credential,
        );

        Harness {
            _dir: dir,
            db,
            judge,
            pipeline: Arc::new(pipeline),
            group,
            alice,
        }
    }

    impl Harness {
        async fn post(&self, content: &str) -> MessageRecord {
            self.db
                .insert_message(NewMessage::user(&self.group, &self.alice, content))
                .await
                .unwrap()
        }

        fn ai_messages(&self) -> Vec<MessageRecord> {
            self.db
                .recent_messages(&self.group, 100)
                .unwrap()
                .into_iter()
                .filter(|m| m.message_type == MessageType::Ai)
                .collect()
        }

        fn judge_calls(&self) -> usize {
            self.judge.calls.load(Ordering::SeqCst)
        }
    }

    const SPEAK: &str = r#"{"speak": true, "reason": "can help"}"#;
    const QUIET: &str = r#"{"speak": false, "reason": "small talk"}"#;

    #[tokio::test]
    async fn question_passes_both_layers_and_gets_a_reply() {
        let h = harness(SPEAK, Arc::new(ScriptedModel::replying("Check the lockfile.")), true);
        let question = h.post("Does anyone know why my build fails?").await;

        let outcome = h.pipeline.handle_message(question.clone()).await;
        assert_eq!(
            outcome,
            PipelineOutcome::Replied {
                trigger: ReplyTrigger::Proactive,
                used_fallback: false
            }
        );
        assert_eq!(h.judge_calls(), 1);

        let replies = h.ai_messages();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].content, "Check the lockfile.");
        assert_eq!(replies[0].reply_to_id.as_deref(), Some(question.id.as_str()));

        let state = h.pipeline.registry().conversation_state(&h.group).unwrap();
        assert_eq!(state.messages_since_ai(), 0);
        assert!(state.last_ai_spoke().is_some());
    }

    #[tokio::test]
    async fn agent_failure_still_replies_and_resets_cooldown() {
        let h = harness(SPEAK, Arc::new(ScriptedModel::failing("provider down")), true);
        let question = h.post("Does anyone know why my build fails?").await;

        let outcome = h.pipeline.handle_message(question.clone()).await;
        assert_eq!(
            outcome,
            PipelineOutcome::Replied {
                trigger: ReplyTrigger::Proactive,
                used_fallback: true
            }
        );
        let replies = h.ai_messages();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].content, FALLBACK_REPLY);
        assert_eq!(replies[0].reply_to_id.as_deref(), Some(question.id.as_str()));

        let state = h.pipeline.registry().conversation_state(&h.group).unwrap();
        assert_eq!(state.messages_since_ai(), 0);
        assert!(state.last_ai_spoke().is_some());
    }

    #[tokio::test]
    async fn judge_decline_keeps_the_ai_quiet() {
        let h = harness(QUIET, Arc::new(ScriptedModel::replying("unused")), true);
        let question = h.post("what are we doing for lunch?").await;

        let outcome = h.pipeline.handle_message(question).await;
        assert_eq!(
            outcome,
            PipelineOutcome::Declined {
                reason: "small talk".into()
            }
        );
        assert!(h.ai_messages().is_empty());
        let state = h.pipeline.registry().conversation_state(&h.group).unwrap();
        assert_eq!(state.messages_since_ai(), 1);
        assert_eq!(state.last_ai_spoke(), None);
    }

    #[tokio::test]
    async fn prefilter_decline_never_reaches_the_judge() {
        let h = harness(SPEAK, Arc::new(ScriptedModel::replying("unused")), true);
        let outcome = h.pipeline.handle_message(h.post("ok").await).await;
        assert!(matches!(outcome, PipelineOutcome::Ignored { .. }));
        assert_eq!(h.judge_calls(), 0);
        assert!(h.ai_messages().is_empty());
    }

    #[tokio::test]
    async fn mention_bypasses_cooldown_and_judge() {
        let h = harness(QUIET, Arc::new(ScriptedModel::replying("Here!")), true);
        h.pipeline
            .registry()
            .record_ai_spoke(&h.group, Utc::now(), Some("earlier reply"));

        let outcome = h.pipeline.handle_message(h.post("@AI are you there").await).await;
        assert_eq!(
            outcome,
            PipelineOutcome::Replied {
                trigger: ReplyTrigger::Direct(DirectTrigger::Mention),
                used_fallback: false
            }
        );
        assert_eq!(h.judge_calls(), 0);
        assert_eq!(h.ai_messages().len(), 1);
    }

    #[tokio::test]
    async fn replying_to_the_ai_is_a_direct_trigger() {
        let h = harness(QUIET, Arc::new(ScriptedModel::replying("Sure.")), true);
        let question = h.post("@AI summarize the thread").await;
        h.pipeline.handle_message(question).await;
        let ai_reply = h.ai_messages().remove(0);

        let follow_up = h
            .db
            .insert_message(
                NewMessage::user(&h.group, &h.alice, "thanks, and the second point?")
                    .replying_to(&ai_reply.id),
            )
            .await
            .unwrap();
        let outcome = h.pipeline.handle_message(follow_up).await;
        assert_eq!(
            outcome,
            PipelineOutcome::Replied {
                trigger: ReplyTrigger::Direct(DirectTrigger::ReplyToAi),
                used_fallback: false
            }
        );
        assert_eq!(h.ai_messages().len(), 2);
        assert_eq!(h.judge_calls(), 0);
    }

    #[tokio::test]
    async fn missing_credential_only_updates_counters() {
        let h = harness(SPEAK, Arc::new(ScriptedModel::replying("unused")), false);
        let outcome = h.pipeline.handle_message(h.post("@AI hello?").await).await;
        assert_eq!(outcome, PipelineOutcome::NoCredential);
        assert!(h.ai_messages().is_empty());
        assert_eq!(h.judge_calls(), 0);
        let state = h.pipeline.registry().conversation_state(&h.group).unwrap();
        assert_eq!(state.recent_messages().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_runs_in_the_background() {
        let h = harness(SPEAK, Arc::new(ScriptedModel::replying("On it.")), true);
        let handle = h.pipeline.dispatch(h.post("@AI status?").await);
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::Replied { .. }));
        assert_eq!(h.ai_messages().len(), 1);
    }

    #[tokio::test]
    async fn replies_in_one_group_run_one_at_a_time() {
        let model = Arc::new(ScriptedModel {
            delay: Some(Duration::from_millis(200)),
            ..ScriptedModel::replying("On it.")
        });
        let h = harness(QUIET, model.clone(), true);
        let first = h.post("@AI check the deploy").await;
        let second = h.post("@AI and the staging db").await;

        let (a, b) = tokio::join!(h.pipeline.dispatch(first), h.pipeline.dispatch(second));
        for outcome in [a.unwrap(), b.unwrap()] {
            assert_eq!(
                outcome,
                PipelineOutcome::Replied {
                    trigger: ReplyTrigger::Direct(DirectTrigger::Mention),
                    used_fallback: false
                }
            );
        }

        assert_eq!(model.prompts().len(), 2);
        assert_eq!(model.peak_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(h.ai_messages().len(), 2);
    }
}
