use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::llm_client::{extract_json_object, CompletionOptions, CompletionService, Message};

const JUDGE_MAX_TOKENS: u32 = 50;
const REASON_MAX_CHARS: usize = 100;

const JUDGE_SYSTEM_PROMPT: &str = "You decide whether the AI assistant in a group chat should \
speak up right now without being asked.

Criteria:
- Someone asked a question and you might know the answer -> consider speaking
- The topic is interesting and you have a distinct perspective -> consider speaking
- Purely casual small talk or a private exchange -> stay quiet
- Someone else is already answering -> stay quiet
- The topic is sensitive or people are arguing -> stay quiet

Output JSON only, nothing else:
{\"speak\": true/false, \"reason\": \"short reason\"}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationDecision {
    pub speak: bool,
    pub reason: String,
}

impl EvaluationDecision {
    fn decline(reason: impl Into<String>) -> Self {
        Self {
            speak: false,
            reason: reason.into(),
        }
    }
}

/// Bounded yes/no model call. Every failure is a `speak: false` decision.
pub struct ProactiveJudge {
    llm: Arc<dyn CompletionService>,
    model: Option<String>,
    timeout: Duration,
    credential_configured: bool,
}

impl ProactiveJudge {
    pub fn new(
        llm: Arc<dyn CompletionService>,
        model: Option<String>,
        timeout: Duration,
        credential_configured: bool,
    ) -> Self {
        Self {
            llm,
            model,
            timeout,
            credential_configured,
        }
    }

    pub async fn evaluate(
        &self,
        group_id: &str,
        recent_context: &[String],
        trigger_reason: &str,
    ) -> EvaluationDecision {
        if !self.credential_configured {
            return EvaluationDecision::decline("no API key configured");
        }

        let user_turn = format!(
            "Trigger reason: {}\n\nRecent conversation:\n{}",
            trigger_reason,
            recent_context.join("\n")
        );
        let options = CompletionOptions {
            max_tokens: JUDGE_MAX_TOKENS,
            temperature: 0.0,
            model: self.model.clone(),
        };
        let messages = [Message::user(user_turn)];

        let call = self.llm.complete(JUDGE_SYSTEM_PROMPT, &messages, &options);
        let text = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(text)) => text,
            Ok(Err(error)) => {
                tracing::warn!(group_id, "Judge request failed: {:#}", error);
                return EvaluationDecision::decline(truncate(&format!("judge error: {}", error)));
            }
            Err(_) => {
                tracing::warn!(
                    group_id,
                    "Judge timed out after {}ms; staying quiet",
                    self.timeout.as_millis()
                );
                return EvaluationDecision::decline("judge timed out");
            }
        };

        tracing::debug!(group_id, raw = %text.trim(), "Judge raw output");

        let Some(json) = extract_json_object(text.trim()) else {
            tracing::warn!(group_id, raw = %text.trim(), "Judge output had no JSON object");
            return EvaluationDecision::decline("malformed judge output");
        };
        let parsed: Value = match serde_json::from_str(json) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(group_id, "Judge JSON did not parse: {}", error);
                return EvaluationDecision::decline("malformed judge output");
            }
        };

        let speak = parsed.get("speak").and_then(Value::as_bool) == Some(true);
        let reason = match parsed.get("reason") {
            Some(Value::String(reason)) => truncate(reason),
            Some(Value::Null) | None => String::new(),
            Some(other) => truncate(&other.to_string()),
        };

        tracing::info!(group_id, speak, reason = %reason, "Judge decision");
        EvaluationDecision { speak, reason }
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(REASON_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::LlmClient;
    use crate::test_support::spawn_stub_server;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use std::sync::Mutex;

    enum Reply {
        Text(String),
        Fail,
        Hang,
    }

    struct ScriptedLlm {
        reply: Reply,
        seen: Mutex<Vec<(String, String, u32, f32)>>,
    }

    impl ScriptedLlm {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedLlm {
        async fn complete(
            &self,
            system_prompt: &str,
            messages: &[Message],
            options: &CompletionOptions,
        ) -> Result<String> {
            self.seen.lock().unwrap().push((
                system_prompt.to_string(),
                messages[0].content.clone(),
                options.max_tokens,
                options.temperature,
            ));
            match &self.reply {
                Reply::Text(text) => Ok(text.clone()),
                Reply::Fail => anyhow::bail!("LLM API returned error 500: boom"),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(r#"{"speak": true}"#.to_string())
                }
            }
        }
    }

    fn judge(llm: Arc<dyn CompletionService>, timeout: Duration) -> ProactiveJudge {
        ProactiveJudge::new(llm, None, timeout, true)
    }

    fn digest() -> Vec<String> {
        vec!["[user]: why does cargo rebuild everything?".to_string()]
    }

    #[tokio::test]
    async fn accepts_and_truncates_reason() {
        let long_reason = format!(r#"{{"speak": true, "reason": "{}"}}"#, "r".repeat(300));
        let llm = ScriptedLlm::new(Reply::Text(long_reason));
        let decision = judge(llm.clone(), Duration::from_secs(3))
            .evaluate("g", &digest(), "question detected")
            .await;
        assert!(decision.speak);
        assert_eq!(decision.reason.chars().count(), 100);

        let seen = llm.seen.lock().unwrap();
        let (system, user, max_tokens, temperature) = &seen[0];
        assert!(system.contains("already answering"));
        assert!(user.contains("Trigger reason: question detected"));
        assert!(user.contains("[user]: why does cargo"));
        assert_eq!(*max_tokens, 50);
        assert_eq!(*temperature, 0.0);
    }

    #[tokio::test]
    async fn reads_json_wrapped_in_prose() {
        let llm = ScriptedLlm::new(Reply::Text(
            "Sure. {\"speak\": false, \"reason\": \"people are joking around\"} hope that helps"
                .to_string(),
        ));
        let decision = judge(llm, Duration::from_secs(3))
            .evaluate("g", &digest(), "question detected")
            .await;
        assert!(!decision.speak);
        assert_eq!(decision.reason, "people are joking around");
    }

    #[tokio::test]
    async fn non_boolean_speak_is_a_decline() {
        let llm = ScriptedLlm::new(Reply::Text(r#"{"speak": "yes", "reason": "sure"}"#.to_string()));
        let decision = judge(llm, Duration::from_secs(3))
            .evaluate("g", &digest(), "question detected")
            .await;
        assert!(!decision.speak);
    }

    #[tokio::test]
    async fn fails_closed_on_error_timeout_and_garbage() {
        let cases: Vec<(Arc<ScriptedLlm>, &str)> = vec![
            (ScriptedLlm::new(Reply::Fail), "judge error"),
            (ScriptedLlm::new(Reply::Hang), "judge timed out"),
            (ScriptedLlm::new(Reply::Text("I think yes".to_string())), "malformed judge output"),
            (ScriptedLlm::new(Reply::Text("{speak: yes}".to_string())), "malformed judge output"),
        ];
        for (llm, expected) in cases {
            let decision = judge(llm, Duration::from_millis(50))
                .evaluate("g", &digest(), "help request detected")
                .await;
            assert!(!decision.speak);
            assert!(decision.reason.starts_with(expected), "{}", decision.reason);
        }
    }

    #[tokio::test]
    async fn missing_credential_short_circuits() {
        let llm = ScriptedLlm::new(Reply::Text(r#"{"speak": true}"#.to_string()));
        let decision = ProactiveJudge::new(llm.clone(), None, Duration::from_secs(3), false)
            .evaluate("g", &digest(), "question detected")
            .await;
        assert!(!decision.speak);
        assert!(llm.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fails_closed_against_real_http_failures() {
        let app = Router::new()
            .route(
                "/error/chat/completions",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream down") }),
            )
            .route(
                "/slow/chat/completions",
                post(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "{}"
                }),
            );
        let base = spawn_stub_server(app).await;

        for (path, expected) in [("error", "judge error"), ("slow", "judge timed out")] {
            let llm = Arc::new(LlmClient::new(
                format!("{}/{}", base, path),
                "sk-test".into(),
                "judge".into(),
            ));
            let decision = judge(llm, Duration::from_millis(300))
                .evaluate("g", &digest(), "question detected")
                .await;
            assert!(!decision.speak);
            assert!(decision.reason.starts_with(expected), "{}", decision.reason);
        }
    }
}
