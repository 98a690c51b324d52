//! Local rule prefilter.
//!
//! Every human message passes through here before anything touches the
//! network. The message is always recorded into the group state first; the
//! decision is then a pure function of that state plus the message.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex_lite::Regex;

use super::state::{GroupConversationState, RecentMessage};
use crate::database::MessageType;

pub const MIN_CONTENT_CHARS: usize = 4;
pub const COOLDOWN_SECS: i64 = 5 * 60;
pub const COOLDOWN_MESSAGES: u32 = 8;
pub const UNANSWERED_SECS: i64 = 2 * 60;
/// How far back the stale-question rescue looks for a candidate.
pub const UNANSWERED_LOOKBACK_SECS: i64 = 10 * 60;
pub const PRESENCE_THRESHOLD: u32 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDecision {
    pub should_evaluate: bool,
    pub reason: String,
}

impl TriggerDecision {
    fn accept(reason: impl Into<String>) -> Self {
        Self {
            should_evaluate: true,
            reason: reason.into(),
        }
    }

    fn skip(reason: impl Into<String>) -> Self {
        Self {
            should_evaluate: false,
            reason: reason.into(),
        }
    }
}

struct Patterns {
    question_mark: Option<Regex>,
    question_words: Option<Regex>,
    help_words: Option<Regex>,
    ai_mention: Option<Regex>,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        question_mark: compile("[？?]"),
        question_words: compile(
            r"(?:怎么|为什么|为啥|哪里|哪个|什么|如何|谁|几个|多少|吗|嘛|呢|咋|啥|哪儿|能不能|可不可以|是不是|有没有|会不会)|(?i:\b(?:why|how|what|where|which|who|when)\b)",
        ),
        help_words: compile(
            r"(?:帮忙|帮我|推荐|有没有人|谁知道|谁能|求助|求推荐|急|在线等|有人吗|谁会)|(?i:\b(?:help|please help|anyone know|recommend|urgent|asap)\b)",
        ),
        ai_mention: compile(r"(?:^|[^A-Za-z0-9_])@[Aa][Ii]\b"),
    })
}

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(error) => {
            tracing::error!("Invalid prefilter pattern {:?}: {}", pattern, error);
            None
        }
    }
}

fn matches(re: &Option<Regex>, text: &str) -> bool {
    re.as_ref().map_or(false, |re| re.is_match(text))
}

pub fn is_question(content: &str) -> bool {
    let p = patterns();
    matches(&p.question_mark, content) || matches(&p.question_words, content)
}

pub fn is_help_request(content: &str) -> bool {
    matches(&patterns().help_words, content)
}

/// Standalone, case-insensitive `@AI` token.
pub fn mentions_ai(content: &str) -> bool {
    matches(&patterns().ai_mention, content)
}

/// Record the message, then decide whether it is a candidate for the judge.
pub fn check_proactive_trigger(
    state: &mut GroupConversationState,
    content: &str,
    sender_id: Option<&str>,
    message_type: MessageType,
    now: DateTime<Utc>,
) -> TriggerDecision {
    let question = is_question(content);
    state.record(RecentMessage {
        content: content.to_string(),
        sender_id: sender_id.map(str::to_string),
        timestamp: now,
        is_question: question,
        message_type,
    });

    if message_type == MessageType::Ai {
        return TriggerDecision::skip("AI message never self-triggers");
    }

    if content.trim().chars().count() < MIN_CONTENT_CHARS {
        return TriggerDecision::skip("message too short");
    }

    if mentions_ai(content) {
        return TriggerDecision::skip("direct mention handled by direct trigger");
    }

    if let Some(last_spoke) = state.last_ai_spoke() {
        let elapsed = now - last_spoke;
        if elapsed < Duration::seconds(COOLDOWN_SECS)
            && state.messages_since_ai() < COOLDOWN_MESSAGES
        {
            return TriggerDecision::skip(format!(
                "cooldown active ({}s, {} messages)",
                elapsed.num_seconds(),
                state.messages_since_ai()
            ));
        }
    }

    if question {
        return TriggerDecision::accept("question detected");
    }

    if is_help_request(content) {
        return TriggerDecision::accept("help request detected");
    }

    if stale_question_waiting(state, now) {
        return TriggerDecision::accept("unanswered question >2min");
    }

    if state.messages_since_ai() >= PRESENCE_THRESHOLD {
        return TriggerDecision::accept(format!(
            "{} messages without AI participation",
            state.messages_since_ai()
        ));
    }

    TriggerDecision::skip("no rule matched")
}

/// The oldest recent USER question, other than the message just recorded,
/// that nobody else has followed and that has waited past the threshold.
fn stale_question_waiting(state: &GroupConversationState, now: DateTime<Utc>) -> bool {
    let recent = state.recent_messages();
    let candidates = recent.len().saturating_sub(1);
    let lookback = Duration::seconds(UNANSWERED_LOOKBACK_SECS);

    let Some((idx, question)) = recent
        .iter()
        .take(candidates)
        .enumerate()
        .find(|(_, m)| {
            m.is_question && m.message_type == MessageType::User && now - m.timestamp <= lookback
        })
    else {
        return false;
    };

    let answered = recent
        .iter()
        .skip(idx + 1)
        .any(|m| m.sender_id != question.sender_id);

    !answered && now - question.timestamp > Duration::seconds(UNANSWERED_SECS)
}
