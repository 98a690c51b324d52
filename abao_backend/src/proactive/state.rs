use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::database::MessageType;

/// Recent messages kept per group for the heuristics.
pub const MAX_RECENT_MESSAGES: usize = 20;
/// Messages included in the judge digest.
pub const DIGEST_MESSAGES: usize = 5;
const DIGEST_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct RecentMessage {
    pub content: String,
    pub sender_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_question: bool,
    pub message_type: MessageType,
}

/// Per-group ring buffer plus cooldown counters.
#[derive(Debug, Clone)]
pub struct GroupConversationState {
    recent: VecDeque<RecentMessage>,
    last_ai_spoke: Option<DateTime<Utc>>,
    messages_since_ai: u32,
    last_activity: DateTime<Utc>,
}

impl GroupConversationState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            recent: VecDeque::with_capacity(MAX_RECENT_MESSAGES),
            last_ai_spoke: None,
            messages_since_ai: 0,
            last_activity: now,
        }
    }

    /// Append an observed message, evicting the oldest past capacity.
    pub fn record(&mut self, message: RecentMessage) {
        self.last_activity = self.last_activity.max(message.timestamp);
        self.push(message);
        self.messages_since_ai = self.messages_since_ai.saturating_add(1);
    }

    /// Reset cooldown counters. The AI line joins the buffer without counting
    /// toward `messages_since_ai`.
    pub fn record_ai_spoke(&mut self, now: DateTime<Utc>, content: Option<&str>) {
        self.last_ai_spoke = Some(now);
        self.messages_since_ai = 0;
        self.last_activity = self.last_activity.max(now);
        if let Some(content) = content {
            self.push(RecentMessage {
                content: content.to_string(),
                sender_id: None,
                timestamp: now,
                is_question: false,
                message_type: MessageType::Ai,
            });
        }
    }

    fn push(&mut self, message: RecentMessage) {
        self.recent.push_back(message);
        while self.recent.len() > MAX_RECENT_MESSAGES {
            self.recent.pop_front();
        }
    }

    pub fn recent_messages(&self) -> &VecDeque<RecentMessage> {
        &self.recent
    }

    pub fn last_ai_spoke(&self) -> Option<DateTime<Utc>> {
        self.last_ai_spoke
    }

    pub fn messages_since_ai(&self) -> u32 {
        self.messages_since_ai
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = self.last_activity.max(now);
    }

    /// Last `count` messages as `"[AI|user]: <first 100 chars>"`.
    pub fn recent_digest(&self, count: usize) -> Vec<String> {
        let skip = self.recent.len().saturating_sub(count);
        self.recent
            .iter()
            .skip(skip)
            .map(|m| {
                let prefix = if m.message_type == MessageType::Ai {
                    "[AI]"
                } else {
                    "[user]"
                };
                let head: String = m.content.chars().take(DIGEST_CHARS).collect();
                format!("{}: {}", prefix, head)
            })
            .collect()
    }
}
