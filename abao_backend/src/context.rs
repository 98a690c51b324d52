//! Conversation window assembly for the response agent.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::database::{MessageRecord, MessageStore, MessageType};

pub const WINDOW_MINUTES: i64 = 30;
pub const WINDOW_LIMIT: usize = 50;
pub const ROSTER_ACTIVITY_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContextRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextMessage {
    pub role: ContextRole,
    pub content: String,
}

pub struct ContextAssembler {
    store: Arc<dyn MessageStore>,
    time_tags: bool,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn MessageStore>, time_tags: bool) -> Self {
        Self { store, time_tags }
    }

    /// Last 30 minutes of the group (the newest 50 rows), preceded by any
    /// out-of-window messages those rows reply to.
    pub async fn build_context_window(
        &self,
        group_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContextMessage>> {
        let window = self
            .store
            .messages_in_window(group_id, now - Duration::minutes(WINDOW_MINUTES), WINDOW_LIMIT)
            .await
            .context("Failed to load context window")?;
        if window.is_empty() {
            return Ok(Vec::new());
        }

        let in_window: HashSet<&str> = window.iter().map(|m| m.id.as_str()).collect();
        let mut seen = HashSet::new();
        let missing: Vec<String> = window
            .iter()
            .filter_map(|m| m.reply_to_id.as_deref())
            .filter(|id| !in_window.contains(id))
            .filter(|id| seen.insert(*id))
            .map(str::to_string)
            .collect();

        let compensation = if missing.is_empty() {
            Vec::new()
        } else {
            tracing::debug!(
                group_id,
                count = missing.len(),
                "Pulling out-of-window reply targets into context"
            );
            self.store
                .messages_by_ids(&missing)
                .await
                .context("Failed to load reply targets")?
        };

        Ok(compensation
            .iter()
            .chain(window.iter())
            .map(|row| self.to_context_message(row, now))
            .collect())
    }

    fn to_context_message(&self, row: &MessageRecord, now: DateTime<Utc>) -> ContextMessage {
        let tag = if self.time_tags {
            format!("[{}] ", relative_time(row.created_at, now))
        } else {
            String::new()
        };
        match row.message_type {
            MessageType::Ai => ContextMessage {
                role: ContextRole::Assistant,
                content: format!("{}{}", tag, row.content),
            },
            MessageType::System => ContextMessage {
                role: ContextRole::System,
                content: row.content.clone(),
            },
            MessageType::User => ContextMessage {
                role: ContextRole::User,
                content: format!("{}{}: {}", tag, row.sender_display_name(), row.content),
            },
        }
    }

    /// Member list with seven-day activity labels, for the system prompt.
    pub async fn build_group_roster(&self, group_id: &str, now: DateTime<Utc>) -> Result<String> {
        let roster = self
            .store
            .group_roster(group_id, now - Duration::days(ROSTER_ACTIVITY_DAYS))
            .await
            .context("Failed to load group roster")?;
        if roster.is_empty() {
            return Ok(String::new());
        }

        let mut lines = vec!["Members:".to_string()];
        for member in roster {
            if member.is_ai {
                lines.push(format!("- {} (AI assistant, you)", member.display_name));
            } else {
                lines.push(format!(
                    "- {} ({} messages in the last 7 days, {})",
                    member.display_name,
                    member.recent_message_count,
                    member.activity_label()
                ));
            }
        }
        Ok(lines.join("\n"))
    }
}

/// One prompt for the agent: user lines verbatim, others tagged by role.
pub fn flatten_prompt(context: &[ContextMessage]) -> String {
    context
        .iter()
        .map(|m| match m.role {
            ContextRole::User => m.content.clone(),
            ContextRole::Assistant => format!("[AI]: {}", m.content),
            ContextRole::System => format!("[system]: {}", m.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds().max(0);
    if secs < 60 {
        return "just now".to_string();
    }
    let mins = secs / 60;
    if mins < 60 {
        return format!("{} min ago", mins);
    }
    let hours = mins / 60;
    if hours < 24 {
        return format!("{} h ago", hours);
    }
    format!("{} days ago", hours / 24)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ChatDatabase, NewMessage};
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("abao_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    struct Fixture {
        db: Arc<ChatDatabase>,
        group: String,
        alice: String,
        bob: String,
        path: PathBuf,
    }

    fn fixture(name: &str) -> Fixture {
        let path = temp_db_path(name);
        let db = Arc::new(ChatDatabase::new(&path).expect("db init"));
        let group = db.create_group("g").expect("group");
        let alice = db.create_user(Some("Alice"), None).expect("alice");
        let bob = db.create_user(None, Some("bob.smith@example.com")).expect("bob");
        db.add_member(&group, &alice).expect("member");
        db.add_member(&group, &bob).expect("member");
        Fixture {
            db,
            group,
            alice,
            bob,
            path,
        }
    }

    #[tokio::test]
    async fn empty_window_yields_empty_context() {
        let f = fixture("ctx_empty");
        let assembler = ContextAssembler::new(f.db.clone(), false);
        let context = assembler
            .build_context_window(&f.group, Utc::now())
            .await
            .expect("context");
        assert!(context.is_empty());
        let _ = std::fs::remove_file(&f.path);
    }

    #[tokio::test]
    async fn maps_roles_and_display_names() {
        let f = fixture("ctx_roles");
        let now = Utc::now();
        let question = f
            .db
            .insert_message_at(NewMessage::user(&f.group, &f.alice, "hi all"), now - Duration::minutes(3))
            .expect("insert");
        f.db.insert_message_at(
            NewMessage::user(&f.group, &f.bob, "hey"),
            now - Duration::minutes(2),
        )
        .expect("insert");
        f.db.insert_message_at(
            NewMessage::ai_reply(&f.group, "hello!", &question.id),
            now - Duration::minutes(1),
        )
        .expect("insert");

        let assembler = ContextAssembler::new(f.db.clone(), false);
        let context = assembler
            .build_context_window(&f.group, now)
            .await
            .expect("context");
        assert_eq!(
            context,
            vec![
                ContextMessage {
                    role: ContextRole::User,
                    content: "Alice: hi all".into()
                },
                ContextMessage {
                    role: ContextRole::User,
                    content: "bob.smith: hey".into()
                },
                ContextMessage {
                    role: ContextRole::Assistant,
                    content: "hello!".into()
                },
            ]
        );
        assert_eq!(flatten_prompt(&context), "Alice: hi all\nbob.smith: hey\n[AI]: hello!");
        let _ = std::fs::remove_file(&f.path);
    }

    #[tokio::test]
    async fn out_of_window_reply_target_is_prepended_once() {
        let f = fixture("ctx_compensation");
        let now = Utc::now();
        let ancient = f
            .db
            .insert_message_at(
                NewMessage::user(&f.group, &f.alice, "what's the wifi password?"),
                now - Duration::days(2),
            )
            .expect("insert");
        f.db.insert_message_at(
            NewMessage::user(&f.group, &f.bob, "unrelated chatter"),
            now - Duration::minutes(10),
        )
        .expect("insert");
        f.db.insert_message_at(
            NewMessage::user(&f.group, &f.bob, "it's on the fridge").replying_to(&ancient.id),
            now - Duration::minutes(5),
        )
        .expect("insert");
        f.db.insert_message_at(
            NewMessage::user(&f.group, &f.alice, "thanks!").replying_to(&ancient.id),
            now - Duration::minutes(4),
        )
        .expect("insert");

        let assembler = ContextAssembler::new(f.db.clone(), true);
        let context = assembler
            .build_context_window(&f.group, now)
            .await
            .expect("context");

        let hits: Vec<_> = context
            .iter()
            .enumerate()
            .filter(|(_, m)| m.content.contains("wifi password"))
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 0);
        assert_eq!(context[0].content, "[2 days ago] Alice: what's the wifi password?");
        assert_eq!(context.len(), 4);
        assert_eq!(context[2].content, "[5 min ago] bob.smith: it's on the fridge");
        let _ = std::fs::remove_file(&f.path);
    }

    #[tokio::test]
    async fn busy_window_keeps_the_newest_messages() {
        let f = fixture("ctx_busy");
        let now = Utc::now();
        for i in 0..60 {
            f.db.insert_message_at(
                NewMessage::user(&f.group, &f.bob, &format!("chatter {}", i)),
                now - Duration::minutes(20) + Duration::seconds(i),
            )
            .expect("insert");
        }
        f.db.insert_message_at(
            NewMessage::user(&f.group, &f.alice, "@AI summarize please"),
            now - Duration::seconds(1),
        )
        .expect("insert");

        let assembler = ContextAssembler::new(f.db.clone(), false);
        let context = assembler
            .build_context_window(&f.group, now)
            .await
            .expect("context");
        assert_eq!(context.len(), WINDOW_LIMIT);
        assert_eq!(context[0].content, "bob.smith: chatter 11");
        assert_eq!(
            context.last().map(|m| m.content.as_str()),
            Some("Alice: @AI summarize please")
        );
        let _ = std::fs::remove_file(&f.path);
    }

    #[tokio::test]
    async fn roster_lists_members_with_activity() {
        let f = fixture("ctx_roster");
        let now = Utc::now();
        for _ in 0..20 {
            f.db.insert_message_at(NewMessage::user(&f.group, &f.alice, "chat"), now)
                .expect("insert");
        }
        let assembler = ContextAssembler::new(f.db.clone(), true);
        let roster = assembler
            .build_group_roster(&f.group, now)
            .await
            .expect("roster");
        assert!(roster.starts_with("Members:"));
        assert!(roster.contains("(AI assistant, you)"));
        assert!(roster.contains("- Alice (20 messages in the last 7 days, active)"));
        assert!(roster.contains("- bob.smith (0 messages in the last 7 days, lurker)"));
        let _ = std::fs::remove_file(&f.path);
    }

    #[test]
    fn relative_time_buckets() {
        let now = Utc::now();
        assert_eq!(relative_time(now - Duration::seconds(5), now), "just now");
        assert_eq!(relative_time(now - Duration::minutes(7), now), "7 min ago");
        assert_eq!(relative_time(now - Duration::hours(3), now), "3 h ago");
        assert_eq!(relative_time(now - Duration::days(4), now), "4 days ago");
    }
}
