use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::database::MessageDto;

const GROUP_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Start,
    End,
}

/// Events pushed to every session subscribed to a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum GroupEvent {
    NewMessage(MessageDto),
    AiStreamStart {
        stream_id: String,
        reply_to_id: String,
    },
    AiStreamDelta {
        stream_id: String,
        delta: String,
    },
    AiStreamTool {
        stream_id: String,
        tool_name: String,
        phase: ToolPhase,
    },
    AiStreamEnd {
        stream_id: String,
    },
}

impl GroupEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            GroupEvent::NewMessage(_) => "NEW_MESSAGE",
            GroupEvent::AiStreamStart { .. } => "AI_STREAM_START",
            GroupEvent::AiStreamDelta { .. } => "AI_STREAM_DELTA",
            GroupEvent::AiStreamTool { .. } => "AI_STREAM_TOOL",
            GroupEvent::AiStreamEnd { .. } => "AI_STREAM_END",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupEventEnvelope {
    pub group_id: String,
    pub emitted_at: DateTime<Utc>,
    pub event: GroupEvent,
}

/// Fan-out of group events to connected sessions.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, group_id: &str, event: GroupEvent);
}

/// One tokio broadcast channel per group, created on first subscribe.
#[derive(Default)]
pub struct GroupHub {
    channels: Mutex<HashMap<String, broadcast::Sender<GroupEventEnvelope>>>,
}

impl GroupHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, group_id: &str) -> broadcast::Receiver<GroupEventEnvelope> {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(group_id.to_string())
            .or_insert_with(|| broadcast::channel(GROUP_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, group_id: &str) -> usize {
        match self.channels.lock() {
            Ok(channels) => channels
                .get(group_id)
                .map(|tx| tx.receiver_count())
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Drop channels nobody listens to. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        before - channels.len()
    }
}

impl Broadcaster for GroupHub {
    fn broadcast(&self, group_id: &str, event: GroupEvent) {
        let channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(tx) = channels.get(group_id) else {
            tracing::trace!(group_id, "No subscribers for {}", event.event_type());
            return;
        };
        let envelope = GroupEventEnvelope {
            group_id: group_id.to_string(),
            emitted_at: Utc::now(),
            event,
        };
        // No receivers left is not an error for fan-out.
        let _ = tx.send(envelope);
    }
}
