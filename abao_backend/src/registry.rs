//! Per-group state: conversation counters for the funnel and the long-lived
//! agent session, both evicted after half an hour of silence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::agent::{AgentSession, SessionSettings};
use crate::broadcast::GroupHub;
use crate::database::MessageType;
use crate::memory::MemoryStore;
use crate::proactive::{check_proactive_trigger, GroupConversationState, TriggerDecision};
use crate::tools::web::WebShared;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const IDLE_TIMEOUT_MINUTES: i64 = 30;

/// Held for the whole Layer 3 invocation; one reply per group at a time.
pub type SharedSession = Arc<tokio::sync::Mutex<AgentSession>>;

struct SessionSlot {
    session: SharedSession,
    last_used: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub states_evicted: usize,
    pub sessions_evicted: usize,
    pub sessions_busy: usize,
}

pub struct GroupRegistry {
    states: Mutex<HashMap<String, GroupConversationState>>,
    sessions: tokio::sync::Mutex<HashMap<String, SessionSlot>>,
    settings: SessionSettings,
    memory: Arc<dyn MemoryStore>,
    web: Arc<WebShared>,
    hub: Option<Arc<GroupHub>>,
}

impl GroupRegistry {
    pub fn new(settings: SessionSettings, memory: Arc<dyn MemoryStore>) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            settings,
            memory,
            web: Arc::new(WebShared::new()),
            hub: None,
        }
    }

    /// Prune abandoned broadcast channels on every sweep.
    pub fn with_hub(mut self, hub: Arc<GroupHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<String, GroupConversationState>> {
        match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Layer 1: record the message into the group's state and decide.
    pub fn observe(
        &self,
        group_id: &str,
        content: &str,
        sender_id: Option<&str>,
        message_type: MessageType,
        now: DateTime<Utc>,
    ) -> TriggerDecision {
        let mut states = self.lock_states();
        let state = states
            .entry(group_id.to_string())
            .or_insert_with(|| GroupConversationState::new(now));
        check_proactive_trigger(state, content, sender_id, message_type, now)
    }

    pub fn record_ai_spoke(&self, group_id: &str, now: DateTime<Utc>, content: Option<&str>) {
        let mut states = self.lock_states();
        states
            .entry(group_id.to_string())
            .or_insert_with(|| GroupConversationState::new(now))
            .record_ai_spoke(now, content);
    }

    /// Digest of the latest `count` messages for the judge.
    pub fn recent_context(&self, group_id: &str, count: usize) -> Vec<String> {
        self.lock_states()
            .get(group_id)
            .map(|state| state.recent_digest(count))
            .unwrap_or_default()
    }

    pub fn conversation_state(&self, group_id: &str) -> Option<GroupConversationState> {
        self.lock_states().get(group_id).cloned()
    }

    /// The group's agent session, created on first use.
    pub async fn session(&self, group_id: &str, now: DateTime<Utc>) -> Result<SharedSession> {
        let mut sessions = self.sessions.lock().await;
        if let Some(slot) = sessions.get_mut(group_id) {
            slot.last_used = slot.last_used.max(now);
            return Ok(slot.session.clone());
        }

        let session = AgentSession::open(
            group_id,
            &self.settings,
            self.memory.clone(),
            self.web.clone(),
        )
        .await
        .with_context(|| format!("Failed to open agent session for group {}", group_id))?;
        let session = Arc::new(tokio::sync::Mutex::new(session));
        sessions.insert(
            group_id.to_string(),
            SessionSlot {
                session: session.clone(),
                last_used: now,
            },
        );
        Ok(session)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub fn state_count(&self) -> usize {
        self.lock_states().len()
    }

    /// Drop state and sessions idle for more than 30 minutes. Sessions with
    /// an invocation in flight are left for a later sweep.
    pub async fn sweep_idle(&self, now: DateTime<Utc>) -> SweepReport {
        let cutoff = now - chrono::Duration::minutes(IDLE_TIMEOUT_MINUTES);
        let mut report = SweepReport::default();

        let activity: HashMap<String, DateTime<Utc>> = self
            .lock_states()
            .iter()
            .map(|(group, state)| (group.clone(), state.last_activity()))
            .collect();

        let mut sessions = self.sessions.lock().await;
        let mut evicted = Vec::new();
        for (group_id, slot) in sessions.iter() {
            let last_active = activity
                .get(group_id)
                .map_or(slot.last_used, |at| (*at).max(slot.last_used));
            if last_active >= cutoff {
                continue;
            }
            match slot.session.try_lock() {
                Ok(session) => {
                    session.dispose().await;
                    evicted.push(group_id.clone());
                }
                Err(_) => {
                    tracing::debug!(group_id = %group_id, "Skipping eviction of busy session");
                    report.sessions_busy += 1;
                }
            }
        }
        for group_id in &evicted {
            sessions.remove(group_id);
            tracing::info!(group_id = %group_id, "Idle agent session cleaned up");
        }
        report.sessions_evicted = evicted.len();
        let remaining: Vec<String> = sessions.keys().cloned().collect();
        drop(sessions);

        {
            let mut states = self.lock_states();
            let before = states.len();
            states.retain(|group_id, state| {
                state.last_activity() >= cutoff || remaining.contains(group_id)
            });
            report.states_evicted = before - states.len();
        }

        if let Some(hub) = &self.hub {
            let pruned = hub.prune();
            if pruned > 0 {
                tracing::debug!(pruned, "Pruned idle broadcast channels");
            }
        }

        if report != SweepReport::default() {
            tracing::info!(?report, "Idle sweep finished");
        }
        report
    }

    /// Sweep every `interval` until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.sweep_idle(Utc::now()).await;
            }
        })
    }
}
