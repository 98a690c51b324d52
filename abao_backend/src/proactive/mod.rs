//! Proactive speech funnel: local rules first, then a bounded model judge.

pub mod judge;
pub mod prefilter;
pub mod state;

pub use judge::{EvaluationDecision, ProactiveJudge};
pub use prefilter::{check_proactive_trigger, mentions_ai, TriggerDecision};
pub use state::{GroupConversationState, RecentMessage, DIGEST_MESSAGES, MAX_RECENT_MESSAGES};
