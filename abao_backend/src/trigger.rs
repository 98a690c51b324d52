use anyhow::Result;

use crate::database::{MessageRecord, MessageStore, MessageType};
use crate::proactive::mentions_ai;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectTrigger {
    Mention,
    ReplyToAi,
}

/// Whether a human message addresses the AI directly, bypassing the funnel.
pub fn direct_trigger(
    message: &MessageRecord,
    reply_target: Option<&MessageRecord>,
) -> Option<DirectTrigger> {
    if message.message_type != MessageType::User {
        return None;
    }
    if mentions_ai(&message.content) {
        return Some(DirectTrigger::Mention);
    }
    match reply_target {
        Some(target) if target.message_type == MessageType::Ai => Some(DirectTrigger::ReplyToAi),
        _ => None,
    }
}

/// Resolve the reply target through the store, then classify.
pub async fn detect_direct_trigger(
    store: &dyn MessageStore,
    message: &MessageRecord,
) -> Result<Option<DirectTrigger>> {
    if message.message_type != MessageType::User {
        return Ok(None);
    }
    if mentions_ai(&message.content) {
        return Ok(Some(DirectTrigger::Mention));
    }
    let target = match message.reply_to_id.as_deref() {
        Some(id) => store.get_message(id).await?,
        None => None,
    };
    Ok(direct_trigger(message, target.as_ref()))
}
