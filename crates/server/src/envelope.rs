//! Canonical broadcast envelope

use deskrelay_shared::{ConversationId, ServerEvent};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Immutable event fanned out to every member of a conversation
///
/// Built once by the message pipeline. Room members receive its
/// `{type, data}` projection; the bus carries it whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEnvelope {
    conversation_id: ConversationId,
    event: ServerEvent,
    #[serde(with = "time::serde::rfc3339")]
    emitted_at: OffsetDateTime,
}

impl BroadcastEnvelope {
    pub fn new(conversation_id: ConversationId, event: ServerEvent) -> Self {
        Self {
            conversation_id,
            event,
            emitted_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn event(&self) -> &ServerEvent {
        &self.event
    }

    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }

    pub fn emitted_at(&self) -> OffsetDateTime {
        self.emitted_at
    }

    /// JSON text frame sent to room members
    pub fn wire_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.event)
    }
}
