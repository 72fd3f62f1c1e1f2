//! WebSocket event types and serialization
//!
//! Defines all client-to-server and server-to-client frames with type-safe
//! serde serialization. Every frame is a JSON text frame tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::{ConversationId, MessageRole, ParticipantId};

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Events sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Chat message to persist and broadcast
    #[serde(alias = "chat-message")]
    Message {
        #[serde(default)]
        content: String,
        /// Validated by the relay, so unknown roles get a precise error
        #[serde(default)]
        role: String,
    },

    /// Typing indicator, relayed to everyone but the sender
    #[serde(alias = "typing-indicator", rename_all = "camelCase")]
    Typing { is_typing: bool },

    /// Announce the sender to the room
    #[serde(alias = "participant-joined")]
    ParticipantJoined,

    /// Application-level heartbeat
    Ping,
}

impl ClientEvent {
    /// Every `type` value the relay accepts
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "message",
        "chat-message",
        "typing",
        "typing-indicator",
        "participant_joined",
        "participant-joined",
        "ping",
    ];

    /// Parse a text frame, distinguishing unknown types from bad payloads
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if !Self::KNOWN_TYPES.contains(&event_type.as_str()) {
            return Err(ProtocolError::UnknownType(event_type));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            event_type,
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake accepted
    #[serde(rename_all = "camelCase")]
    Connected {
        conversation_id: ConversationId,
        timestamp: String,
    },

    /// Persisted chat message
    Message { data: ChatMessageData },

    /// Someone started or stopped typing
    Typing { data: TypingData },

    /// A participant announced itself
    ParticipantJoined { data: ParticipantJoinedData },

    /// Error scoped to the receiving connection
    Error { error: String },

    /// Heartbeat response
    Pong,
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// The `type` tag this event serializes with
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Message { .. } => "message",
            Self::Typing { .. } => "typing",
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
        }
    }
}

// =============================================================================
// Event Data Structures
// =============================================================================

/// Chat message as recorded by the persistence API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageData {
    pub id: String,
    pub content: String,
    pub role: MessageRole,
    /// Creation time exactly as the persistence API reported it
    pub timestamp: String,
    pub sender: SenderInfo,
}

/// Message author details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingData {
    pub participant_id: ParticipantId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantJoinedData {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub timestamp: String,
}
