//! Common types used across DeskRelay

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ProtocolError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Conversation ID wrapper
///
/// Conversation ids are issued by the upstream application and are opaque to
/// the relay (e.g. `conv-42`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Participant ID wrapper (customer or agent)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Per-socket session ID, unique within a relay process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Who a connected participant is, as established by the token issuer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Customer,
    Agent,
}

impl FromStr for ParticipantRole {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "customer" => Ok(Self::Customer),
            "agent" => Ok(Self::Agent),
            _ => Err(ProtocolError::UnknownRole(s.to_string())),
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Customer => f.write_str("customer"),
            Self::Agent => f.write_str("agent"),
        }
    }
}

/// Author role of a chat message
///
/// Parsed case-insensitively. Serialized lowercase on the wire; the upstream
/// persistence API uses the uppercase form (see [`MessageRole::as_api_str`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum MessageRole {
    User,
    Agent,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_api_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Agent => "AGENT",
            Self::Assistant => "ASSISTANT",
            Self::System => "SYSTEM",
        }
    }
}

impl FromStr for MessageRole {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USER" => Ok(Self::User),
            "AGENT" => Ok(Self::Agent),
            "ASSISTANT" => Ok(Self::Assistant),
            "SYSTEM" => Ok(Self::System),
            _ => Err(ProtocolError::UnknownRole(s.to_string())),
        }
    }
}

impl TryFrom<String> for MessageRole {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// =============================================================================
// Session Token
// =============================================================================

/// Claims carried by a session token
///
/// Tokens are issued and refreshed outside the relay; the relay only checks the
/// signature, the expiry and that the identity fields are usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub participant_id: String,
    pub conversation_id: String,
    /// "customer" or "agent"
    pub role: String,
    #[serde(default)]
    pub authenticated: bool,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

// =============================================================================
// Close Codes
// =============================================================================

/// WebSocket close codes used by the relay
pub mod close_codes {
    /// Intentional teardown
    pub const NORMAL: u16 = 1000;
    /// Server shutting down
    pub const GOING_AWAY: u16 = 1001;
    /// Handshake carried no token
    pub const MISSING_TOKEN: u16 = 4001;
    /// Token signature valid but expired
    pub const TOKEN_EXPIRED: u16 = 4002;
    /// Token could not be decoded or its signature did not verify
    pub const INVALID_TOKEN: u16 = 4003;
    /// Token verified but its identity payload is unusable
    pub const MALFORMED_IDENTITY: u16 = 4004;

    /// Whether a close code signals a rejected handshake
    pub fn is_handshake_rejection(code: u16) -> bool {
        (MISSING_TOKEN..=MALFORMED_IDENTITY).contains(&code)
    }
}

/// Current UTC time as an RFC 3339 string
pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}
