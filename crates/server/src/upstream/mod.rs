//! Client side of the upstream application API
//!
//! The relay owns no conversation history. Chat messages are persisted and
//! participant profiles are resolved through a narrow, secret-gated HTTP API.

pub mod client;

use async_trait::async_trait;
use deskrelay_shared::{ChatMessageData, MessageRole, ParticipantId, SenderInfo};
use serde::{Deserialize, Serialize};

pub use client::HttpConversationApi;

/// Header carrying the shared secret on every upstream call
pub const SECRET_HEADER: &str = "X-Internal-Secret";

/// Message to persist, as submitted by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub conversation_id: String,
    pub content: String,
    /// Uppercase API form, e.g. `USER`
    pub role: String,
    pub participant_id: String,
}

impl NewMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        participant_id: impl Into<String>,
        content: impl Into<String>,
        role: MessageRole,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            content: content.into(),
            role: role.as_api_str().to_string(),
            participant_id: participant_id.into(),
        }
    }
}

/// Canonical record returned by the persistence API
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessage {
    pub id: String,
    pub content: String,
    pub role: MessageRole,
    pub created_at: String,
    pub sender: SenderInfo,
}

impl From<PersistedMessage> for ChatMessageData {
    fn from(record: PersistedMessage) -> Self {
        Self {
            id: record.id,
            content: record.content,
            role: record.role,
            timestamp: record.created_at,
            sender: record.sender,
        }
    }
}

/// Participant profile used for join announcements
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantProfile {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ParticipantProfile {
    /// Preferred display name, `displayName` first, then `name`
    pub fn resolved_name(&self) -> Option<&str> {
        [self.display_name.as_deref(), self.name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|n| !n.is_empty())
    }
}

/// Persistence and lookup operations the relay depends on
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Durably record a chat message, returning the canonical record
    async fn save_message(&self, message: &NewMessage) -> UpstreamResult<PersistedMessage>;

    /// Look up a participant's profile
    async fn participant(&self, participant_id: &ParticipantId)
        -> UpstreamResult<ParticipantProfile>;
}

/// Error type for upstream API calls
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response from upstream: {0}")]
    InvalidResponse(String),

    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),
}

impl UpstreamError {
    /// Returns true if this error is transient and a retry may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Http(e) => e.is_timeout() || e.is_connect(),
            UpstreamError::Status { status, .. } => *status >= 500 || *status == 429,
            UpstreamError::InvalidResponse(_) => false,
            UpstreamError::InvalidUrl(_) => false,
        }
    }
}

/// Result type for upstream API calls
pub type UpstreamResult<T> = Result<T, UpstreamError>;
