//! Inbound frame processing
//!
//! Every client frame goes through here: parse, validate, persist when needed,
//! build the broadcast envelope, deliver locally, then publish to the bus.

use std::sync::Arc;

use deskrelay_shared::{
    now_rfc3339, ChatMessageData, ClientEvent, MessageRole, ParticipantJoinedData,
    ProtocolError, ServerEvent, SessionId, TypingData,
};

use super::connection::{Connection, SendError};
use super::room::RoomRegistry;
use crate::bus::{BroadcastBus, BusMessage};
use crate::envelope::BroadcastEnvelope;
use crate::upstream::{ConversationApi, NewMessage, UpstreamError};

/// Why a frame produced an error reply instead of a broadcast
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Message content is empty")]
    EmptyContent,

    #[error("Message exceeds {max} characters")]
    ContentTooLong { max: usize },

    #[error("Failed to save message")]
    Persistence(#[source] UpstreamError),

    #[error("Failed to resolve participant")]
    ParticipantLookup(#[source] UpstreamError),

    #[error("Participant has no display name")]
    MissingDisplayName,
}

/// Turns client frames into broadcasts
pub struct MessagePipeline {
    registry: Arc<RoomRegistry>,
    bus: Arc<dyn BroadcastBus>,
    api: Arc<dyn ConversationApi>,
    max_message_length: usize,
}

impl MessagePipeline {
    pub fn new(
        registry: Arc<RoomRegistry>,
        bus: Arc<dyn BroadcastBus>,
        api: Arc<dyn ConversationApi>,
        max_message_length: usize,
    ) -> Self {
        Self {
            registry,
            bus,
            api,
            max_message_length,
        }
    }

    /// Process one text frame from `conn`
    ///
    /// Failures are reported to the sender only; the connection stays open.
    pub async fn handle_frame(&self, conn: &Connection, text: &str) {
        let result = match ClientEvent::parse(text) {
            Ok(event) => self.handle_event(conn, event).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = result {
            match &e {
                PipelineError::Persistence(source) | PipelineError::ParticipantLookup(source) => {
                    tracing::warn!(
                        session_id = %conn.session_id,
                        conversation_id = %conn.conversation_id,
                        error = %source,
                        "{}",
                        e
                    );
                }
                PipelineError::MissingDisplayName => {
                    tracing::warn!(
                        session_id = %conn.session_id,
                        participant_id = %conn.participant_id,
                        "Participant profile has no display name"
                    );
                }
                _ => {
                    tracing::debug!(
                        session_id = %conn.session_id,
                        error = %e,
                        "Rejected client frame"
                    );
                }
            }
            reply(conn, &ServerEvent::error(e.to_string()));
        }
    }

    /// Process an already-parsed event
    pub async fn handle_event(&self, conn: &Connection, event: ClientEvent) -> Result<(), PipelineError> {
        match event {
            ClientEvent::Message { content, role } => self.chat_message(conn, content, &role).await,
            ClientEvent::Typing { is_typing } => {
                self.typing(conn, is_typing).await;
                Ok(())
            }
            ClientEvent::ParticipantJoined => self.participant_joined(conn).await,
            ClientEvent::Ping => {
                conn.mark_alive();
                reply(conn, &ServerEvent::Pong);
                Ok(())
            }
        }
    }

    async fn chat_message(
        &self,
        conn: &Connection,
        content: String,
        role: &str,
    ) -> Result<(), PipelineError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(PipelineError::EmptyContent);
        }
        if content.chars().count() > self.max_message_length {
            return Err(PipelineError::ContentTooLong {
                max: self.max_message_length,
            });
        }
        let role: MessageRole = role.parse()?;

        let record = self
            .api
            .save_message(&NewMessage::new(
                conn.conversation_id.as_str(),
                conn.participant_id.as_str(),
                content,
                role,
            ))
            .await
            .map_err(PipelineError::Persistence)?;

        tracing::debug!(
            session_id = %conn.session_id,
            conversation_id = %conn.conversation_id,
            message_id = %record.id,
            "Message persisted"
        );

        let data = ChatMessageData::from(record);
        self.fan_out(
            BroadcastEnvelope::new(conn.conversation_id.clone(), ServerEvent::Message { data }),
            None,
        )
        .await;
        Ok(())
    }

    async fn typing(&self, conn: &Connection, is_typing: bool) {
        let envelope = BroadcastEnvelope::new(
            conn.conversation_id.clone(),
            ServerEvent::Typing {
                data: TypingData {
                    participant_id: conn.participant_id.clone(),
                    is_typing,
                },
            },
        );
        self.fan_out(envelope, Some(conn.session_id)).await;
    }

    async fn participant_joined(&self, conn: &Connection) -> Result<(), PipelineError> {
        let profile = self
            .api
            .participant(&conn.participant_id)
            .await
            .map_err(PipelineError::ParticipantLookup)?;

        let display_name = profile
            .resolved_name()
            .ok_or(PipelineError::MissingDisplayName)?
            .to_string();

        let envelope = BroadcastEnvelope::new(
            conn.conversation_id.clone(),
            ServerEvent::ParticipantJoined {
                data: ParticipantJoinedData {
                    participant_id: conn.participant_id.clone(),
                    display_name,
                    timestamp: now_rfc3339(),
                },
            },
        );
        self.fan_out(envelope, None).await;
        Ok(())
    }

    /// Deliver to this process's room, then to every other instance
    ///
    /// A bus failure only costs cross-instance delivery.
    async fn fan_out(&self, envelope: BroadcastEnvelope, exclude: Option<SessionId>) {
        self.registry.broadcast_local(&envelope, exclude).await;

        let conversation_id = envelope.conversation_id().clone();
        let message = BusMessage::new(self.registry.instance_id(), envelope, exclude);
        if let Err(e) = self.bus.publish(&conversation_id, &message).await {
            tracing::warn!(
                conversation_id = %conversation_id,
                transport = self.bus.transport(),
                error = %e,
                "Bus publish failed - cross-instance delivery degraded"
            );
        }
    }
}

/// Answer the sender; a closed socket just loses the reply
fn reply(conn: &Connection, event: &ServerEvent) {
    if let Err(SendError::Serialize(e)) = conn.send(event) {
        tracing::error!(session_id = %conn.session_id, error = %e, kind = event.kind(), "Failed to serialize reply");
    }
}
