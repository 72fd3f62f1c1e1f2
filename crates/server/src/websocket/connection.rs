//! WebSocket connection management
//!
//! Represents an authenticated WebSocket connection and its outbound queue.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use deskrelay_shared::{ConversationId, ParticipantId, ParticipantRole, ServerEvent, SessionId};
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::auth::VerifiedIdentity;

/// Instruction for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized JSON text frame
    Frame(String),
    /// Protocol-level ping
    Ping,
    /// Send a close frame and stop writing
    Close { code: u16, reason: &'static str },
}

/// The writer task is gone; the socket is closed or closing
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// Why an event was not queued for this connection
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Closed(#[from] ConnectionClosed),

    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Represents an active, authenticated WebSocket connection
#[derive(Debug)]
pub struct Connection {
    /// Unique session ID for this connection
    pub session_id: SessionId,

    /// Room this connection belongs to, fixed at handshake
    pub conversation_id: ConversationId,

    pub participant_id: ParticipantId,
    pub role: ParticipantRole,
    pub authenticated: bool,
    pub connected_at: OffsetDateTime,

    /// Unix seconds of the last inbound frame
    last_activity: AtomicI64,

    /// Cleared by each liveness sweep, set again by a pong
    alive: AtomicBool,

    /// Channel to this connection's writer task
    sender: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    /// Create a connection for a verified identity
    pub fn new(identity: &VerifiedIdentity, sender: mpsc::UnboundedSender<Outbound>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            session_id: SessionId::new(),
            conversation_id: identity.conversation_id.clone(),
            participant_id: identity.participant_id.clone(),
            role: identity.role,
            authenticated: identity.authenticated,
            connected_at: now,
            last_activity: AtomicI64::new(now.unix_timestamp()),
            alive: AtomicBool::new(true),
            sender,
        }
    }

    /// Send an event to this connection
    pub fn send(&self, event: &ServerEvent) -> Result<(), SendError> {
        let json = serde_json::to_string(event)?;
        self.send_text(json)?;
        Ok(())
    }

    /// Queue an already-serialized text frame
    pub fn send_text(&self, text: String) -> Result<(), ConnectionClosed> {
        self.sender
            .send(Outbound::Frame(text))
            .map_err(|_| ConnectionClosed)
    }

    /// Queue a protocol ping
    pub fn ping(&self) -> Result<(), ConnectionClosed> {
        self.sender.send(Outbound::Ping).map_err(|_| ConnectionClosed)
    }

    /// Ask the writer to close the socket with `code`
    ///
    /// Frames queued earlier are flushed first; anything queued later is dropped.
    pub fn close(&self, code: u16, reason: &'static str) {
        let _ = self.sender.send(Outbound::Close { code, reason });
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Record inbound traffic
    pub fn touch(&self) {
        self.last_activity
            .store(OffsetDateTime::now_utc().unix_timestamp(), Ordering::Relaxed);
    }

    /// A pong (or application ping) proved the peer is alive
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
        self.touch();
    }

    /// Clear the liveness flag, returning whether it was set
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn last_activity_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or(self.connected_at)
    }
}
