//! Error types for the DeskRelay wire protocol

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON frame: {0}")]
    InvalidJson(String),

    #[error("Frame is missing a \"type\" field")]
    MissingType,

    #[error("Unrecognized event type: {0}")]
    UnknownType(String),

    #[error("Invalid {event_type} payload: {reason}")]
    InvalidPayload { event_type: String, reason: String },

    #[error("Unrecognized role: {0}")]
    UnknownRole(String),
}
