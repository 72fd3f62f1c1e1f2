//! Client error types

/// Errors surfaced to users of the reconnecting client
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The socket is not currently established; nothing was sent
    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    Send(#[source] ConnectError),
}

/// Why a single connection attempt or session operation failed
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The relay closed the handshake with a rejection code (4001-4004)
    #[error("Handshake rejected with close code {code}: {reason}")]
    Rejected { code: u16, reason: String },

    #[error("Token unavailable: {0}")]
    Token(#[from] TokenSourceError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out waiting for the connection acknowledgment")]
    Timeout,

    #[error("Connection closed")]
    Closed,
}

/// Token retrieval failures
#[derive(Debug, thiserror::Error)]
pub enum TokenSourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token endpoint returned {0}")]
    Status(u16),

    #[error("Token endpoint returned an empty token")]
    Empty,
}
