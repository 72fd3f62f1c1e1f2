//! Connection seam between the driver and the network

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use deskrelay_shared::{close_codes, ClientEvent, ServerEvent};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::ConnectError;

/// How long an attempt waits for the relay's `connected` acknowledgment
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// What an established session yields
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Frame(ServerEvent),
    /// The socket closed; `code` is absent when it dropped without a close frame
    Closed { code: Option<u16> },
}

/// An established, acknowledged connection
#[async_trait]
pub trait Session: Send {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), ConnectError>;

    /// Next frame or the close; never resolves again after `Closed`
    async fn next_event(&mut self) -> SessionEvent;

    async fn close(&mut self, code: u16);
}

/// Opens sessions using a session token
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session + 'static;

    /// Connect and wait for the acknowledgment; a handshake rejection is an error
    async fn connect(&self, token: &str) -> Result<Self::Session, ConnectError>;
}

/// Connects to a relay's `/ws` endpoint
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    /// `url` is the gateway endpoint, e.g. `wss://relay.example.com/ws`
    pub fn new(url: &str) -> Result<Self, ConnectError> {
        let url = Url::parse(url).map_err(|e| ConnectError::InvalidUrl(e.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(ConnectError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            ))),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Session = WsSession;

    async fn connect(&self, token: &str) -> Result<WsSession, ConnectError> {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", token);

        let (mut stream, _) = connect_async(url.as_str()).await?;

        // Room traffic that races ahead of the acknowledgment is kept for the session
        let mut early = VecDeque::new();
        let ack = tokio::time::timeout(ACK_TIMEOUT, async {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(ServerEvent::Connected {
                                conversation_id, ..
                            }) => return Ok(conversation_id),
                            Ok(other) => {
                                tracing::debug!(kind = other.kind(), "Frame arrived before acknowledgment");
                                early.push_back(other);
                            }
                            Err(e) => return Err(ConnectError::Protocol(e.to_string())),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(match frame {
                            Some(frame) => ConnectError::Rejected {
                                code: u16::from(frame.code),
                                reason: frame.reason.to_string(),
                            },
                            None => ConnectError::Closed,
                        });
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(ConnectError::WebSocket(e)),
                    None => return Err(ConnectError::Closed),
                }
            }
        })
        .await
        .map_err(|_| ConnectError::Timeout)??;

        tracing::debug!(conversation_id = %ack, "Relay acknowledged connection");
        Ok(WsSession {
            stream,
            pending: early,
            closed: false,
        })
    }
}

/// Live socket to the relay
pub struct WsSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Frames received before the acknowledgment, delivered first
    pending: VecDeque<ServerEvent>,
    closed: bool,
}

#[async_trait]
impl Session for WsSession {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), ConnectError> {
        let text = serde_json::to_string(event).map_err(|e| ConnectError::Protocol(e.to_string()))?;
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> SessionEvent {
        if let Some(event) = self.pending.pop_front() {
            return SessionEvent::Frame(event);
        }
        if self.closed {
            return std::future::pending().await;
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => return SessionEvent::Frame(event),
                    Err(e) => {
                        tracing::warn!(error = %e, "Ignoring unrecognized relay frame");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    self.closed = true;
                    return SessionEvent::Closed {
                        code: frame.map(|f| u16::from(f.code)),
                    };
                }
                // Pings are answered by tungstenite on the next read/write
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Relay socket error");
                    self.closed = true;
                    return SessionEvent::Closed { code: None };
                }
                None => {
                    self.closed = true;
                    return SessionEvent::Closed { code: None };
                }
            }
        }
    }

    async fn close(&mut self, code: u16) {
        if self.closed {
            return;
        }
        self.closed = true;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: if code == close_codes::NORMAL {
                "client disconnect".into()
            } else {
                "".into()
            },
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            tracing::debug!(error = %e, "Failed to close relay socket cleanly");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_requires_websocket_scheme() {
        assert!(WsConnector::new("wss://relay.example.com/ws").is_ok());
        assert!(matches!(
            WsConnector::new("https://relay.example.com/ws"),
            Err(ConnectError::InvalidUrl(_))
        ));
        assert!(matches!(
            WsConnector::new("not a url"),
            Err(ConnectError::InvalidUrl(_))
        ));
    }

    /// Serves one socket that sends `frames` and then stays open
    async fn scripted_relay(frames: Vec<String>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(tcp).await.unwrap();
            for frame in frames {
                socket.send(Message::Text(frame)).await.unwrap();
            }
            while socket.next().await.is_some() {}
        });
        format!("ws://{}/ws", addr)
    }

    #[tokio::test]
    async fn test_frames_before_ack_are_kept() {
        let url = scripted_relay(vec![
            r#"{"type":"typing","data":{"participantId":"agent-1","isTyping":true}}"#.to_string(),
            r#"{"type":"connected","conversationId":"conv-1","timestamp":"2024-01-01T00:00:00Z"}"#
                .to_string(),
        ])
        .await;

        let connector = WsConnector::new(&url).unwrap();
        let mut session = connector.connect("token").await.unwrap();
        assert_eq!(
            session.next_event().await,
            SessionEvent::Frame(ServerEvent::Typing {
                data: deskrelay_shared::TypingData {
                    participant_id: deskrelay_shared::ParticipantId::from("agent-1"),
                    is_typing: true,
                }
            })
        );
        session.close(close_codes::NORMAL).await;
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_connect_error() {
        let connector = WsConnector::new("ws://127.0.0.1:1/ws").unwrap();
        assert!(matches!(
            connector.connect("token").await,
            Err(ConnectError::WebSocket(_))
        ));
    }
}
