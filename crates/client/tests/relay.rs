//! Reconnecting client against a live relay

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use deskrelay_client::{
    BackoffPolicy, ConnectionState, DriverEvent, ReconnectingClient, TokenSource,
    TokenSourceError, WsConnector,
};
use deskrelay_server::bus::{MemoryBroker, MemoryBus};
use deskrelay_server::config::{BrokerConfig, Config, LogFormat};
use deskrelay_server::routes::create_router;
use deskrelay_server::upstream::HttpConversationApi;
use deskrelay_server::AppState;
use deskrelay_shared::{ClientEvent, ConversationId, ParticipantId, ServerEvent, TypingData};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedReceiver;

const SECRET: &str = "client-integration-secret-at-least-32-chars";

async fn spawn_relay() -> (SocketAddr, AppState) {
    let config = Config {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        instance_id: "relay-client-test".to_string(),
        allowed_origins: Vec::new(),
        log_format: LogFormat::Pretty,
        ws_token_secret: SECRET.to_string(),
        api_base_url: "http://127.0.0.1:1".to_string(),
        internal_api_secret: "internal".to_string(),
        upstream_timeout: Duration::from_secs(1),
        broker: BrokerConfig::Memory,
        heartbeat_interval: Duration::from_secs(30),
        max_message_length: 4000,
    };
    let api =
        HttpConversationApi::new("http://127.0.0.1:1", "internal", Duration::from_secs(1)).unwrap();
    let bus = MemoryBus::with_broker(Arc::new(MemoryBroker::default()));
    let state = AppState::with_parts(config, Arc::new(bus), Arc::new(api));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(state.clone());
    tokio::spawn(async move { axum::serve(listener, app).await });

    (addr, state)
}

fn token(participant: &str, exp_offset: i64) -> String {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    encode(
        &Header::default(),
        &json!({
            "participantId": participant,
            "conversationId": "conv-client",
            "role": "customer",
            "authenticated": true,
            "exp": now + exp_offset,
            "iat": now,
        }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

/// Hands out queued tokens, then valid ones
struct QueuedTokens {
    participant: String,
    queue: Mutex<VecDeque<String>>,
}

impl QueuedTokens {
    fn new(participant: &str, queued: Vec<String>) -> Self {
        Self {
            participant: participant.to_string(),
            queue: Mutex::new(queued.into()),
        }
    }
}

#[async_trait]
impl TokenSource for QueuedTokens {
    async fn fetch_token(&self) -> Result<String, TokenSourceError> {
        let queued = self.queue.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| token(&self.participant, 3600)))
    }
}

fn policy() -> BackoffPolicy {
    BackoffPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        max_attempts: 5,
    }
}

async fn wait_for_room_size(state: &AppState, expected: usize) {
    let conv = ConversationId::from("conv-client");
    for _ in 0..100 {
        if state.registry.room_size(&conv).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("room never reached {} members", expected);
}

async fn next_frame(events: &mut UnboundedReceiver<DriverEvent>) -> ServerEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("driver stopped");
        if let DriverEvent::Frame(frame) = event {
            return frame;
        }
    }
}

#[tokio::test]
async fn test_expired_token_then_fresh_token_connects() {
    let (addr, state) = spawn_relay().await;
    let connector = WsConnector::new(&format!("ws://{}/ws", addr)).unwrap();
    let tokens = QueuedTokens::new("cust-1", vec![token("cust-1", -3600)]);

    let (mut client, mut events) = ReconnectingClient::spawn(connector, tokens, policy());
    assert_eq!(
        client.wait_for(ConnectionState::Connected).await,
        ConnectionState::Connected
    );

    let mut scheduled = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, DriverEvent::ReconnectScheduled { .. }) {
            scheduled += 1;
        }
    }
    assert_eq!(scheduled, 1);
    wait_for_room_size(&state, 1).await;

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    wait_for_room_size(&state, 0).await;
}

#[tokio::test]
async fn test_typing_reaches_the_other_participant() {
    let (addr, state) = spawn_relay().await;
    let url = format!("ws://{}/ws", addr);

    let (mut customer, _customer_events) = ReconnectingClient::spawn(
        WsConnector::new(&url).unwrap(),
        QueuedTokens::new("cust-1", Vec::new()),
        policy(),
    );
    let (mut agent, mut agent_events) = ReconnectingClient::spawn(
        WsConnector::new(&url).unwrap(),
        QueuedTokens::new("agent-1", Vec::new()),
        policy(),
    );
    customer.wait_for(ConnectionState::Connected).await;
    agent.wait_for(ConnectionState::Connected).await;
    wait_for_room_size(&state, 2).await;

    customer
        .send(ClientEvent::Typing { is_typing: true })
        .await
        .unwrap();

    assert_eq!(
        next_frame(&mut agent_events).await,
        ServerEvent::Typing {
            data: TypingData {
                participant_id: ParticipantId::from("cust-1"),
                is_typing: true,
            }
        }
    );

    customer.disconnect().await;
    agent.disconnect().await;
}

#[tokio::test]
async fn test_relay_shutdown_triggers_reconnect() {
    let (addr, state) = spawn_relay().await;
    let connector = WsConnector::new(&format!("ws://{}/ws", addr)).unwrap();

    let (mut client, mut events) = ReconnectingClient::spawn(
        connector,
        QueuedTokens::new("cust-1", Vec::new()),
        policy(),
    );
    client.wait_for(ConnectionState::Connected).await;
    wait_for_room_size(&state, 1).await;

    state.registry.close_all(1001, "server shutting down").await;

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no reconnection scheduled")
            .expect("driver stopped");
        if matches!(event, DriverEvent::ReconnectScheduled { .. }) {
            break;
        }
    }
    assert_eq!(
        client.wait_for(ConnectionState::Connected).await,
        ConnectionState::Connected
    );
    client.disconnect().await;
}
