//! Health check endpoints

use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub instance_id: String,
    pub uptime_secs: u64,
    pub connections: usize,
    pub rooms: BTreeMap<String, usize>,
    /// Resident set size of this process, when the platform reports it
    pub memory_bytes: Option<u64>,
    pub broker: BrokerHealth,
}

#[derive(Debug, Serialize)]
pub struct BrokerHealth {
    pub transport: &'static str,
    pub reachable: bool,
}

/// Health check endpoint
///
/// Always 200 while the process serves; a broker outage only degrades
/// cross-instance delivery, so it is reported as `degraded`.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let reachable = match state.bus.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, transport = state.bus.transport(), "Broker health check failed");
            false
        }
    };

    let rooms = state.registry.room_sizes().await;
    Json(HealthResponse {
        status: if reachable { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        instance_id: state.config.instance_id.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        connections: rooms.values().sum(),
        rooms,
        memory_bytes: current_process_memory_bytes(),
        broker: BrokerHealth {
            transport: state.bus.transport(),
            reachable,
        },
    })
}

/// Liveness probe (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: ready only while the broker is reachable
pub async fn readiness(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state
        .bus
        .ping()
        .await
        .map(|()| StatusCode::OK)
        .map_err(|e| ApiError::ServiceUnavailable(format!("broker unreachable: {}", e)))
}

fn current_process_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    system.process(pid).map(sysinfo::Process::memory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BroadcastBus, BusError, BusMessage, BusResult, EnvelopeSink, MemoryBus, Subscription};
    use crate::config::{BrokerConfig, Config, LogFormat};
    use crate::routes::create_router;
    use crate::upstream::HttpConversationApi;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use deskrelay_shared::ConversationId;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct UnreachableBus;

    #[async_trait]
    impl BroadcastBus for UnreachableBus {
        fn transport(&self) -> &'static str {
            "redis"
        }
        async fn publish(&self, _: &ConversationId, _: &BusMessage) -> BusResult<()> {
            Err(BusError::Closed)
        }
        fn subscribe(&self, conversation_id: &ConversationId, _: EnvelopeSink) -> Subscription {
            Subscription::from_fn(conversation_id.to_string(), || {})
        }
        async fn ping(&self) -> BusResult<()> {
            Err(BusError::Closed)
        }
    }

    fn config() -> Config {
        Config {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            instance_id: "relay-test".to_string(),
            allowed_origins: Vec::new(),
            log_format: LogFormat::Pretty,
            ws_token_secret: "test-token-secret-must-be-at-least-32-characters".to_string(),
            api_base_url: "http://127.0.0.1:1".to_string(),
            internal_api_secret: "internal".to_string(),
            upstream_timeout: Duration::from_secs(1),
            broker: BrokerConfig::Memory,
            heartbeat_interval: Duration::from_secs(30),
            max_message_length: 4000,
        }
    }

    fn state_with(bus: Arc<dyn BroadcastBus>) -> AppState {
        let api = HttpConversationApi::new("http://127.0.0.1:1", "internal", Duration::from_secs(1))
            .unwrap();
        AppState::with_parts(config(), bus, Arc::new(api))
    }

    async fn get(state: AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = create_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health_reports_rooms_and_broker() {
        let state = state_with(Arc::new(MemoryBus::new()));
        let (conn, _rx) = crate::websocket::connection::tests::connection("conv-1", "cust-1");
        state.registry.join(conn).await;

        let (status, body) = get(state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["instanceId"], "relay-test");
        assert_eq!(body["connections"], 1);
        assert_eq!(body["rooms"]["conv-1"], 1);
        assert_eq!(body["broker"]["transport"], "memory");
        assert_eq!(body["broker"]["reachable"], true);
    }

    #[tokio::test]
    async fn test_broker_outage_degrades_health_and_fails_readiness() {
        let (status, body) = get(state_with(Arc::new(UnreachableBus)), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["broker"]["reachable"], false);

        let (status, body) = get(state_with(Arc::new(UnreachableBus)), "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_liveness_and_readiness_ok() {
        let (status, _) = get(state_with(Arc::new(MemoryBus::new())), "/health/live").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get(state_with(Arc::new(MemoryBus::new())), "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_not_found() {
        let (status, body) = get(state_with(Arc::new(MemoryBus::new())), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }
}
