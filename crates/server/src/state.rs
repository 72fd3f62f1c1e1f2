//! Shared application state

use std::sync::Arc;
use std::time::Instant;

use crate::auth::TokenVerifier;
use crate::bus::{self, BroadcastBus, BusError};
use crate::config::Config;
use crate::upstream::{ConversationApi, HttpConversationApi, UpstreamError};
use crate::websocket::{MessagePipeline, RoomRegistry};

/// State handed to every route
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub verifier: Arc<TokenVerifier>,
    pub bus: Arc<dyn BroadcastBus>,
    pub registry: Arc<RoomRegistry>,
    pub pipeline: Arc<MessagePipeline>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire up the relay from configuration
    ///
    /// Must run inside a Tokio runtime: the room registry starts its bus
    /// dispatcher immediately.
    pub fn from_config(config: Config) -> Result<Self, StartupError> {
        let bus = bus::from_config(&config.broker)?;
        let api: Arc<dyn ConversationApi> = Arc::new(HttpConversationApi::new(
            &config.api_base_url,
            &config.internal_api_secret,
            config.upstream_timeout,
        )?);
        Ok(Self::with_parts(config, bus, api))
    }

    /// Build state around an existing bus and persistence API
    pub fn with_parts(
        config: Config,
        bus: Arc<dyn BroadcastBus>,
        api: Arc<dyn ConversationApi>,
    ) -> Self {
        let registry = RoomRegistry::new(config.instance_id.clone(), Arc::clone(&bus));
        let pipeline = MessagePipeline::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            api,
            config.max_message_length,
        );

        Self {
            verifier: Arc::new(TokenVerifier::new(&config.ws_token_secret)),
            config: Arc::new(config),
            bus,
            registry,
            pipeline: Arc::new(pipeline),
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Failed to initialize broker: {0}")]
    Bus(#[from] BusError),
    #[error("Failed to initialize upstream API client: {0}")]
    Upstream(#[from] UpstreamError),
}
