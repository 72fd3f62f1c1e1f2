//! Cross-instance broadcast bus
//!
//! Unifies every relay process into one broadcast domain per conversation.
//!
//! # Transports
//!
//! - **Redis**: native pub/sub, one dedicated connection per subscription
//! - **REST list**: bounded list per channel on a REST command API, polled at a
//!   fixed interval (portable, higher latency)
//! - **Memory**: process-local broker for single-instance deployments and tests
//!
//! All three sit behind [`BroadcastBus`], so the room registry's subscription
//! lifecycle does not know which one is deployed.

pub mod memory;
pub mod redis_pubsub;
pub mod rest;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deskrelay_shared::{ConversationId, SessionId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_retry::strategy::ExponentialBackoff;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::envelope::BroadcastEnvelope;

pub use self::memory::{MemoryBroker, MemoryBus};
pub use self::redis_pubsub::RedisBus;
pub use self::rest::RestListBus;

/// Prefix of every conversation channel name
pub const CHANNEL_PREFIX: &str = "deskrelay:conversation:";

/// Longest wait between broker reconnection attempts
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Channel name for a conversation
pub fn channel_name(conversation_id: &ConversationId) -> String {
    format!("{}{}", CHANNEL_PREFIX, conversation_id)
}

/// Delay before broker reconnection attempt `attempt` (0-based): 500ms doubling, capped
pub(crate) fn reconnect_delay(attempt: usize) -> Duration {
    ExponentialBackoff::from_millis(2)
        .factor(250)
        .max_delay(MAX_RECONNECT_DELAY)
        .nth(attempt)
        .unwrap_or(MAX_RECONNECT_DELAY)
}

/// What travels over the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    /// Unique per publish, used by polling transports to skip entries already seen
    pub id: Uuid,
    /// Instance id of the publishing relay
    pub origin: String,
    /// Connection on the origin instance that must not receive this envelope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<SessionId>,
    pub envelope: BroadcastEnvelope,
}

impl BusMessage {
    pub fn new(origin: &str, envelope: BroadcastEnvelope, exclude: Option<SessionId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin: origin.to_string(),
            exclude,
            envelope,
        }
    }
}

/// Receives every message published on a subscribed channel
pub type EnvelopeSink = mpsc::UnboundedSender<BusMessage>;

/// Handle for one channel subscription
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
    channel: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Subscription backed by a listener task; releasing aborts the task
    pub fn from_task(channel: String, task: JoinHandle<()>) -> Self {
        Self::from_fn(channel, move || task.abort())
    }

    /// Subscription released by running `release`
    pub fn from_fn(channel: String, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            channel,
            release: Some(Box::new(release)),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stop receiving messages for this channel
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            tracing::debug!(channel = %self.channel, "Bus subscription released");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// Pub/sub seam between relay processes
#[async_trait]
pub trait BroadcastBus: Send + Sync {
    /// Short transport name reported by the health endpoint
    fn transport(&self) -> &'static str;

    /// Publish to the conversation's channel
    async fn publish(&self, conversation_id: &ConversationId, message: &BusMessage)
        -> BusResult<()>;

    /// Deliver every message published on the conversation's channel to `sink`,
    /// including messages this process published.
    ///
    /// Never blocks on the network: the transport establishes and maintains the
    /// subscription in the background.
    fn subscribe(&self, conversation_id: &ConversationId, sink: EnvelopeSink) -> Subscription;

    /// Check broker reachability
    async fn ping(&self) -> BusResult<()>;
}

/// Build the transport selected by configuration
pub fn from_config(config: &BrokerConfig) -> BusResult<Arc<dyn BroadcastBus>> {
    let bus: Arc<dyn BroadcastBus> = match config {
        BrokerConfig::Redis { url } => Arc::new(RedisBus::new(url)?),
        BrokerConfig::RestList {
            url,
            token,
            poll_interval,
            capacity,
        } => Arc::new(RestListBus::new(url, token, *poll_interval, *capacity)?),
        BrokerConfig::Memory => Arc::new(MemoryBus::new()),
    };
    Ok(bus)
}

/// Error type for broker operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Broker rejected command: {0}")]
    Rejected(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    #[error("Subscription stream closed")]
    Closed,

    #[error("Broker did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Broker unavailable after a recent connection failure")]
    Unavailable,
}

/// Result type for broker operations
pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_channel_name_is_deterministic() {
        let id = ConversationId::from("conv-42");
        assert_eq!(channel_name(&id), "deskrelay:conversation:conv-42");
        assert_eq!(channel_name(&id), channel_name(&id.clone()));
    }

    #[test]
    fn test_reconnect_delay_grows_and_caps() {
        assert_eq!(reconnect_delay(0), Duration::from_millis(500));
        assert_eq!(reconnect_delay(1), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(2), Duration::from_millis(2000));
        assert_eq!(reconnect_delay(50), MAX_RECONNECT_DELAY);
    }

    #[test]
    fn test_subscription_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let sub = Subscription::from_fn("ch".to_string(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(sub.channel(), "ch");

        sub.unsubscribe();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_subscription_releases() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        {
            let _sub = Subscription::from_fn("ch".to_string(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bus_message_wire_form() {
        let envelope = BroadcastEnvelope::new(
            ConversationId::from("conv-1"),
            deskrelay_shared::ServerEvent::Pong,
        );
        let message = BusMessage::new("relay-a", envelope, None);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["origin"], "relay-a");
        assert!(json.get("exclude").is_none());

        let decoded: BusMessage = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, message);
    }
}
