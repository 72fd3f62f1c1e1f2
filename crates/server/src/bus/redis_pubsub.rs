//! Redis pub/sub transport

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deskrelay_shared::ConversationId;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::OnceCell;

use super::{
    channel_name, reconnect_delay, BroadcastBus, BusError, BusMessage, BusResult, EnvelopeSink,
    Subscription,
};

/// Longest wait for the publisher connection to come up
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest wait for a single command reply
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// After a failed connect, calls fail immediately for this long
const CONNECT_COOLDOWN: Duration = Duration::from_secs(5);

/// Redis-backed bus
///
/// Publishing shares one lazily-established connection manager. Every
/// subscription owns a dedicated pub/sub connection (Redis requires it) kept
/// alive by a background task that reconnects with backoff.
pub struct RedisBus {
    client: Client,
    publisher: OnceCell<ConnectionManager>,
    last_connect_failure: Mutex<Option<Instant>>,
}

impl RedisBus {
    /// Parses the URL only; no connection is made until first use
    pub fn new(url: &str) -> BusResult<Self> {
        Ok(Self {
            client: Client::open(url)?,
            publisher: OnceCell::new(),
            last_connect_failure: Mutex::new(None),
        })
    }

    fn last_connect_failure(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_connect_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Shared publisher connection, established on first use
    ///
    /// Connecting is bounded by `CONNECT_TIMEOUT`; while a recent attempt
    /// failed, callers get `BusError::Unavailable` without a new attempt.
    async fn connection(&self) -> BusResult<ConnectionManager> {
        if let Some(manager) = self.publisher.get() {
            return Ok(manager.clone());
        }

        let failed_at = *self.last_connect_failure();
        if failed_at.is_some_and(|at| at.elapsed() < CONNECT_COOLDOWN) {
            return Err(BusError::Unavailable);
        }

        let result = self
            .publisher
            .get_or_try_init(|| async {
                match tokio::time::timeout(
                    CONNECT_TIMEOUT,
                    ConnectionManager::new(self.client.clone()),
                )
                .await
                {
                    Ok(connected) => connected.map_err(BusError::from),
                    Err(_) => Err(BusError::Timeout(CONNECT_TIMEOUT)),
                }
            })
            .await;

        match result {
            Ok(manager) => {
                *self.last_connect_failure() = None;
                Ok(manager.clone())
            }
            Err(e) => {
                *self.last_connect_failure() = Some(Instant::now());
                Err(e)
            }
        }
    }
}

#[async_trait]
impl BroadcastBus for RedisBus {
    fn transport(&self) -> &'static str {
        "redis"
    }

    async fn publish(
        &self,
        conversation_id: &ConversationId,
        message: &BusMessage,
    ) -> BusResult<()> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.connection().await?;
        let receivers: i64 = bounded(conn.publish(channel_name(conversation_id), payload)).await?;

        tracing::trace!(
            conversation_id = %conversation_id,
            receivers,
            "Published to Redis channel"
        );
        Ok(())
    }

    fn subscribe(&self, conversation_id: &ConversationId, sink: EnvelopeSink) -> Subscription {
        let channel = channel_name(conversation_id);
        let client = self.client.clone();
        let task_channel = channel.clone();

        let task = tokio::spawn(async move {
            let mut attempt = 0;
            loop {
                match listen(&client, &task_channel, &sink, &mut attempt).await {
                    Ok(()) => break,
                    Err(e) => {
                        let delay = reconnect_delay(attempt);
                        attempt += 1;
                        tracing::warn!(
                            channel = %task_channel,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Redis subscription lost - cross-instance delivery degraded"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });

        Subscription::from_task(channel, task)
    }

    async fn ping(&self) -> BusResult<()> {
        let mut conn = self.connection().await?;
        let reply: String = bounded(redis::cmd("PING").query_async(&mut conn)).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(BusError::Rejected(reply))
        }
    }
}

/// Run a command, giving up after `COMMAND_TIMEOUT`
async fn bounded<T>(command: impl Future<Output = redis::RedisResult<T>>) -> BusResult<T> {
    match tokio::time::timeout(COMMAND_TIMEOUT, command).await {
        Ok(reply) => Ok(reply?),
        Err(_) => Err(BusError::Timeout(COMMAND_TIMEOUT)),
    }
}

/// Forward one pub/sub connection's messages into `sink`
///
/// Returns `Ok` once the sink is gone, an error when the connection drops.
async fn listen(
    client: &Client,
    channel: &str,
    sink: &EnvelopeSink,
    attempt: &mut usize,
) -> BusResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    *attempt = 0;
    tracing::debug!(channel = %channel, "Subscribed to Redis channel");

    let mut messages = pubsub.into_on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Non-text Redis payload ignored");
                continue;
            }
        };

        match serde_json::from_str::<BusMessage>(&payload) {
            Ok(message) => {
                if sink.send(message).is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Malformed bus message ignored");
            }
        }
    }

    Err(BusError::Closed)
}
