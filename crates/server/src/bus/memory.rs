//! In-process broker
//!
//! Several [`MemoryBus`] handles sharing one [`MemoryBroker`] behave like relay
//! processes sharing a real broker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use deskrelay_shared::ConversationId;
use tokio::sync::broadcast;

use super::{channel_name, BroadcastBus, BusMessage, BusResult, EnvelopeSink, Subscription};

/// Per-channel buffer; slow subscribers past this lag lose messages
const CHANNEL_CAPACITY: usize = 1024;

/// Shared channel table
#[derive(Default)]
pub struct MemoryBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<BusMessage>>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of live subscribers on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels()
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

/// Bus handle over a [`MemoryBroker`]
#[derive(Clone)]
pub struct MemoryBus {
    broker: Arc<MemoryBroker>,
}

impl MemoryBus {
    /// Bus with a private broker
    pub fn new() -> Self {
        Self::with_broker(MemoryBroker::new())
    }

    /// Bus sharing `broker` with other handles
    pub fn with_broker(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastBus for MemoryBus {
    fn transport(&self) -> &'static str {
        "memory"
    }

    async fn publish(
        &self,
        conversation_id: &ConversationId,
        message: &BusMessage,
    ) -> BusResult<()> {
        let channel = channel_name(conversation_id);
        let mut channels = self.broker.channels();

        if let Some(tx) = channels.get(&channel) {
            if tx.send(message.clone()).is_err() {
                // Every receiver is gone
                channels.remove(&channel);
            }
        }
        Ok(())
    }

    fn subscribe(&self, conversation_id: &ConversationId, sink: EnvelopeSink) -> Subscription {
        let channel = channel_name(conversation_id);
        // Registered before returning so nothing published afterwards is missed
        let mut rx = self
            .broker
            .channels()
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let task_channel = channel.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if sink.send(message).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            channel = %task_channel,
                            skipped,
                            "In-memory subscriber lagged, messages dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription::from_task(channel, task)
    }

    async fn ping(&self) -> BusResult<()> {
        Ok(())
    }
}
