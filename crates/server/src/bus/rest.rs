//! Polling-list transport over a REST command API
//!
//! For brokers reachable only over HTTPS (Upstash-compatible). Each channel is
//! a capped Redis list: publishers `RPUSH` + `LTRIM`, subscribers poll the
//! whole list with `LRANGE` and deliver entries whose ids they have not seen.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use deskrelay_shared::ConversationId;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    channel_name, reconnect_delay, BroadcastBus, BusError, BusMessage, BusResult, EnvelopeSink,
    Subscription,
};

/// Lists outlive their last publish by this many seconds
const LIST_TTL_SECS: u64 = 3600;

/// Request timeout for broker commands
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One reply of the command API
#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl CommandReply {
    fn into_result(self) -> BusResult<Value> {
        match self.error {
            Some(error) => Err(BusError::Rejected(error)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// REST polling-list bus
#[derive(Clone)]
pub struct RestListBus {
    http: Client,
    base_url: Url,
    token: String,
    poll_interval: Duration,
    capacity: usize,
}

impl RestListBus {
    pub fn new(
        url: &str,
        token: &str,
        poll_interval: Duration,
        capacity: usize,
    ) -> BusResult<Self> {
        let base_url = Url::parse(url).map_err(|e| BusError::InvalidUrl(e.to_string()))?;
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            http,
            base_url,
            token: token.to_string(),
            poll_interval,
            capacity: capacity.max(1),
        })
    }

    fn pipeline_url(&self) -> BusResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BusError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("pipeline");
        Ok(url)
    }

    async fn post(&self, url: Url, body: &Value) -> BusResult<reqwest::Response> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let reply = response.json::<CommandReply>().await.ok();
        Err(BusError::Rejected(
            reply
                .and_then(|r| r.error)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
        ))
    }

    /// Run one command and return its result
    async fn command(&self, args: Value) -> BusResult<Value> {
        let response = self.post(self.base_url.clone(), &args).await?;
        response.json::<CommandReply>().await?.into_result()
    }

    /// Run several commands in one round trip, failing if any of them failed
    async fn pipeline(&self, commands: Value) -> BusResult<Vec<Value>> {
        let response = self.post(self.pipeline_url()?, &commands).await?;
        response
            .json::<Vec<CommandReply>>()
            .await?
            .into_iter()
            .map(CommandReply::into_result)
            .collect()
    }

    /// Current contents of a channel list, oldest first
    async fn read_list(&self, channel: &str) -> BusResult<Vec<BusMessage>> {
        let result = self.command(json!(["LRANGE", channel, "0", "-1"])).await?;
        let entries: Vec<String> = serde_json::from_value(result)?;

        Ok(entries
            .iter()
            .filter_map(|raw| match serde_json::from_str::<BusMessage>(raw) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Malformed list entry ignored");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl BroadcastBus for RestListBus {
    fn transport(&self) -> &'static str {
        "rest-list"
    }

    async fn publish(
        &self,
        conversation_id: &ConversationId,
        message: &BusMessage,
    ) -> BusResult<()> {
        let channel = channel_name(conversation_id);
        let payload = serde_json::to_string(message)?;
        let keep_from = format!("-{}", self.capacity);

        self.pipeline(json!([
            ["RPUSH", channel, payload],
            ["LTRIM", channel, keep_from, "-1"],
            ["EXPIRE", channel, LIST_TTL_SECS.to_string()],
        ]))
        .await?;
        Ok(())
    }

    fn subscribe(&self, conversation_id: &ConversationId, sink: EnvelopeSink) -> Subscription {
        let channel = channel_name(conversation_id);
        let bus = self.clone();
        let task_channel = channel.clone();

        let task = tokio::spawn(async move {
            let mut seen: Option<HashSet<Uuid>> = None;
            let mut failures = 0;

            loop {
                let delay = match bus.read_list(&task_channel).await {
                    Ok(entries) => {
                        if failures > 0 {
                            tracing::info!(channel = %task_channel, "Broker polling recovered");
                            failures = 0;
                        }
                        for message in take_unseen(&mut seen, entries) {
                            if sink.send(message).is_err() {
                                return;
                            }
                        }
                        bus.poll_interval
                    }
                    Err(e) => {
                        let backoff = reconnect_delay(failures);
                        failures += 1;
                        tracing::warn!(
                            channel = %task_channel,
                            error = %e,
                            retry_in_ms = backoff.as_millis() as u64,
                            "Broker poll failed - cross-instance delivery degraded"
                        );
                        backoff.max(bus.poll_interval)
                    }
                };

                if sink.is_closed() {
                    return;
                }
                tokio::time::sleep(delay).await;
            }
        });

        Subscription::from_task(channel, task)
    }

    async fn ping(&self) -> BusResult<()> {
        match self.command(json!(["PING"])).await? {
            Value::String(reply) if reply == "PONG" => Ok(()),
            other => Err(BusError::Rejected(other.to_string())),
        }
    }
}

/// Entries of the current list snapshot not delivered before, oldest first
///
/// The first snapshot only establishes the baseline: whatever was already in
/// the list when polling started is treated as seen. Afterwards `seen` tracks
/// the ids of the latest snapshot, which bounds it to the list capacity.
fn take_unseen(seen: &mut Option<HashSet<Uuid>>, entries: Vec<BusMessage>) -> Vec<BusMessage> {
    let current: HashSet<Uuid> = entries.iter().map(|m| m.id).collect();

    let fresh = match seen.as_ref() {
        None => Vec::new(),
        Some(previous) => entries
            .into_iter()
            .filter(|m| !previous.contains(&m.id))
            .collect(),
    };

    *seen = Some(current);
    fresh
}
