//! HTTP implementation of the upstream API

use std::time::Duration;

use async_trait::async_trait;
use deskrelay_shared::ParticipantId;
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;

use super::{
    ConversationApi, NewMessage, ParticipantProfile, PersistedMessage, UpstreamError,
    UpstreamResult, SECRET_HEADER,
};

/// Maximum number of retry attempts for idempotent lookups
const MAX_RETRIES: usize = 2;

/// Initial backoff duration for retries (100ms)
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Maximum backoff duration for retries (2 seconds)
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Error bodies are truncated before they reach logs or errors
const MAX_ERROR_BODY: usize = 512;

/// reqwest-backed client for the persistence and lookup API
#[derive(Clone)]
pub struct HttpConversationApi {
    http: Client,
    base_url: Url,
    secret: String,
}

impl HttpConversationApi {
    pub fn new(base_url: &str, secret: &str, timeout: Duration) -> UpstreamResult<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| UpstreamError::InvalidUrl(e.to_string()))?;
        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url,
            secret: secret.to_string(),
        })
    }

    /// Build `<base>/<segments...>`, percent-encoding each segment
    fn endpoint(&self, segments: &[&str]) -> UpstreamResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| UpstreamError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn fetch_participant(&self, participant_id: &str) -> UpstreamResult<ParticipantProfile> {
        let url = self.endpoint(&["participants", participant_id])?;
        let response = self
            .http
            .get(url)
            .header(SECRET_HEADER, &self.secret)
            .send()
            .await?;

        read_json(response).await
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    /// Persistence is never retried: a retry after an ambiguous failure could
    /// record the same message twice.
    async fn save_message(&self, message: &NewMessage) -> UpstreamResult<PersistedMessage> {
        let url = self.endpoint(&["messages"])?;
        let response = self
            .http
            .post(url)
            .header(SECRET_HEADER, &self.secret)
            .json(message)
            .send()
            .await?;

        read_json(response).await
    }

    async fn participant(
        &self,
        participant_id: &ParticipantId,
    ) -> UpstreamResult<ParticipantProfile> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .take(MAX_RETRIES)
            .map(jitter);

        Retry::spawn(retry_strategy, || async {
            let result = self.fetch_participant(participant_id.as_str()).await;

            match &result {
                Ok(_) => Ok(result),
                Err(e) if e.is_transient() => {
                    tracing::debug!(
                        participant_id = %participant_id,
                        error = %e,
                        "Transient participant lookup error - will retry"
                    );
                    Err(result)
                }
                // Permanent errors stop the retry loop
                Err(_) => Ok(result),
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> UpstreamResult<T> {
    let status = response.status();
    if !status.is_success() {
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        return Err(UpstreamError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| UpstreamError::InvalidResponse(e.to_string()))
}
