//! Session token sources

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::TokenSourceError;

/// Supplies a fresh session token for every connection attempt
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<String, TokenSourceError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Fetches tokens from an HTTP endpoint answering `{"token": "..."}`
#[derive(Clone)]
pub struct HttpTokenSource {
    http: Client,
    url: String,
    bearer: Option<String>,
}

impl HttpTokenSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
            bearer: None,
        }
    }

    /// Authenticate token requests with the caller's own credentials
    pub fn with_bearer(mut self, credentials: impl Into<String>) -> Self {
        self.bearer = Some(credentials.into());
        self
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch_token(&self) -> Result<String, TokenSourceError> {
        let mut request = self.http.post(&self.url);
        if let Some(bearer) = &self.bearer {
            request = request.bearer_auth(bearer);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TokenSourceError::Status(status.as_u16()));
        }

        let body: TokenResponse = response.json().await?;
        if body.token.trim().is_empty() {
            return Err(TokenSourceError::Empty);
        }
        Ok(body.token)
    }
}
