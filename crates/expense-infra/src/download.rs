//! Attachment fetcher
//!
//! `Fetcher` is the download port used by the download worker. `HttpFetcher`
//! does one GET per attempt and lets [`retry_async`] drive the attempts.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

use expense_core::ErrorClass;

use crate::retry::{retry_async, RetryStrategy};

#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("missing source URL")]
    MissingUrl,

    #[error("unexpected HTTP status {code}")]
    Status { code: u16 },

    #[error("transport error: {message}")]
    Transport { message: String, temporary: bool },

    #[error("request timed out")]
    Timeout,

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        temporary: bool,
        last: String,
    },
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_temporary(&self) -> bool {
        match self {
            FetchError::MissingUrl => false,
            FetchError::Status { code } => RetryStrategy::is_retryable_status_code(*code),
            FetchError::Transport { temporary, .. } => *temporary,
            FetchError::Timeout => true,
            FetchError::Body(_) => true,
            FetchError::Exhausted { temporary, .. } => *temporary,
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::from_temporary(self.is_temporary())
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return FetchError::Timeout;
        }
        let temporary = err.is_connect() || RetryStrategy::is_temporary_error(&err);
        FetchError::Transport {
            message: err.to_string(),
            temporary,
        }
    }
}

/// Download port.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url`, retrying temporary failures up to `max_attempts` total
    /// attempts. `credential` is sent as a bearer token when present.
    async fn fetch_with_retry(
        &self,
        url: &str,
        credential: Option<&str>,
        max_attempts: u32,
    ) -> Result<FetchedFile, FetchError>;
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    strategy: RetryStrategy,
}

impl HttpFetcher {
    /// `request_timeout` bounds each single attempt.
    pub fn new(strategy: RetryStrategy, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("expense-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, strategy })
    }

    pub fn with_client(client: Client, strategy: RetryStrategy) -> Self {
        Self { client, strategy }
    }

    async fn fetch_once(&self, url: &str, credential: Option<&str>) -> Result<FetchedFile, FetchError> {
        let mut request = self.client.get(url);
        if let Some(token) = credential {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                code: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))?;
        let size = bytes.len() as u64;

        Ok(FetchedFile {
            bytes,
            content_type,
            size,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[tracing::instrument(skip(self, credential))]
    async fn fetch_with_retry(
        &self,
        url: &str,
        credential: Option<&str>,
        max_attempts: u32,
    ) -> Result<FetchedFile, FetchError> {
        if url.trim().is_empty() {
            return Err(FetchError::MissingUrl);
        }

        let result = retry_async(
            &self.strategy,
            max_attempts,
            |e: &FetchError| e.is_temporary(),
            |_| self.fetch_once(url, credential),
        )
        .await;

        match result {
            Ok(file) => {
                tracing::debug!(size_bytes = file.size, "Attachment fetched");
                Ok(file)
            }
            Err(exhausted) if exhausted.attempts == 1 => Err(exhausted.last_error),
            Err(exhausted) => Err(FetchError::Exhausted {
                attempts: exhausted.attempts,
                temporary: exhausted.last_error.is_temporary(),
                last: exhausted.last_error.to_string(),
            }),
        }
    }
}
