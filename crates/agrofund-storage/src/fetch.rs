//! HTTP fetching for remote funding feeds: fixed request timeout, capped retries.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, Instrument};

/// How a failed feed request should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFailure {
    /// Timeouts, dropped connections, 5xx and 408.
    Transient,
    /// The publisher is throttling us (429).
    Throttled,
    Permanent,
}

pub fn classify_feed_status(status: u16) -> FeedFailure {
    match status {
        408 => FeedFailure::Transient,
        429 => FeedFailure::Throttled,
        500..=599 => FeedFailure::Transient,
        _ => FeedFailure::Permanent,
    }
}

fn classify_request_error(err: &reqwest::Error) -> FeedFailure {
    if err.is_timeout() || err.is_connect() {
        FeedFailure::Transient
    } else {
        FeedFailure::Permanent
    }
}

/// Exponential backoff: `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
/// `max_attempts` counts the first request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Wait before the next request after `attempt` (1-based) failed, or `None` to give up.
    /// A server-supplied `Retry-After` replaces the computed delay but still respects the cap.
    pub fn next_delay(
        &self,
        failure: FeedFailure,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        if failure == FeedFailure::Permanent || attempt >= self.max_attempts {
            return None;
        }
        let doubling = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let computed = self.base_delay.saturating_mul(doubling);
        Some(retry_after.unwrap_or(computed).min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feed answered {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building feed http client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = tracing::info_span!("feed_fetch", source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 1;
        loop {
            let (failure, retry_after, error) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse { status, final_url, body });
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let retry_after = resp
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<u64>().ok())
                        .map(Duration::from_secs);
                    let error = FetchError::HttpStatus {
                        status,
                        url: resp.url().to_string(),
                    };
                    (classify_feed_status(status), retry_after, error)
                }
                Err(err) => (classify_request_error(&err), None, FetchError::Request(err)),
            };

            let Some(delay) = self.backoff.next_delay(failure, attempt, retry_after) else {
                return Err(error);
            };
            debug!(attempt, ?failure, error = %error, delay_ms = delay.as_millis() as u64, "retrying feed");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
