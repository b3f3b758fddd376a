use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use super::models::{blackbox_entries, parse_player_counts, PlayerCountSample, RoundMetadata};
use crate::config::IngestConfig;
use crate::error::FetchError;

/// Attempts and backoff curve applied to every outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &IngestConfig) -> Self {
        Self {
            max_attempts: cfg.max_retries.saturating_add(1),
            base_delay: Duration::from_millis(cfg.backoff_ms),
            max_delay: Duration::from_millis(cfg.max_backoff_ms.max(cfg.backoff_ms)),
        }
    }

    /// Exponential delay before retry number `attempt` (1-based), capped at `max_delay`.
    /// A server-provided `Retry-After` wins when it is longer.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        let exp = self.base_delay.saturating_mul(factor).min(self.max_delay);
        match retry_after {
            Some(ra) if ra > exp => ra,
            _ => exp,
        }
    }

    /// Longest a call can take when every attempt runs to `per_attempt` and every backoff
    /// draws maximum jitter. Server `Retry-After` values are not bounded here.
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff: Duration = (1..attempts).map(|a| self.delay_for(a, None)).sum();
        per_attempt.saturating_mul(attempts) + backoff + backoff / 4
    }

    /// `delay_for` plus up to 25% random jitter, so parallel workers don't retry in lockstep.
    fn jittered(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let d = self.delay_for(attempt, retry_after);
        let spread = (d.as_millis() as u64) / 4;
        if spread == 0 {
            return d;
        }
        d + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// The four stats endpoints the pipeline reads from.
#[async_trait]
pub trait RoundApi: Send + Sync + 'static {
    /// One listing page, newest first, starting at `offset` (0 = newest round).
    async fn round_list(&self, offset: i64) -> Result<Vec<RoundMetadata>, FetchError>;
    async fn blackbox(&self, round_id: i64) -> Result<Vec<Value>, FetchError>;
    async fn player_counts(&self, round_id: i64) -> Result<Vec<PlayerCountSample>, FetchError>;
    async fn metadata(&self, round_id: i64) -> Result<RoundMetadata, FetchError>;

    async fn latest_round_id(&self) -> Result<Option<i64>, FetchError> {
        Ok(self.round_list(0).await?.first().map(|r| r.round_id))
    }
}

pub struct ParaApiClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl ParaApiClient {
    pub fn new(cfg: &IngestConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.http_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to construct stats API HTTP client")?;
        Ok(Self {
            http,
            base_url: cfg.api_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::from_config(cfg),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let url = self.url(path);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let (message, retry_after) = match self.http.get(&url).header("Accept", "application/json").send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        // A body cut off mid-stream is a transport failure, retried like one.
                        match resp.text().await {
                            Ok(text) => {
                                return serde_json::from_str(&text).map_err(|e| FetchError::Decode {
                                    endpoint: path.to_string(),
                                    message: e.to_string(),
                                })
                            }
                            Err(e) => (format!("reading body: {e}"), None),
                        }
                    } else if !is_retryable(status) {
                        let text = resp.text().await.unwrap_or_default();
                        return Err(FetchError::Permanent {
                            endpoint: path.to_string(),
                            status: status.as_u16(),
                            message: truncate(&text, 200),
                        });
                    } else {
                        let retry_after = resp
                            .headers()
                            .get("Retry-After")
                            .and_then(|h| h.to_str().ok())
                            .and_then(|s| s.trim().parse::<u64>().ok())
                            .map(Duration::from_secs);
                        (format!("status {status}"), retry_after)
                    }
                }
                Err(err) => (err.to_string(), None),
            };

            if attempt >= self.retry.max_attempts {
                return Err(FetchError::Transient {
                    endpoint: path.to_string(),
                    attempts: attempt,
                    message,
                });
            }
            let wait = self.retry.jittered(attempt, retry_after);
            warn!(endpoint = path, attempt, wait_ms = wait.as_millis() as u64, %message, "stats API call failed; backing off");
            tokio::time::sleep(wait).await;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[async_trait]
impl RoundApi for ParaApiClient {
    async fn round_list(&self, offset: i64) -> Result<Vec<RoundMetadata>, FetchError> {
        let page: Vec<RoundMetadata> = self.get_json(&format!("/roundlist?offset={offset}")).await?;
        debug!(offset, len = page.len(), "roundlist page");
        Ok(page)
    }

    async fn blackbox(&self, round_id: i64) -> Result<Vec<Value>, FetchError> {
        let raw: Value = self.get_json(&format!("/blackbox/{round_id}")).await?;
        Ok(blackbox_entries(raw))
    }

    async fn player_counts(&self, round_id: i64) -> Result<Vec<PlayerCountSample>, FetchError> {
        let path = format!("/playercounts/{round_id}");
        let raw: Value = self.get_json(&path).await?;
        parse_player_counts(raw).map_err(|message| FetchError::Decode {
            endpoint: path,
            message,
        })
    }

    async fn metadata(&self, round_id: i64) -> Result<RoundMetadata, FetchError> {
        self.get_json(&format!("/metadata/{round_id}")).await
    }
}
