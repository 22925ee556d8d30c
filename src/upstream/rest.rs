//! REST pull client for the exchange's public Ticker endpoint.
//!
//! Every request passes admission control first, then runs under one overall
//! deadline covering all retry attempts. Transient failures (network errors,
//! 5xx) retry with exponential backoff; client errors and exchange-reported
//! errors do not.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{LtpError, Result};
use crate::pairs::PairMapper;
use crate::ratelimit::UpstreamLimiter;
use crate::upstream::{TickerInfo, TickerResult};

const USER_AGENT: &str = concat!("ltp-service/", env!("CARGO_PKG_VERSION"));

/// Error-message fragments that mark a network failure as transient.
const RETRYABLE_FRAGMENTS: &[&str] = &[
    "connection refused",
    "no such host",
    "timeout",
    "temporary failure",
];

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    /// Overall deadline for one `get_tickers` call, retries included.
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.kraken.com".to_string(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: HashMap<String, TickerInfo>,
}

/// Outcome of a single wire attempt.
enum Attempt {
    Done(TickerResult),
    Retryable(String),
    Fatal(LtpError),
}

pub struct RestClient {
    http: reqwest::Client,
    config: RestConfig,
    limiter: Arc<UpstreamLimiter>,
    mapper: Arc<PairMapper>,
}

impl RestClient {
    pub fn new(
        config: RestConfig,
        limiter: Arc<UpstreamLimiter>,
        mapper: Arc<PairMapper>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| LtpError::Internal(anyhow::anyhow!("build http client: {e}")))?;

        Ok(Self {
            http,
            config,
            limiter,
            mapper,
        })
    }

    /// Fetch tickers for the given standard pairs. The response keeps the
    /// exchange's own pair naming; translating back is the caller's job.
    pub async fn get_tickers(
        &self,
        pairs: &[String],
        cancel: &CancellationToken,
    ) -> Result<TickerResult> {
        if pairs.is_empty() {
            return Err(LtpError::InvalidInput(
                "at least one pair is required".to_string(),
            ));
        }

        let mut pull_names = Vec::with_capacity(pairs.len());
        for pair in pairs {
            match self.mapper.to_pull(pair) {
                Some(name) => pull_names.push(name),
                None => return Err(LtpError::UnsupportedPair(pair.clone())),
            }
        }
        let csv = pull_names.join(",");

        match timeout(self.config.timeout, self.fetch_with_retries(&csv, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(LtpError::UpstreamUnavailable(format!(
                "ticker request exceeded {:?} deadline",
                self.config.timeout
            ))),
        }
    }

    async fn fetch_with_retries(
        &self,
        csv: &str,
        cancel: &CancellationToken,
    ) -> Result<TickerResult> {
        if !self.limiter.acquire(cancel).await {
            return Err(LtpError::UpstreamUnavailable(
                "request cancelled while waiting for rate limiter".to_string(),
            ));
        }

        let mut last_error = String::new();
        for attempt in 1..=self.config.max_retries.max(1) {
            match self.fetch_once(csv).await {
                Attempt::Done(result) => return Ok(result),
                Attempt::Fatal(err) => return Err(err),
                Attempt::Retryable(msg) => {
                    warn!(attempt, error = %msg, "ticker request failed");
                    last_error = msg;
                }
            }

            if attempt < self.config.max_retries.max(1) {
                let backoff = self
                    .config
                    .base_backoff
                    .saturating_mul(2u32.saturating_pow((attempt - 1).min(16)));
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(LtpError::UpstreamUnavailable(
                            "request cancelled during retry backoff".to_string(),
                        ));
                    }
                    _ = sleep(backoff) => {}
                }
            }
        }

        Err(LtpError::UpstreamUnavailable(format!(
            "{} attempts exhausted, last error: {last_error}",
            self.config.max_retries.max(1)
        )))
    }

    async fn fetch_once(&self, csv: &str) -> Attempt {
        let url = format!("{}/0/public/Ticker", self.config.base_url);

        let response = match self.http.get(&url).query(&[("pair", csv)]).send().await {
            Ok(response) => response,
            Err(e) => {
                return if is_retryable_request_error(&e) {
                    Attempt::Retryable(e.to_string())
                } else {
                    Attempt::Fatal(LtpError::UpstreamUnavailable(e.to_string()))
                };
            }
        };

        let status = response.status();
        if status.is_server_error() {
            return Attempt::Retryable(format!("HTTP {status}"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Attempt::Fatal(LtpError::Upstream(format!("HTTP {status}: {body}")));
        }

        let parsed: TickerResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                return Attempt::Fatal(LtpError::Upstream(format!(
                    "unparsable ticker response: {e}"
                )))
            }
        };

        if !parsed.error.is_empty() {
            return Attempt::Fatal(LtpError::Upstream(parsed.error.join(", ")));
        }

        Attempt::Done(TickerResult {
            tickers: parsed.result,
        })
    }
}

/// Transient network failures are retried; everything else is not.
/// Deadline expiry and cancellation abort the whole call and never reach
/// this classifier.
fn is_retryable_request_error(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }
    is_retryable_message(&format!("{err:?}"))
}

fn is_retryable_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    RETRYABLE_FRAGMENTS
        .iter()
        .any(|fragment| msg.contains(fragment))
}
