use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

use crate::record::parse_page_body;
use crate::{PageQuery, VendorClient, VendorError, VendorPage};

const ERROR_BODY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff for transient failures on a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket that admits `requests_per_minute` with a burst of the same size.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let rpm = requests_per_minute.max(1);
        Self {
            capacity: rpm,
            refill_every: Duration::from_secs(60) / rpm,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait for a token. Refills advance `last_refill` by whole periods so
    /// partial periods carry over to the next call.
    pub async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(state.last_refill);
            let refills = u32::try_from(elapsed.as_nanos() / self.refill_every.as_nanos())
                .unwrap_or(u32::MAX);
            if refills > 0 {
                let uncapped = state.tokens.saturating_add(refills);
                state.last_refill = if uncapped > self.capacity {
                    now
                } else {
                    state.last_refill + self.refill_every * refills
                };
                state.tokens = uncapped.min(self.capacity);
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let next_refill = state.last_refill + self.refill_every;
            drop(state);
            tokio::time::sleep_until(next_refill).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpVendorConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub user_agent: Option<String>,
    pub timeout: Duration,
    pub max_in_flight: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpVendorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            api_key: None,
            user_agent: None,
            timeout: Duration::from_secs(20),
            max_in_flight: 4,
            token_bucket: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpVendorClient {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
    in_flight: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpVendorClient {
    pub fn new(config: HttpVendorConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let endpoint = format!("{}/cars", config.base_url.trim_end_matches('/'));
        let endpoint = Url::parse(&endpoint)
            .with_context(|| format!("parsing vendor endpoint {endpoint}"))?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            token_bucket: config
                .token_bucket
                .map(|c| Arc::new(SimpleTokenBucket::new(c))),
        })
    }

    async fn send(&self, query: &PageQuery) -> Result<VendorPage, VendorError> {
        let mut request = self.client.get(self.endpoint.clone()).query(&query.query_pairs());
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }

        let resp = request.send().await.map_err(map_request_error)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(map_request_error)?;

        if status.is_success() {
            let page = parse_page_body(&body)?;
            debug!(records = page.len(), total = ?page.total, "vendor page received");
            return Ok(page);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(VendorError::RateLimited);
        }

        match classify_status(status) {
            RetryDisposition::Retryable => {
                Err(VendorError::Transient(format!("http status {}", status.as_u16())))
            }
            RetryDisposition::NonRetryable => Err(VendorError::Rejected {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body)
                    .chars()
                    .take(ERROR_BODY_PREVIEW_CHARS)
                    .collect(),
            }),
        }
    }
}

fn map_request_error(err: reqwest::Error) -> VendorError {
    match classify_reqwest_error(&err) {
        RetryDisposition::Retryable => VendorError::Transient(err.to_string()),
        RetryDisposition::NonRetryable if err.is_decode() || err.is_body() => {
            VendorError::Transient(err.to_string())
        }
        RetryDisposition::NonRetryable => VendorError::Request(err.to_string()),
    }
}

#[async_trait]
impl VendorClient for HttpVendorClient {
    async fn fetch_page(&self, query: &PageQuery) -> Result<VendorPage, VendorError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| VendorError::Request("vendor client is shutting down".into()))?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!(
            "vendor_fetch",
            make = %query.make,
            model = query.model.as_deref().unwrap_or("*"),
            site = query.site,
            page = query.page
        );
        self.send(query).instrument(span).await
    }
}
