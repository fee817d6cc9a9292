use std::{
    future::Future,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use reqwest::Client;
use reqwest_retry::{policies::ExponentialBackoff, RetryDecision, RetryPolicy as _};
use slog::{debug, warn, Logger};
use time::OffsetDateTime;
use tokio::time::sleep;

use crate::{
    error_from_status, parse_label_values, parse_query_response, unix_seconds, FetchError,
    QueryResponse, RateLimiter, Step, TimeWindow,
};

/// The subset of the Prometheus HTTP API the engine consumes.
///
/// Each call is a single attempt; retrying is the caller's business.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn query_range(
        &self,
        query: &str,
        window: &TimeWindow,
        step: &Step,
    ) -> Result<QueryResponse, FetchError>;

    async fn query_instant(
        &self,
        query: &str,
        at: Option<OffsetDateTime>,
    ) -> Result<QueryResponse, FetchError>;

    async fn label_values(&self, label: &str) -> Result<Vec<String>, FetchError>;
}

pub struct PromClient {
    logger: Logger,
    base_url: String,
    http: Client,
    timeout: Duration,
    rate_limiter: Arc<RateLimiter>,
}

impl PromClient {
    pub fn new(
        logger: Logger,
        base_url: &str,
        user_agent: &str,
        timeout: Duration,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<PromClient, FetchError> {
        let http = Client::builder().user_agent(user_agent).build()?;
        Ok(Self {
            logger,
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            timeout,
            rate_limiter,
        })
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<(u16, String), FetchError> {
        self.rate_limiter.acquire().await;

        let url = format!("{}/{}", self.base_url, path);
        debug!(self.logger, "requesting: {} {:?}", url, params);
        let response = self
            .http
            .get(&url)
            .query(params)
            .timeout(self.timeout)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(error_from_status(status.as_u16(), &body));
        }
        Ok((status.as_u16(), body))
    }
}

#[async_trait]
impl QueryBackend for PromClient {
    async fn query_range(
        &self,
        query: &str,
        window: &TimeWindow,
        step: &Step,
    ) -> Result<QueryResponse, FetchError> {
        let params = [
            ("query", query.to_string()),
            ("start", unix_seconds(window.start)),
            ("end", unix_seconds(window.end)),
            ("step", step.to_string()),
        ];
        let (status, body) = self.get("query_range", &params).await?;
        parse_query_response(status, &body)
    }

    async fn query_instant(
        &self,
        query: &str,
        at: Option<OffsetDateTime>,
    ) -> Result<QueryResponse, FetchError> {
        let mut params = vec![("query", query.to_string())];
        if let Some(at) = at {
            params.push(("time", unix_seconds(at)));
        }
        let (status, body) = self.get("query", &params).await?;
        parse_query_response(status, &body)
    }

    async fn label_values(&self, label: &str) -> Result<Vec<String>, FetchError> {
        let (status, body) = self.get(&format!("label/{}/values", label), &[]).await?;
        parse_label_values(status, &body)
    }
}

/// Exponential backoff applied to transient backend failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// The last error seen once a request stops being retried.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub error: FetchError,
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .retry_bounds(self.min_backoff, self.max_backoff.max(self.min_backoff))
            .build_with_max_retries(self.max_retries)
    }

    /// Run `attempt` until it succeeds, fails permanently, or retries run out.
    pub async fn run<T, F, Fut>(&self, logger: &Logger, mut attempt: F) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let backoff = self.backoff();
        let started = SystemTime::now();
        let mut past_retries = 0;
        loop {
            let error = match attempt().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let attempts = past_retries + 1;
            if !error.is_transient() {
                return Err(RetryExhausted { attempts, error });
            }
            match backoff.should_retry(started, past_retries) {
                RetryDecision::Retry { execute_after } => {
                    let wait = execute_after
                        .duration_since(SystemTime::now())
                        .unwrap_or_default();
                    warn!(
                        logger,
                        "attempt {} failed, retrying in {:?}: {}", attempts, wait, error
                    );
                    sleep(wait).await;
                    past_retries += 1;
                }
                RetryDecision::DoNotRetry => return Err(RetryExhausted { attempts, error }),
            }
        }
    }
}
