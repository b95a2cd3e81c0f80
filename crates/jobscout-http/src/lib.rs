//! Rate-limited HTTP fetching for scrapers plus the typed client for the job API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use jobscout_core::JobRecord;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobscout-http";

pub const DEFAULT_USER_AGENT: &str = concat!("JobScout-Agent/", env!("CARGO_PKG_VERSION"));

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// `2^attempt` seconds, capped at one minute.
    pub fn api_default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Resolve `href` against `base`. Absolute hrefs pass through unchanged.
pub fn resolve_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    match reqwest::Url::parse(base) {
        Ok(base) => base.join(href).ok().map(String::from),
        Err(_) => reqwest::Url::parse(href).ok().map(String::from),
    }
}

/// `base` with `query` appended as a form-encoded query string.
pub fn url_with_query(base: &str, query: &[(&str, String)]) -> Option<String> {
    reqwest::Url::parse_with_params(base, query.iter().map(|(k, v)| (*k, v.as_str())))
        .ok()
        .map(String::from)
}

// ---------------------------------------------------------------------------
// Scraper fetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket allowing roughly `rate` requests per second. `None` for non-positive rates.
    pub fn per_second(rate: f64) -> Option<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return None;
        }
        Some(Self {
            capacity: (rate.ceil() as u32).max(1),
            refill_every: Duration::from_secs_f64(1.0 / rate),
        })
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

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && !self.refill_every.is_zero() {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limited by {url} after {attempts} attempts")]
    RateLimited { url: String, attempts: usize },
    #[error("fetcher is shutting down")]
    Closed,
}

/// Shared page fetcher used by every source adapter in a run.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    buckets: Mutex<HashMap<String, Arc<SimpleTokenBucket>>>,
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

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    /// Throttle `source_id` to about `rate_per_sec` requests per second.
    pub async fn set_rate_limit(&self, source_id: &str, rate_per_sec: f64) {
        let mut buckets = self.buckets.lock().await;
        match TokenBucketConfig::per_second(rate_per_sec) {
            Some(config) => {
                buckets.insert(source_id.to_string(), Arc::new(SimpleTokenBucket::new(config)));
            }
            None => {
                buckets.remove(source_id);
            }
        }
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn bucket_for(&self, source_id: &str) -> Option<Arc<SimpleTokenBucket>> {
        self.buckets.lock().await.get(source_id).cloned()
    }

    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedPage, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(bucket) = self.bucket_for(source_id).await {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched page");
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        warn!(status = status.as_u16(), attempt, "retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        return Err(FetchError::RateLimited {
                            url: final_url,
                            attempts: attempt + 1,
                        });
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        warn!(error = %err, attempt, "retryable request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Job API client
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication failed: {message}")]
    Authentication { message: String },
    #[error("validation error: {message}")]
    Validation { message: String },
    #[error("server error {status} after {attempts} attempts: {message}")]
    Server {
        status: u16,
        attempts: usize,
        message: String,
    },
    #[error("http {status}: {message}")]
    Status { status: u16, message: String },
    #[error("network error after {attempts} attempts: {source}")]
    Network {
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("reading response body: {0}")]
    InvalidBody(#[source] reqwest::Error),
    #[error("invalid api client configuration: {0}")]
    Config(String),
}

/// Decoded API envelope: `{ "success": bool, "data": ..., "error": "..." }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub status_code: u16,
}

impl ApiResponse {
    /// Empty bodies decode as an unsuccessful envelope; non-JSON bodies keep a
    /// truncated copy in `error`.
    pub fn from_body(body: &str, status_code: u16) -> Self {
        let parsed = if body.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str::<Value>(body) {
                Ok(value) => value,
                Err(_) => {
                    let snippet: String = body.chars().take(200).collect();
                    return Self::failure(format!("Invalid JSON response: {snippet}"), status_code);
                }
            }
        };

        let error = match parsed.get("error") {
            None | Some(Value::Null) => None,
            Some(Value::String(message)) => Some(message.clone()),
            Some(other) => Some(other.to_string()),
        };

        Self {
            success: parsed.get("success").and_then(Value::as_bool).unwrap_or(false),
            data: parsed.get("data").filter(|d| !d.is_null()).cloned(),
            error,
            status_code,
        }
    }

    pub fn failure(error: impl Into<String>, status_code: u16) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            status_code,
        }
    }

    fn message(&self) -> String {
        self.error.clone().unwrap_or_else(|| "no error message".to_string())
    }

    fn data_count(&self, key: &str) -> u64 {
        self.data
            .as_ref()
            .and_then(|data| data.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl ApiClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            backoff: BackoffPolicy::api_default(),
        }
    }
}

/// Filters for `GET /agents/logs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub page: u32,
    pub limit: u32,
    pub agent_id: Option<String>,
    pub source: Option<String>,
    pub status: Option<String>,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 50,
            agent_id: None,
            source: None,
            status: None,
        }
    }
}

impl LogQuery {
    fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("page", self.page.to_string()), ("limit", self.limit.to_string())];
        let optional = [
            ("agentId", &self.agent_id),
            ("source", &self.source),
            ("status", &self.status),
        ];
        for (key, value) in optional {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                pairs.push((key, value.to_string()));
            }
        }
        pairs
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    backoff: BackoffPolicy,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> Result<Self, ApiError> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() || config.api_key.trim().is_empty() {
            return Err(ApiError::Config(
                "base_url and api_key are required".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|err| ApiError::Config(format!("building reqwest client: {err}")))?;

        info!(%base_url, "api client initialised");
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        query: &[(&'static str, String)],
    ) -> Result<ApiResponse, ApiError> {
        let url = self.endpoint_url(endpoint);
        let max_retries = self.backoff.max_retries;
        let mut attempt = 0;

        loop {
            debug!(%method, %url, attempt = attempt + 1, "api request");
            let mut builder = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.api_key);
            if let Some(body) = body {
                builder = builder.json(body);
            }
            if !query.is_empty() {
                builder = builder.query(query);
            }

            let resp = match builder.send().await {
                Ok(resp) => resp,
                Err(err) if attempt < max_retries => {
                    let wait = self.backoff.delay_for_attempt(attempt);
                    warn!(error = %err, wait_secs = wait.as_secs_f64(), "network error, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                    continue;
                }
                Err(source) => {
                    return Err(ApiError::Network {
                        attempts: attempt + 1,
                        source,
                    })
                }
            };

            let status = resp.status();
            let text = resp.text().await.map_err(ApiError::InvalidBody)?;
            let response = ApiResponse::from_body(&text, status.as_u16());

            match status {
                StatusCode::UNAUTHORIZED => {
                    return Err(ApiError::Authentication {
                        message: response.message(),
                    })
                }
                StatusCode::BAD_REQUEST => {
                    return Err(ApiError::Validation {
                        message: response.message(),
                    })
                }
                s if s.is_server_error() && attempt < max_retries => {
                    let wait = self.backoff.delay_for_attempt(attempt);
                    warn!(status = s.as_u16(), wait_secs = wait.as_secs_f64(), "server error, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                s if s.is_server_error() => {
                    return Err(ApiError::Server {
                        status: s.as_u16(),
                        attempts: attempt + 1,
                        message: response.message(),
                    })
                }
                s if s.is_client_error() => {
                    return Err(ApiError::Status {
                        status: s.as_u16(),
                        message: response.message(),
                    })
                }
                _ => return Ok(response),
            }
        }
    }

    /// `POST /agents/sync` with the run's unique jobs and execution stats.
    pub async fn sync_jobs(
        &self,
        jobs: &[JobRecord],
        execution_stats: &Value,
        agent_version: &str,
    ) -> Result<ApiResponse, ApiError> {
        let payload = serde_json::json!({
            "jobs": jobs.iter().map(JobRecord::to_api_value).collect::<Vec<_>>(),
            "execution_stats": execution_stats,
            "timestamp": Utc::now().to_rfc3339(),
            "agent_version": agent_version,
        });

        info!(jobs = jobs.len(), "syncing jobs to api");
        let response = self
            .request(Method::POST, "/agents/sync", Some(&payload), &[])
            .await?;
        if response.success {
            info!(
                inserted = response.data_count("jobsInserted"),
                updated = response.data_count("jobsUpdated"),
                logs = response.data_count("logsCreated"),
                "jobs synced"
            );
        } else {
            warn!(error = ?response.error, "job sync rejected");
        }
        Ok(response)
    }

    pub async fn agent_status(&self) -> Result<ApiResponse, ApiError> {
        let response = self.request(Method::GET, "/agents/status", None, &[]).await?;
        if !response.success {
            warn!(error = ?response.error, "agent status request unsuccessful");
        }
        Ok(response)
    }

    pub async fn agent_logs(&self, query: &LogQuery) -> Result<ApiResponse, ApiError> {
        let response = self
            .request(Method::GET, "/agents/logs", None, &query.to_pairs())
            .await?;
        if response.success {
            let count = response
                .data
                .as_ref()
                .and_then(|data| data.get("logs"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            debug!(count, "retrieved agent logs");
        } else {
            warn!(error = ?response.error, "agent logs request unsuccessful");
        }
        Ok(response)
    }

    /// Never fails: errors fold into an unsuccessful response with status 0.
    pub async fn health_check(&self) -> ApiResponse {
        match self.request(Method::GET, "/health", None, &[]).await {
            Ok(response) => {
                if !response.success {
                    warn!(error = ?response.error, "api health check failed");
                }
                response
            }
            Err(err) => {
                warn!(error = %err, "api health check error");
                ApiResponse::failure(format!("Health check failed: {err}"), 0)
            }
        }
    }

    pub async fn test_connection(&self) -> bool {
        self.health_check().await.success
    }
}
