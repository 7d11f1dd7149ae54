//! Review persistence, report view reads and HTTP fetch utilities for reviewpipe.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use reviewpipe_core::CanonicalReview;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod memory;
mod postgres;
mod postgrest;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use postgrest::PostgrestStore;

pub const CRATE_NAME: &str = "reviewpipe-storage";

/// Table holding collected reviews, unique on `(source, review_id)`.
pub const RAW_REVIEWS_TABLE: &str = "raw_reviews";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Pseudonymous author identity. A missing name hashes like the empty string.
pub fn author_hash(author_name: Option<&str>) -> String {
    sha256_hex(author_name.unwrap_or_default().as_bytes())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned http {status}: {message}")]
    Status { status: u16, message: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unexpected store response: {0}")]
    Decode(String),
}

/// Insert-or-ignore sink for canonical reviews.
#[async_trait]
pub trait ReviewSink: Send + Sync {
    /// Writes `rows`, leaving rows whose `(source, review_id)` already exists untouched.
    /// Returns the number of rows actually inserted; an empty slice is `Ok(0)`.
    async fn insert_new(&self, rows: &[CanonicalReview]) -> Result<u64, StoreError>;
}

/// Precomputed sentiment views maintained by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportView {
    Kpis,
    AspectSentiment,
    AspectQuotes,
}

impl ReportView {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportView::Kpis => "v_kpis",
            ReportView::AspectSentiment => "v_aspect_sentiment",
            ReportView::AspectQuotes => "v_aspect_quotes",
        }
    }
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Returns every row of `view` as a JSON object.
    async fn fetch_view(&self, view: ReportView) -> Result<Vec<JsonValue>, StoreError>;
}

/// Backing-store connection secrets, validated by presence only.
#[derive(Clone)]
pub struct StoreCredentials {
    pub project_url: String,
    pub service_role_key: String,
}

impl fmt::Debug for StoreCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreCredentials")
            .field("project_url", &self.project_url)
            .field("service_role_key", &"<redacted>")
            .finish()
    }
}

/// Store selected from the project URL scheme: `postgres://` talks to the database directly,
/// anything else is treated as a PostgREST endpoint.
#[derive(Debug)]
pub enum StoreBackend {
    Postgrest(PostgrestStore),
    Postgres(PgStore),
}

impl StoreBackend {
    /// Builds the store without touching the network; connections are opened on first use.
    pub fn connect(
        credentials: &StoreCredentials,
        timeout: Duration,
    ) -> Result<Arc<Self>, StoreError> {
        let url = credentials.project_url.trim();
        let backend = if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            StoreBackend::Postgres(PgStore::connect_lazy(url)?)
        } else {
            StoreBackend::Postgrest(PostgrestStore::new(credentials, timeout)?)
        };
        debug!(backend = backend.kind(), "configured review store");
        Ok(Arc::new(backend))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreBackend::Postgrest(_) => "postgrest",
            StoreBackend::Postgres(_) => "postgres",
        }
    }
}

#[async_trait]
impl ReviewSink for StoreBackend {
    async fn insert_new(&self, rows: &[CanonicalReview]) -> Result<u64, StoreError> {
        match self {
            StoreBackend::Postgrest(store) => store.insert_new(rows).await,
            StoreBackend::Postgres(store) => store.insert_new(rows).await,
        }
    }
}

#[async_trait]
impl ReportStore for StoreBackend {
    async fn fetch_view(&self, view: ReportView) -> Result<Vec<JsonValue>, StoreError> {
        match self {
            StoreBackend::Postgrest(store) => store.fetch_view(view).await,
            StoreBackend::Postgres(store) => store.fetch_view(view).await,
        }
    }
}

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
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry schedule for feed fetches. `max_retries: 0` makes every fetch single-shot.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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
            backoff: config.backoff,
        })
    }

    /// GETs `url`. Any non-2xx status that is not retried comes back as `FetchError::HttpStatus`.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.fetch_query(run_id, source_id, url, &[]).await
    }

    /// GETs `url` with url-encoded `query` pairs appended.
    pub async fn fetch_query(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.send_with_retries(|| self.client.get(url).query(query))
            .instrument(span)
            .await
    }

    /// POSTs an `application/x-www-form-urlencoded` body, with the same retry and status
    /// handling as [`HttpFetcher::fetch_bytes`].
    pub async fn post_form(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, &str)],
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post", %run_id, source_id, url);
        self.send_with_retries(|| self.client.post(url).query(query).form(form))
            .instrument(span)
            .await
    }

    async fn send_with_retries(
        &self,
        request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match request().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying fetch");
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
