//! Review collection orchestration: targets, adapters, chunked idempotent writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reviewpipe_adapters::{adapter_for_source, AdapterContext, AdapterSettings, SourceAdapter};
use reviewpipe_core::{AppTarget, CanonicalReview, RatingPolicy, ReviewSource};
use reviewpipe_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, MemoryStore, ReviewSink, StoreBackend,
    StoreCredentials,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "reviewpipe-sync";

/// Rows per sink call; keeps each insert payload comfortably small.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

pub const DEFAULT_APP_ID: &str = "1541576007";
pub const DEFAULT_COUNTRY: &str = "ph";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Missing PROJECT_URL or SERVICE_ROLE_KEY")]
    MissingSecrets,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub project_url: Option<String>,
    pub service_role_key: Option<String>,
    pub targets_path: PathBuf,
    pub feed_base_url: String,
    pub play_base_url: String,
    pub play_lang: String,
    pub play_max_reviews: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_retries: usize,
    pub chunk_size: usize,
    pub rating_policy: RatingPolicy,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            project_url: lookup("PROJECT_URL"),
            service_role_key: lookup("SERVICE_ROLE_KEY"),
            targets_path: lookup("REVIEWPIPE_TARGETS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./targets.yaml")),
            feed_base_url: lookup("REVIEWPIPE_FEED_BASE_URL")
                .unwrap_or_else(|| reviewpipe_adapters::APP_STORE_FEED_BASE_URL.to_string()),
            play_base_url: lookup("REVIEWPIPE_PLAY_BASE_URL")
                .unwrap_or_else(|| reviewpipe_adapters::GOOGLE_PLAY_BASE_URL.to_string()),
            play_lang: lookup("REVIEWPIPE_PLAY_LANG")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| reviewpipe_adapters::GOOGLE_PLAY_DEFAULT_LANG.to_string()),
            play_max_reviews: lookup("REVIEWPIPE_PLAY_MAX_REVIEWS")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(reviewpipe_adapters::GOOGLE_PLAY_MAX_REVIEWS),
            user_agent: lookup("REVIEWPIPE_USER_AGENT")
                .unwrap_or_else(|| "reviewpipe/0.1".to_string()),
            http_timeout_secs: lookup("REVIEWPIPE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_retries: lookup("REVIEWPIPE_HTTP_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            chunk_size: lookup("REVIEWPIPE_CHUNK_SIZE")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            rating_policy: if lookup("REVIEWPIPE_KEEP_ZERO_RATING")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false)
            {
                RatingPolicy::KeepZero
            } else {
                RatingPolicy::ZeroIsMissing
            },
        }
    }

    /// Both secrets must be present and non-blank; their values are not otherwise checked.
    pub fn credentials(&self) -> Result<StoreCredentials, ConfigError> {
        let present = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
        };
        match (present(&self.project_url), present(&self.service_role_key)) {
            (Some(project_url), Some(service_role_key)) => Ok(StoreCredentials {
                project_url,
                service_role_key,
            }),
            _ => Err(ConfigError::MissingSecrets),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout(),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_retries,
                ..Default::default()
            },
        }
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            app_store_base_url: self.feed_base_url.clone(),
            google_play_base_url: self.play_base_url.clone(),
            google_play_lang: self.play_lang.clone(),
            google_play_max_reviews: self.play_max_reviews,
            rating_policy: self.rating_policy,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetRegistry {
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub source: ReviewSource,
    pub app_id: String,
    pub country: String,
    /// Store search terms used when `app_id` turns up no reviews (Google Play only).
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self {
            targets: vec![TargetConfig {
                source: ReviewSource::AppStore,
                app_id: DEFAULT_APP_ID.to_string(),
                country: DEFAULT_COUNTRY.to_string(),
                query: None,
                enabled: true,
                notes: None,
            }],
        }
    }
}

impl TargetRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: TargetRegistry =
            serde_yaml::from_str(text).context("parsing target registry")?;
        for target in &registry.targets {
            let country = target.country.trim();
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                bail!(
                    "target {}:{} has invalid country code `{}`",
                    target.source,
                    target.app_id,
                    target.country
                );
            }
            if target.app_id.trim().is_empty() {
                bail!("target for {} has an empty app_id", target.source);
            }
        }
        Ok(registry)
    }

    /// Loads the registry at `path`, or the built-in single target when the file does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            info!(
                path = %path.display(),
                "no target registry found; using built-in default target"
            );
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled_targets(&self) -> Vec<AppTarget> {
        self.targets
            .iter()
            .filter(|t| t.enabled)
            .map(|t| {
                let target = AppTarget::new(t.source, t.app_id.trim(), &t.country);
                match &t.query {
                    Some(query) => target.with_query(query),
                    None => target,
                }
            })
            .collect()
    }
}

/// Tagged result of one adapter run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Collected { target: AppTarget, fetched: usize },
    Failed { target: AppTarget, reason: String },
}

impl SourceOutcome {
    pub fn target(&self) -> &AppTarget {
        match self {
            SourceOutcome::Collected { target, .. } | SourceOutcome::Failed { target, .. } => {
                target
            }
        }
    }

    pub fn fetched(&self) -> usize {
        match self {
            SourceOutcome::Collected { fetched, .. } => *fetched,
            SourceOutcome::Failed { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkOutcome {
    pub index: usize,
    pub rows: usize,
    pub inserted: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub inserted: u64,
    pub sources: Vec<SourceOutcome>,
    pub chunks: Vec<ChunkOutcome>,
}

/// Response body of the collect endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectSummary {
    pub ok: bool,
    pub inserted: u64,
    pub sources: BTreeMap<String, usize>,
}

impl CollectRun {
    /// Per-source counts are reviews fetched, not inserted. Every source with a target in
    /// this run is listed; a source whose targets all failed reports zero.
    pub fn summary(&self) -> CollectSummary {
        let mut sources = BTreeMap::new();
        for outcome in &self.sources {
            *sources
                .entry(outcome.target().source.as_str().to_string())
                .or_insert(0) += outcome.fetched();
        }
        CollectSummary {
            ok: true,
            inserted: self.inserted,
            sources,
        }
    }

    pub fn failed_sources(&self) -> usize {
        self.sources
            .iter()
            .filter(|o| matches!(o, SourceOutcome::Failed { .. }))
            .count()
    }

    pub fn failed_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.error.is_some()).count()
    }
}

#[derive(Clone)]
pub struct CollectJob {
    pub adapter: Arc<dyn SourceAdapter>,
    pub target: AppTarget,
}

pub struct CollectPipeline {
    http: Arc<HttpFetcher>,
    sink: Arc<dyn ReviewSink>,
    jobs: Vec<CollectJob>,
    chunk_size: usize,
}

impl CollectPipeline {
    pub fn new(http: Arc<HttpFetcher>, sink: Arc<dyn ReviewSink>, jobs: Vec<CollectJob>) -> Self {
        Self {
            http,
            sink,
            jobs,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn from_config(
        config: &PipelineConfig,
        registry: &TargetRegistry,
        sink: Arc<dyn ReviewSink>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let settings = config.adapter_settings();
        let jobs = registry
            .enabled_targets()
            .into_iter()
            .map(|target| CollectJob {
                adapter: adapter_for_source(target.source, &settings),
                target,
            })
            .collect();
        Ok(Self::new(Arc::new(http), sink, jobs).with_chunk_size(config.chunk_size))
    }

    /// One collection pass. Source and chunk failures are recorded in the returned run,
    /// never propagated.
    pub async fn run_once(&self) -> CollectRun {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("collect_run", %run_id);

        async move {
            let ctx = AdapterContext { run_id };
            let (sources, rows) = self.collect_all(&ctx).await;
            let chunks = self.write_chunks(&rows).await;
            let inserted = chunks.iter().map(|c| c.inserted).sum();

            let run = CollectRun {
                run_id,
                started_at,
                finished_at: Utc::now(),
                inserted,
                sources,
                chunks,
            };
            info!(
                fetched = rows.len(),
                inserted = run.inserted,
                failed_sources = run.failed_sources(),
                failed_chunks = run.failed_chunks(),
                "collection run finished"
            );
            run
        }
        .instrument(span)
        .await
    }

    async fn collect_all(
        &self,
        ctx: &AdapterContext,
    ) -> (Vec<SourceOutcome>, Vec<CanonicalReview>) {
        let handles = self
            .jobs
            .iter()
            .map(|job| {
                let adapter = Arc::clone(&job.adapter);
                let target = job.target.clone();
                let http = Arc::clone(&self.http);
                let ctx = ctx.clone();
                let span = info_span!("collect_source", %target);
                tokio::spawn(
                    async move { adapter.collect(&http, &ctx, &target).await }.instrument(span),
                )
            })
            .collect::<Vec<_>>();

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut rows = Vec::new();
        for (job, handle) in self.jobs.iter().zip(handles) {
            let target = job.target.clone();
            match handle.await {
                Ok(Ok(mut collected)) => {
                    info!(%target, fetched = collected.len(), "source collected");
                    outcomes.push(SourceOutcome::Collected {
                        target,
                        fetched: collected.len(),
                    });
                    rows.append(&mut collected);
                }
                Ok(Err(err)) => {
                    warn!(%target, error = %err, "source failed; contributing no reviews");
                    outcomes.push(SourceOutcome::Failed {
                        target,
                        reason: err.to_string(),
                    });
                }
                Err(join_err) => {
                    warn!(
                        %target,
                        error = %join_err,
                        "source task aborted; contributing no reviews"
                    );
                    outcomes.push(SourceOutcome::Failed {
                        target,
                        reason: format!("adapter task failed: {join_err}"),
                    });
                }
            }
        }
        (outcomes, rows)
    }

    async fn write_chunks(&self, rows: &[CanonicalReview]) -> Vec<ChunkOutcome> {
        let mut outcomes = Vec::new();
        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            let outcome = match self.sink.insert_new(chunk).await {
                Ok(inserted) => ChunkOutcome {
                    index,
                    rows: chunk.len(),
                    inserted,
                    error: None,
                },
                Err(err) => {
                    warn!(
                        chunk = index,
                        rows = chunk.len(),
                        error = %err,
                        "chunk write failed; continuing"
                    );
                    ChunkOutcome {
                        index,
                        rows: chunk.len(),
                        inserted: 0,
                        error: Some(err.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// Runs one collection pass against the configured store, or an in-memory store when
/// `dry_run` is set.
pub async fn run_collect_once(config: &PipelineConfig, dry_run: bool) -> Result<CollectRun> {
    let credentials = config.credentials()?;
    let registry = TargetRegistry::load(&config.targets_path).await?;
    let sink: Arc<dyn ReviewSink> = if dry_run {
        Arc::new(MemoryStore::new())
    } else {
        StoreBackend::connect(&credentials, config.http_timeout())?
    };
    let pipeline = CollectPipeline::from_config(config, &registry, sink)?;
    Ok(pipeline.run_once().await)
}

pub async fn run_collect_once_from_env(dry_run: bool) -> Result<CollectRun> {
    run_collect_once(&PipelineConfig::from_env(), dry_run).await
}
