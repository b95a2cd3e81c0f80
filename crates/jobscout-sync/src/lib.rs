//! Run pipeline: scrape every enabled source concurrently, dedup at the join
//! point, enrich, write run reports and push the unique jobs to the job API.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use jobscout_adapters::{adapter_for_source, CompanyConfig, SearchParams, SourceAdapter, SourceKind};
use jobscout_core::{detect_remote_work, extract_benefits, extract_requirements, JobRecord};
use jobscout_dedup::{DuplicateDetector, DEFAULT_SIMILARITY_THRESHOLD};
use jobscout_http::{ApiClient, ApiClientConfig, HttpClientConfig, HttpFetcher, DEFAULT_USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobscout-sync";
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_API_URL: &str = "http://localhost:3000/api";
pub const DEFAULT_SYNC_CRON: &str = "0 0 */4 * * *";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub kind: SourceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub rate_limit_per_sec: Option<f64>,
    #[serde(default)]
    pub company: Option<CompanyConfig>,
}

fn default_enabled() -> bool {
    true
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        let mut seen = std::collections::HashSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id `{}` in source registry", source.source_id);
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub source_timeout_secs: u64,
    pub source_max_retries: usize,
    pub source_retry_delay_secs: u64,
    pub similarity_threshold: f64,
    pub workspace_root: PathBuf,
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            api_url: non_empty(lookup("JOBSCOUT_API_URL"))
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_key: non_empty(lookup("JOBSCOUT_API_KEY")),
            scheduler_enabled: lookup("JOBSCOUT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            sync_cron: non_empty(lookup("JOBSCOUT_SYNC_CRON"))
                .unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            user_agent: non_empty(lookup("JOBSCOUT_USER_AGENT"))
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: parse_or(lookup("JOBSCOUT_HTTP_TIMEOUT_SECS"), 20),
            source_timeout_secs: parse_or(lookup("JOBSCOUT_SOURCE_TIMEOUT_SECS"), 900),
            source_max_retries: parse_or(lookup("JOBSCOUT_SOURCE_MAX_RETRIES"), 2),
            source_retry_delay_secs: parse_or(lookup("JOBSCOUT_SOURCE_RETRY_DELAY_SECS"), 5),
            similarity_threshold: parse_or(
                lookup("JOBSCOUT_SIMILARITY_THRESHOLD"),
                DEFAULT_SIMILARITY_THRESHOLD,
            ),
            workspace_root: non_empty(lookup("JOBSCOUT_WORKSPACE"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            source_timeout: Duration::from_secs(self.source_timeout_secs),
            max_retries: self.source_max_retries,
            retry_delay: Duration::from_secs(self.source_retry_delay_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

pub trait DedupHook: Send + Sync {
    fn apply(&self, items: Vec<JobRecord>) -> Result<Vec<JobRecord>>;
}

pub trait EnrichmentHook: Send + Sync {
    fn apply(&self, items: Vec<JobRecord>) -> Result<Vec<JobRecord>>;
}

#[derive(Default)]
pub struct NoopDedupHook;

impl DedupHook for NoopDedupHook {
    fn apply(&self, items: Vec<JobRecord>) -> Result<Vec<JobRecord>> {
        Ok(items)
    }
}

#[derive(Default)]
pub struct NoopEnrichmentHook;

impl EnrichmentHook for NoopEnrichmentHook {
    fn apply(&self, items: Vec<JobRecord>) -> Result<Vec<JobRecord>> {
        Ok(items)
    }
}

/// Runs a fresh [`DuplicateDetector`] over each batch, so nothing carries over
/// between runs.
pub struct DetectorDedupHook {
    similarity_threshold: f64,
}

impl DetectorDedupHook {
    pub fn new(similarity_threshold: f64) -> Self {
        Self { similarity_threshold }
    }
}

impl Default for DetectorDedupHook {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl DedupHook for DetectorDedupHook {
    fn apply(&self, items: Vec<JobRecord>) -> Result<Vec<JobRecord>> {
        let mut detector = DuplicateDetector::with_threshold(self.similarity_threshold);
        let unique = detector.remove_duplicates(items);
        let stats = detector.get_stats();
        debug!(?stats, "dedup pass complete");
        Ok(unique)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RelevanceRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<RelevanceRule>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelevanceRule {
    pub contains_any: Vec<String>,
    pub weight: f64,
}

/// Weighted keyword scoring from `rules/relevance.yaml`, plus requirement,
/// benefit and remote backfill from the record text.
pub struct RelevanceRuleEnrichmentHook {
    rules: Vec<RelevanceRule>,
}

impl RelevanceRuleEnrichmentHook {
    pub fn new(rules: Vec<RelevanceRule>) -> Self {
        Self { rules }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: RelevanceRulesFile = serde_yaml::from_str(text).context("parsing relevance rules")?;
        Ok(Self::new(file.rules))
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("relevance.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Matched weight over total positive weight, clamped to [0, 1].
    pub fn score(&self, job: &JobRecord) -> f64 {
        let total: f64 = self.rules.iter().map(|r| r.weight.max(0.0)).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let haystack = format!(
            "{} {} {}",
            job.title,
            job.description,
            job.requirements.join(" ")
        )
        .to_lowercase();
        let matched: f64 = self
            .rules
            .iter()
            .filter(|rule| {
                rule.contains_any
                    .iter()
                    .any(|needle| haystack.contains(&needle.to_lowercase()))
            })
            .map(|rule| rule.weight)
            .sum();
        (matched / total).clamp(0.0, 1.0)
    }
}

impl EnrichmentHook for RelevanceRuleEnrichmentHook {
    fn apply(&self, mut items: Vec<JobRecord>) -> Result<Vec<JobRecord>> {
        for job in &mut items {
            if job.requirements.is_empty() {
                job.requirements = extract_requirements(&job.description);
            }
            if job.benefits.is_empty() {
                job.benefits = extract_benefits(&job.description);
            }
            if !job.remote
                && detect_remote_work(&format!("{} {} {}", job.title, job.location, job.description))
            {
                job.remote = true;
            }
            job.relevance_score = self.score(job);
        }
        items.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Succeeded { jobs_found: usize, attempts: usize },
    Failed { error: String, attempts: usize },
    TimedOut { after_secs: f64 },
}

impl SourceOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_id: String,
    pub duration_secs: f64,
    pub outcome: SourceOutcome,
}

impl SourceReport {
    fn error_line(&self) -> Option<String> {
        match &self.outcome {
            SourceOutcome::Succeeded { .. } => None,
            SourceOutcome::Failed { error, attempts } => Some(format!(
                "{}: {error} (after {attempts} attempts)",
                self.source_id
            )),
            SourceOutcome::TimedOut { after_secs } => {
                Some(format!("{}: timed out after {after_secs:.1}s", self.source_id))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub source_timeout: Duration,
    pub max_retries: usize,
    pub retry_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            source_timeout: Duration::from_secs(900),
            max_retries: 2,
            retry_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeResults {
    pub jobs: Vec<JobRecord>,
    pub reports: Vec<SourceReport>,
    pub errors: Vec<String>,
    pub total_found: usize,
    pub duplicates_removed: usize,
}

pub struct ScrapeOrchestrator {
    http: Arc<HttpFetcher>,
    adapters: Vec<Box<dyn SourceAdapter>>,
    config: OrchestratorConfig,
}

impl ScrapeOrchestrator {
    pub fn new(
        http: Arc<HttpFetcher>,
        adapters: Vec<Box<dyn SourceAdapter>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { http, adapters, config }
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.source_id()).collect()
    }

    /// Scrapes every source concurrently, then feeds all records through
    /// `dedup` in source order. A failing source never aborts the others.
    pub async fn scrape_all(
        &self,
        run_id: Uuid,
        params: &SearchParams,
        dedup: &dyn DedupHook,
    ) -> Result<ScrapeResults> {
        info!(sources = self.adapters.len(), "scraping sources");
        let runs = self.adapters.iter().map(|adapter| {
            let span = info_span!("scrape_source", source_id = adapter.source_id());
            self.scrape_source(adapter.as_ref(), run_id, params)
                .instrument(span)
        });
        let finished = join_all(runs).await;

        let mut all_jobs = Vec::new();
        let mut reports = Vec::with_capacity(finished.len());
        let mut errors = Vec::new();
        for (report, jobs) in finished {
            if let Some(line) = report.error_line() {
                errors.push(line);
            }
            all_jobs.extend(jobs);
            reports.push(report);
        }

        let total_found = all_jobs.len();
        let jobs = dedup.apply(all_jobs).context("deduplicating scraped jobs")?;
        let duplicates_removed = total_found.saturating_sub(jobs.len());
        info!(
            total_found,
            unique = jobs.len(),
            duplicates_removed,
            failed_sources = errors.len(),
            "scrape join complete"
        );

        Ok(ScrapeResults {
            jobs,
            reports,
            errors,
            total_found,
            duplicates_removed,
        })
    }

    async fn scrape_source(
        &self,
        adapter: &dyn SourceAdapter,
        run_id: Uuid,
        params: &SearchParams,
    ) -> (SourceReport, Vec<JobRecord>) {
        let started = Instant::now();
        let attempts = self.scrape_with_retries(adapter, run_id, params);
        let (outcome, jobs) = match tokio::time::timeout(self.config.source_timeout, attempts).await {
            Ok(Ok((jobs, attempts))) => (
                SourceOutcome::Succeeded {
                    jobs_found: jobs.len(),
                    attempts,
                },
                jobs,
            ),
            Ok(Err((error, attempts))) => (SourceOutcome::Failed { error, attempts }, Vec::new()),
            Err(_) => {
                let after_secs = self.config.source_timeout.as_secs_f64();
                warn!(after_secs, "source deadline exceeded");
                (SourceOutcome::TimedOut { after_secs }, Vec::new())
            }
        };
        let report = SourceReport {
            source_id: adapter.source_id().to_string(),
            duration_secs: started.elapsed().as_secs_f64(),
            outcome,
        };
        (report, jobs)
    }

    async fn scrape_with_retries(
        &self,
        adapter: &dyn SourceAdapter,
        run_id: Uuid,
        params: &SearchParams,
    ) -> std::result::Result<(Vec<JobRecord>, usize), (String, usize)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match adapter.scrape(&self.http, run_id, params).await {
                Ok(jobs) => return Ok((jobs, attempt)),
                Err(err) if attempt <= self.config.max_retries => {
                    warn!(attempt, error = %err, "scrape attempt failed; retrying");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(err) => {
                    error!(attempt, error = %err, "source failed");
                    return Err((err.to_string(), attempt));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyCount {
    pub company: String,
    pub job_count: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunAnalysis {
    pub jobs_by_source: BTreeMap<String, usize>,
    pub top_companies: Vec<CompanyCount>,
    pub remote_percentage: f64,
}

const TOP_COMPANIES: usize = 10;

impl RunAnalysis {
    pub fn from_jobs(jobs: &[JobRecord]) -> Self {
        let mut jobs_by_source = BTreeMap::new();
        let mut by_company: BTreeMap<&str, usize> = BTreeMap::new();
        for job in jobs {
            *jobs_by_source.entry(job.source.clone()).or_insert(0) += 1;
            *by_company.entry(job.company.as_str()).or_insert(0) += 1;
        }
        let mut top_companies: Vec<_> = by_company
            .into_iter()
            .map(|(company, job_count)| CompanyCount {
                company: company.to_string(),
                job_count,
            })
            .collect();
        // BTreeMap order breaks ties alphabetically.
        top_companies.sort_by(|a, b| b.job_count.cmp(&a.job_count));
        top_companies.truncate(TOP_COMPANIES);

        let remote = jobs.iter().filter(|j| j.remote).count();
        let remote_percentage = if jobs.is_empty() {
            0.0
        } else {
            remote as f64 * 100.0 / jobs.len() as f64
        };

        Self {
            jobs_by_source,
            top_companies,
            remote_percentage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApiSyncOutcome {
    Skipped { reason: String },
    Synced { status_code: u16 },
    Rejected { status_code: u16, error: Option<String> },
    Failed { error: String },
}

impl fmt::Display for ApiSyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped { reason } => write!(f, "skipped ({reason})"),
            Self::Synced { status_code } => write!(f, "synced ({status_code})"),
            Self::Rejected { status_code, error } => write!(
                f,
                "rejected ({status_code}): {}",
                error.as_deref().unwrap_or("no error message")
            ),
            Self::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub sources: Vec<SourceReport>,
    pub total_jobs_found: usize,
    pub unique_jobs: usize,
    pub duplicates_removed: usize,
    pub errors: Vec<String>,
    pub analysis: RunAnalysis,
    pub api_sync: ApiSyncOutcome,
    pub reports_dir: String,
}

impl SyncRunSummary {
    pub fn sources_successful(&self) -> usize {
        self.sources.iter().filter(|s| s.outcome.is_success()).count()
    }

    pub fn synced(&self) -> bool {
        matches!(self.api_sync, ApiSyncOutcome::Synced { .. })
    }

    /// `execution_stats` payload sent alongside the jobs.
    pub fn execution_stats(&self) -> serde_json::Value {
        json!({
            "run_id": self.run_id,
            "total_jobs_found": self.total_jobs_found,
            "unique_jobs": self.unique_jobs,
            "duplicates_removed": self.duplicates_removed,
            "sources_scraped": self.sources.len(),
            "sources_successful": self.sources_successful(),
            "total_errors": self.errors.len(),
            "errors": self.errors,
            "scraping_duration": self.duration_secs,
            "sources": self.sources,
            "analysis": self.analysis,
        })
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct SyncPipeline {
    config: SyncConfig,
    http: Arc<HttpFetcher>,
    api: Option<ApiClient>,
    dedup: Box<dyn DedupHook>,
    enrichment: Box<dyn EnrichmentHook>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let api = match &config.api_key {
            Some(key) => {
                let mut api_config = ApiClientConfig::new(&config.api_url, key);
                api_config.user_agent = config.user_agent.clone();
                Some(ApiClient::new(api_config).context("building api client")?)
            }
            None => {
                warn!("JOBSCOUT_API_KEY not set; api sync disabled");
                None
            }
        };
        Ok(Self {
            config,
            http: Arc::new(http),
            api,
            dedup: Box::<NoopDedupHook>::default(),
            enrichment: Box::<NoopEnrichmentHook>::default(),
            run_lock: Mutex::new(()),
        })
    }

    pub fn with_hooks(
        mut self,
        dedup: Box<dyn DedupHook>,
        enrichment: Box<dyn EnrichmentHook>,
    ) -> Self {
        self.dedup = dedup;
        self.enrichment = enrichment;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs one full sync, waiting for any run already in progress.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        self.execute().await
    }

    /// Like [`run_once`](Self::run_once) but returns `None` immediately when a
    /// run is already in progress.
    pub async fn try_run_once(&self) -> Option<Result<SyncRunSummary>> {
        let _guard = self.run_lock.try_lock().ok()?;
        Some(self.execute().await)
    }

    async fn execute(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.execute_run(run_id).instrument(span).await
    }

    async fn execute_run(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let root = &self.config.workspace_root;

        let registry = SourceRegistry::load(&root.join("sources.yaml")).await?;
        let params = load_search_params(root).await?;

        let mut adapters = Vec::new();
        for source in registry.enabled() {
            let adapter = adapter_for_source(&source.source_id, source.kind, source.company.as_ref())
                .with_context(|| format!("building adapter for {}", source.source_id))?;
            if let Some(rate) = source.rate_limit_per_sec {
                self.http.set_rate_limit(&source.source_id, rate).await;
            }
            adapters.push(adapter);
        }
        info!(enabled_sources = adapters.len(), "sync run started");

        let orchestrator =
            ScrapeOrchestrator::new(self.http.clone(), adapters, self.config.orchestrator_config());
        let results = orchestrator
            .scrape_all(run_id, &params, self.dedup.as_ref())
            .await?;
        let jobs = self.enrichment.apply(results.jobs).context("enriching jobs")?;

        let reports_dir = root.join("reports").join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        write_json(&reports_dir.join("jobs.json"), &jobs).await?;

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            duration_secs: clock.elapsed().as_secs_f64(),
            sources: results.reports,
            total_jobs_found: results.total_found,
            unique_jobs: jobs.len(),
            duplicates_removed: results.duplicates_removed,
            errors: results.errors,
            analysis: RunAnalysis::from_jobs(&jobs),
            api_sync: ApiSyncOutcome::Skipped {
                reason: "not attempted".to_string(),
            },
            reports_dir: reports_dir.display().to_string(),
        };
        summary.api_sync = self.sync_to_api(&jobs, &summary).await;
        summary.finished_at = Utc::now();
        summary.duration_secs = clock.elapsed().as_secs_f64();

        write_json(&reports_dir.join("run_summary.json"), &summary).await?;
        info!(
            unique_jobs = summary.unique_jobs,
            duplicates_removed = summary.duplicates_removed,
            sources_successful = summary.sources_successful(),
            api_sync = %summary.api_sync,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn sync_to_api(&self, jobs: &[JobRecord], summary: &SyncRunSummary) -> ApiSyncOutcome {
        let Some(api) = &self.api else {
            return ApiSyncOutcome::Skipped {
                reason: "no api key configured".to_string(),
            };
        };
        match api
            .sync_jobs(jobs, &summary.execution_stats(), AGENT_VERSION)
            .await
        {
            Ok(response) if response.success => ApiSyncOutcome::Synced {
                status_code: response.status_code,
            },
            Ok(response) => {
                warn!(status_code = response.status_code, error = ?response.error, "api rejected sync");
                ApiSyncOutcome::Rejected {
                    status_code: response.status_code,
                    error: response.error,
                }
            }
            Err(err) => {
                error!(error = %err, "api sync failed");
                ApiSyncOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    /// Builds the cron scheduler when enabled. Ticks that land while a run is
    /// still going are skipped.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.try_run_once().await {
                    None => warn!("previous sync still running; skipping scheduled run"),
                    Some(Ok(summary)) => info!(run_id = %summary.run_id, "scheduled sync complete"),
                    Some(Err(err)) => error!(error = ?err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

async fn load_search_params(root: &Path) -> Result<SearchParams> {
    let path = root.join("search.yaml");
    if !fs::try_exists(&path).await.unwrap_or(false) {
        info!(path = %path.display(), "no search config; using defaults");
        return Ok(SearchParams::default());
    }
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

pub fn build_pipeline(config: SyncConfig) -> Result<SyncPipeline> {
    let enrichment = RelevanceRuleEnrichmentHook::from_workspace_root(&config.workspace_root)?;
    let dedup = DetectorDedupHook::new(config.similarity_threshold);
    Ok(SyncPipeline::new(config)?.with_hooks(Box::new(dedup), Box::new(enrichment)))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    build_pipeline(SyncConfig::from_env())?.run_once().await
}

/// Markdown digest of the `runs` most recent run summaries under
/// `<root>/reports`.
pub fn report_recent_runs(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut lines = vec!["# Job Scout Recent Runs".to_string(), String::new()];
    if !reports_root.exists() {
        lines.push("No runs recorded yet.".to_string());
        return Ok(lines.join("\n"));
    }

    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let path = entry
            .with_context(|| format!("reading {}", reports_root.display()))?
            .path()
            .join("run_summary.json");
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        match serde_json::from_str::<SyncRunSummary>(&text) {
            Ok(summary) => summaries.push(summary),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable run summary"),
        }
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    if summaries.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for summary in summaries.iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at.to_rfc3339()));
        lines.push(format!("- duration: {:.1}s", summary.duration_secs));
        lines.push(format!(
            "- sources: {}/{} succeeded",
            summary.sources_successful(),
            summary.sources.len()
        ));
        lines.push(format!(
            "- jobs: {} found, {} unique, {} duplicates removed",
            summary.total_jobs_found, summary.unique_jobs, summary.duplicates_removed
        ));
        lines.push(format!("- remote: {:.0}%", summary.analysis.remote_percentage));
        lines.push(format!("- api sync: {}", summary.api_sync));
        if !summary.errors.is_empty() {
            lines.push(format!("- errors: {}", summary.errors.len()));
            for error in &summary.errors {
                lines.push(format!("  - {error}"));
            }
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jobscout_adapters::AdapterError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn job(title: &str, company: &str, source: &str) -> JobRecord {
        let mut record = JobRecord::new(
            title,
            company,
            "Remote",
            format!("{title} at {company}. Build and operate distributed services."),
            format!("https://example.com/{source}/{}", title.to_lowercase().replace(' ', "-")),
        );
        record.source = source.to_string();
        record
    }

    enum Behavior {
        Fixed(Vec<JobRecord>),
        FailTimes(usize, Vec<JobRecord>),
        AlwaysFail,
        Slow,
    }

    struct FakeAdapter {
        id: String,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl FakeAdapter {
        fn boxed(id: &str, behavior: Behavior) -> Box<dyn SourceAdapter> {
            Box::new(Self {
                id: id.to_string(),
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SourceAdapter for FakeAdapter {
        fn source_id(&self) -> &str {
            &self.id
        }

        fn search_urls(&self, _params: &SearchParams) -> Vec<String> {
            Vec::new()
        }

        fn parse_listing(&self, _html: &str, _page_url: &str) -> Result<Vec<JobRecord>, AdapterError> {
            Ok(Vec::new())
        }

        async fn scrape(
            &self,
            _http: &HttpFetcher,
            _run_id: Uuid,
            _params: &SearchParams,
        ) -> Result<Vec<JobRecord>, AdapterError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Fixed(jobs) => Ok(jobs.clone()),
                Behavior::FailTimes(n, jobs) if call >= *n => Ok(jobs.clone()),
                Behavior::FailTimes(..) => Err(AdapterError::Message("flaky upstream".into())),
                Behavior::AlwaysFail => Err(AdapterError::Message("board is down".into())),
                Behavior::Slow => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Vec::new())
                }
            }
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            source_timeout: Duration::from_millis(300),
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
        }
    }

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("fetcher"))
    }

    #[test]
    fn config_defaults_without_env() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.api_key, None);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.sync_cron, DEFAULT_SYNC_CRON);
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.source_timeout_secs, 900);
        assert_eq!(config.source_max_retries, 2);
        assert_eq!(config.source_retry_delay_secs, 5);
        assert_eq!(config.similarity_threshold, DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(config.workspace_root, PathBuf::from("."));
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("JOBSCOUT_API_URL", "https://jobs.example.com/api"),
            ("JOBSCOUT_API_KEY", "secret"),
            ("JOBSCOUT_SCHEDULER_ENABLED", "TRUE"),
            ("JOBSCOUT_SOURCE_MAX_RETRIES", "4"),
            ("JOBSCOUT_SIMILARITY_THRESHOLD", "0.9"),
            ("JOBSCOUT_HTTP_TIMEOUT_SECS", "soon"),
            ("JOBSCOUT_WORKSPACE", "/srv/jobscout"),
        ]);
        let config = SyncConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.api_url, "https://jobs.example.com/api");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert!(config.scheduler_enabled);
        assert_eq!(config.source_max_retries, 4);
        assert_eq!(config.similarity_threshold, 0.9);
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.workspace_root, PathBuf::from("/srv/jobscout"));
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        let config = SyncConfig::from_lookup(|key| (key == "JOBSCOUT_API_KEY").then(|| "  ".to_string()));
        assert_eq!(config.api_key, None);
    }

    #[test]
    fn registry_parses_sources_and_defaults_enabled() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - source_id: remote_ok
    kind: remote_ok
    rate_limit_per_sec: 0.5
  - source_id: weworkremotely
    kind: we_work_remotely
    enabled: false
  - source_id: company_acme
    display_name: Acme Careers
    kind: company
    company:
      name: Acme
      careers_url: https://acme.example.com/careers
"#,
        )
        .expect("registry");
        assert_eq!(registry.sources.len(), 3);
        assert_eq!(registry.sources[0].rate_limit_per_sec, Some(0.5));
        let enabled: Vec<_> = registry.enabled().map(|s| s.source_id.as_str()).collect();
        assert_eq!(enabled, vec!["remote_ok", "company_acme"]);
        let company = registry.sources[2].company.as_ref().expect("company block");
        assert_eq!(company.name, "Acme");
    }

    #[test]
    fn registry_rejects_duplicate_source_ids() {
        let err = SourceRegistry::from_yaml_str(
            "sources:\n  - source_id: a\n    kind: remote_ok\n  - source_id: a\n    kind: remote_ok\n",
        )
        .expect_err("duplicate ids");
        assert!(err.to_string().contains("duplicate source_id"));
    }

    #[tokio::test]
    async fn orchestrator_isolates_failures_and_dedups_in_source_order() {
        let shared = job("Rust Engineer", "Ferrous Labs", "board_a");
        let mut same_elsewhere = shared.clone();
        same_elsewhere.source = "board_b".into();

        let orchestrator = ScrapeOrchestrator::new(
            fetcher(),
            vec![
                FakeAdapter::boxed(
                    "board_a",
                    Behavior::Fixed(vec![shared.clone(), job("Data Analyst", "Numbers Inc", "board_a")]),
                ),
                FakeAdapter::boxed("board_b", Behavior::FailTimes(1, vec![same_elsewhere])),
                FakeAdapter::boxed("board_c", Behavior::AlwaysFail),
            ],
            fast_config(),
        );

        let results = orchestrator
            .scrape_all(Uuid::new_v4(), &SearchParams::default(), &DetectorDedupHook::default())
            .await
            .expect("scrape");

        assert_eq!(orchestrator.source_ids(), vec!["board_a", "board_b", "board_c"]);
        assert_eq!(results.total_found, 3);
        assert_eq!(results.jobs.len(), 2);
        assert_eq!(results.duplicates_removed, 1);
        // The first-registered source wins the duplicate.
        assert_eq!(results.jobs[0].source, "board_a");

        let ids: Vec<_> = results.reports.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["board_a", "board_b", "board_c"]);
        assert_eq!(
            results.reports[1].outcome,
            SourceOutcome::Succeeded { jobs_found: 1, attempts: 2 }
        );
        assert_eq!(
            results.reports[2].outcome,
            SourceOutcome::Failed {
                error: "board is down".into(),
                attempts: 3
            }
        );
        assert_eq!(results.errors.len(), 1);
        assert!(results.errors[0].starts_with("board_c: board is down"));
    }

    #[tokio::test]
    async fn slow_source_times_out_without_blocking_others() {
        let orchestrator = ScrapeOrchestrator::new(
            fetcher(),
            vec![
                FakeAdapter::boxed("slow", Behavior::Slow),
                FakeAdapter::boxed("fast", Behavior::Fixed(vec![job("QA Lead", "Testers", "fast")])),
            ],
            fast_config(),
        );

        let started = Instant::now();
        let results = orchestrator
            .scrape_all(Uuid::new_v4(), &SearchParams::default(), &NoopDedupHook)
            .await
            .expect("scrape");

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(results.reports[0].outcome, SourceOutcome::TimedOut { .. }));
        assert!(results.reports[1].outcome.is_success());
        assert_eq!(results.jobs.len(), 1);
        assert!(results.errors[0].contains("timed out"));
    }

    #[test]
    fn relevance_hook_scores_backfills_and_sorts() {
        let hook = RelevanceRuleEnrichmentHook::from_yaml_str(
            r#"
version: 1
rules:
  - contains_any: ["rust"]
    weight: 3
  - contains_any: ["kubernetes", "k8s"]
    weight: 1
"#,
        )
        .expect("rules");

        let plain = job("Office Manager", "Acme", "a");
        let mut rusty = job("Rust Engineer", "Ferrous", "a");
        rusty.description =
            "Work from home building Rust services on k8s.\nBenefits:\n- Health insurance coverage\n".into();
        rusty.remote = false;

        let enriched = hook.apply(vec![plain, rusty]).expect("enrich");
        assert_eq!(enriched[0].title, "Rust Engineer");
        assert_eq!(enriched[0].relevance_score, 1.0);
        assert!(enriched[0].remote);
        assert!(!enriched[0].benefits.is_empty());
        assert_eq!(enriched[1].relevance_score, 0.0);
    }

    #[test]
    fn relevance_score_is_zero_without_rules() {
        let hook = RelevanceRuleEnrichmentHook::new(Vec::new());
        assert_eq!(hook.score(&job("Rust Engineer", "Ferrous", "a")), 0.0);
    }

    #[test]
    fn analysis_counts_sources_companies_and_remote_share() {
        let mut onsite = job("Chef", "Kitchen Co", "b");
        onsite.remote = false;
        let mut remote = job("Rust Engineer", "Ferrous", "a");
        remote.remote = true;
        let mut remote_two = job("Go Engineer", "Ferrous", "a");
        remote_two.remote = true;
        let onsite_two = {
            let mut j = job("Baker", "Kitchen Co", "b");
            j.remote = false;
            j
        };

        let analysis = RunAnalysis::from_jobs(&[remote, onsite, remote_two, onsite_two]);
        assert_eq!(analysis.jobs_by_source.get("a"), Some(&2));
        assert_eq!(analysis.jobs_by_source.get("b"), Some(&2));
        assert_eq!(analysis.top_companies[0].company, "Ferrous");
        assert_eq!(analysis.top_companies[1].company, "Kitchen Co");
        assert_eq!(analysis.remote_percentage, 50.0);
    }

    const CAREERS_PAGE: &str = r#"
        <html><body>
          <div class="job-listing">
            <h3 class="job-title">Backend Engineer</h3>
            <span class="location">Remote</span>
            <a href="/jobs/1">Apply</a>
          </div>
          <div class="job-listing">
            <h3 class="job-title">Product Designer</h3>
            <span class="location">Berlin</span>
            <a href="/jobs/2">Apply</a>
          </div>
        </body></html>
    "#;

    /// Serves `CAREERS_PAGE` to every connection.
    async fn careers_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut request = Vec::new();
                    while !String::from_utf8_lossy(&request).contains("\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let reply = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{CAREERS_PAGE}",
                        CAREERS_PAGE.len()
                    );
                    let _ = socket.write_all(reply.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/careers")
    }

    fn write_workspace(root: &Path, careers_url: &str) {
        std::fs::write(
            root.join("sources.yaml"),
            format!(
                r#"
sources:
  - source_id: acme_main
    kind: company
    company:
      name: Acme
      careers_url: {careers_url}
  - source_id: acme_mirror
    kind: company
    company:
      name: Acme
      careers_url: {careers_url}
  - source_id: remote_ok
    kind: remote_ok
    enabled: false
"#
            ),
        )
        .expect("sources.yaml");
        std::fs::create_dir_all(root.join("rules")).expect("rules dir");
        std::fs::write(
            root.join("rules").join("relevance.yaml"),
            "version: 1\nrules:\n  - contains_any: [\"engineer\"]\n    weight: 1\n",
        )
        .expect("relevance.yaml");
    }

    fn test_config(root: &Path) -> SyncConfig {
        let mut config = SyncConfig::from_lookup(|_| None);
        config.workspace_root = root.to_path_buf();
        config.http_timeout_secs = 5;
        config.source_timeout_secs = 30;
        config.source_retry_delay_secs = 0;
        config
    }

    #[tokio::test]
    async fn run_once_scrapes_dedups_and_writes_reports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let careers_url = careers_server().await;
        write_workspace(dir.path(), &careers_url);

        let pipeline = build_pipeline(test_config(dir.path())).expect("pipeline");
        let summary = pipeline.run_once().await.expect("run");

        assert_eq!(summary.sources.len(), 2);
        assert_eq!(summary.sources_successful(), 2);
        assert_eq!(summary.total_jobs_found, 4);
        assert_eq!(summary.unique_jobs, 2);
        assert_eq!(summary.duplicates_removed, 2);
        assert!(summary.errors.is_empty());
        assert!(!summary.synced());
        assert!(matches!(summary.api_sync, ApiSyncOutcome::Skipped { .. }));

        let reports_dir = PathBuf::from(&summary.reports_dir);
        let jobs: Vec<JobRecord> = serde_json::from_str(
            &std::fs::read_to_string(reports_dir.join("jobs.json")).expect("jobs.json"),
        )
        .expect("parse jobs");
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].title, "Backend Engineer");
        assert_eq!(jobs[0].relevance_score, 1.0);
        assert!(jobs.iter().all(|j| j.source == "acme_main"));

        let stored: SyncRunSummary = serde_json::from_str(
            &std::fs::read_to_string(reports_dir.join("run_summary.json")).expect("summary"),
        )
        .expect("parse summary");
        assert_eq!(stored.run_id, summary.run_id);

        let digest = report_recent_runs(5, Some(dir.path().to_path_buf())).expect("digest");
        assert!(digest.contains(&summary.run_id.to_string()));
        assert!(digest.contains("4 found, 2 unique, 2 duplicates removed"));
        assert!(digest.contains("api sync: skipped"));
    }

    #[tokio::test]
    async fn run_once_fails_without_source_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = SyncPipeline::new(test_config(dir.path())).expect("pipeline");
        let err = pipeline.run_once().await.expect_err("missing sources.yaml");
        assert!(format!("{err:#}").contains("sources.yaml"));
    }

    #[tokio::test]
    async fn try_run_once_skips_when_a_run_is_in_progress() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = SyncPipeline::new(test_config(dir.path())).expect("pipeline");
        let _held = pipeline.run_lock.lock().await;
        assert!(pipeline.try_run_once().await.is_none());
    }

    #[test]
    fn report_without_runs_says_so() {
        let dir = tempfile::tempdir().expect("tempdir");
        let digest = report_recent_runs(3, Some(dir.path().to_path_buf())).expect("digest");
        assert!(digest.contains("No runs recorded yet."));
    }

    #[tokio::test]
    async fn scheduler_is_not_built_when_disabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = Arc::new(SyncPipeline::new(test_config(dir.path())).expect("pipeline"));
        assert!(pipeline.maybe_build_scheduler().await.expect("scheduler").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_is_built_when_enabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        config.scheduler_enabled = true;
        let pipeline = Arc::new(SyncPipeline::new(config).expect("pipeline"));
        assert!(pipeline.maybe_build_scheduler().await.expect("scheduler").is_some());
    }
}
