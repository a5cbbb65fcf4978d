//! Similarity engine, catalog consolidation, batch running, and the crawl
//! daemon.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Notify;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use niancai_adapters::{
    CliExtractor, CrawlWorker, DirectFetch, ExtractRung, ExtractionApi, FetchRung, HtmlProbe,
    RenderApiFetch, RetryBudget, WorkerOutcome,
};
use niancai_core::{CatalogEntry, Listing};
use niancai_storage::{
    CatalogDocument, CatalogStore, CrawlOutcome, DecisionRecord, PageFetcher, PageFetcherConfig,
    QueueError, QueueStore,
};

pub const CRATE_NAME: &str = "niancai-sync";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NiancaiConfig {
    pub data_dir: PathBuf,
    pub backends_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub excluded_patterns: Vec<String>,
}

impl NiancaiConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("NIANCAI_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        Self {
            backends_path: std::env::var("NIANCAI_BACKENDS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./backends.yaml")),
            user_agent: std::env::var("NIANCAI_USER_AGENT")
                .unwrap_or_else(|_| "niancai-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("NIANCAI_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            excluded_patterns: std::env::var("NIANCAI_EXCLUDED_PATTERNS")
                .map(|v| {
                    v.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| vec!["/search".to_string()]),
            data_dir,
        }
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("queue.json")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.json")
    }

    pub fn decisions_path(&self) -> PathBuf {
        self.data_dir.join("decisions.jsonl")
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_attempt_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

impl RetryConfig {
    fn budget(&self) -> RetryBudget {
        RetryBudget {
            max_attempts: self.max_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchBackendConfig {
    pub name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractBackendConfig {
    pub name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Ordered backend registry, loaded from `backends.yaml`. Order in the file
/// is ladder order.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendRegistry {
    #[serde(default)]
    pub fetch: Vec<FetchBackendConfig>,
    #[serde(default)]
    pub extract: Vec<ExtractBackendConfig>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self {
            fetch: vec![FetchBackendConfig {
                name: "direct".to_string(),
                endpoint: None,
                retry: RetryConfig::default(),
            }],
            extract: vec![ExtractBackendConfig {
                name: "html-probe".to_string(),
                endpoint: None,
                command: None,
                args: Vec::new(),
                retry: RetryConfig::default(),
            }],
        }
    }
}

pub fn load_backend_registry(path: &Path) -> Result<BackendRegistry> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BackendRegistry::default()),
        Err(e) => Err(anyhow::Error::new(e).context(format!("reading {}", path.display()))),
    }
}

pub fn build_worker(registry: &BackendRegistry, config: &NiancaiConfig) -> Result<CrawlWorker> {
    let fetcher = Arc::new(PageFetcher::new(PageFetcherConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?);
    let client = fetcher.client().clone();

    let mut fetch = Vec::new();
    for backend in &registry.fetch {
        let rung: FetchRung = match backend.name.as_str() {
            "direct" => FetchRung {
                backend: Arc::new(DirectFetch::new(Arc::clone(&fetcher))),
                budget: backend.retry.budget(),
            },
            "render-api" => {
                let Some(endpoint) = &backend.endpoint else {
                    bail!("fetch backend render-api requires an endpoint");
                };
                FetchRung {
                    backend: Arc::new(RenderApiFetch::new(client.clone(), endpoint.clone())),
                    budget: backend.retry.budget(),
                }
            }
            other => bail!("unknown fetch backend {other}"),
        };
        fetch.push(rung);
    }

    let mut extract = Vec::new();
    for backend in &registry.extract {
        let rung: ExtractRung = match backend.name.as_str() {
            "extraction-api" => {
                let Some(endpoint) = &backend.endpoint else {
                    bail!("extract backend extraction-api requires an endpoint");
                };
                ExtractRung {
                    backend: Arc::new(ExtractionApi::new(client.clone(), endpoint.clone())),
                    budget: backend.retry.budget(),
                }
            }
            "cli-extractor" => {
                let Some(command) = &backend.command else {
                    bail!("extract backend cli-extractor requires a command");
                };
                ExtractRung {
                    backend: Arc::new(CliExtractor::new(command.clone(), backend.args.clone())),
                    budget: backend.retry.budget(),
                }
            }
            "html-probe" => ExtractRung {
                backend: Arc::new(HtmlProbe),
                budget: backend.retry.budget(),
            },
            other => bail!("unknown extract backend {other}"),
        };
        extract.push(rung);
    }

    if fetch.is_empty() {
        bail!("backend registry declares no fetch backends");
    }
    if extract.is_empty() {
        bail!("backend registry declares no extract backends");
    }
    Ok(CrawlWorker::new(fetch, extract))
}

pub fn build_runner(config: &NiancaiConfig) -> Result<BatchRunner> {
    let registry = load_backend_registry(&config.backends_path)?;
    let worker = build_worker(&registry, config)?;
    Ok(BatchRunner::new(
        QueueStore::new(config.queue_path()),
        CatalogStore::new(config.catalog_path(), config.decisions_path()),
        worker,
        Consolidator::new(DedupParams::default()),
        config.excluded_patterns.clone(),
    ))
}

// ---------------------------------------------------------------------------
// Similarity & conflict resolution
// ---------------------------------------------------------------------------

/// Two listings at or above this similarity are duplicate candidates.
pub const DUPLICATE_THRESHOLD: f64 = 0.5;
/// Score when one normalized title contains the other. Historical call sites
/// disagreed on this value; see DESIGN.md before changing it.
pub const TITLE_CONTAINMENT_SCORE: f64 = 0.9;
/// Score when neither dish sets nor titles relate the pair.
pub const DEFAULT_SIMILARITY: f64 = 0.3;

/// Weights for the field-presence completeness score.
#[derive(Debug, Clone, Copy)]
pub struct CompletenessWeights {
    pub image: f64,
    pub description: f64,
    pub dish_count: f64,
    pub tag_count: f64,
    pub original_price: f64,
    pub order_deadline: f64,
    pub region: f64,
    pub city: f64,
    pub fulfill_start: f64,
}

impl Default for CompletenessWeights {
    fn default() -> Self {
        Self {
            image: 1.0,
            description: 1.0,
            dish_count: 1.0,
            tag_count: 1.0,
            original_price: 1.0,
            order_deadline: 1.0,
            region: 1.0,
            city: 1.0,
            fulfill_start: 1.0,
        }
    }
}

/// The one parameter set shared by every consolidation call site.
#[derive(Debug, Clone, Copy)]
pub struct DedupParams {
    pub duplicate_threshold: f64,
    pub title_containment_score: f64,
    pub default_similarity: f64,
    pub completeness: CompletenessWeights,
}

impl Default for DedupParams {
    fn default() -> Self {
        Self {
            duplicate_threshold: DUPLICATE_THRESHOLD,
            title_containment_score: TITLE_CONTAINMENT_SCORE,
            default_similarity: DEFAULT_SIMILARITY,
            completeness: CompletenessWeights::default(),
        }
    }
}

pub fn normalize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn dish_set(listing: &Listing) -> HashSet<&str> {
    listing
        .dishes
        .iter()
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .collect()
}

/// Similarity in [0, 1]. Dish sets dominate when both are present; titles
/// break the tie otherwise.
pub fn similarity(params: &DedupParams, a: &Listing, b: &Listing) -> f64 {
    let (dishes_a, dishes_b) = (dish_set(a), dish_set(b));
    if !dishes_a.is_empty() && !dishes_b.is_empty() {
        let intersection = dishes_a.intersection(&dishes_b).count();
        let union = dishes_a.union(&dishes_b).count();
        return intersection as f64 / union as f64;
    }
    let (title_a, title_b) = (normalize_title(&a.title), normalize_title(&b.title));
    if !title_a.is_empty() && title_a == title_b {
        return 1.0;
    }
    if !title_a.is_empty()
        && !title_b.is_empty()
        && (title_a.contains(&title_b) || title_b.contains(&title_a))
    {
        return params.title_containment_score;
    }
    params.default_similarity
}

pub fn completeness(weights: &CompletenessWeights, listing: &Listing) -> f64 {
    let mut score = 0.0;
    if listing.image_url.is_some() {
        score += weights.image;
    }
    if listing
        .description
        .as_deref()
        .is_some_and(|d| !d.trim().is_empty())
    {
        score += weights.description;
    }
    if !listing.dishes.is_empty() {
        score += weights.dish_count;
    }
    if !listing.tags.is_empty() {
        score += weights.tag_count;
    }
    if listing.original_price.is_some() {
        score += weights.original_price;
    }
    if listing.order_deadline.is_some() {
        score += weights.order_deadline;
    }
    if listing.region.is_some() {
        score += weights.region;
    }
    if listing.city.is_some() {
        score += weights.city;
    }
    if listing.fulfill_start.is_some() {
        score += weights.fulfill_start;
    }
    score
}

/// Which entry of a duplicate pair survives, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub keep: Uuid,
    pub duplicate: Uuid,
    pub reason: String,
}

/// Pick the authoritative entry of a pair. Symmetric: the winner depends only
/// on the entries, never on argument order.
pub fn decide(params: &DedupParams, a: &CatalogEntry, b: &CatalogEntry) -> Verdict {
    let (dishes_a, dishes_b) = (a.listing.dishes.len(), b.listing.dishes.len());
    if dishes_a != dishes_b {
        let (winner, loser, more, fewer) = if dishes_a > dishes_b {
            (a, b, dishes_a, dishes_b)
        } else {
            (b, a, dishes_b, dishes_a)
        };
        return Verdict {
            keep: winner.id,
            duplicate: loser.id,
            reason: format!("菜名數量: {more} > {fewer}"),
        };
    }

    let score_a = completeness(&params.completeness, &a.listing);
    let score_b = completeness(&params.completeness, &b.listing);
    if score_a != score_b {
        let (winner, loser, high, low) = if score_a > score_b {
            (a, b, score_a, score_b)
        } else {
            (b, a, score_b, score_a)
        };
        return Verdict {
            keep: winner.id,
            duplicate: loser.id,
            reason: format!("完整度: {high:.1} > {low:.1}"),
        };
    }

    // Deterministic final tie-break: earlier record wins, id ordering after.
    let a_wins = (a.created_at, a.id) <= (b.created_at, b.id);
    let (winner, loser) = if a_wins { (a, b) } else { (b, a) };
    Verdict {
        keep: winner.id,
        duplicate: loser.id,
        reason: "建立時間較早".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Catalog consolidation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidListing {
    pub reason: String,
    pub source_url: String,
}

#[derive(Debug, Default)]
pub struct ConsolidationSummary {
    pub incoming: usize,
    pub added: usize,
    pub exact_duplicates: usize,
    pub superseded: usize,
    pub invalid: Vec<InvalidListing>,
}

/// Merges freshly extracted listings into the catalog and resolves conflicts
/// within every (vendor, price) candidate group. Pure over the document; the
/// caller owns store I/O.
pub struct Consolidator {
    params: DedupParams,
}

impl Consolidator {
    pub fn new(params: DedupParams) -> Self {
        Self { params }
    }

    pub fn merge(
        &self,
        doc: &mut CatalogDocument,
        incoming: Vec<Listing>,
        now: DateTime<Utc>,
    ) -> (ConsolidationSummary, Vec<DecisionRecord>) {
        let mut summary = ConsolidationSummary {
            incoming: incoming.len(),
            ..ConsolidationSummary::default()
        };

        for listing in incoming {
            if let Err(e) = listing.validate() {
                summary.invalid.push(InvalidListing {
                    reason: e.to_string(),
                    source_url: listing.source_url.clone(),
                });
                continue;
            }
            // Cheap pre-filter: identical (vendor, title) is an outright
            // duplicate, no similarity scoring needed.
            let exact = doc.entries.iter().any(|entry| {
                entry.is_published()
                    && entry.listing.vendor_name == listing.vendor_name
                    && entry.listing.title == listing.title
            });
            if exact {
                summary.exact_duplicates += 1;
                continue;
            }
            doc.entries.push(CatalogEntry::publish(listing, now));
            summary.added += 1;
        }

        let mut groups: BTreeMap<(String, i64), Vec<usize>> = BTreeMap::new();
        for (idx, entry) in doc.entries.iter().enumerate() {
            if entry.is_published() {
                groups
                    .entry((entry.listing.vendor_name.clone(), entry.listing.price))
                    .or_default()
                    .push(idx);
            }
        }

        let mut decisions = Vec::new();
        for indices in groups.values() {
            for i in 0..indices.len() {
                for j in (i + 1)..indices.len() {
                    let (left, right) = (indices[i], indices[j]);
                    if !doc.entries[left].is_published() || !doc.entries[right].is_published() {
                        continue;
                    }
                    let score = similarity(
                        &self.params,
                        &doc.entries[left].listing,
                        &doc.entries[right].listing,
                    );
                    if score < self.params.duplicate_threshold {
                        continue;
                    }
                    let verdict = decide(&self.params, &doc.entries[left], &doc.entries[right]);
                    let loser = if doc.entries[left].id == verdict.duplicate {
                        left
                    } else {
                        right
                    };
                    doc.entries[loser].supersede(verdict.keep, verdict.reason.clone(), now);
                    summary.superseded += 1;
                    decisions.push(DecisionRecord {
                        keep_id: verdict.keep,
                        duplicate_id: verdict.duplicate,
                        similarity: score,
                        reason: verdict.reason,
                        decided_at: now,
                    });
                }
            }
        }

        (summary, decisions)
    }
}

// ---------------------------------------------------------------------------
// Batch running
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Drains queue batches through the worker and feeds completed jobs into
/// consolidation. Owns the stores; the worker stays queue-blind.
pub struct BatchRunner {
    queue: QueueStore,
    catalog: CatalogStore,
    worker: CrawlWorker,
    consolidator: Consolidator,
    excluded_patterns: Vec<String>,
}

impl BatchRunner {
    pub fn new(
        queue: QueueStore,
        catalog: CatalogStore,
        worker: CrawlWorker,
        consolidator: Consolidator,
        excluded_patterns: Vec<String>,
    ) -> Self {
        Self {
            queue,
            catalog,
            worker,
            consolidator,
            excluded_patterns,
        }
    }

    pub fn queue(&self) -> &QueueStore {
        &self.queue
    }

    fn excluded_reason(&self, url: &str) -> Option<String> {
        self.excluded_patterns
            .iter()
            .find(|pattern| url.contains(pattern.as_str()))
            .map(|pattern| format!("網址符合排除規則: {pattern}"))
    }

    /// Claim and process up to `batch_size` jobs, strictly sequentially.
    /// Excluded URLs complete as skipped without touching the worker.
    pub async fn run_batch(&self, batch_size: usize) -> Result<RunSummary, QueueError> {
        let jobs = self.queue.dequeue_batch(batch_size).await?;
        let mut summary = RunSummary::default();
        for job in jobs {
            summary.processed += 1;
            if let Some(reason) = self.excluded_reason(&job.url) {
                info!(job_id = %job.id, url = %job.url, %reason, "skipping excluded url");
                self.queue
                    .record_success(job.id, CrawlOutcome::Skipped { reason })
                    .await?;
                summary.skipped += 1;
                continue;
            }
            match self.worker.process(&job.url).await {
                WorkerOutcome::Success { page, listing } => {
                    self.queue
                        .record_success(job.id, CrawlOutcome::Extracted { page, listing })
                        .await?;
                    summary.succeeded += 1;
                }
                WorkerOutcome::Failure { error, .. } => {
                    warn!(job_id = %job.id, url = %job.url, %error, "crawl job failed");
                    self.queue.record_failure(job.id, &error).await?;
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Export completed jobs and merge their listings into the catalog.
    pub async fn consolidate_once(&self) -> Result<ConsolidationSummary> {
        let exported = self.queue.export_completed().await?;
        let incoming: Vec<Listing> = exported
            .into_iter()
            .filter_map(|job| match job.result {
                Some(CrawlOutcome::Extracted { listing, .. }) => Some(listing),
                _ => None,
            })
            .collect();
        let mut doc = self.catalog.load().await?;
        let now = Utc::now();
        let (summary, decisions) = self.consolidator.merge(&mut doc, incoming, now);
        self.catalog.save(&doc).await?;
        self.catalog.append_decisions(&decisions).await?;
        info!(
            incoming = summary.incoming,
            added = summary.added,
            exact_duplicates = summary.exact_duplicates,
            superseded = summary.superseded,
            invalid = summary.invalid.len(),
            "consolidation pass complete"
        );
        Ok(summary)
    }

    /// One-shot run: reclaim anything stuck, drain one batch, consolidate.
    pub async fn run_once(
        &self,
        batch_size: usize,
    ) -> Result<(RunSummary, ConsolidationSummary)> {
        self.queue.reclaim_stuck().await?;
        let run = self.run_batch(batch_size).await?;
        let consolidation = self.consolidate_once().await?;
        Ok((run, consolidation))
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct DaemonConfig {
    pub tick_secs: u64,
    pub batch_size: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            batch_size: 10,
        }
    }
}

#[derive(Debug)]
pub enum TickReport {
    /// A batch was still running; nothing was touched.
    SkippedBusy,
    Idle { consolidated: bool },
    Ran {
        run: RunSummary,
        consolidation: ConsolidationSummary,
    },
}

struct DaemonInner {
    runner: BatchRunner,
    config: DaemonConfig,
    running: AtomicBool,
    busy: AtomicBool,
    fatal: Notify,
}

impl DaemonInner {
    async fn tick(&self) -> Result<TickReport> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("previous batch still running, skipping tick");
            return Ok(TickReport::SkippedBusy);
        }
        let report = self.tick_locked().await;
        self.busy.store(false, Ordering::SeqCst);
        report
    }

    async fn tick_locked(&self) -> Result<TickReport> {
        let queue = self.runner.queue();
        let reclaimed = queue.reclaim_stuck().await?;
        if reclaimed > 0 {
            warn!(reclaimed, "requeued jobs abandoned mid-flight");
        }
        let snapshot = queue.snapshot().await?;
        if snapshot.pending.is_empty() {
            if snapshot.completed.is_empty() {
                return Ok(TickReport::Idle {
                    consolidated: false,
                });
            }
            self.runner.consolidate_once().await?;
            return Ok(TickReport::Idle { consolidated: true });
        }
        let run = self.runner.run_batch(self.config.batch_size).await?;
        let consolidation = self.runner.consolidate_once().await?;
        Ok(TickReport::Ran { run, consolidation })
    }
}

/// Long-running scheduler: drains the queue on a fixed tick, reclaims
/// abandoned jobs, and consolidates after every batch. At most one batch is
/// ever in flight, enforced by the `busy` flag.
pub struct Daemon {
    inner: Arc<DaemonInner>,
}

impl Daemon {
    pub fn new(runner: BatchRunner, config: DaemonConfig) -> Self {
        Self {
            inner: Arc::new(DaemonInner {
                runner,
                config,
                running: AtomicBool::new(true),
                busy: AtomicBool::new(false),
                fatal: Notify::new(),
            }),
        }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.inner.tick().await
    }

    /// Run until a shutdown signal or a fatal queue persistence error. No
    /// pending or processing job is lost on exit; it persists for the next
    /// start.
    pub async fn run(self) -> Result<()> {
        info!(
            tick_secs = self.inner.config.tick_secs,
            batch_size = self.inner.config.batch_size,
            "daemon starting"
        );

        // Immediate first tick so a crashed run is reclaimed without waiting
        // out the interval.
        log_tick(self.inner.tick().await?);

        let mut sched = JobScheduler::new().await.context("creating scheduler")?;
        let inner = Arc::clone(&self.inner);
        let job = Job::new_repeated_async(
            Duration::from_secs(self.inner.config.tick_secs),
            move |_uuid, _lock| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    if !inner.running.load(Ordering::SeqCst) {
                        return;
                    }
                    match inner.tick().await {
                        Ok(report) => log_tick(report),
                        Err(e) => {
                            error!(error = %format!("{e:#}"), "tick failed, shutting down");
                            inner.fatal.notify_one();
                        }
                    }
                })
            },
        )
        .context("creating daemon tick job")?;
        sched.add(job).await.context("adding daemon tick job")?;
        sched.start().await.context("starting scheduler")?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
            _ = self.inner.fatal.notified() => error!("unrecoverable queue error"),
        }

        self.inner.running.store(false, Ordering::SeqCst);
        sched.shutdown().await.context("stopping scheduler")?;

        // Final consolidation so completed work lands in the catalog before
        // exit.
        let summary = self.inner.runner.consolidate_once().await?;
        info!(
            added = summary.added,
            superseded = summary.superseded,
            "final consolidation complete, daemon stopped"
        );
        Ok(())
    }
}

fn log_tick(report: TickReport) {
    match report {
        TickReport::SkippedBusy => {}
        TickReport::Idle { consolidated } => {
            info!(consolidated, "tick idle");
        }
        TickReport::Ran { run, consolidation } => {
            info!(
                processed = run.processed,
                succeeded = run.succeeded,
                failed = run.failed,
                skipped = run.skipped,
                added = consolidation.added,
                superseded = consolidation.superseded,
                "tick complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use niancai_core::{EntryStatus, ShippingModes};
    use tempfile::tempdir;

    fn listing(vendor: &str, title: &str, price: i64, dishes: &[&str]) -> Listing {
        Listing {
            vendor_name: vendor.to_string(),
            title: title.to_string(),
            price,
            dishes: dishes.iter().map(|d| d.to_string()).collect(),
            tags: vec![],
            source_url: format!("https://shop.example.tw/{title}"),
            image_url: None,
            description: None,
            original_price: None,
            order_deadline: None,
            region: None,
            city: None,
            fulfill_start: None,
            shipping: ShippingModes::default(),
        }
    }

    fn entry(listing: Listing) -> CatalogEntry {
        CatalogEntry::publish(listing, Utc::now())
    }

    #[test]
    fn similarity_of_a_listing_with_itself_is_one() {
        let params = DedupParams::default();
        let a = listing("老協珍", "佛跳牆二入組", 3980, &["佛跳牆", "紅燒肉"]);
        assert_eq!(similarity(&params, &a, &a), 1.0);
    }

    #[test]
    fn similarity_uses_jaccard_when_both_have_dishes() {
        let params = DedupParams::default();
        let a = listing("老協珍", "年菜A組", 3980, &["佛跳牆", "紅燒肉"]);
        let b = listing("老協珍", "年菜B組", 3980, &["佛跳牆", "紅燒肉", "干貝"]);
        let score = similarity(&params, &a, &b);
        assert!((score - 2.0 / 3.0).abs() < 1e-9, "{score}");
    }

    #[test]
    fn similarity_falls_back_to_titles_without_dishes() {
        let params = DedupParams::default();
        let a = listing("老協珍", "干貝佛跳牆", 1980, &[]);
        let same = listing("老協珍", "干貝 佛跳牆", 1980, &[]);
        let contained = listing("老協珍", "干貝佛跳牆豪華版", 1980, &[]);
        let unrelated = listing("老協珍", "東坡肉禮盒", 1980, &[]);

        assert_eq!(similarity(&params, &a, &same), 1.0);
        assert_eq!(similarity(&params, &a, &contained), TITLE_CONTAINMENT_SCORE);
        assert_eq!(similarity(&params, &a, &unrelated), DEFAULT_SIMILARITY);
    }

    #[test]
    fn decide_prefers_more_dishes_with_the_documented_reason() {
        let params = DedupParams::default();
        let two = entry(listing("老協珍", "年菜A組", 3980, &["佛跳牆", "紅燒肉"]));
        let three = entry(listing(
            "老協珍",
            "年菜B組",
            3980,
            &["佛跳牆", "紅燒肉", "干貝"],
        ));

        let score = similarity(&params, &two.listing, &three.listing);
        assert!(score >= DUPLICATE_THRESHOLD);

        let verdict = decide(&params, &two, &three);
        assert_eq!(verdict.keep, three.id);
        assert_eq!(verdict.duplicate, two.id);
        assert_eq!(verdict.reason, "菜名數量: 3 > 2");
    }

    #[test]
    fn decide_is_symmetric() {
        let params = DedupParams::default();
        let mut richer = listing("老協珍", "年菜A組", 3980, &["佛跳牆", "紅燒肉"]);
        richer.image_url = Some("https://img.example.tw/a.jpg".to_string());
        richer.description = Some("經典盛宴".to_string());
        let cases = [
            (
                entry(listing("老協珍", "年菜A組", 3980, &["佛跳牆"])),
                entry(listing("老協珍", "年菜B組", 3980, &["佛跳牆", "干貝"])),
            ),
            (
                entry(richer),
                entry(listing("老協珍", "年菜C組", 3980, &["佛跳牆", "紅燒肉"])),
            ),
            (
                entry(listing("老協珍", "年菜A組", 3980, &["佛跳牆", "紅燒肉"])),
                entry(listing("老協珍", "年菜D組", 3980, &["佛跳牆", "紅燒肉"])),
            ),
        ];
        for (a, b) in cases {
            let forward = decide(&params, &a, &b);
            let backward = decide(&params, &b, &a);
            assert_eq!(forward.keep, backward.keep);
            assert_eq!(forward.duplicate, backward.duplicate);
            assert_eq!(forward.reason, backward.reason);
        }
    }

    #[test]
    fn decide_ties_break_on_creation_time() {
        let params = DedupParams::default();
        let older = CatalogEntry::publish(
            listing("老協珍", "年菜A組", 3980, &["佛跳牆", "紅燒肉"]),
            Utc::now() - chrono::Duration::days(1),
        );
        let newer = entry(listing("老協珍", "年菜B組", 3980, &["佛跳牆", "紅燒肉"]));

        let verdict = decide(&params, &newer, &older);
        assert_eq!(verdict.keep, older.id);
        assert_eq!(verdict.reason, "建立時間較早");
    }

    #[test]
    fn merge_supersedes_the_weaker_entry_and_logs_a_decision() {
        let consolidator = Consolidator::new(DedupParams::default());
        let mut doc = CatalogDocument::default();
        let incoming = vec![
            listing("老協珍", "年菜A組", 3980, &["佛跳牆", "紅燒肉"]),
            listing("老協珍", "年菜B組", 3980, &["佛跳牆", "紅燒肉", "干貝"]),
        ];

        let (summary, decisions) = consolidator.merge(&mut doc, incoming, Utc::now());
        assert_eq!(summary.added, 2);
        assert_eq!(summary.superseded, 1);
        assert_eq!(decisions.len(), 1);
        assert!((decisions[0].similarity - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(decisions[0].reason, "菜名數量: 3 > 2");

        let duplicate = doc
            .entries
            .iter()
            .find(|e| e.status == EntryStatus::Duplicate)
            .expect("one entry superseded");
        assert_eq!(duplicate.listing.title, "年菜A組");
        assert_eq!(duplicate.duplicate_of, Some(decisions[0].keep_id));
        assert_eq!(doc.entries.len(), 2, "supersede never deletes");
    }

    #[test]
    fn merge_is_idempotent_on_an_unchanged_snapshot() {
        let consolidator = Consolidator::new(DedupParams::default());
        let mut doc = CatalogDocument::default();
        let incoming = vec![
            listing("老協珍", "年菜A組", 3980, &["佛跳牆", "紅燒肉"]),
            listing("老協珍", "年菜B組", 3980, &["佛跳牆", "紅燒肉", "干貝"]),
            listing("福華飯店", "雙人年菜", 2680, &["東坡肉"]),
        ];
        let (_, _) = consolidator.merge(&mut doc, incoming, Utc::now());
        let snapshot = doc.clone();

        let (summary, decisions) = consolidator.merge(&mut doc, Vec::new(), Utc::now());
        assert_eq!(doc, snapshot);
        assert_eq!(summary.superseded, 0);
        assert!(decisions.is_empty());
    }

    #[test]
    fn merge_skips_exact_vendor_title_duplicates_before_scoring() {
        let consolidator = Consolidator::new(DedupParams::default());
        let mut doc = CatalogDocument::default();
        consolidator.merge(
            &mut doc,
            vec![listing("老協珍", "年菜A組", 3980, &["佛跳牆"])],
            Utc::now(),
        );

        let (summary, decisions) = consolidator.merge(
            &mut doc,
            vec![listing("老協珍", "年菜A組", 4280, &["佛跳牆", "干貝"])],
            Utc::now(),
        );
        assert_eq!(summary.exact_duplicates, 1);
        assert_eq!(summary.added, 0);
        assert!(decisions.is_empty());
        assert_eq!(doc.entries.len(), 1);
    }

    #[test]
    fn merge_leaves_dissimilar_same_price_entries_alone() {
        let consolidator = Consolidator::new(DedupParams::default());
        let mut doc = CatalogDocument::default();
        // Same vendor and price, disjoint dish sets: two sizes coincidentally
        // priced the same.
        let incoming = vec![
            listing("福華飯店", "四人年菜", 2680, &["東坡肉", "櫻花蝦米糕"]),
            listing("福華飯店", "六人年菜", 2680, &["干貝", "烏魚子"]),
        ];

        let (summary, decisions) = consolidator.merge(&mut doc, incoming, Utc::now());
        assert_eq!(summary.added, 2);
        assert_eq!(summary.superseded, 0);
        assert!(decisions.is_empty());
        assert!(doc.entries.iter().all(CatalogEntry::is_published));
    }

    #[test]
    fn merge_routes_malformed_listings_to_the_invalid_bucket() {
        let consolidator = Consolidator::new(DedupParams::default());
        let mut doc = CatalogDocument::default();
        let incoming = vec![
            listing("", "年菜A組", 3980, &["佛跳牆"]),
            listing("老協珍", "年菜B組", 0, &["佛跳牆"]),
            listing("老協珍", "年菜C組", 3980, &["佛跳牆"]),
        ];

        let (summary, _) = consolidator.merge(&mut doc, incoming, Utc::now());
        assert_eq!(summary.added, 1);
        assert_eq!(summary.invalid.len(), 2);
        assert_eq!(summary.invalid[0].reason, "缺少店家名稱");
        assert!(summary.invalid[1].reason.contains("價格必須為正數"));
        assert_eq!(doc.entries.len(), 1);
    }

    fn empty_worker() -> CrawlWorker {
        CrawlWorker::new(Vec::new(), Vec::new())
    }

    fn runner_in(dir: &tempfile::TempDir) -> BatchRunner {
        BatchRunner::new(
            QueueStore::new(dir.path().join("queue.json")),
            CatalogStore::new(
                dir.path().join("catalog.json"),
                dir.path().join("decisions.jsonl"),
            ),
            empty_worker(),
            Consolidator::new(DedupParams::default()),
            vec!["/search".to_string()],
        )
    }

    #[tokio::test]
    async fn excluded_urls_are_skipped_without_dispatch() {
        let dir = tempdir().expect("tempdir");
        let runner = runner_in(&dir);
        runner
            .queue()
            .enqueue("https://shop.example.tw/search?q=年菜", 0)
            .await
            .expect("enqueue");

        // The worker has no backends, so any dispatched job would fail; a
        // skip proves the worker was never consulted.
        let summary = runner.run_batch(5).await.expect("run batch");
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);

        let doc = runner.queue().snapshot().await.expect("snapshot");
        assert_eq!(doc.completed.len(), 1);
        assert!(matches!(
            doc.completed[0].result,
            Some(CrawlOutcome::Skipped { .. })
        ));
    }

    #[tokio::test]
    async fn busy_tick_mutates_nothing_and_reports_the_skip() {
        let dir = tempdir().expect("tempdir");
        let runner = runner_in(&dir);
        runner
            .queue()
            .enqueue("https://shop.example.tw/item/1", 0)
            .await
            .expect("enqueue");
        runner.queue().dequeue_batch(1).await.expect("claim one");

        let daemon = Daemon::new(runner, DaemonConfig::default());
        daemon.inner.busy.store(true, Ordering::SeqCst);
        let before = daemon
            .inner
            .runner
            .queue()
            .snapshot()
            .await
            .expect("snapshot");

        let report = daemon.tick().await.expect("tick");
        assert!(matches!(report, TickReport::SkippedBusy));

        let after = daemon
            .inner
            .runner
            .queue()
            .snapshot()
            .await
            .expect("snapshot");
        assert_eq!(before, after, "busy tick must not mutate the queue");
        assert_eq!(after.processing.len(), 1, "stuck job not reclaimed yet");
    }

    #[tokio::test]
    async fn idle_tick_reclaims_and_consolidates_completed_work() {
        let dir = tempdir().expect("tempdir");
        let runner = runner_in(&dir);
        let job = runner
            .queue()
            .enqueue("https://shop.example.tw/item/1", 0)
            .await
            .expect("enqueue");
        runner.queue().dequeue_batch(1).await.expect("claim");
        runner
            .queue()
            .record_success(
                job.id,
                CrawlOutcome::Skipped {
                    reason: "test".to_string(),
                },
            )
            .await
            .expect("complete");

        let daemon = Daemon::new(runner, DaemonConfig::default());
        let report = daemon.tick().await.expect("tick");
        assert!(matches!(report, TickReport::Idle { consolidated: true }));

        let doc = daemon
            .inner
            .runner
            .queue()
            .snapshot()
            .await
            .expect("snapshot");
        assert_eq!(doc.total(), 0, "completed jobs exported");
        assert!(!daemon.inner.busy.load(Ordering::SeqCst));
    }

    #[test]
    fn registry_defaults_to_direct_fetch_and_html_probe() {
        let registry = load_backend_registry(Path::new("/nonexistent/backends.yaml"))
            .expect("missing file is fine");
        assert_eq!(registry.fetch[0].name, "direct");
        assert_eq!(registry.extract[0].name, "html-probe");
    }

    #[test]
    fn registry_parses_ladder_order_and_budgets() {
        let registry: BackendRegistry = serde_yaml::from_str(
            r#"
fetch:
  - name: direct
    retry:
      max_attempts: 2
  - name: render-api
    endpoint: https://render.internal/v1/render
extract:
  - name: extraction-api
    endpoint: https://extract.internal/v1/listing
  - name: cli-extractor
    command: niancai-extract
    args: ["--format", "json"]
  - name: html-probe
"#,
        )
        .expect("parse yaml");
        assert_eq!(registry.fetch.len(), 2);
        assert_eq!(registry.fetch[0].retry.max_attempts, 2);
        assert_eq!(registry.fetch[1].retry.max_attempts, 3);
        assert_eq!(registry.extract.len(), 3);
        assert_eq!(registry.extract[1].command.as_deref(), Some("niancai-extract"));
    }
}
