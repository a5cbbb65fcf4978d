//! Durable queue/catalog document stores + HTTP page retrieval for niancai.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use niancai_core::{CatalogEntry, Listing};

pub const CRATE_NAME: &str = "niancai-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Metadata about one successfully retrieved page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub backend: String,
    pub final_url: String,
    pub content_length: usize,
    pub content_sha256: String,
    pub fetched_at: DateTime<Utc>,
}

/// Terminal outcome of one crawl job.
///
/// Excluded-URL jobs complete with a `Skipped` marker instead of failing so
/// the queue drains and the partition-count invariant holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrawlOutcome {
    Extracted { page: PageMeta, listing: Listing },
    Skipped { reason: String },
}

/// One queued crawl target. Status is positional: the partition vector a job
/// sits in is its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub url: String,
    pub priority: i32,
    pub added_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CrawlOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl Job {
    fn new(url: String, priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            priority,
            added_at: now,
            retry_count: 0,
            result: None,
            error: None,
            failed_at: None,
        }
    }
}

/// The full queue document. Every store operation is a read-modify-write of
/// this value followed by an atomic rename.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueDocument {
    pub pending: Vec<Job>,
    pub processing: Vec<Job>,
    pub completed: Vec<Job>,
    pub failed: Vec<Job>,
}

impl QueueDocument {
    pub fn total(&self) -> usize {
        self.pending.len() + self.processing.len() + self.completed.len() + self.failed.len()
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.partitions().any(|job| job.url == url)
    }

    fn partitions(&self) -> impl Iterator<Item = &Job> {
        self.pending
            .iter()
            .chain(self.processing.iter())
            .chain(self.completed.iter())
            .chain(self.failed.iter())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("網址已在佇列中: {url}")]
    DuplicateUrl { url: String },
    #[error("無效網址 {url}: {reason}")]
    MalformedUrl { url: String, reason: String },
    #[error("job {0} is not in the processing partition")]
    UnknownJob(Uuid),
    #[error("queue document {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl QueueError {
    /// Persistence failures are fatal to the daemon; everything else recovers.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::Persistence { .. })
    }
}

/// Per-URL report for batch enqueueing.
#[derive(Debug, Default)]
pub struct EnqueueReport {
    pub queued: Vec<Uuid>,
    pub rejected: Vec<(String, String)>,
}

fn validate_url(url: &str) -> Result<(), QueueError> {
    let parsed = Url::parse(url).map_err(|e| QueueError::MalformedUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(QueueError::MalformedUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

/// File-backed crawl-job queue partitioned into pending / processing /
/// completed / failed.
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<QueueDocument, QueueError> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| QueueError::Persistence {
                path: self.path.clone(),
                source: anyhow::Error::new(e).context("parsing queue document"),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(QueueDocument::default()),
            Err(e) => Err(QueueError::Persistence {
                path: self.path.clone(),
                source: anyhow::Error::new(e).context("reading queue document"),
            }),
        }
    }

    async fn persist(&self, doc: &QueueDocument) -> Result<(), QueueError> {
        write_document_atomically(&self.path, doc)
            .await
            .map_err(|source| QueueError::Persistence {
                path: self.path.clone(),
                source,
            })
    }

    /// Append a pending job. Rejects malformed URLs before touching the
    /// document and duplicate URLs without mutating it.
    pub async fn enqueue(&self, url: &str, priority: i32) -> Result<Job, QueueError> {
        validate_url(url)?;
        let mut doc = self.load().await?;
        if doc.contains_url(url) {
            return Err(QueueError::DuplicateUrl {
                url: url.to_string(),
            });
        }
        let job = Job::new(url.to_string(), priority, Utc::now());
        doc.pending.push(job.clone());
        self.persist(&doc).await?;
        debug!(job_id = %job.id, url, "enqueued crawl job");
        Ok(job)
    }

    /// Enqueue many URLs in one read-modify-write, reporting per-URL outcomes.
    pub async fn enqueue_many(
        &self,
        urls: &[String],
        priority: i32,
    ) -> Result<EnqueueReport, QueueError> {
        let mut doc = self.load().await?;
        let mut report = EnqueueReport::default();
        let now = Utc::now();
        for url in urls {
            if let Err(e) = validate_url(url) {
                report.rejected.push((url.clone(), e.to_string()));
                continue;
            }
            if doc.contains_url(url) {
                report
                    .rejected
                    .push((url.clone(), format!("網址已在佇列中: {url}")));
                continue;
            }
            let job = Job::new(url.clone(), priority, now);
            report.queued.push(job.id);
            doc.pending.push(job);
        }
        if !report.queued.is_empty() {
            self.persist(&doc).await?;
        }
        Ok(report)
    }

    /// Pop up to `n` pending jobs FIFO and move them to processing. An empty
    /// pending partition yields an empty batch.
    pub async fn dequeue_batch(&self, n: usize) -> Result<Vec<Job>, QueueError> {
        let mut doc = self.load().await?;
        let take = n.min(doc.pending.len());
        if take == 0 {
            return Ok(Vec::new());
        }
        let batch: Vec<Job> = doc.pending.drain(..take).collect();
        doc.processing.extend(batch.iter().cloned());
        self.persist(&doc).await?;
        Ok(batch)
    }

    pub async fn record_success(
        &self,
        id: Uuid,
        outcome: CrawlOutcome,
    ) -> Result<(), QueueError> {
        let mut doc = self.load().await?;
        let mut job = take_processing(&mut doc, id)?;
        job.result = Some(outcome);
        doc.completed.push(job);
        self.persist(&doc).await
    }

    pub async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        let mut doc = self.load().await?;
        let mut job = take_processing(&mut doc, id)?;
        job.error = Some(error.to_string());
        job.failed_at = Some(Utc::now());
        doc.failed.push(job);
        self.persist(&doc).await
    }

    /// Move every processing job back to pending, prepended so the
    /// earliest-stuck job is retried first. Post-condition: processing empty.
    pub async fn reclaim_stuck(&self) -> Result<usize, QueueError> {
        let mut doc = self.load().await?;
        if doc.processing.is_empty() {
            return Ok(0);
        }
        let mut reclaimed: Vec<Job> = doc.processing.drain(..).collect();
        let count = reclaimed.len();
        reclaimed.extend(doc.pending.drain(..));
        doc.pending = reclaimed;
        self.persist(&doc).await?;
        info!(count, "reclaimed stuck jobs");
        Ok(count)
    }

    /// Requeue every failed job, bumping its retry count and clearing the
    /// stored error.
    pub async fn retry_failed(&self) -> Result<usize, QueueError> {
        let mut doc = self.load().await?;
        if doc.failed.is_empty() {
            return Ok(0);
        }
        let count = doc.failed.len();
        for mut job in doc.failed.drain(..) {
            job.retry_count += 1;
            job.error = None;
            job.failed_at = None;
            doc.pending.push(job);
        }
        self.persist(&doc).await?;
        info!(count, "requeued failed jobs");
        Ok(count)
    }

    /// Remove and return completed jobs. The only operation besides
    /// [`QueueStore::clear`] that drops jobs, and only from completed.
    pub async fn export_completed(&self) -> Result<Vec<Job>, QueueError> {
        let mut doc = self.load().await?;
        if doc.completed.is_empty() {
            return Ok(Vec::new());
        }
        let exported: Vec<Job> = doc.completed.drain(..).collect();
        self.persist(&doc).await?;
        Ok(exported)
    }

    pub async fn clear(&self) -> Result<(), QueueError> {
        self.persist(&QueueDocument::default()).await
    }

    /// Read-only view of the current document.
    pub async fn snapshot(&self) -> Result<QueueDocument, QueueError> {
        self.load().await
    }
}

fn take_processing(doc: &mut QueueDocument, id: Uuid) -> Result<Job, QueueError> {
    let idx = doc
        .processing
        .iter()
        .position(|job| job.id == id)
        .ok_or(QueueError::UnknownJob(id))?;
    Ok(doc.processing.remove(idx))
}

async fn write_document_atomically<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("serializing document")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
    let mut file = fs::File::create(&temp_path)
        .await
        .with_context(|| format!("creating temp file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);
    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

/// One consolidation decision, appended to the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub keep_id: Uuid,
    pub duplicate_id: Uuid,
    pub similarity: f64,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

/// The persisted catalog: an ordered collection of entries where `status`
/// gates downstream visibility.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub entries: Vec<CatalogEntry>,
}

/// Catalog JSON document + append-only JSONL decision log.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    catalog_path: PathBuf,
    decisions_path: PathBuf,
}

impl CatalogStore {
    pub fn new(catalog_path: impl Into<PathBuf>, decisions_path: impl Into<PathBuf>) -> Self {
        Self {
            catalog_path: catalog_path.into(),
            decisions_path: decisions_path.into(),
        }
    }

    pub async fn load(&self) -> anyhow::Result<CatalogDocument> {
        match fs::read(&self.catalog_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", self.catalog_path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CatalogDocument::default()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("reading {}", self.catalog_path.display()))),
        }
    }

    pub async fn save(&self, doc: &CatalogDocument) -> anyhow::Result<()> {
        write_document_atomically(&self.catalog_path, doc).await
    }

    pub async fn append_decisions(&self, decisions: &[DecisionRecord]) -> anyhow::Result<()> {
        if decisions.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.decisions_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut lines = String::new();
        for decision in decisions {
            lines.push_str(&serde_json::to_string(decision).context("serializing decision")?);
            lines.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.decisions_path)
            .await
            .with_context(|| format!("opening {}", self.decisions_path.display()))?;
        file.write_all(lines.as_bytes())
            .await
            .with_context(|| format!("appending to {}", self.decisions_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", self.decisions_path.display()))?;
        Ok(())
    }
}

/// A retrieved page body plus the metadata the pipeline records about it.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
    pub content_sha256: String,
}

impl FetchedPage {
    pub fn content_length(&self) -> usize {
        self.body.len()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct PageFetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for PageFetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Single-attempt HTTP GET; retry budgets and inter-attempt delays live with
/// the backend ladder, which treats a timed-out attempt like any other
/// failure.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
}

impl PageFetcher {
    pub fn new(config: PageFetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.text().await?;
        let content_sha256 = sha256_hex(body.as_bytes());
        Ok(FetchedPage {
            status,
            final_url,
            body,
            content_sha256,
        })
    }
}
