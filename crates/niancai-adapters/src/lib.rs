//! Fetch/extraction backend adapters + the two-stage crawl worker.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use niancai_core::{Listing, ShippingModes};
use niancai_storage::{FetchError, FetchedPage, PageFetcher, PageMeta};

pub const CRATE_NAME: &str = "niancai-adapters";

/// Retry budget for one backend rung: bounded attempts, fixed inter-attempt
/// delay, and a per-attempt timeout that counts as an ordinary failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(20),
        }
    }
}

pub type AttemptFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

#[derive(Debug, Clone)]
pub struct LadderWin<T> {
    pub backend: String,
    pub attempts: u32,
    pub value: T,
}

#[derive(Debug, Error)]
#[error("所有後端皆失敗: {last_error}")]
pub struct LadderExhausted {
    pub last_error: String,
}

/// First-success-wins over an ordered list of named rungs. Each rung gets its
/// full retry budget before the ladder advances; the error of the last
/// attempt survives for the caller.
pub async fn run_ladder<'a, T>(
    rungs: Vec<(String, RetryBudget)>,
    mut attempt: impl FnMut(usize) -> AttemptFuture<'a, T>,
) -> Result<LadderWin<T>, LadderExhausted> {
    let mut last_error = "no backends configured".to_string();
    for (idx, (name, budget)) in rungs.iter().enumerate() {
        let max_attempts = budget.max_attempts.max(1);
        for attempt_no in 1..=max_attempts {
            match tokio::time::timeout(budget.attempt_timeout, attempt(idx)).await {
                Ok(Ok(value)) => {
                    return Ok(LadderWin {
                        backend: name.clone(),
                        attempts: attempt_no,
                        value,
                    });
                }
                Ok(Err(e)) => {
                    last_error = format!("{name}: {e:#}");
                }
                Err(_) => {
                    last_error = format!(
                        "{name}: attempt timed out after {:?}",
                        budget.attempt_timeout
                    );
                }
            }
            debug!(backend = %name, attempt = attempt_no, max_attempts, %last_error, "attempt failed");
            if attempt_no < max_attempts {
                tokio::time::sleep(budget.retry_delay).await;
            }
        }
        warn!(backend = %name, "backend exhausted, advancing");
    }
    Err(LadderExhausted { last_error })
}

/// Stage-1 page retrieval backend.
#[async_trait]
pub trait FetchBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// Plain HTTP GET through the shared [`PageFetcher`].
pub struct DirectFetch {
    fetcher: Arc<PageFetcher>,
}

impl DirectFetch {
    pub fn new(fetcher: Arc<PageFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl FetchBackend for DirectFetch {
    fn name(&self) -> &str {
        "direct"
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetcher.fetch_text(url).await
    }
}

#[derive(Debug, Deserialize)]
struct RenderApiResponse {
    success: bool,
    #[serde(default)]
    content: String,
    #[serde(default, alias = "contentLength")]
    content_length: Option<usize>,
}

/// Rendering-service fallback for pages the direct fetch cannot read.
pub struct RenderApiFetch {
    client: reqwest::Client,
    endpoint: String,
}

impl RenderApiFetch {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl FetchBackend for RenderApiFetch {
    fn name(&self) -> &str {
        "render-api"
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "url": url, "backendName": self.name() }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: self.endpoint.clone(),
            });
        }
        let rendered: RenderApiResponse = resp.json().await?;
        if !rendered.success || rendered.content.is_empty() {
            return Err(FetchError::HttpStatus {
                status: 502,
                url: url.to_string(),
            });
        }
        debug!(
            url,
            content_length = rendered.content_length.unwrap_or(rendered.content.len()),
            "render api returned content"
        );
        let content_sha256 = niancai_storage::sha256_hex(rendered.content.as_bytes());
        Ok(FetchedPage {
            status,
            final_url: url.to_string(),
            body: rendered.content,
            content_sha256,
        })
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("extractor output unparseable: {0}")]
    InvalidPayload(String),
    #[error("extractor command failed: {0}")]
    Command(String),
    #[error("頁面中找不到商品資料")]
    NoListing,
}

/// Raw listing payload as emitted by the extraction backends. Carries both
/// legacy shipping forms; [`RawListingPayload::into_listing`] reconciles them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawListingPayload {
    pub vendor_name: String,
    pub title: String,
    pub price: i64,
    #[serde(default)]
    pub dishes: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub original_price: Option<i64>,
    #[serde(default)]
    pub order_deadline: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub fulfill_start: Option<String>,
    #[serde(default)]
    pub shipping_mode: Option<String>,
    #[serde(default)]
    pub shipping_modes: Option<Vec<String>>,
}

impl RawListingPayload {
    pub fn into_listing(self, source_url: &str) -> Listing {
        let shipping = ShippingModes::reconcile(self.shipping_mode, self.shipping_modes);
        Listing {
            vendor_name: self.vendor_name.trim().to_string(),
            title: self.title.trim().to_string(),
            price: self.price,
            dishes: self
                .dishes
                .into_iter()
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect(),
            tags: self
                .tags
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            source_url: source_url.to_string(),
            image_url: self.image_url,
            description: self.description,
            original_price: self.original_price,
            order_deadline: self.order_deadline,
            region: self.region,
            city: self.city,
            fulfill_start: self.fulfill_start,
            shipping,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExtractionApiResponse {
    Failure { error: String },
    Listing(RawListingPayload),
}

/// Stage-2 extraction backend.
#[async_trait]
pub trait ExtractBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn extract(&self, page: &FetchedPage) -> Result<Listing, ExtractError>;
}

/// Network extraction service: page content in, structured listing out.
pub struct ExtractionApi {
    client: reqwest::Client,
    endpoint: String,
}

impl ExtractionApi {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ExtractBackend for ExtractionApi {
    fn name(&self) -> &str {
        "extraction-api"
    }

    async fn extract(&self, page: &FetchedPage) -> Result<Listing, ExtractError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "url": page.final_url,
                "content": page.body,
            }))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ExtractError::InvalidPayload(format!(
                "http status {status}: {text}"
            )));
        }
        match serde_json::from_str::<ExtractionApiResponse>(&text) {
            Ok(ExtractionApiResponse::Listing(payload)) => {
                Ok(payload.into_listing(&page.final_url))
            }
            Ok(ExtractionApiResponse::Failure { error }) => {
                Err(ExtractError::InvalidPayload(error))
            }
            Err(e) => Err(ExtractError::InvalidPayload(e.to_string())),
        }
    }
}

/// External command-line extractor: page body on stdin, listing JSON on
/// stdout. The child is killed if the ladder times the attempt out.
pub struct CliExtractor {
    command: String,
    args: Vec<String>,
}

impl CliExtractor {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl ExtractBackend for CliExtractor {
    fn name(&self) -> &str {
        "cli-extractor"
    }

    async fn extract(&self, page: &FetchedPage) -> Result<Listing, ExtractError> {
        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .arg(&page.final_url)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExtractError::Command(format!("{}: {e}", self.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(page.body.as_bytes())
                .await
                .map_err(|e| ExtractError::Command(format!("writing stdin: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExtractError::Command(format!("waiting for {}: {e}", self.command)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::Command(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }
        let payload: RawListingPayload = serde_json::from_slice(&output.stdout)
            .map_err(|e| ExtractError::InvalidPayload(e.to_string()))?;
        Ok(payload.into_listing(&page.final_url))
    }
}

/// Last-resort local extraction: JSON-LD product blocks embedded in the page.
/// Most vendor pages lack them, in which case this backend reports
/// [`ExtractError::NoListing`] and the job fails upward.
#[derive(Debug, Default)]
pub struct HtmlProbe;

#[async_trait]
impl ExtractBackend for HtmlProbe {
    fn name(&self) -> &str {
        "html-probe"
    }

    async fn extract(&self, page: &FetchedPage) -> Result<Listing, ExtractError> {
        let blocks = {
            let document = Html::parse_document(&page.body);
            let selector = Selector::parse(r#"script[type="application/ld+json"]"#)
                .map_err(|e| ExtractError::InvalidPayload(e.to_string()))?;
            document
                .select(&selector)
                .map(|node| node.text().collect::<String>())
                .collect::<Vec<_>>()
        };
        for block in blocks {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&block) else {
                continue;
            };
            if let Some(listing) = product_from_ld_json(&value, &page.final_url) {
                return Ok(listing);
            }
        }
        Err(ExtractError::NoListing)
    }
}

fn product_from_ld_json(value: &serde_json::Value, source_url: &str) -> Option<Listing> {
    if let Some(items) = value.as_array() {
        return items
            .iter()
            .find_map(|item| product_from_ld_json(item, source_url));
    }
    if value.get("@type")?.as_str()? != "Product" {
        return None;
    }
    let title = value.get("name")?.as_str()?.trim().to_string();
    let vendor_name = value
        .get("brand")
        .and_then(|b| b.get("name"))
        .or_else(|| value.get("seller").and_then(|s| s.get("name")))
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .trim()
        .to_string();
    let offers = value.get("offers")?;
    let price = offers
        .get("price")
        .and_then(|p| {
            p.as_i64()
                .or_else(|| p.as_f64().map(|f| f.round() as i64))
                .or_else(|| p.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
        })
        .unwrap_or(0);
    Some(Listing {
        vendor_name,
        title,
        price,
        dishes: Vec::new(),
        tags: Vec::new(),
        source_url: source_url.to_string(),
        image_url: value
            .get("image")
            .and_then(|i| i.as_str())
            .map(str::to_string),
        description: value
            .get("description")
            .and_then(|d| d.as_str())
            .map(str::to_string),
        original_price: None,
        order_deadline: None,
        region: None,
        city: None,
        fulfill_start: None,
        shipping: ShippingModes::default(),
    })
}

pub struct FetchRung {
    pub backend: Arc<dyn FetchBackend>,
    pub budget: RetryBudget,
}

pub struct ExtractRung {
    pub backend: Arc<dyn ExtractBackend>,
    pub budget: RetryBudget,
}

/// Tagged result of one worker run. The worker never returns `Err` past this
/// boundary; the caller records whichever variant comes back.
#[derive(Debug, Clone)]
pub enum WorkerOutcome {
    Success { page: PageMeta, listing: Listing },
    Failure {
        error: String,
        partial_page: Option<PageMeta>,
    },
}

/// Two-stage fetch-with-fallback worker: retrieve the page through the fetch
/// ladder, then turn it into a listing through the extraction ladder. Holds
/// no queue access; the caller records outcomes.
pub struct CrawlWorker {
    fetch: Vec<FetchRung>,
    extract: Vec<ExtractRung>,
}

impl CrawlWorker {
    pub fn new(fetch: Vec<FetchRung>, extract: Vec<ExtractRung>) -> Self {
        Self { fetch, extract }
    }

    pub async fn process(&self, url: &str) -> WorkerOutcome {
        let fetch_rungs: Vec<(String, RetryBudget)> = self
            .fetch
            .iter()
            .map(|r| (r.backend.name().to_string(), r.budget))
            .collect();
        let fetched = run_ladder(fetch_rungs, |i| {
            let backend = Arc::clone(&self.fetch[i].backend);
            Box::pin(async move { backend.fetch(url).await.map_err(anyhow::Error::new) })
        })
        .await;

        let (page, backend) = match fetched {
            Ok(win) => (win.value, win.backend),
            Err(e) => {
                return WorkerOutcome::Failure {
                    error: e.to_string(),
                    partial_page: None,
                };
            }
        };
        let meta = PageMeta {
            backend,
            final_url: page.final_url.clone(),
            content_length: page.content_length(),
            content_sha256: page.content_sha256.clone(),
            fetched_at: Utc::now(),
        };

        let extract_rungs: Vec<(String, RetryBudget)> = self
            .extract
            .iter()
            .map(|r| (r.backend.name().to_string(), r.budget))
            .collect();
        let page_ref = &page;
        let extracted = run_ladder(extract_rungs, |i| {
            let backend = Arc::clone(&self.extract[i].backend);
            Box::pin(async move {
                backend
                    .extract(page_ref)
                    .await
                    .map_err(anyhow::Error::new)
            })
        })
        .await;

        match extracted {
            Ok(win) => WorkerOutcome::Success {
                page: meta,
                listing: win.value,
            },
            Err(e) => WorkerOutcome::Failure {
                error: e.to_string(),
                partial_page: Some(meta),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn page(body: &str) -> FetchedPage {
        FetchedPage {
            status: StatusCode::OK,
            final_url: "https://shop.example.tw/item/1".to_string(),
            body: body.to_string(),
            content_sha256: niancai_storage::sha256_hex(body.as_bytes()),
        }
    }

    fn quick_budget(max_attempts: u32) -> RetryBudget {
        RetryBudget {
            max_attempts,
            retry_delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn payload_reconciles_legacy_scalar_shipping() {
        let payload: RawListingPayload = serde_json::from_str(
            r#"{"vendor_name":"老協珍","title":"佛跳牆二入組","price":3980,
                "dishes":["佛跳牆","紅燒肉"],"shipping_mode":"冷凍宅配"}"#,
        )
        .expect("parse");
        let listing = payload.into_listing("https://shop.example.tw/item/1");
        assert_eq!(listing.shipping.as_list(), ["冷凍宅配"]);
        assert_eq!(listing.shipping.primary(), Some("冷凍宅配"));
    }

    #[test]
    fn payload_prefers_list_shipping_form() {
        let payload: RawListingPayload = serde_json::from_str(
            r#"{"vendor_name":"老協珍","title":"佛跳牆二入組","price":3980,
                "shipping_mode":"宅配","shipping_modes":["冷凍宅配","門市自取"]}"#,
        )
        .expect("parse");
        let listing = payload.into_listing("https://shop.example.tw/item/1");
        assert_eq!(listing.shipping.as_list(), ["冷凍宅配", "門市自取"]);
    }

    #[test]
    fn payload_trims_blank_dishes_and_tags() {
        let payload: RawListingPayload = serde_json::from_str(
            r#"{"vendor_name":" 老協珍 ","title":" 佛跳牆 ","price":1280,
                "dishes":["佛跳牆","  ",""],"tags":[" 年菜 "]}"#,
        )
        .expect("parse");
        let listing = payload.into_listing("https://shop.example.tw/item/2");
        assert_eq!(listing.vendor_name, "老協珍");
        assert_eq!(listing.dishes, ["佛跳牆"]);
        assert_eq!(listing.tags, ["年菜"]);
    }

    #[tokio::test]
    async fn ladder_exhausts_each_rung_before_advancing() {
        let calls = AtomicU32::new(0);
        let rungs = vec![
            ("first".to_string(), quick_budget(2)),
            ("second".to_string(), quick_budget(2)),
        ];
        let win = run_ladder(rungs, |i| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                if i == 0 {
                    anyhow::bail!("rung one always fails (call {n})");
                }
                Ok::<_, anyhow::Error>(format!("rung two on call {n}"))
            })
        })
        .await
        .expect("second rung succeeds");

        assert_eq!(win.backend, "second");
        assert_eq!(win.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timed_out_attempt_counts_as_a_failure() {
        let calls = AtomicU32::new(0);
        let rungs = vec![(
            "sleepy".to_string(),
            RetryBudget {
                max_attempts: 2,
                retry_delay: Duration::from_millis(1),
                attempt_timeout: Duration::from_millis(10),
            },
        )];
        let err = run_ladder(rungs, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), anyhow::Error>(())
            })
        })
        .await
        .expect_err("all attempts hang");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.last_error.contains("timed out"), "{}", err.last_error);
    }

    struct StaticFetch {
        name: &'static str,
        body: Option<&'static str>,
    }

    #[async_trait]
    impl FetchBackend for StaticFetch {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
            match self.body {
                Some(body) => Ok(page(body)),
                None => Err(FetchError::HttpStatus {
                    status: 403,
                    url: url.to_string(),
                }),
            }
        }
    }

    struct StaticExtract {
        name: &'static str,
        listing: Option<RawListingPayload>,
    }

    #[async_trait]
    impl ExtractBackend for StaticExtract {
        fn name(&self) -> &str {
            self.name
        }

        async fn extract(&self, page: &FetchedPage) -> Result<Listing, ExtractError> {
            match &self.listing {
                Some(payload) => Ok(payload.clone().into_listing(&page.final_url)),
                None => Err(ExtractError::NoListing),
            }
        }
    }

    fn sample_payload() -> RawListingPayload {
        serde_json::from_str(
            r#"{"vendor_name":"老協珍","title":"佛跳牆二入組","price":3980,
                "dishes":["佛跳牆","紅燒肉"]}"#,
        )
        .expect("payload")
    }

    #[tokio::test]
    async fn worker_falls_back_to_second_fetch_backend() {
        let worker = CrawlWorker::new(
            vec![
                FetchRung {
                    backend: Arc::new(StaticFetch {
                        name: "direct",
                        body: None,
                    }),
                    budget: quick_budget(2),
                },
                FetchRung {
                    backend: Arc::new(StaticFetch {
                        name: "render-api",
                        body: Some("<html>年菜</html>"),
                    }),
                    budget: quick_budget(1),
                },
            ],
            vec![ExtractRung {
                backend: Arc::new(StaticExtract {
                    name: "extraction-api",
                    listing: Some(sample_payload()),
                }),
                budget: quick_budget(1),
            }],
        );

        match worker.process("https://shop.example.tw/item/1").await {
            WorkerOutcome::Success { page, listing } => {
                assert_eq!(page.backend, "render-api");
                assert_eq!(listing.vendor_name, "老協珍");
                assert_eq!(page.content_length, "<html>年菜</html>".len());
            }
            WorkerOutcome::Failure { error, .. } => panic!("expected success, got {error}"),
        }
    }

    #[tokio::test]
    async fn worker_tags_stage_two_failure_with_partial_page() {
        let worker = CrawlWorker::new(
            vec![FetchRung {
                backend: Arc::new(StaticFetch {
                    name: "direct",
                    body: Some("<html></html>"),
                }),
                budget: quick_budget(1),
            }],
            vec![ExtractRung {
                backend: Arc::new(StaticExtract {
                    name: "html-probe",
                    listing: None,
                }),
                budget: quick_budget(2),
            }],
        );

        match worker.process("https://shop.example.tw/item/1").await {
            WorkerOutcome::Failure {
                error,
                partial_page,
            } => {
                let partial = partial_page.expect("stage one succeeded");
                assert_eq!(partial.backend, "direct");
                assert!(error.contains("html-probe"), "{error}");
            }
            WorkerOutcome::Success { .. } => panic!("extraction should fail"),
        }
    }

    #[tokio::test]
    async fn worker_tags_total_fetch_failure_without_page() {
        let worker = CrawlWorker::new(
            vec![FetchRung {
                backend: Arc::new(StaticFetch {
                    name: "direct",
                    body: None,
                }),
                budget: quick_budget(1),
            }],
            vec![],
        );

        match worker.process("https://shop.example.tw/item/1").await {
            WorkerOutcome::Failure {
                partial_page,
                error,
            } => {
                assert!(partial_page.is_none());
                assert!(error.contains("403"), "{error}");
            }
            WorkerOutcome::Success { .. } => panic!("fetch should fail"),
        }
    }

    #[tokio::test]
    async fn html_probe_reads_ld_json_product_blocks() {
        let body = r#"<html><head>
            <script type="application/ld+json">
            {"@type":"Product","name":"干貝佛跳牆",
             "brand":{"name":"老協珍"},
             "offers":{"price":"3980","priceCurrency":"TWD"}}
            </script></head><body></body></html>"#;
        let listing = HtmlProbe
            .extract(&page(body))
            .await
            .expect("probe finds product");
        assert_eq!(listing.title, "干貝佛跳牆");
        assert_eq!(listing.vendor_name, "老協珍");
        assert_eq!(listing.price, 3980);
    }

    #[tokio::test]
    async fn html_probe_reports_no_listing_on_plain_pages() {
        let err = HtmlProbe
            .extract(&page("<html><body>年菜特輯</body></html>"))
            .await
            .expect_err("nothing to extract");
        assert!(matches!(err, ExtractError::NoListing));
    }
}
