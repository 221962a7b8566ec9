//! Fetch orchestration: the opaque fetch-service contract, batch
//! normalization, and an HTTP + CSS-selector default implementation.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pricewatch_core::{PriceKind, PriceSnapshot};
use scraper::{Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "pricewatch-fetch";

/// Everything one check observes about one product page. Per-item
/// failure is data, not an error: a failed item degrades to
/// [`FetchResult::failed`] and never aborts the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResult {
    pub name: Option<String>,
    pub prices: PriceSnapshot,
    pub identifier: Option<String>,
    pub out_of_stock: bool,
}

impl FetchResult {
    /// The sentinel for an item that could not be fetched: no data,
    /// treated as out of stock so it is never notified on.
    pub fn failed() -> Self {
        Self {
            name: None,
            prices: PriceSnapshot::new(),
            identifier: None,
            out_of_stock: true,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.name.is_some() && !self.prices.is_empty() && !self.out_of_stock
    }
}

/// Whole-call failures. "No results map returned" aborts the caller's
/// tick; a map full of failed entries is normal per-item degradation.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch session unavailable: {0}")]
    Session(#[source] anyhow::Error),
    #[error("fetch batch failed: {0}")]
    Batch(#[source] anyhow::Error),
}

/// The external fetch service. Implementations must return exactly one
/// entry per requested URL; [`fetch_batch_normalized`] backfills for
/// the ones that do not.
#[async_trait]
pub trait FetchService: Send + Sync {
    async fn fetch_batch(&self, urls: &[String]) -> Result<HashMap<String, FetchResult>, FetchError>;
}

/// Call the service and enforce the one-entry-per-URL contract, so
/// callers can index the map without checking membership.
pub async fn fetch_batch_normalized(
    service: &dyn FetchService,
    urls: &[String],
) -> Result<HashMap<String, FetchResult>, FetchError> {
    let mut results = service.fetch_batch(urls).await?;
    for url in urls {
        if !results.contains_key(url) {
            warn!(url = url.as_str(), "fetch service omitted a requested url; degrading to failed");
            results.insert(url.clone(), FetchResult::failed());
        }
    }
    Ok(results)
}

/// One provisioned scraping session, reused for every URL of a batch.
/// The session is an owned value scoped to the batch call, so it is
/// released on every exit path.
#[async_trait]
pub trait ProductSession: Send {
    async fn fetch_product(&mut self, url: &str) -> anyhow::Result<FetchResult>;
}

/// Drive one session over the batch, strictly in list order. Item
/// errors degrade to the failed sentinel.
pub async fn run_batch<S: ProductSession>(
    mut session: S,
    urls: &[String],
) -> HashMap<String, FetchResult> {
    let mut results = HashMap::with_capacity(urls.len());
    for url in urls {
        let result = match session.fetch_product(url).await {
            Ok(result) => result,
            Err(err) => {
                warn!(url = url.as_str(), error = %format!("{err:#}"), "product fetch failed");
                FetchResult::failed()
            }
        };
        results.insert(url.clone(), result);
    }
    results
}

/// CSS selectors describing where the default fetcher finds product
/// facts on a page. Price matches are taken in document order: first
/// the card price, then the regular price.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectorRules {
    pub name: String,
    pub prices: String,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub out_of_stock: Option<String>,
}

impl Default for SelectorRules {
    fn default() -> Self {
        Self {
            name: "h1".to_string(),
            prices: ".price".to_string(),
            identifier: Some(".sku".to_string()),
            out_of_stock: Some(".out-of-stock".to_string()),
        }
    }
}

impl SelectorRules {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing selector rules")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: reqwest::StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
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
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Bound on any single page request, element waits included.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub rules: SelectorRules,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            rules: SelectorRules::default(),
        }
    }
}

/// Default [`FetchService`]: plain HTTP GET per product page, facts
/// extracted with the configured CSS selectors. One reqwest client is
/// provisioned per batch and reused for all of its URLs.
#[derive(Debug)]
pub struct HttpFetchService {
    config: FetchConfig,
}

impl HttpFetchService {
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }

    fn acquire_session(&self) -> Result<HttpSession, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.config.timeout);
        if let Some(user_agent) = &self.config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder
            .build()
            .context("building http client")
            .map_err(FetchError::Session)?;
        Ok(HttpSession {
            client,
            rules: self.config.rules.clone(),
            backoff: self.config.backoff,
        })
    }
}

#[async_trait]
impl FetchService for HttpFetchService {
    async fn fetch_batch(&self, urls: &[String]) -> Result<HashMap<String, FetchResult>, FetchError> {
        let session = self.acquire_session()?;
        Ok(run_batch(session, urls).await)
    }
}

struct HttpSession {
    client: reqwest::Client,
    rules: SelectorRules,
    backoff: BackoffPolicy,
}

impl HttpSession {
    async fn fetch_page(&self, url: &str) -> anyhow::Result<String> {
        let mut last_error: Option<anyhow::Error> = None;
        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.text().await.context("reading page body");
                    }
                    let err = anyhow::anyhow!("http status {status} for {url}");
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_error = Some(err.into());
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("retries exhausted for {url}")))
    }
}

#[async_trait]
impl ProductSession for HttpSession {
    async fn fetch_product(&mut self, url: &str) -> anyhow::Result<FetchResult> {
        let body = self.fetch_page(url).await?;
        parse_product_document(&body, &self.rules)
    }
}

/// Extract product facts from a fetched page. Pure, so extraction is
/// testable without a server.
pub fn parse_product_document(html: &str, rules: &SelectorRules) -> anyhow::Result<FetchResult> {
    let document = Html::parse_document(html);

    let name = select_first_text(&document, &rules.name)?;

    let mut prices = PriceSnapshot::new();
    let price_texts = select_all_texts(&document, &rules.prices)?;
    for (text, kind) in price_texts
        .iter()
        .zip([PriceKind::Card, PriceKind::Regular])
    {
        if let Some(amount) = clean_price(text) {
            prices.insert(kind, amount);
        }
    }

    let identifier = match &rules.identifier {
        Some(selector) => select_first_text(&document, selector)?.and_then(|t| identifier_token(&t)),
        None => None,
    };

    let out_of_stock = match &rules.out_of_stock {
        Some(selector) => select_first_text(&document, selector)?.is_some(),
        None => false,
    };

    Ok(FetchResult {
        name,
        prices,
        identifier,
        out_of_stock,
    })
}

/// Digits-only price parse: "12 990 ₽" -> 12990. Anything without a
/// digit is no price.
pub fn clean_price(text: &str) -> Option<i64> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// The identifier is the last whitespace token of the matched element's
/// text ("SKU: 123456" -> "123456"), if that token carries a digit.
fn identifier_token(text: &str) -> Option<String> {
    text.split_whitespace()
        .last()
        .filter(|token| token.chars().any(|c| c.is_ascii_digit()))
        .map(|token| token.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string())
        .filter(|token| !token.is_empty())
}

fn select_first_text(document: &Html, selector: &str) -> anyhow::Result<Option<String>> {
    let sel = Selector::parse(selector)
        .map_err(|e| anyhow::anyhow!("bad selector {selector:?}: {e}"))?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_all_texts(document: &Html, selector: &str) -> anyhow::Result<Vec<String>> {
    let sel = Selector::parse(selector)
        .map_err(|e| anyhow::anyhow!("bad selector {selector:?}: {e}"))?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
