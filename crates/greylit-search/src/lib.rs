//! Paginated search execution + tiered result accumulation for Greylit.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use greylit_core::{
    ResultItem, SearchQueryTier, SearchRun, SiteResultSet, SEARCH_PAGE_SIZE, SITE_RESULT_CAP,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "greylit-search";

/// Pages requested per tier, in tier order (one request per page).
pub const TIER_PAGE_BUDGETS: [usize; 3] = [4, 8, 10];

/// One logical paginated search request, scoped to a site and a tier's terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPageRequest {
    pub site: String,
    /// Zero-based page index; the wire offset is `page * SEARCH_PAGE_SIZE + 1`.
    pub page: usize,
    pub tier: SearchQueryTier,
}

/// A raw hit as returned by the search service, before priority tagging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHit {
    pub link: String,
    pub title: String,
    pub snippet: String,
}

/// Outcome of one page request after credential rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Page(Vec<RawHit>),
    /// Every configured credential was spent on quota-exceeded responses.
    QuotaExhausted,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("search api error ({reason}): {message}")]
    Api { reason: String, message: String },
    #[error("no search credentials configured")]
    NoCredentials,
}

/// Opaque executor for one page request. The production implementation owns
/// credential rotation; the accumulator only sees a page or the exhaustion
/// sentinel.
#[async_trait]
pub trait SearchPageExecutor: Send + Sync {
    async fn execute(&self, request: &SearchPageRequest) -> Result<PageOutcome, SearchError>;
}

/// One (api key, engine id) pair for the Custom Search JSON API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CseCredential {
    pub api_key: String,
    pub cx: String,
}

#[derive(Debug, Clone)]
pub struct CseConfig {
    pub credentials: Vec<CseCredential>,
    pub endpoint: String,
    pub timeout: Duration,
}

impl CseConfig {
    /// Reads `GREYLIT_CSE_KEYS` and `GREYLIT_CSE_CX` (comma-separated). When
    /// fewer engine ids than keys are supplied the last id is reused for the
    /// remaining keys.
    pub fn from_env() -> Self {
        let keys = split_csv(&std::env::var("GREYLIT_CSE_KEYS").unwrap_or_default());
        let cxs = split_csv(&std::env::var("GREYLIT_CSE_CX").unwrap_or_default());
        let credentials = keys
            .iter()
            .enumerate()
            .map(|(i, key)| CseCredential {
                api_key: key.clone(),
                cx: cxs
                    .get(i)
                    .or_else(|| cxs.last())
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        Self {
            credentials,
            endpoint: "https://www.googleapis.com/customsearch/v1".to_string(),
            timeout: Duration::from_secs(
                std::env::var("GREYLIT_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
        }
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Google Custom Search client. Iterates the configured credential pairs in
/// order and rotates to the next pair on a quota-exceeded response, returning
/// [`PageOutcome::QuotaExhausted`] once all pairs are spent.
#[derive(Debug)]
pub struct CseClient {
    client: reqwest::Client,
    config: CseConfig,
}

impl CseClient {
    pub fn new(config: CseConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building search http client")?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Deserialize)]
struct CseResponse {
    #[serde(default)]
    items: Vec<CseResponseItem>,
    error: Option<CseApiError>,
}

#[derive(Debug, Deserialize)]
struct CseResponseItem {
    link: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
}

#[derive(Debug, Deserialize)]
struct CseApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<CseApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct CseApiErrorDetail {
    #[serde(default)]
    reason: String,
}

impl CseApiError {
    fn is_quota_exceeded(&self) -> bool {
        self.errors
            .iter()
            .any(|detail| detail.reason.contains("rateLimitExceeded"))
    }

    fn primary_reason(&self) -> &str {
        self.errors
            .first()
            .map(|detail| detail.reason.as_str())
            .unwrap_or("unknown")
    }
}

#[async_trait]
impl SearchPageExecutor for CseClient {
    async fn execute(&self, request: &SearchPageRequest) -> Result<PageOutcome, SearchError> {
        if self.config.credentials.is_empty() {
            return Err(SearchError::NoCredentials);
        }

        let start = request.page * SEARCH_PAGE_SIZE + 1;
        for credential in &self.config.credentials {
            let response = self
                .client
                .get(&self.config.endpoint)
                .query(&[
                    ("q", request.tier.all_terms.as_str()),
                    ("exactTerms", request.tier.exact_phrase.as_str()),
                    ("orTerms", request.tier.any_terms.as_str()),
                    ("excludeTerms", request.tier.none_terms.as_str()),
                    ("siteSearch", request.site.as_str()),
                    ("key", credential.api_key.as_str()),
                    ("cx", credential.cx.as_str()),
                ])
                .query(&[("num", SEARCH_PAGE_SIZE), ("start", start)])
                .send()
                .await?;

            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                warn!(site = %request.site, page = request.page, "credential over quota, rotating");
                continue;
            }

            let body: CseResponse = response.json().await?;
            match body.error {
                Some(error) if error.is_quota_exceeded() => {
                    warn!(site = %request.site, page = request.page, "credential over quota, rotating");
                    continue;
                }
                Some(error) => {
                    return Err(SearchError::Api {
                        reason: error.primary_reason().to_string(),
                        message: error.message,
                    });
                }
                None => {
                    let hits = body
                        .items
                        .into_iter()
                        .map(|item| RawHit {
                            link: item.link,
                            title: item.title,
                            snippet: item.snippet,
                        })
                        .collect();
                    return Ok(PageOutcome::Page(hits));
                }
            }
        }

        warn!(site = %request.site, page = request.page, "all search credentials exhausted");
        Ok(PageOutcome::QuotaExhausted)
    }
}

/// Per-site accumulation outcome, before run-level aggregation.
#[derive(Debug, Clone)]
pub struct SiteAccumulation {
    pub results: SiteResultSet,
    pub quota_exhausted: bool,
}

/// Tiered, paginated result accumulator. Issues requests strictly
/// sequentially: one page at a time, one tier at a time, one site at a time.
pub struct Accumulator<'a, E: SearchPageExecutor + ?Sized> {
    executor: &'a E,
}

impl<'a, E: SearchPageExecutor + ?Sized> Accumulator<'a, E> {
    pub fn new(executor: &'a E) -> Self {
        Self { executor }
    }

    /// Accumulates up to [`SITE_RESULT_CAP`] deduplicated items for one site
    /// across the active tiers. First-tier-wins: a link already present keeps
    /// the priority of the tier that first returned it.
    pub async fn accumulate_site(
        &self,
        site: &str,
        tiers: &[SearchQueryTier],
    ) -> SiteAccumulation {
        let mut items: Vec<ResultItem> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut labels: Vec<String> = Vec::new();
        let mut quota_exhausted = false;

        for (index, tier) in tiers.iter().take(TIER_PAGE_BUDGETS.len()).enumerate() {
            if !tier.is_active() || items.len() >= SITE_RESULT_CAP {
                continue;
            }
            labels.push(tier.describe());
            let priority = (index + 1) as u8;

            for page in 0..TIER_PAGE_BUDGETS[index] {
                let request = SearchPageRequest {
                    site: site.to_string(),
                    page,
                    tier: tier.clone(),
                };
                let raw_count = match self.executor.execute(&request).await {
                    Ok(PageOutcome::Page(hits)) => {
                        let count = hits.len();
                        for hit in hits {
                            if seen.insert(hit.link.clone()) {
                                items.push(ResultItem {
                                    link: hit.link,
                                    title: hit.title,
                                    snippet: hit.snippet,
                                    priority,
                                });
                            }
                        }
                        count
                    }
                    Ok(PageOutcome::QuotaExhausted) => {
                        // Halts this tier's pagination only; tiers already
                        // accumulated keep their results.
                        quota_exhausted = true;
                        break;
                    }
                    Err(error) => {
                        warn!(site, page, error = %error, "page request failed, ending tier pagination");
                        break;
                    }
                };
                if items.len() >= SITE_RESULT_CAP || raw_count < SEARCH_PAGE_SIZE {
                    break;
                }
            }
        }

        items.truncate(SITE_RESULT_CAP);
        SiteAccumulation {
            results: SiteResultSet {
                site: site.to_string(),
                query_label: labels.join("; "),
                items,
            },
            quota_exhausted,
        }
    }

    /// Runs the accumulation across all sites, in the order supplied, and
    /// folds per-site quota exhaustion into the run-level flag.
    pub async fn run(&self, sites: &[String], tiers: &[SearchQueryTier]) -> SearchRun {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut out = Vec::new();
        let mut limit_exceeded = false;

        for site in sites {
            let site = site.trim();
            if site.is_empty() {
                continue;
            }
            let accumulation = self.accumulate_site(site, tiers).await;
            limit_exceeded |= accumulation.quota_exhausted;
            out.push(accumulation.results);
        }

        SearchRun {
            run_id,
            started_at,
            sites: out,
            limit_exceeded,
        }
    }
}

/// Splits a websites textarea into one trimmed site per non-blank line.
pub fn parse_site_list(input: &str) -> Vec<String> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect()
}
