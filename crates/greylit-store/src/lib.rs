//! Tabular-store client + best-effort batch upsert for Greylit results.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use greylit_core::{
    ResultItem, SiteResultSet, UpsertProgress, UpsertRecord, UpsertStats, RECORD_STATUS_TODO,
};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "greylit-store";

/// Fixed pause after each successful write; the destination store allows five
/// requests per second.
pub const WRITE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store access denied: {0}")]
    Permission(String),
    #[error("store table or field not found: {0}")]
    NotFound(String),
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Diagnostic hint logged next to per-item write failures. Cosmetic only;
    /// every class lands in the same aggregate error counter.
    pub fn hint(&self) -> &'static str {
        match self {
            StoreError::Permission(_) => "check the token's write scope and base/table access",
            StoreError::NotFound(_) => "check the table name and that field names match the schema",
            _ => "see the error message",
        }
    }
}

/// Destination tabular store, treated as an opaque service.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Exact-match lookup by link, capped at one result. Returns the matching
    /// record id when one exists.
    async fn find_by_link(&self, link: &str) -> Result<Option<String>, StoreError>;

    async fn create(&self, record: &UpsertRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct AirtableConfig {
    pub token: String,
    pub base_id: String,
    pub table_name: String,
    pub api_url: String,
    pub timeout: Duration,
}

impl AirtableConfig {
    pub fn from_env() -> Self {
        Self {
            token: std::env::var("AIRTABLE_TOKEN").unwrap_or_default(),
            base_id: std::env::var("AIRTABLE_BASE_ID").unwrap_or_default(),
            table_name: std::env::var("AIRTABLE_TABLE_NAME")
                .unwrap_or_else(|_| "raw_results".to_string()),
            api_url: "https://api.airtable.com/v0".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.token.is_empty() && !self.base_id.is_empty()
    }
}

/// Airtable REST client implementing [`RecordStore`].
#[derive(Debug)]
pub struct AirtableClient {
    client: reqwest::Client,
    config: AirtableConfig,
}

impl AirtableClient {
    pub fn new(config: AirtableConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building store http client")?;
        Ok(Self { client, config })
    }

    fn table_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.config.api_url, self.config.base_id, self.config.table_name
        )
    }

    async fn classify(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 | 403 => StoreError::Permission(body),
            404 => StoreError::NotFound(body),
            422 if body.contains("NOT_FOUND") || body.contains("UNKNOWN_FIELD_NAME") => {
                StoreError::NotFound(body)
            }
            _ => StoreError::Other(format!("status {status}: {body}")),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RecordList {
    #[serde(default)]
    records: Vec<RecordRef>,
}

#[derive(Debug, Deserialize)]
struct RecordRef {
    id: String,
}

#[async_trait]
impl RecordStore for AirtableClient {
    async fn find_by_link(&self, link: &str) -> Result<Option<String>, StoreError> {
        let formula = format!("{{link}}='{}'", link.replace('\'', "\\'"));
        let response = self
            .client
            .get(self.table_url())
            .bearer_auth(&self.config.token)
            .query(&[("filterByFormula", formula.as_str()), ("maxRecords", "1")])
            .send()
            .await?;
        let list: RecordList = Self::classify(response).await?.json().await?;
        Ok(list.records.into_iter().next().map(|record| record.id))
    }

    async fn create(&self, record: &UpsertRecord) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.table_url())
            .bearer_auth(&self.config.token)
            .json(&json!({ "fields": record }))
            .send()
            .await?;
        Self::classify(response).await?;
        Ok(())
    }
}

/// Domain component of a link, empty when the link does not parse as a URL.
pub fn source_domain(link: &str) -> String {
    reqwest::Url::parse(link)
        .ok()
        .and_then(|url| url.host_str().map(ToString::to_string))
        .unwrap_or_default()
}

/// Normalizes one search hit into the fixed record shape written to the store.
pub fn normalize_record(item: &ResultItem, search_query: &str) -> UpsertRecord {
    UpsertRecord {
        title: item.title.clone(),
        link: item.link.clone(),
        snippet: item.snippet.clone(),
        source_domain: source_domain(&item.link),
        search_query: search_query.to_string(),
        priority: item.priority,
        scraped_at: Utc::now().date_naive(),
        status: RECORD_STATUS_TODO.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpsertOptions {
    pub verify_duplicates: bool,
    /// Pause after each successful write only; skips and failures incur none.
    pub write_delay: Duration,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            verify_duplicates: true,
            write_delay: WRITE_DELAY,
        }
    }
}

/// Best-effort batch upsert over a [`RecordStore`]. No failure on a single
/// item ever aborts the batch; everything surfaces in the aggregate counters.
pub struct UpsertClient<'a, S: RecordStore + ?Sized> {
    store: &'a S,
    options: UpsertOptions,
}

impl<'a, S: RecordStore + ?Sized> UpsertClient<'a, S> {
    pub fn new(store: &'a S, options: UpsertOptions) -> Self {
        Self { store, options }
    }

    /// Flattens all items across the site result sets, preserving site order
    /// and per-site order, and writes each one. The progress callback fires
    /// exactly once per item, in order, with monotonically increasing
    /// `processed`.
    pub async fn save_results<F>(&self, results: &[SiteResultSet], mut on_progress: F) -> UpsertStats
    where
        F: FnMut(UpsertProgress),
    {
        let mut stats = UpsertStats::default();
        let worklist: Vec<(&ResultItem, String)> = results
            .iter()
            .flat_map(|set| {
                let label = if set.query_label.trim().is_empty() {
                    format!("search on {}", set.site)
                } else {
                    set.query_label.clone()
                };
                set.items.iter().map(move |item| (item, label.clone()))
            })
            .collect();
        let total = worklist.len();

        for (item, label) in worklist {
            let mut wrote = false;
            if item.link.is_empty() {
                stats.errors += 1;
            } else if self.options.verify_duplicates && self.is_duplicate(&item.link).await {
                stats.duplicates += 1;
            } else {
                match self.store.create(&normalize_record(item, &label)).await {
                    Ok(()) => {
                        stats.created += 1;
                        wrote = true;
                    }
                    Err(error) => {
                        stats.errors += 1;
                        warn!(
                            link = %item.link,
                            error = %error,
                            hint = error.hint(),
                            "record write failed"
                        );
                    }
                }
            }

            stats.processed += 1;
            on_progress(UpsertProgress {
                processed: stats.processed,
                total,
                created: stats.created,
                errors: stats.errors,
            });

            if wrote && !self.options.write_delay.is_zero() {
                tokio::time::sleep(self.options.write_delay).await;
            }
        }

        stats
    }

    /// A failed lookup is treated as "no duplicate found" and the write
    /// proceeds, favoring completeness over strict dedup.
    async fn is_duplicate(&self, link: &str) -> bool {
        match self.store.find_by_link(link).await {
            Ok(existing) => existing.is_some(),
            Err(error) => {
                warn!(link, error = %error, "duplicate check failed, writing anyway");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum LinkBehavior {
        Create,
        Duplicate,
        FailLookup,
        FailWrite,
    }

    #[derive(Default)]
    struct MockStore {
        behaviors: HashMap<String, LinkBehavior>,
        lookups: Mutex<Vec<String>>,
        created: Mutex<Vec<UpsertRecord>>,
    }

    impl MockStore {
        fn with(behaviors: &[(&str, LinkBehavior)]) -> Self {
            Self {
                behaviors: behaviors
                    .iter()
                    .map(|(link, behavior)| (link.to_string(), *behavior))
                    .collect(),
                ..Default::default()
            }
        }

        fn behavior_for(&self, link: &str) -> LinkBehavior {
            self.behaviors
                .get(link)
                .copied()
                .unwrap_or(LinkBehavior::Create)
        }
    }

    #[async_trait]
    impl RecordStore for MockStore {
        async fn find_by_link(&self, link: &str) -> Result<Option<String>, StoreError> {
            self.lookups.lock().unwrap().push(link.to_string());
            match self.behavior_for(link) {
                LinkBehavior::Duplicate => Ok(Some("recDUP".to_string())),
                LinkBehavior::FailLookup => Err(StoreError::NotFound(
                    "UNKNOWN_FIELD_NAME: link".to_string(),
                )),
                _ => Ok(None),
            }
        }

        async fn create(&self, record: &UpsertRecord) -> Result<(), StoreError> {
            match self.behavior_for(&record.link) {
                LinkBehavior::FailWrite => {
                    Err(StoreError::Permission("INVALID_PERMISSIONS".to_string()))
                }
                _ => {
                    self.created.lock().unwrap().push(record.clone());
                    Ok(())
                }
            }
        }
    }

    fn item(link: &str, priority: u8) -> ResultItem {
        ResultItem {
            link: link.to_string(),
            title: format!("title for {link}"),
            snippet: "snippet".to_string(),
            priority,
        }
    }

    fn site(name: &str, label: &str, items: Vec<ResultItem>) -> SiteResultSet {
        SiteResultSet {
            site: name.to_string(),
            query_label: label.to_string(),
            items,
        }
    }

    fn fast_options(verify_duplicates: bool) -> UpsertOptions {
        UpsertOptions {
            verify_duplicates,
            write_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn mixed_batch_counts_every_item_once() {
        let store = MockStore::with(&[("https://a.org/fail", LinkBehavior::FailWrite)]);
        let results = vec![site(
            "a.org",
            "AND: q",
            vec![item("", 1), item("https://a.org/fail", 1), item("https://a.org/ok", 2)],
        )];

        let mut progress = Vec::new();
        let stats = UpsertClient::new(&store, fast_options(false))
            .save_results(&results, |update| progress.push(update))
            .await;

        assert_eq!(stats.processed, 3);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.duplicates, 0);
        assert_eq!(stats.errors, 2);
        assert_eq!(progress.len(), 3);
        let processed: Vec<_> = progress.iter().map(|p| p.processed).collect();
        assert_eq!(processed, vec![1, 2, 3]);
        assert!(progress.iter().all(|p| p.total == 3));
    }

    #[tokio::test]
    async fn no_lookups_without_verify_duplicates() {
        let store = MockStore::with(&[]);
        let results = vec![site(
            "a.org",
            "AND: q",
            vec![item("https://a.org/1", 1), item("https://a.org/2", 1)],
        )];

        let stats = UpsertClient::new(&store, fast_options(false))
            .save_results(&results, |_| {})
            .await;

        assert_eq!(stats.created, 2);
        assert!(store.lookups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_match_skips_the_write() {
        let store = MockStore::with(&[("https://a.org/dup", LinkBehavior::Duplicate)]);
        let results = vec![site(
            "a.org",
            "AND: q",
            vec![item("https://a.org/dup", 1), item("https://a.org/new", 1)],
        )];

        let stats = UpsertClient::new(&store, fast_options(true))
            .save_results(&results, |_| {})
            .await;

        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.errors, 0);
        let created = store.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].link, "https://a.org/new");
    }

    #[tokio::test]
    async fn failed_lookup_falls_through_to_the_write() {
        let store = MockStore::with(&[("https://a.org/odd", LinkBehavior::FailLookup)]);
        let results = vec![site("a.org", "AND: q", vec![item("https://a.org/odd", 1)])];

        let stats = UpsertClient::new(&store, fast_options(true))
            .save_results(&results, |_| {})
            .await;

        assert_eq!(stats.created, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(store.lookups.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn worklist_preserves_site_order_and_labels() {
        let store = MockStore::with(&[]);
        let results = vec![
            site("a.org", "AND: first", vec![item("https://a.org/1", 1)]),
            site("b.org", "", vec![item("https://b.org/1", 2)]),
        ];

        let stats = UpsertClient::new(&store, fast_options(false))
            .save_results(&results, |_| {})
            .await;

        assert_eq!(stats.processed, 2);
        let created = store.created.lock().unwrap();
        assert_eq!(created[0].search_query, "AND: first");
        assert_eq!(created[0].source_domain, "a.org");
        assert_eq!(created[0].priority, 1);
        // Blank label falls back to a per-site placeholder.
        assert_eq!(created[1].search_query, "search on b.org");
        assert_eq!(created[1].status, RECORD_STATUS_TODO);
    }

    #[test]
    fn source_domain_handles_bad_links() {
        assert_eq!(source_domain("https://www.example.org/report.pdf"), "www.example.org");
        assert_eq!(source_domain("not a url"), "");
        assert_eq!(source_domain(""), "");
    }

    #[test]
    fn record_serializes_with_iso_date() {
        let record = UpsertRecord {
            title: "t".into(),
            link: "https://example.org/r".into(),
            snippet: "s".into(),
            source_domain: "example.org".into(),
            search_query: "AND: q".into(),
            priority: 2,
            scraped_at: NaiveDate::from_ymd_opt(2026, 8, 26).unwrap(),
            status: RECORD_STATUS_TODO.into(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["scraped_at"], "2026-08-26");
        assert_eq!(value["priority"], 2);
        assert_eq!(value["status"], "Todo");
    }
}
